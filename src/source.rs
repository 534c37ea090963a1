use std::path::{Path, PathBuf};

use once_cell::unsync::OnceCell;

use crate::index::{simple_index, IndexVec};

simple_index! {
    /// Identifies a source file within a program
    pub struct SourceId;
}

/// The logical name of a source file: either a path on disk or a virtual
/// numeric id for sources given to the compiler in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceName {
    Local(PathBuf),
    Virtual(u32),
}

impl core::fmt::Display for SourceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceName::Local(path) => f.write_fmt(format_args!("{}", path.display())),
            SourceName::Virtual(id) => f.write_fmt(format_args!("virtual://{id}")),
        }
    }
}

/// An immutable piece of source text with a logical name.
#[derive(Debug)]
pub struct SourceFile {
    pub id: SourceId,
    pub name: SourceName,
    pub contents: String,
    line_starts: OnceCell<Vec<u32>>,
}

impl SourceFile {
    pub fn new(id: SourceId, name: SourceName, contents: String) -> Self {
        Self {
            id,
            name,
            contents,
            line_starts: OnceCell::new(),
        }
    }

    pub fn text_of(&self, span: SourceSpan) -> &str {
        debug_assert_eq!(span.source, self.id);
        &self.contents[span.start as usize..span.end as usize]
    }

    /// The position just past the last byte of the file.
    pub fn end_position(&self) -> SourcePosition {
        SourcePosition {
            source: self.id,
            index: self.contents.len() as u32,
        }
    }

    /// An empty span anchored at the end of the file.
    pub fn end_span(&self) -> SourceSpan {
        SourceSpan::empty_at(self.end_position())
    }

    /// A span covering the entire file.
    pub fn full_span(&self) -> SourceSpan {
        SourceSpan {
            source: self.id,
            start: 0,
            end: self.contents.len() as u32,
        }
    }

    fn line_starts(&self) -> &[u32] {
        self.line_starts.get_or_init(|| {
            let mut starts = vec![0u32];
            for (i, ch) in self.contents.char_indices() {
                if ch == '\n' {
                    starts.push((i + 1) as u32);
                }
            }
            starts
        })
    }

    /// Translates a byte index into a 1-based (line, column) pair.
    pub fn line_col(&self, index: u32) -> (u32, u32) {
        let index = index.min(self.contents.len() as u32);
        let starts = self.line_starts();

        let line_idx = match starts.binary_search(&index) {
            Ok(idx) => idx,
            Err(idx) => idx.saturating_sub(1),
        };

        (line_idx as u32 + 1, index - starts[line_idx] + 1)
    }

    /// The 1-based line number containing `index`.
    pub fn line_of(&self, index: u32) -> u32 {
        self.line_col(index).0
    }
}

/// A position within a single source file, measured in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourcePosition {
    pub source: SourceId,
    pub index: u32,
}

/// A half-open byte range within a single source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceSpan {
    pub source: SourceId,
    pub start: u32,
    pub end: u32,
}

impl SourceSpan {
    pub fn new(source: SourceId, start: u32, end: u32) -> Self {
        debug_assert!(start <= end);
        Self { source, start, end }
    }

    /// An empty span anchored at `position`.
    pub fn empty_at(position: SourcePosition) -> Self {
        Self {
            source: position.source,
            start: position.index,
            end: position.index,
        }
    }

    /// The smallest span covering both `a` and `b`.
    pub fn cover(a: SourceSpan, b: SourceSpan) -> Self {
        debug_assert_eq!(a.source, b.source);
        Self {
            source: a.source,
            start: a.start.min(b.start),
            end: a.end.max(b.end),
        }
    }

    pub fn start_position(&self) -> SourcePosition {
        SourcePosition {
            source: self.source,
            index: self.start,
        }
    }

    pub fn end_position(&self) -> SourcePosition {
        SourcePosition {
            source: self.source,
            index: self.end,
        }
    }

    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn intersects(&self, other: SourceSpan) -> bool {
        self.source == other.source && self.start < other.end && other.start < self.end
    }

    pub fn intersection(&self, other: SourceSpan) -> Option<SourceSpan> {
        self.intersects(other).then(|| SourceSpan {
            source: self.source,
            start: self.start.max(other.start),
            end: self.end.min(other.end),
        })
    }

    /// This span widened (never narrowed) to also cover `other`.
    #[must_use]
    pub fn extended_to_cover(self, other: SourceSpan) -> SourceSpan {
        SourceSpan::cover(self, other)
    }

    /// This span with its upper bound pushed out to `index`.
    #[must_use]
    pub fn extended_up_to(self, index: u32) -> SourceSpan {
        SourceSpan {
            source: self.source,
            start: self.start,
            end: self.end.max(index),
        }
    }

    /// True when this span fully contains `other`.
    pub fn covers(&self, other: SourceSpan) -> bool {
        self.source == other.source && self.start <= other.start && other.end <= self.end
    }
}

/// The program-wide table of loaded source files.
#[derive(Debug, Default)]
pub struct SourceMap {
    files: IndexVec<SourceId, SourceFile>,
}

impl SourceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_local(&mut self, path: &Path, contents: String) -> SourceId {
        let id = self.files.next_index();
        self.files.push(SourceFile::new(
            id,
            SourceName::Local(path.to_path_buf()),
            contents,
        ));
        id
    }

    pub fn insert_virtual(&mut self, tag: u32, contents: String) -> SourceId {
        let id = self.files.next_index();
        self.files
            .push(SourceFile::new(id, SourceName::Virtual(tag), contents));
        id
    }

    pub fn get(&self, id: SourceId) -> &SourceFile {
        &self.files[id]
    }

    pub fn name_of(&self, id: SourceId) -> String {
        self.files[id].name.to_string()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SourceFile> {
        self.files.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Index;

    fn file(contents: &str) -> SourceFile {
        SourceFile::new(
            SourceId::new(0),
            SourceName::Virtual(0),
            contents.to_owned(),
        )
    }

    fn span(start: u32, end: u32) -> SourceSpan {
        SourceSpan::new(SourceId::new(0), start, end)
    }

    #[test]
    fn line_col_arithmetic() {
        let f = file("ab\ncd\n\nef");

        assert_eq!(f.line_col(0), (1, 1));
        assert_eq!(f.line_col(1), (1, 2));
        assert_eq!(f.line_col(3), (2, 1));
        assert_eq!(f.line_col(6), (3, 1));
        assert_eq!(f.line_col(7), (4, 1));
        assert_eq!(f.line_col(9), (4, 3));
    }

    #[test]
    fn span_intersection() {
        assert!(span(0, 4).intersects(span(3, 6)));
        assert!(!span(0, 4).intersects(span(4, 6)));
        assert_eq!(span(0, 4).intersection(span(3, 6)), Some(span(3, 4)));
        assert_eq!(span(0, 3).intersection(span(3, 6)), None);
    }

    #[test]
    fn span_extension() {
        assert_eq!(span(2, 4).extended_to_cover(span(6, 8)), span(2, 8));
        assert_eq!(span(2, 4).extended_up_to(9), span(2, 9));
        assert_eq!(span(2, 4).extended_up_to(3), span(2, 4));
    }

    #[test]
    fn empty_span_at_position() {
        let p = SourcePosition {
            source: SourceId::new(0),
            index: 5,
        };
        let s = SourceSpan::empty_at(p);
        assert!(s.is_empty());
        assert_eq!(s.start, 5);
    }
}
