use std::cmp::Ordering;

use crate::source::{SourceMap, SourceSpan};

/// The severity of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Note,
    Warning,
    Error,
}

impl core::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Level::Note => f.write_str("note"),
            Level::Warning => f.write_str("warning"),
            Level::Error => f.write_str("error"),
        }
    }
}

/// A level-tagged message anchored at a source span, possibly carrying
/// sub-diagnostics that refine it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub level: Level,
    pub message: String,
    pub site: SourceSpan,
    pub notes: Vec<Diagnostic>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>, site: SourceSpan) -> Self {
        Self {
            level: Level::Error,
            message: message.into(),
            site,
            notes: Vec::new(),
        }
    }

    pub fn warning(message: impl Into<String>, site: SourceSpan) -> Self {
        Self {
            level: Level::Warning,
            message: message.into(),
            site,
            notes: Vec::new(),
        }
    }

    pub fn note(message: impl Into<String>, site: SourceSpan) -> Self {
        Self {
            level: Level::Note,
            message: message.into(),
            site,
            notes: Vec::new(),
        }
    }

    /// Attaches a sub-diagnostic. Sub-diagnostics must have level `note`.
    #[must_use]
    pub fn with_note(mut self, note: Diagnostic) -> Self {
        debug_assert_eq!(note.level, Level::Note);
        self.notes.push(note);
        self
    }

    /// The total order on diagnostics: file name, then start position, then
    /// level from most to least severe, then message, then notes.
    pub fn ordering(a: &Diagnostic, b: &Diagnostic, sources: &SourceMap) -> Ordering {
        sources
            .name_of(a.site.source)
            .cmp(&sources.name_of(b.site.source))
            .then_with(|| a.site.start.cmp(&b.site.start))
            .then_with(|| b.level.cmp(&a.level))
            .then_with(|| a.message.cmp(&b.message))
            .then_with(|| {
                for (x, y) in a.notes.iter().zip(b.notes.iter()) {
                    let o = Diagnostic::ordering(x, y, sources);
                    if o != Ordering::Equal {
                        return o;
                    }
                }
                a.notes.len().cmp(&b.notes.len())
            })
    }

    /// Renders this diagnostic in the GNU standard format:
    /// `<file>:<line>.<column>[-<line>.<column>]: <level>: <message>`,
    /// followed by its notes, one per line.
    pub fn render(&self, sources: &SourceMap) -> String {
        let mut out = String::new();
        self.render_into(&mut out, sources);
        out
    }

    fn render_into(&self, out: &mut String, sources: &SourceMap) {
        use std::fmt::Write;

        let file = sources.get(self.site.source);
        let (line, column) = file.line_col(self.site.start);

        write!(out, "{}:{line}.{column}", file.name).unwrap();
        if !self.site.is_empty() {
            let (end_line, end_column) = file.line_col(self.site.end);
            write!(out, "-{end_line}.{end_column}").unwrap();
        }
        write!(out, ": {}: {}", self.level, self.message).unwrap();

        for note in &self.notes {
            out.push('\n');
            note.render_into(out, sources);
        }
    }
}

/// An ordered accumulator of diagnostics that remembers whether any of them
/// is an error.
#[derive(Debug, Default, Clone)]
pub struct DiagnosticSet {
    diagnostics: Vec<Diagnostic>,
    contains_error: bool,
}

impl DiagnosticSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, diagnostic: Diagnostic) {
        self.contains_error |= diagnostic.level == Level::Error;
        self.diagnostics.push(diagnostic);
    }

    pub fn extend(&mut self, other: DiagnosticSet) {
        self.contains_error |= other.contains_error;
        self.diagnostics.extend(other.diagnostics);
    }

    pub fn contains_error(&self) -> bool {
        self.contains_error
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter()
    }

    pub fn len(&self) -> usize {
        self.diagnostics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    /// The diagnostics in their total order (insertion order is preserved by
    /// `iter`; this sorts a copy of the references).
    pub fn sorted<'a>(&'a self, sources: &SourceMap) -> Vec<&'a Diagnostic> {
        let mut items: Vec<&Diagnostic> = self.diagnostics.iter().collect();
        items.sort_by(|a, b| Diagnostic::ordering(a, b, sources));
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Index;
    use crate::source::{SourceId, SourceSpan};
    use pretty_assertions::assert_eq;

    fn span(sources: &SourceMap, start: u32, end: u32) -> SourceSpan {
        let _ = sources;
        SourceSpan::new(SourceId::new(0), start, end)
    }

    fn test_sources() -> SourceMap {
        let mut sources = SourceMap::new();
        sources.insert_virtual(0, "let x = 1\nlet y = 2\n".to_owned());
        sources
    }

    #[test]
    fn render_gnu_format() {
        let sources = test_sources();
        let d = Diagnostic::error("undefined symbol 'x'", span(&sources, 4, 5));

        assert_eq!(
            d.render(&sources),
            "virtual://0:1.5-1.6: error: undefined symbol 'x'"
        );
    }

    #[test]
    fn render_empty_span_has_no_range() {
        let sources = test_sources();
        let d = Diagnostic::error("boom", span(&sources, 4, 4));

        assert_eq!(d.render(&sources), "virtual://0:1.5: error: boom");
    }

    #[test]
    fn notes_render_beneath() {
        let sources = test_sources();
        let d = Diagnostic::error("first", span(&sources, 0, 3))
            .with_note(Diagnostic::note("second", span(&sources, 10, 13)));

        assert_eq!(
            d.render(&sources),
            "virtual://0:1.1-1.4: error: first\nvirtual://0:2.1-2.4: note: second"
        );
    }

    #[test]
    fn ordering_prefers_position_then_severity() {
        let sources = test_sources();
        let early = Diagnostic::warning("w", span(&sources, 0, 1));
        let late_error = Diagnostic::error("e", span(&sources, 5, 6));
        let late_note = Diagnostic::note("n", span(&sources, 5, 6));

        let mut set = DiagnosticSet::new();
        set.insert(late_note.clone());
        set.insert(early.clone());
        set.insert(late_error.clone());

        let sorted = set.sorted(&sources);
        assert_eq!(sorted, vec![&early, &late_error, &late_note]);
    }

    #[test]
    fn error_tracking() {
        let sources = test_sources();
        let mut set = DiagnosticSet::new();
        assert!(!set.contains_error());

        set.insert(Diagnostic::warning("w", span(&sources, 0, 1)));
        assert!(!set.contains_error());

        set.insert(Diagnostic::error("e", span(&sources, 0, 1)));
        assert!(set.contains_error());
    }
}
