//! Compiler front-end for Dyva, an indentation-sensitive,
//! expression-oriented language: lexing, parsing into an arena-backed AST,
//! scoping, lowering to a control-flow IR in SSA style, and the IR analyses
//! that check and normalize the result.

use std::io;
use std::path::{Path, PathBuf};

use hashbrown::HashMap;

use crate::diagnostics::{Diagnostic, DiagnosticSet};
use crate::frontend::ast::{ImportDecl, ModuleIndex, NodeRef, SyntaxArena};
use crate::frontend::parser::parse_module;
use crate::frontend::scope::{scope_module, ScopeTables};
use crate::index::IndexVec;
use crate::ir::dominators::{definitions_dominate_uses, DominatorTree};
use crate::ir::lower::lower_module;
use crate::ir::regions::{close_regions, eliminate_dead_accesses};
use crate::ir::yields::check_yield_coherence;
use crate::source::{SourceId, SourceMap, SourceSpan};

pub mod diagnostics;
pub mod frontend;
pub mod index;
pub mod ir;
pub mod source;

/// The file extension of Dyva sources.
pub const SOURCE_EXTENSION: &str = "dyva";

/// One compiled module: its syntax, lexical relationships, IR, and the
/// diagnostics gathered along the way.
#[derive(Debug)]
pub struct Module {
    pub index: ModuleIndex,
    pub source: SourceId,
    pub arena: SyntaxArena,
    pub roots: Vec<NodeRef>,
    pub scopes: ScopeTables,
    pub ir: ir::Module,
    pub diagnostics: DiagnosticSet,
}

impl Module {
    pub fn contains_error(&self) -> bool {
        self.diagnostics.contains_error()
    }
}

/// An ordered collection of modules compiled from loaded sources.
#[derive(Default)]
pub struct Program {
    pub sources: SourceMap,
    pub modules: IndexVec<ModuleIndex, Module>,
    by_path: HashMap<PathBuf, ModuleIndex>,
    loading: Vec<PathBuf>,
    next_virtual: u32,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads and compiles a file. Re-loading an already loaded file returns
    /// the existing module; a directory resolves to the `index.dyva` within
    /// it.
    pub fn load_file(&mut self, path: &Path, as_main: bool) -> io::Result<ModuleIndex> {
        let path = if path.is_dir() {
            path.join(format!("index.{SOURCE_EXTENSION}"))
        } else {
            path.to_path_buf()
        };
        let canonical = path.canonicalize().unwrap_or_else(|_| path.clone());

        if let Some(existing) = self.by_path.get(&canonical) {
            return Ok(*existing);
        }

        let contents = std::fs::read_to_string(&path)?;
        let source = self.sources.insert_local(&path, contents);

        self.loading.push(canonical.clone());
        let index = self.compile(source, as_main, path.parent().map(Path::to_path_buf));
        self.loading.pop();

        self.by_path.insert(canonical, index);
        Ok(index)
    }

    /// Compiles an in-memory source under a fresh virtual name.
    pub fn load_source(&mut self, contents: impl Into<String>, as_main: bool) -> ModuleIndex {
        let tag = self.next_virtual;
        self.next_virtual += 1;
        let source = self.sources.insert_virtual(tag, contents.into());
        self.compile(source, as_main, None)
    }

    /// parse -> (unless the parse failed) imports -> scope -> lower -> IR
    /// passes. Each stage accumulates diagnostics without halting the next.
    fn compile(
        &mut self,
        source: SourceId,
        as_main: bool,
        directory: Option<PathBuf>,
    ) -> ModuleIndex {
        let index = self.modules.next_index();
        self.modules.push(Module {
            index,
            source,
            arena: SyntaxArena::new(index),
            roots: Vec::new(),
            scopes: ScopeTables::default(),
            ir: ir::Module::new(),
            diagnostics: DiagnosticSet::new(),
        });

        let result = parse_module(self.sources.get(source), index, as_main);
        let parse_failed = result.diagnostics.contains_error();
        {
            let module = &mut self.modules[index];
            module.arena = result.arena;
            module.roots = result.roots;
            module.diagnostics = result.diagnostics;
        }

        if parse_failed {
            return index;
        }

        self.load_imports(index, directory);

        let file = self.sources.get(source);
        let module = &mut self.modules[index];
        module.scopes = scope_module(&module.arena, &module.roots);

        let mut diagnostics = std::mem::take(&mut module.diagnostics);
        module.ir = lower_module(
            &module.arena,
            &module.roots,
            &module.scopes,
            file,
            as_main,
            &mut diagnostics,
        );

        for function in module.ir.functions.values_mut() {
            if !function.is_defined() {
                continue;
            }

            let tree = DominatorTree::compute(function);
            if !definitions_dominate_uses(function, &tree) {
                continue;
            }

            close_regions(function);
            check_yield_coherence(function, &mut diagnostics);
            eliminate_dead_accesses(function);
        }

        module.diagnostics = diagnostics;
        index
    }

    /// Follows `import` declarations depth-first. Canonicalized paths detect
    /// cycles; imports carry no semantic effect on scoping.
    fn load_imports(&mut self, index: ModuleIndex, directory: Option<PathBuf>) {
        let module = &self.modules[index];
        let mut imports: Vec<(String, SourceSpan)> = Vec::new();
        for root in &module.roots {
            if let Some(id) = module.arena.cast::<ImportDecl>(*root) {
                let node = module.arena.get(id);
                imports.push((node.name.value.clone(), node.site));
            }
        }

        if imports.is_empty() {
            return;
        }
        let Some(directory) = directory else {
            return;
        };

        for (name, site) in imports {
            let file = directory.join(format!("{name}.{SOURCE_EXTENSION}"));
            let target = if file.exists() {
                file
            } else {
                directory.join(&name)
            };

            let canonical = target.canonicalize().unwrap_or_else(|_| target.clone());
            let resolved = if canonical.is_dir() {
                canonical.join(format!("index.{SOURCE_EXTENSION}"))
            } else {
                canonical
            };

            if self.loading.contains(&resolved) {
                self.modules[index].diagnostics.insert(Diagnostic::error(
                    format!("import cycle detected through '{name}'"),
                    site,
                ));
                continue;
            }

            if let Err(error) = self.load_file(&target, false) {
                self.modules[index].diagnostics.insert(Diagnostic::error(
                    format!("cannot load module '{name}': {error}"),
                    site,
                ));
            }
        }
    }

    /// Execution placeholder: reports whether the module could run at all.
    pub fn run(&self, module: ModuleIndex) -> bool {
        !self.modules[module].contains_error()
    }

    pub fn contains_error(&self) -> bool {
        self.modules.iter().any(Module::contains_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(text: &str) -> (Program, ModuleIndex) {
        let mut program = Program::new();
        let index = program.load_source(text, true);
        (program, index)
    }

    #[test]
    fn empty_input_produces_nothing() {
        let (program, index) = load("");
        let module = &program.modules[index];
        assert!(module.roots.is_empty());
        assert!(module.diagnostics.is_empty());
        assert!(program.run(index));
    }

    #[test]
    fn pipeline_produces_ir_and_regions() {
        let (program, index) = load("fun f(x) =\n  let y = x\n  return y\nprint(f(1))\n");
        let module = &program.modules[index];
        assert!(!module.contains_error());

        let f = module.ir.get("f").expect("f was lowered");
        let rendered = f.to_string();
        assert!(rendered.contains("access [let]"), "IR was: {rendered}");
        assert!(rendered.contains("end_access"), "IR was: {rendered}");
    }

    #[test]
    fn parse_errors_stop_the_pipeline() {
        let (program, index) = load("fun f() =\n  a\n   b\n");
        let module = &program.modules[index];
        assert!(module.contains_error());
        // No IR was produced
        assert!(module.ir.functions.is_empty());
        assert!(!program.run(index));
    }

    #[test]
    fn semantic_errors_do_not_halt_lowering() {
        let (program, index) = load("print(x)\nprint(y)\n");
        let module = &program.modules[index];
        let messages: Vec<_> = module.diagnostics.iter().map(|d| d.message.clone()).collect();
        assert_eq!(
            messages,
            vec!["undefined symbol 'x'", "undefined symbol 'y'"]
        );
        assert!(module.ir.get("$main").is_some());
    }

    #[test]
    fn directory_imports_resolve_index() {
        let directory = std::env::temp_dir().join(format!(
            "dyvac-dir-import-test-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(directory.join("lib")).unwrap();
        std::fs::write(
            directory.join("lib").join("index.dyva"),
            "fun shared(x) = x\n",
        )
        .unwrap();
        std::fs::write(directory.join("app.dyva"), "import lib\nfun go(x) = x\n").unwrap();

        let mut program = Program::new();
        let app = program
            .load_file(&directory.join("app.dyva"), false)
            .unwrap();

        assert_eq!(program.modules.len(), 2);
        assert!(!program.contains_error());

        let lib = program.modules.iter().find(|m| m.index != app).unwrap();
        assert!(lib.ir.get("shared").is_some());

        std::fs::remove_dir_all(&directory).ok();
    }

    #[test]
    fn imports_load_and_cycles_are_detected() {
        let directory = std::env::temp_dir().join(format!(
            "dyvac-import-test-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&directory).unwrap();
        std::fs::write(directory.join("a.dyva"), "import b\nfun fa(x) = x\n").unwrap();
        std::fs::write(directory.join("b.dyva"), "import a\nfun fb(x) = x\n").unwrap();

        let mut program = Program::new();
        let a = program.load_file(&directory.join("a.dyva"), false).unwrap();

        // b was loaded transitively; the back-edge to a was cut
        assert_eq!(program.modules.len(), 2);
        let b = program.modules.iter().find(|m| m.index != a).unwrap();
        assert!(b
            .diagnostics
            .iter()
            .any(|d| d.message.contains("import cycle")));

        // Re-loading is a no-op that returns the existing module
        let again = program.load_file(&directory.join("a.dyva"), false).unwrap();
        assert_eq!(again, a);
        assert_eq!(program.modules.len(), 2);

        std::fs::remove_dir_all(&directory).ok();
    }
}
