use hashbrown::HashMap;

use crate::frontend::ast::{DeclarationId, NodeRef, SyntaxArena};
use crate::frontend::visit::{traverse, Visitor};

/// The lexical relationships of one module: a parent pointer for every node
/// and the declarations directly contained in every scope.
#[derive(Debug, Default)]
pub struct ScopeTables {
    syntax_to_parent: Vec<Option<NodeRef>>,
    scope_to_declarations: HashMap<NodeRef, Vec<DeclarationId>>,
}

impl ScopeTables {
    /// The innermost scope containing `node`: either a scope node or the
    /// module scope. `None` only before scoping ran.
    pub fn parent(&self, node: NodeRef) -> Option<NodeRef> {
        self.syntax_to_parent
            .get(node.offset as usize)
            .copied()
            .flatten()
    }

    /// The declarations lexically contained in `scope`, in source order.
    pub fn declarations(&self, scope: NodeRef) -> &[DeclarationId] {
        self.scope_to_declarations
            .get(&scope)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_scoped(&self, scope: NodeRef) -> bool {
        self.scope_to_declarations.contains_key(&scope)
    }
}

struct Scoper<'a> {
    tables: &'a mut ScopeTables,
    /// The stack of entered scopes; the last entry is the innermost.
    stack: Vec<NodeRef>,
}

impl<'a> Visitor for Scoper<'a> {
    fn will_enter(&mut self, arena: &SyntaxArena, node: NodeRef) -> bool {
        let innermost = *self.stack.last().expect("the module scope is always on the stack");
        self.tables.syntax_to_parent[node.offset as usize] = Some(innermost);

        if let Some(declaration) = arena.cast_to_declaration(node) {
            if !innermost.is_module_scope() {
                self.tables
                    .scope_to_declarations
                    .get_mut(&innermost)
                    .expect("entered scopes are seeded")
                    .push(declaration);
            }
        }

        if arena.tag(node).is_scope() {
            self.stack.push(node);
            self.tables.scope_to_declarations.insert(node, Vec::new());
        }

        true
    }

    fn will_exit(&mut self, arena: &SyntaxArena, node: NodeRef) {
        if arena.tag(node).is_scope() {
            let popped = self.stack.pop();
            debug_assert_eq!(popped, Some(node));
        }
    }
}

/// Materializes parent pointers and per-scope declaration lists for a parsed
/// module.
pub fn scope_module(arena: &SyntaxArena, roots: &[NodeRef]) -> ScopeTables {
    let mut tables = ScopeTables {
        syntax_to_parent: vec![None; arena.len()],
        scope_to_declarations: HashMap::new(),
    };

    let module_scope = NodeRef::module_scope(arena.module());
    tables
        .scope_to_declarations
        .insert(module_scope, Vec::new());

    let mut scoper = Scoper {
        tables: &mut tables,
        stack: vec![module_scope],
    };
    for root in roots {
        traverse(arena, *root, &mut scoper);
    }

    tables
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::ast::{FunctionDecl, ModuleIndex, SyntaxTag};
    use crate::frontend::parser::{parse_module, ParseResult};
    use crate::index::Index;
    use crate::source::SourceMap;

    fn scoped(text: &str) -> (ParseResult, ScopeTables) {
        let mut sources = SourceMap::new();
        let id = sources.insert_virtual(0, text.to_owned());
        let result = parse_module(sources.get(id), ModuleIndex::new(0), true);
        assert!(!result.diagnostics.contains_error());
        let tables = scope_module(&result.arena, &result.roots);
        (result, tables)
    }

    #[test]
    fn every_node_has_a_parent() {
        let (result, tables) = scoped("fun f(x) =\n  let y = x\n  return y\nf(1)\n");

        for node in result.arena.refs() {
            let parent = tables.parent(node).expect("scoping fills every parent");
            assert!(
                parent.is_module_scope() || result.arena.tag(parent).is_scope(),
                "parent of {:?} is not a scope",
                result.arena.tag(node)
            );
        }
    }

    #[test]
    fn parent_spans_cover_child_spans() {
        let (result, tables) = scoped("fun f(x) =\n  if x do\n    return 1\n  return 2\n");

        for node in result.arena.refs() {
            let parent = tables.parent(node).unwrap();
            if parent.is_module_scope() {
                continue;
            }
            let parent_site = result.arena.site(parent);
            let child_site = result.arena.site(node);
            assert!(
                parent_site.covers(child_site),
                "{:?} does not cover {:?}",
                result.arena.tag(parent),
                result.arena.tag(node)
            );
        }
    }

    #[test]
    fn scope_declarations_are_ordered() {
        let (result, tables) = scoped("fun f(x) =\n  let a = 1\n  let b = 2\n  return a\n");

        let function = result
            .arena
            .cast::<FunctionDecl>(result.roots[0])
            .expect("root is a function");

        let declarations = tables.declarations(function.raw);
        // The parameter, the two bindings, and their variables
        let tags: Vec<_> = declarations
            .iter()
            .map(|d| result.arena.tag(d.raw()))
            .collect();
        assert_eq!(tags[0], SyntaxTag::ParameterDecl);
        assert!(tags.contains(&SyntaxTag::BindingDecl));
    }

    #[test]
    fn top_level_declarations_are_not_attributed_to_the_module_map() {
        let (result, tables) = scoped("let a = 1\n");
        let module_scope = NodeRef::module_scope(result.arena.module());
        assert!(tables.declarations(module_scope).is_empty());
        assert!(tables.is_scoped(module_scope));
    }

    #[test]
    fn nested_scopes_nest() {
        let (result, tables) = scoped("fun f(x) =\n  if x do\n    let y = 1\n");

        // Find the variable declaration for `y` and walk its parents
        let y = result
            .arena
            .refs()
            .find(|r| {
                result
                    .arena
                    .cast::<crate::frontend::ast::VariableDecl>(*r)
                    .is_some_and(|id| result.arena.get(id).identifier.value == "y")
            })
            .expect("y is declared");

        let mut chain = Vec::new();
        let mut cursor = y;
        while let Some(parent) = tables.parent(cursor) {
            if parent.is_module_scope() {
                chain.push(None);
                break;
            }
            chain.push(Some(result.arena.tag(parent)));
            cursor = parent;
        }

        assert_eq!(
            chain,
            vec![
                Some(SyntaxTag::Block),
                Some(SyntaxTag::Conditional),
                Some(SyntaxTag::FunctionDecl),
                None,
            ]
        );
    }
}
