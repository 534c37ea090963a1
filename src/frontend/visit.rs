//! Structural pre-order traversal over the arena, dispatched by node tag.

use crate::frontend::ast::{
    ExpressionId, NodeId, NodeRef, PatternId, Syntax, SyntaxArena, VariableDecl,
};

/// A pre-order visitor. `will_enter` returning `false` skips the node's
/// subtree (and its `will_exit`).
pub trait Visitor {
    fn will_enter(&mut self, arena: &SyntaxArena, node: NodeRef) -> bool {
        let _ = (arena, node);
        true
    }

    fn will_exit(&mut self, arena: &SyntaxArena, node: NodeRef) {
        let _ = (arena, node);
    }
}

/// Walks the subtree rooted at `root` in pre-order.
pub fn traverse<V: Visitor>(arena: &SyntaxArena, root: NodeRef, visitor: &mut V) {
    if !visitor.will_enter(arena, root) {
        return;
    }
    for_each_child(arena, root, &mut |child| traverse(arena, child, visitor));
    visitor.will_exit(arena, root);
}

/// Enumerates the direct children of a node, in source order.
pub fn for_each_child(arena: &SyntaxArena, node: NodeRef, f: &mut impl FnMut(NodeRef)) {
    match arena.node(node) {
        Syntax::BindingDecl(n) => {
            f(n.pattern.raw);
            if let Some(initializer) = n.initializer {
                f(initializer.raw());
            }
        }
        Syntax::FunctionDecl(n) => {
            for parameter in &n.parameters {
                f(parameter.raw);
            }
            if let Some(body) = &n.body {
                for statement in body {
                    f(statement.raw());
                }
            }
        }
        Syntax::ParameterDecl(n) => {
            if let Some(default) = n.default {
                f(default.raw());
            }
        }
        Syntax::StructDecl(n) => {
            for parent in &n.parents {
                f(parent.raw());
            }
            for member in &n.members {
                f(member.raw());
            }
        }
        Syntax::TraitDecl(n) => {
            for parent in &n.parents {
                f(parent.raw());
            }
            for member in &n.members {
                f(member.raw());
            }
        }
        Syntax::FieldDecl(n) => {
            if let Some(default) = n.default {
                f(default.raw());
            }
        }
        Syntax::VariableDecl(_) | Syntax::ImportDecl(_) => {}

        Syntax::BoolLiteral(_)
        | Syntax::IntegerLiteral(_)
        | Syntax::FloatLiteral(_)
        | Syntax::StringLiteral(_) => {}
        Syntax::ArrayLiteral(n) => {
            for element in &n.elements {
                f(element.raw());
            }
        }
        Syntax::DictionaryLiteral(n) => {
            for entry in &n.entries {
                f(entry.key.raw());
                f(entry.value.raw());
            }
        }
        Syntax::TupleLiteral(n) => {
            for element in &n.elements {
                f(element.value.raw());
            }
        }
        Syntax::NameExpr(n) => {
            if let Some(qualification) = n.qualification {
                f(qualification.raw());
            }
        }
        Syntax::Call(n) => {
            f(n.callee.raw());
            for argument in &n.arguments {
                f(argument.value.raw());
            }
        }
        Syntax::TypeTest(n) => {
            f(n.lhs.raw());
            f(n.rhs.raw());
        }
        Syntax::Lambda(n) => {
            for parameter in &n.parameters {
                f(parameter.raw);
            }
            for statement in &n.body {
                f(statement.raw());
            }
        }
        Syntax::Conditional(n) => {
            for condition in &n.conditions {
                f(condition.raw());
            }
            f(n.success.raw);
            if let Some(failure) = n.failure {
                f(failure.raw());
            }
        }
        Syntax::Match(n) => {
            f(n.subject.raw());
            for case in &n.cases {
                f(case.raw);
            }
        }
        Syntax::MatchCase(n) => {
            f(n.pattern.raw());
            f(n.body.raw);
        }
        Syntax::Try(n) => {
            f(n.body.raw);
            for handler in &n.handlers {
                f(handler.raw);
            }
        }

        Syntax::MatchCondition(n) => {
            f(n.pattern.raw());
            f(n.subject.raw());
        }

        Syntax::BindingPattern(n) => f(n.subpattern.raw()),
        Syntax::TuplePattern(n) => {
            for element in &n.elements {
                f(element.pattern.raw());
            }
        }
        Syntax::ExtractorPattern(n) => {
            f(n.callee.raw());
            for argument in &n.arguments {
                f(argument.pattern.raw());
            }
        }
        Syntax::TypePattern(n) => {
            f(n.lhs.raw());
            f(n.rhs.raw());
        }
        Syntax::WildcardPattern(_) => {}

        Syntax::Block(n) => {
            for statement in &n.statements {
                f(statement.raw());
            }
        }
        Syntax::Break(_) | Syntax::Continue(_) => {}
        Syntax::Defer(n) => f(n.body.raw),
        Syntax::For(n) => {
            f(n.binding.raw);
            f(n.domain.raw());
            if let Some(filter) = n.filter {
                f(filter.raw());
            }
            f(n.body.raw);
        }
        Syntax::While(n) => {
            for condition in &n.conditions {
                f(condition.raw());
            }
            f(n.body.raw);
        }
        Syntax::Return(n) => {
            if let Some(value) = n.value {
                f(value.raw());
            }
        }
        Syntax::Throw(n) => f(n.value.raw()),
        Syntax::Yield(n) => f(n.value.raw()),
        Syntax::Assignment(n) => {
            f(n.target.raw());
            f(n.value.raw());
        }
    }
}

/// Walks a pattern alongside an expression. A tuple pattern aligned with a
/// tuple literal of identical labels is visited element-wise; otherwise the
/// callback fires at the pattern as a whole, with the tuple path leading to
/// it.
pub fn visit_pattern_with(
    arena: &SyntaxArena,
    pattern: PatternId,
    expression: ExpressionId,
    path: &mut Vec<u32>,
    f: &mut impl FnMut(PatternId, ExpressionId, &[u32]),
) {
    match (arena.node(pattern.raw()), arena.node(expression.raw())) {
        (Syntax::BindingPattern(p), _) => {
            visit_pattern_with(arena, p.subpattern, expression, path, f);
        }
        (Syntax::TuplePattern(p), Syntax::TupleLiteral(e))
            if p.elements.len() == e.elements.len()
                && p.elements.iter().zip(e.elements.iter()).all(|(pe, ee)| {
                    pe.label.as_ref().map(|l| &l.value) == ee.label.as_ref().map(|l| &l.value)
                }) =>
        {
            for (i, (pe, ee)) in p.elements.iter().zip(e.elements.iter()).enumerate() {
                path.push(i as u32);
                visit_pattern_with(arena, pe.pattern, ee.value, path, f);
                path.pop();
            }
        }
        _ => f(pattern, expression, path),
    }
}

/// Enumerates the variable declarations a pattern introduces, together with
/// the tuple path to each.
pub fn for_each_declaration(
    arena: &SyntaxArena,
    pattern: PatternId,
    path: &mut Vec<u32>,
    f: &mut impl FnMut(NodeId<VariableDecl>, &[u32]),
) {
    match arena.node(pattern.raw()) {
        Syntax::BindingPattern(p) => for_each_declaration(arena, p.subpattern, path, f),
        Syntax::TuplePattern(p) => {
            for (i, element) in p.elements.iter().enumerate() {
                path.push(i as u32);
                for_each_declaration(arena, element.pattern, path, f);
                path.pop();
            }
        }
        Syntax::TypePattern(p) => for_each_declaration(arena, p.lhs, path, f),
        Syntax::ExtractorPattern(p) => {
            for (i, argument) in p.arguments.iter().enumerate() {
                path.push(i as u32);
                for_each_declaration(arena, argument.pattern, path, f);
                path.pop();
            }
        }
        Syntax::VariableDecl(_) => {
            let id = arena
                .cast::<VariableDecl>(pattern.raw())
                .expect("matched the variant");
            f(id, path);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::ast::{ModuleIndex, SyntaxTag};
    use crate::frontend::parser::parse_module;
    use crate::index::Index;
    use crate::source::SourceMap;

    fn parsed(text: &str) -> (SourceMap, crate::frontend::parser::ParseResult) {
        let mut sources = SourceMap::new();
        let id = sources.insert_virtual(0, text.to_owned());
        let result = parse_module(sources.get(id), ModuleIndex::new(0), true);
        assert!(!result.diagnostics.contains_error());
        (sources, result)
    }

    struct Recorder {
        entered: Vec<SyntaxTag>,
        exited: Vec<SyntaxTag>,
        skip: Option<SyntaxTag>,
    }

    impl Visitor for Recorder {
        fn will_enter(&mut self, arena: &SyntaxArena, node: NodeRef) -> bool {
            let tag = arena.tag(node);
            self.entered.push(tag);
            Some(tag) != self.skip
        }

        fn will_exit(&mut self, arena: &SyntaxArena, node: NodeRef) {
            self.exited.push(arena.tag(node));
        }
    }

    #[test]
    fn preorder_enumeration() {
        let (_, result) = parsed("let x = f(1)\n");
        let mut recorder = Recorder {
            entered: Vec::new(),
            exited: Vec::new(),
            skip: None,
        };
        traverse(&result.arena, result.roots[0], &mut recorder);

        assert_eq!(
            recorder.entered,
            vec![
                SyntaxTag::BindingDecl,
                SyntaxTag::BindingPattern,
                SyntaxTag::VariableDecl,
                SyntaxTag::Call,
                SyntaxTag::NameExpr,
                SyntaxTag::IntegerLiteral,
            ]
        );
        // Exits mirror entries in postorder
        assert_eq!(recorder.exited.last(), Some(&SyntaxTag::BindingDecl));
        assert_eq!(recorder.entered.len(), recorder.exited.len());
    }

    #[test]
    fn skipped_subtrees_get_no_exit() {
        let (_, result) = parsed("let x = f(1)\n");
        let mut recorder = Recorder {
            entered: Vec::new(),
            exited: Vec::new(),
            skip: Some(SyntaxTag::Call),
        };
        traverse(&result.arena, result.roots[0], &mut recorder);

        assert!(recorder.entered.contains(&SyntaxTag::Call));
        assert!(!recorder.entered.contains(&SyntaxTag::NameExpr));
        assert!(!recorder.exited.contains(&SyntaxTag::Call));
    }

    #[test]
    fn pattern_expression_alignment() {
        let (_, result) = parsed("let (a, b) = (1, (2, 3))\n");
        let binding = result
            .arena
            .cast::<crate::frontend::ast::BindingDecl>(result.roots[0])
            .unwrap();
        let node = result.arena.get(binding);
        let pattern = PatternId::from(node.pattern);
        let initializer = node.initializer.unwrap();

        let mut leaves = Vec::new();
        visit_pattern_with(
            &result.arena,
            pattern,
            initializer,
            &mut Vec::new(),
            &mut |p, e, path| {
                leaves.push((
                    result.arena.tag(p.raw()),
                    result.arena.tag(e.raw()),
                    path.to_vec(),
                ));
            },
        );

        assert_eq!(
            leaves,
            vec![
                (
                    SyntaxTag::VariableDecl,
                    SyntaxTag::IntegerLiteral,
                    vec![0]
                ),
                (SyntaxTag::VariableDecl, SyntaxTag::TupleLiteral, vec![1]),
            ]
        );
    }

    #[test]
    fn misaligned_tuple_fires_at_the_whole() {
        // Labels do not match, so the callback fires once at the tuple
        let (_, result) = parsed("let (x: a, y: b) = (u: 1, v: 2)\n");
        let binding = result
            .arena
            .cast::<crate::frontend::ast::BindingDecl>(result.roots[0])
            .unwrap();
        let node = result.arena.get(binding);

        let mut count = 0;
        visit_pattern_with(
            &result.arena,
            node.pattern.into(),
            node.initializer.unwrap(),
            &mut Vec::new(),
            &mut |_, _, path| {
                assert!(path.is_empty());
                count += 1;
            },
        );
        assert_eq!(count, 1);
    }

    #[test]
    fn every_parsed_node_is_reachable_from_the_roots() {
        // One program touching every node category
        let source = "\
import helpers
struct Point: Comparable =
  var x = 0
  fun norm(self) =
    return self.x
trait Ordered
fun classify(n, fallback = 0) =
  let label = match n do
    0 => \"zero\"
    .negative(let magnitude) => magnitude
    _ as Int => fallback
  if n, case 0 = n do
    throw label
  else
    return label
subscript first(pair) =
  yield pair.0
fun drive(items) =
  var total = 0
  for let item in items where item do
    while total do
      total = (total - 1)
      continue
    defer
      print(total)
    do
      total = first[item]
  try
    drive([1, 2])
  catch
    _ =>
      total!
  return \\x => x
print(classify(n: true is Bool))
";
        let (_, result) = parsed(source);

        let mut visited = hashbrown::HashSet::new();
        struct Collector<'a> {
            visited: &'a mut hashbrown::HashSet<NodeRef>,
        }
        impl<'a> Visitor for Collector<'a> {
            fn will_enter(&mut self, _arena: &SyntaxArena, node: NodeRef) -> bool {
                self.visited.insert(node)
            }
        }

        for root in &result.roots {
            traverse(
                &result.arena,
                *root,
                &mut Collector {
                    visited: &mut visited,
                },
            );
        }

        assert_eq!(visited.len(), result.arena.len());
        assert!(result.arena.tags_agree_with_payloads());
    }

    #[test]
    fn declaration_enumeration_with_paths() {
        let (_, result) = parsed("let (a, (b, c)) = x\n");
        let binding = result
            .arena
            .cast::<crate::frontend::ast::BindingDecl>(result.roots[0])
            .unwrap();
        let pattern = result.arena.get(binding).pattern;

        let mut declared = Vec::new();
        for_each_declaration(
            &result.arena,
            pattern.into(),
            &mut Vec::new(),
            &mut |variable, path| {
                declared.push((
                    result.arena.get(variable).identifier.value.clone(),
                    path.to_vec(),
                ));
            },
        );

        assert_eq!(
            declared,
            vec![
                ("a".to_owned(), vec![0]),
                ("b".to_owned(), vec![1, 0]),
                ("c".to_owned(), vec![1, 1]),
            ]
        );
    }
}
