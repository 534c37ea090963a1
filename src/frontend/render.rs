//! Renders an arena-backed module as canonical source text. Parsing the
//! rendered text again yields the same tree shape, which is what the
//! round-trip tests rely on.

use std::fmt::Write;

use crate::frontend::ast::{
    BindingDecl, BindingIntroducer, Block, CallStyle, Conditional, ConditionId, DeclarationId,
    ExpressionId, FunctionIntroducer, LabeledExpression, LabeledPattern, Name, NodeId, NodeRef,
    OperatorNotation, ParameterDecl, PassingConvention, PatternId, Syntax, SyntaxArena, SyntaxTag,
};
use crate::source::SourceFile;

const INDENT: &str = "  ";

pub fn render_module(arena: &SyntaxArena, roots: &[NodeRef], source: &SourceFile) -> String {
    let mut renderer = Renderer {
        arena,
        source,
        out: String::new(),
        indent: 0,
    };
    for root in roots {
        renderer.statement_line(*root);
    }
    renderer.out
}

struct Renderer<'a> {
    arena: &'a SyntaxArena,
    source: &'a SourceFile,
    out: String,
    indent: usize,
}

impl<'a> Renderer<'a> {
    fn write_indent(&mut self) {
        for _ in 0..self.indent {
            self.out.push_str(INDENT);
        }
    }

    fn indented(&mut self, f: impl FnOnce(&mut Self)) {
        self.indent += 1;
        f(self);
        self.indent -= 1;
    }

    /// Statements that end in an indented block already wrote their line
    /// break; everything else gets one here.
    fn ensure_newline(&mut self) {
        if !self.out.ends_with('\n') {
            self.out.push('\n');
        }
    }

    /// One statement on its own line at the current indentation.
    fn statement_line(&mut self, statement: NodeRef) {
        self.write_indent();
        self.statement(statement);
        self.ensure_newline();
    }

    /// An indented statement block, starting on a fresh line.
    fn block(&mut self, block: NodeId<Block>) {
        let statements = self.arena.get(block).statements.clone();
        self.out.push('\n');
        self.indented(|this| {
            for statement in &statements {
                this.statement_line(statement.raw());
            }
        });
    }

    fn statement(&mut self, statement: NodeRef) {
        let arena = self.arena;
        match arena.node(statement) {
            Syntax::BindingDecl(_) => {
                let id = arena
                    .cast::<BindingDecl>(statement)
                    .expect("matched the variant");
                self.binding(id);
            }
            Syntax::FunctionDecl(n) => {
                let introducer = match n.introducer {
                    FunctionIntroducer::Fun => "fun",
                    FunctionIntroducer::Subscript => "subscript",
                };
                let _ = write!(self.out, "{introducer} ");
                self.function_name(&n.name);
                self.parameter_list(&n.parameters);

                if let Some(body) = &n.body {
                    self.out.push_str(" =\n");
                    self.indented(|this| {
                        for statement in body {
                            this.statement_line(statement.raw());
                        }
                    });
                }
            }
            Syntax::StructDecl(n) => {
                let _ = write!(self.out, "struct {}", n.identifier.value);
                self.parent_list(&n.parents);
                self.member_block(&n.members);
            }
            Syntax::TraitDecl(n) => {
                let _ = write!(self.out, "trait {}", n.identifier.value);
                self.parent_list(&n.parents);
                self.member_block(&n.members);
            }
            Syntax::FieldDecl(n) => {
                let _ = write!(self.out, "var {}", n.identifier.value);
                if let Some(default) = n.default {
                    self.out.push_str(" = ");
                    self.expression(default);
                }
            }
            Syntax::ImportDecl(n) => {
                let _ = write!(self.out, "import {}", n.name.value);
            }

            Syntax::Block(_) => {
                let id = arena.cast::<Block>(statement).expect("matched the variant");
                self.out.push_str("do");
                self.block(id);
            }
            Syntax::Break(_) => self.out.push_str("break"),
            Syntax::Continue(_) => self.out.push_str("continue"),
            Syntax::Defer(n) => {
                self.out.push_str("defer");
                self.block(n.body);
            }
            Syntax::For(n) => {
                self.out.push_str("for ");
                self.pattern(n.binding.into());
                self.out.push_str(" in ");
                self.expression(n.domain);
                if let Some(filter) = n.filter {
                    self.out.push_str(" where ");
                    self.expression(filter);
                }
                self.out.push_str(" do");
                self.block(n.body);
            }
            Syntax::While(n) => {
                self.out.push_str("while ");
                self.condition_list(&n.conditions);
                self.out.push_str(" do");
                self.block(n.body);
            }
            Syntax::Return(n) => {
                self.out.push_str("return");
                if let Some(value) = n.value {
                    self.out.push(' ');
                    self.expression(value);
                }
            }
            Syntax::Throw(n) => {
                self.out.push_str("throw ");
                self.expression(n.value);
            }
            Syntax::Yield(n) => {
                self.out.push_str("yield ");
                self.expression(n.value);
            }
            Syntax::Assignment(n) => {
                self.expression(n.target);
                self.out.push_str(" = ");
                self.expression(n.value);
            }
            _ => {
                let expression = arena
                    .cast_to_expression(statement)
                    .expect("statements are declarations, statements proper, or expressions");
                self.expression(expression);
            }
        }
    }

    fn binding(&mut self, id: NodeId<BindingDecl>) {
        let node = self.arena.get(id);
        self.pattern(node.pattern.into());
        if let Some(initializer) = node.initializer {
            self.out.push_str(" = ");
            self.expression(initializer);
        }
    }

    fn function_name(&mut self, name: &Name) {
        match name.notation {
            Some(notation) => {
                let _ = write!(self.out, "{notation} {}", name.identifier);
            }
            None => self.identifier(&name.identifier),
        }
    }

    /// Identifiers that collide with a reserved word are backquoted.
    fn identifier(&mut self, value: &str) {
        if value.parse::<crate::frontend::lexer::Keyword>().is_ok()
            || value == "true"
            || value == "false"
            || value == "_"
        {
            let _ = write!(self.out, "`{value}`");
        } else {
            self.out.push_str(value);
        }
    }

    fn parameter_list(&mut self, parameters: &[NodeId<ParameterDecl>]) {
        self.out.push('(');
        for (i, parameter) in parameters.iter().enumerate() {
            if i > 0 {
                self.out.push_str(", ");
            }
            self.parameter(*parameter);
        }
        self.out.push(')');
    }

    fn parameter(&mut self, id: NodeId<ParameterDecl>) {
        let node = self.arena.get(id);

        match &node.label {
            None => self.out.push_str("_ "),
            Some(label) if label.value != node.identifier.value => {
                self.identifier(&label.value);
                self.out.push(' ');
            }
            Some(_) => {}
        }
        self.identifier(&node.identifier.value);

        if let Some(convention) = node.convention {
            let spelled = match convention {
                PassingConvention::Let => "let",
                PassingConvention::Inout => "inout",
                PassingConvention::Sink => "sink",
            };
            let _ = write!(self.out, ": {spelled}");
        }
        if let Some(default) = node.default {
            self.out.push_str(" = ");
            self.expression(default);
        }
    }

    fn parent_list(&mut self, parents: &[ExpressionId]) {
        for (i, parent) in parents.iter().enumerate() {
            self.out.push_str(if i == 0 { ": " } else { ", " });
            self.expression(*parent);
        }
    }

    fn member_block(&mut self, members: &[DeclarationId]) {
        if members.is_empty() {
            return;
        }
        self.out.push_str(" =\n");
        self.indented(|this| {
            for member in members {
                this.statement_line(member.raw());
            }
        });
    }

    fn condition_list(&mut self, conditions: &[ConditionId]) {
        for (i, condition) in conditions.iter().enumerate() {
            if i > 0 {
                self.out.push_str(", ");
            }
            self.condition(*condition);
        }
    }

    fn condition(&mut self, condition: ConditionId) {
        let arena = self.arena;
        let raw = condition.raw();
        match arena.node(raw) {
            Syntax::MatchCondition(n) => {
                self.out.push_str("case ");
                self.pattern(n.pattern);
                self.out.push_str(" = ");
                self.expression(n.subject);
            }
            Syntax::BindingDecl(_) => {
                let id = arena.cast::<BindingDecl>(raw).expect("matched the variant");
                self.binding(id);
            }
            _ => {
                let expression = arena
                    .cast_to_expression(raw)
                    .expect("conditions are expressions, bindings, or match conditions");
                self.expression(expression);
            }
        }
    }

    fn expression(&mut self, expression: ExpressionId) {
        let arena = self.arena;
        let raw = expression.raw();

        match arena.node(raw) {
            Syntax::BoolLiteral(n) => {
                self.out.push_str(if n.value { "true" } else { "false" });
            }
            // Numeric literal spellings come straight from the source
            Syntax::IntegerLiteral(n) => {
                let text = self.source.text_of(n.site);
                self.out.push_str(text);
            }
            Syntax::FloatLiteral(n) => {
                let text = self.source.text_of(n.site);
                self.out.push_str(text);
            }
            Syntax::StringLiteral(n) => {
                let _ = write!(self.out, "{:?}", n.value);
            }
            Syntax::ArrayLiteral(n) => {
                self.out.push('[');
                for (i, element) in n.elements.iter().enumerate() {
                    if i > 0 {
                        self.out.push_str(", ");
                    }
                    self.expression(*element);
                }
                self.out.push(']');
            }
            Syntax::DictionaryLiteral(n) => {
                if n.entries.is_empty() {
                    self.out.push_str("[:]");
                    return;
                }
                self.out.push('[');
                for (i, entry) in n.entries.iter().enumerate() {
                    if i > 0 {
                        self.out.push_str(", ");
                    }
                    self.expression(entry.key);
                    self.out.push_str(": ");
                    self.expression(entry.value);
                }
                self.out.push(']');
            }
            Syntax::TupleLiteral(n) => {
                self.out.push('(');
                for (i, element) in n.elements.iter().enumerate() {
                    if i > 0 {
                        self.out.push_str(", ");
                    }
                    self.labeled_expression(element);
                }
                if n.elements.len() == 1 && n.elements[0].label.is_none() {
                    self.out.push(',');
                }
                self.out.push(')');
            }
            Syntax::NameExpr(n) => {
                if let Some(qualification) = n.qualification {
                    self.expression(qualification);
                    self.out.push('.');
                }
                self.identifier(&n.name.identifier);
            }
            Syntax::Call(n) => self.call(n.callee, &n.arguments, n.style),
            Syntax::TypeTest(n) => {
                self.expression(n.lhs);
                self.out.push_str(" is ");
                self.expression(n.rhs);
            }
            Syntax::Lambda(n) => {
                self.out.push('\\');
                for (i, parameter) in n.parameters.iter().enumerate() {
                    if i > 0 {
                        self.out.push_str(", ");
                    }
                    self.identifier(&arena.get(*parameter).identifier.value);
                }
                self.out.push_str(" =>\n");
                self.indented(|this| {
                    for statement in &n.body {
                        this.statement_line(statement.raw());
                    }
                });
            }
            Syntax::Conditional(_) => {
                let id = arena
                    .cast::<Conditional>(raw)
                    .expect("matched the variant");
                self.conditional(id);
            }
            Syntax::Match(n) => {
                self.out.push_str("match ");
                self.expression(n.subject);
                self.out.push_str(" do\n");
                self.indented(|this| {
                    for case in &n.cases {
                        let node = this.arena.get(*case);
                        this.write_indent();
                        this.pattern(node.pattern);
                        this.out.push_str(" =>");
                        this.block(node.body);
                    }
                });
            }
            Syntax::Try(n) => {
                self.out.push_str("try");
                self.block(n.body);
                if !n.handlers.is_empty() {
                    self.write_indent();
                    self.out.push_str("catch\n");
                    self.indented(|this| {
                        for handler in &n.handlers {
                            let node = this.arena.get(*handler);
                            this.write_indent();
                            this.pattern(node.pattern);
                            this.out.push_str(" =>");
                            this.block(node.body);
                        }
                    });
                }
            }
            _ => unreachable!("not an expression"),
        }
    }

    /// Operator-encoded calls render back as operator syntax, parenthesized
    /// so that re-parsing needs no precedence context.
    fn call(&mut self, callee: ExpressionId, arguments: &[LabeledExpression], style: CallStyle) {
        let arena = self.arena;

        if let Syntax::NameExpr(callee_name) = arena.node(callee.raw()) {
            if let (Some(qualification), Some(notation)) =
                (callee_name.qualification, callee_name.name.notation)
            {
                let operator = &callee_name.name.identifier;
                match notation {
                    OperatorNotation::Infix if arguments.len() == 1 => {
                        self.out.push('(');
                        self.expression(qualification);
                        let _ = write!(self.out, " {operator} ");
                        self.expression(arguments[0].value);
                        self.out.push(')');
                        return;
                    }
                    OperatorNotation::Prefix if arguments.is_empty() => {
                        let _ = write!(self.out, "({operator}");
                        self.expression(qualification);
                        self.out.push(')');
                        return;
                    }
                    OperatorNotation::Postfix if arguments.is_empty() => {
                        self.out.push('(');
                        self.expression(qualification);
                        let _ = write!(self.out, "{operator})");
                        return;
                    }
                    _ => {}
                }
            }
        }

        self.expression(callee);
        let (open, close) = match style {
            CallStyle::Parenthesized => ('(', ')'),
            CallStyle::Bracketed => ('[', ']'),
        };
        self.out.push(open);
        for (i, argument) in arguments.iter().enumerate() {
            if i > 0 {
                self.out.push_str(", ");
            }
            self.labeled_expression(argument);
        }
        self.out.push(close);
    }

    fn labeled_expression(&mut self, element: &LabeledExpression) {
        if let Some(label) = &element.label {
            self.identifier(&label.value);
            self.out.push_str(": ");
        }
        self.expression(element.value);
    }

    fn conditional(&mut self, id: NodeId<Conditional>) {
        let node = self.arena.get(id);
        self.out.push_str("if ");
        self.condition_list(&node.conditions);
        self.out.push_str(" do");
        self.block(node.success);

        if let Some(failure) = node.failure {
            let raw = failure.raw();
            self.write_indent();
            match self.arena.tag(raw) {
                SyntaxTag::Conditional => {
                    self.out.push_str("else ");
                    let nested = self.arena.cast::<Conditional>(raw).expect("tag checked");
                    self.conditional(nested);
                }
                SyntaxTag::Block => {
                    self.out.push_str("else");
                    let block = self.arena.cast::<Block>(raw).expect("tag checked");
                    self.block(block);
                }
                _ => unreachable!("an else branch is a block or a conditional"),
            }
        }
    }

    fn pattern(&mut self, pattern: PatternId) {
        let arena = self.arena;
        let raw = pattern.raw();

        match arena.node(raw) {
            Syntax::BindingPattern(n) => {
                let introducer = match n.introducer {
                    BindingIntroducer::Let => "let",
                    BindingIntroducer::Var => "var",
                    BindingIntroducer::Inout => "inout",
                };
                let _ = write!(self.out, "{introducer} ");
                self.pattern(n.subpattern);
            }
            Syntax::TuplePattern(n) => {
                self.out.push('(');
                for (i, element) in n.elements.iter().enumerate() {
                    if i > 0 {
                        self.out.push_str(", ");
                    }
                    self.labeled_pattern(element);
                }
                self.out.push(')');
            }
            Syntax::ExtractorPattern(n) => {
                self.out.push('.');
                if let Syntax::NameExpr(name) = arena.node(n.callee.raw()) {
                    self.identifier(&name.name.identifier);
                }
                if !n.arguments.is_empty() {
                    self.out.push('(');
                    for (i, argument) in n.arguments.iter().enumerate() {
                        if i > 0 {
                            self.out.push_str(", ");
                        }
                        self.labeled_pattern(argument);
                    }
                    self.out.push(')');
                }
            }
            Syntax::TypePattern(n) => {
                self.pattern(n.lhs);
                self.out.push_str(" as ");
                self.expression(n.rhs);
            }
            Syntax::WildcardPattern(_) => self.out.push('_'),
            Syntax::VariableDecl(n) => {
                self.identifier(&n.identifier.value);
            }
            _ => {
                let expression = arena
                    .cast_to_expression(raw)
                    .expect("pattern leaves are patterns proper or expressions");
                self.expression(expression);
            }
        }
    }

    fn labeled_pattern(&mut self, element: &LabeledPattern) {
        if let Some(label) = &element.label {
            self.identifier(&label.value);
            self.out.push_str(": ");
        }
        self.pattern(element.pattern);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::ast::ModuleIndex;
    use crate::frontend::parser::parse_module;
    use crate::index::Index;
    use crate::source::SourceMap;

    fn render_once(text: &str) -> String {
        let mut sources = SourceMap::new();
        let id = sources.insert_virtual(0, text.to_owned());
        let file = sources.get(id);
        let result = parse_module(file, ModuleIndex::new(0), true);
        assert!(
            !result.diagnostics.contains_error(),
            "parse failed for {text:?}: {:?}",
            result.diagnostics.iter().collect::<Vec<_>>()
        );
        render_module(&result.arena, &result.roots, file)
    }

    fn assert_round_trip(text: &str) {
        let first = render_once(text);
        let second = render_once(&first);
        pretty_assertions::assert_eq!(first, second, "source was {text:?}");
    }

    #[test]
    fn statements_round_trip() {
        assert_round_trip("print(\"Hello\")\n");
        assert_round_trip("let x = 1\nvar (a, b) = (1, 2)\nx = a\n");
        assert_round_trip("a + b * c\n");
        assert_round_trip("x is T\n");
        assert_round_trip("f(x: 1, y: 2)\ns[1]\npoint.x\n");
        assert_round_trip("[]\n[:]\n[1, 2]\n[1: \"a\"]\n(1,)\n(x: 1, y: 2)\n");
    }

    #[test]
    fn declarations_round_trip() {
        assert_round_trip("fun f(x, into y, _ z: inout, w = 0) =\n  return x\n");
        assert_round_trip("subscript s(self) =\n  yield self.x\n");
        assert_round_trip("fun infix + (rhs) =\n  rhs\n");
        assert_round_trip("fun stub(x)\n");
        assert_round_trip("struct Point: Comparable =\n  var x\n  var y = 0\n");
        assert_round_trip("trait Hashable\nimport helpers\n");
    }

    #[test]
    fn control_flow_round_trips() {
        assert_round_trip("if a do\n  1\nelse if b do\n  2\nelse\n  3\n");
        assert_round_trip("while x, let y = f() do\n  g(y)\n");
        assert_round_trip("for let i in items where i do\n  print(i)\n  break\n");
        assert_round_trip("match x do\n  .some(let y) =>\n    y\n  _ =>\n    0\n");
        assert_round_trip("fun f(x) =\n  defer\n    print(1)\n  return x\n");
    }

    #[test]
    fn operator_applications_are_parenthesized() {
        assert_eq!(render_once("a + b\n"), "(a + b)\n");
        assert_eq!(render_once("-x\n"), "(-x)\n");
        assert_eq!(render_once("x!\n"), "(x!)\n");
        // Parenthesization preserves grouping independent of precedence
        assert_eq!(render_once("a + b * c\n"), "(a + (b * c))\n");
    }

    #[test]
    fn keyword_identifiers_keep_their_backquotes() {
        assert_round_trip("let `if` = 1\nprint(`if`)\n");
    }

    #[test]
    fn rendered_literals_keep_their_spelling() {
        assert_round_trip("print(0x1f)\nprint(1_000)\nprint(2.5e-3)\n");
        assert_round_trip("print(\"a\\\"b\")\n");
    }
}
