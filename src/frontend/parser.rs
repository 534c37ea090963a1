use std::collections::VecDeque;

use crate::diagnostics::{Diagnostic, DiagnosticSet};
use crate::frontend::ast::{
    ArrayLiteral, Assignment, BindingDecl, BindingIntroducer, BindingPattern, BindingRole, Block,
    BoolLiteral, Break, Call, CallStyle, Conditional, ConditionId, Continue, DeclarationId, Defer,
    DictionaryEntry, DictionaryLiteral, ElseId, ExpressionId, ExtractorPattern, FieldDecl,
    FloatLiteral, For, FunctionDecl, FunctionIntroducer, Identifier, ImportDecl, IntegerLiteral,
    LabeledExpression, LabeledPattern, Lambda, Match, MatchCase, MatchCondition, ModuleIndex, Name,
    NameExpr, NodeId, NodeRef, OperatorNotation, ParameterDecl, PassingConvention, PatternId,
    Return, StatementId, StringLiteral, StructDecl, SyntaxArena, SyntaxNode, Throw, TraitDecl,
    Try, TupleLiteral, TuplePattern, TypePattern, TypeTest, VariableDecl, WildcardPattern, While,
    Yield,
};
use crate::frontend::lexer::{unescape_string_literal, Keyword, Lexer, Token, TokenTag};
use crate::source::{SourceFile, SourcePosition, SourceSpan};

/// The relative binding strength of an infix operator, derived from its
/// spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrecedenceGroup {
    Disjunction,
    Conjunction,
    Comparison,
    Fallback,
    Addition,
    Multiplication,
    Shift,
}

impl PrecedenceGroup {
    pub fn of(operator: &str) -> Self {
        match operator {
            "||" => PrecedenceGroup::Disjunction,
            "&&" => PrecedenceGroup::Conjunction,
            "??" => PrecedenceGroup::Fallback,
            "<<" | ">>" => PrecedenceGroup::Shift,
            _ => match operator.chars().next() {
                Some('*' | '/' | '%' | '&') => PrecedenceGroup::Multiplication,
                Some('+' | '-' | '|' | '^' | '~') => PrecedenceGroup::Addition,
                _ => PrecedenceGroup::Comparison,
            },
        }
    }

    pub fn binding_power(self) -> u8 {
        match self {
            PrecedenceGroup::Disjunction => 1,
            PrecedenceGroup::Conjunction => 2,
            PrecedenceGroup::Comparison => 3,
            PrecedenceGroup::Fallback => 4,
            PrecedenceGroup::Addition => 5,
            PrecedenceGroup::Multiplication => 6,
            PrecedenceGroup::Shift => 7,
        }
    }

    pub fn is_right_associative(self) -> bool {
        matches!(self, PrecedenceGroup::Fallback)
    }
}

/// The output of parsing one source file.
#[derive(Debug)]
pub struct ParseResult {
    pub arena: SyntaxArena,
    pub roots: Vec<NodeRef>,
    pub diagnostics: DiagnosticSet,
}

type Parse<T> = Result<T, Diagnostic>;

/// One level of the indentation stack: the span summarizing the indentation
/// tokens entered, and how many dedentation tokens close it.
#[derive(Debug, Clone, Copy)]
struct IndentationLevel {
    site: SourceSpan,
    count: u32,
}

/// A recursive-descent parser with one-token lookahead over the lexer's
/// stream, maintaining the position immediately after the last consumed
/// token and a stack of entered indentation levels.
#[derive(Debug)]
pub struct Parser<'source> {
    source: &'source SourceFile,
    lexer: Lexer<'source>,
    lookahead: VecDeque<Token>,
    position: u32,
    arena: SyntaxArena,
    indentation: Vec<IndentationLevel>,
}

/// Parses one source file into a fresh arena. At most one parse error is
/// recorded; parsing stops at the first.
pub fn parse_module(source: &SourceFile, module: ModuleIndex, as_main: bool) -> ParseResult {
    let mut parser = Parser {
        source,
        lexer: Lexer::new(source),
        lookahead: VecDeque::new(),
        position: 0,
        arena: SyntaxArena::new(module),
        indentation: Vec::new(),
    };

    let mut diagnostics = DiagnosticSet::new();
    let roots = match parser.parse_top_level(as_main) {
        Ok(roots) => roots,
        Err(diagnostic) => {
            diagnostics.insert(diagnostic);
            Vec::new()
        }
    };

    ParseResult {
        arena: parser.arena,
        roots,
        diagnostics,
    }
}

impl<'source> Parser<'source> {
    /* Token plumbing */

    fn peek(&mut self) -> Option<Token> {
        self.peek_nth(0)
    }

    fn peek_nth(&mut self, n: usize) -> Option<Token> {
        while self.lookahead.len() <= n {
            self.lookahead.push_back(self.lexer.next()?);
        }
        self.lookahead.get(n).copied()
    }

    fn next_token(&mut self) -> Option<Token> {
        let token = match self.lookahead.pop_front() {
            Some(token) => Some(token),
            None => self.lexer.next(),
        };
        if let Some(token) = token {
            self.position = token.site.end;
        }
        token
    }

    fn at(&mut self, tag: TokenTag) -> bool {
        self.peek().is_some_and(|t| t.tag == tag)
    }

    fn at_keyword(&mut self, keyword: Keyword) -> bool {
        self.at(TokenTag::Keyword(keyword))
    }

    fn take(&mut self, tag: TokenTag) -> Option<Token> {
        if self.at(tag) {
            self.next_token()
        } else {
            None
        }
    }

    fn take_keyword(&mut self, keyword: Keyword) -> Option<Token> {
        self.take(TokenTag::Keyword(keyword))
    }

    /// The parser's current position, immediately after the last consumed
    /// token.
    fn here(&self) -> SourceSpan {
        SourceSpan::empty_at(SourcePosition {
            source: self.source.id,
            index: self.position,
        })
    }

    fn expected(&mut self, thing: &str) -> Diagnostic {
        let site = self.peek().map(|t| t.site).unwrap_or_else(|| self.here());
        Diagnostic::error(format!("expected \"{thing}\""), site)
    }

    fn unexpected(&mut self) -> Diagnostic {
        match self.peek() {
            Some(token) => {
                Diagnostic::error(format!("unexpected token '{}'", token.tag), token.site)
            }
            None => Diagnostic::error("unexpected end of input", self.here()),
        }
    }

    fn expect(&mut self, tag: TokenTag, thing: &str) -> Parse<Token> {
        self.take(tag).ok_or_else(|| self.expected(thing))
    }

    fn expect_keyword(&mut self, keyword: Keyword, thing: &str) -> Parse<Token> {
        self.expect(TokenTag::Keyword(keyword), thing)
    }

    /// True when whitespace (or a line break) separates the last consumed
    /// token from `token`.
    fn gap_before(&self, token: Token) -> bool {
        token.site.start > self.position
    }

    fn line_of(&self, index: u32) -> u32 {
        self.source.line_of(index)
    }

    fn site_of(&self, node: impl Into<NodeRef>) -> SourceSpan {
        self.arena.site(node.into())
    }

    fn insert<T: SyntaxNode>(&mut self, node: T) -> NodeId<T> {
        self.arena.insert(node)
    }

    /* Indentation guard */

    /// Consumes all consecutive indentation tokens, pushing a span that
    /// summarizes them onto the indentation stack.
    fn enter_indentation(&mut self) {
        let mut count = 0;
        let mut site = self.here();
        while let Some(token) = self.take(TokenTag::Indentation) {
            site = if count == 0 {
                token.site
            } else {
                site.extended_to_cover(token.site)
            };
            count += 1;
        }
        self.indentation.push(IndentationLevel { site, count });
    }

    /// Consumes the dedentation tokens matching the innermost entered
    /// indentation.
    fn exit_indentation(&mut self) -> Parse<()> {
        let level = self
            .indentation
            .pop()
            .expect("indentation stack underflow");
        for _ in 0..level.count {
            if self.take(TokenTag::Dedentation).is_none() {
                return Err(self.indentation_mismatch());
            }
        }
        Ok(())
    }

    fn indentation_mismatch(&mut self) -> Diagnostic {
        let prefix: String = self
            .indentation
            .iter()
            .map(|level| self.source.text_of(level.site))
            .collect();
        let note_site = self
            .indentation
            .last()
            .map(|level| level.site)
            .unwrap_or_else(|| self.here());

        Diagnostic::error(
            "dedendation does not match the current indentation",
            self.peek().map(|t| t.site).unwrap_or_else(|| self.here()),
        )
        .with_note(Diagnostic::note(
            format!("the current indentation is \"{prefix}\""),
            note_site,
        ))
    }

    /* Top level */

    /// The roots of the module: statements when the module is the program
    /// entry, declarations otherwise.
    fn parse_top_level(&mut self, as_main: bool) -> Parse<Vec<NodeRef>> {
        let mut roots = Vec::new();

        loop {
            while self.take(TokenTag::Semicolon).is_some() {}

            let Some(token) = self.peek() else { break };
            match token.tag {
                TokenTag::Indentation => return Err(self.indentation_mismatch()),
                TokenTag::Dedentation => return Err(self.unexpected()),
                _ => {}
            }

            let root: NodeRef = if as_main {
                self.parse_statement()?.raw()
            } else {
                self.parse_declaration()?.raw()
            };
            self.check_statement_boundary(root)?;
            roots.push(root);
        }

        Ok(roots)
    }

    /// Two consecutive statements on one line must be separated by `;`.
    fn check_statement_boundary(&mut self, previous: NodeRef) -> Parse<()> {
        let end = self.site_of(previous).end;
        let Some(token) = self.peek() else {
            return Ok(());
        };

        match token.tag {
            TokenTag::Semicolon | TokenTag::Indentation | TokenTag::Dedentation => Ok(()),
            _ if self.line_of(token.site.start) != self.line_of(end) => Ok(()),
            _ => Err(Diagnostic::error(
                "consecutive statements on a line must be separated by ';'",
                token.site,
            )),
        }
    }

    /* Declarations */

    fn parse_declaration(&mut self) -> Parse<DeclarationId> {
        let Some(token) = self.peek() else {
            return Err(self.expected("declaration"));
        };

        match token.tag {
            TokenTag::Keyword(Keyword::Fun) | TokenTag::Keyword(Keyword::Subscript) => {
                Ok(self.parse_function_declaration()?.into())
            }
            TokenTag::Keyword(Keyword::Struct) => Ok(self.parse_struct_declaration()?.into()),
            TokenTag::Keyword(Keyword::Trait) => Ok(self.parse_trait_declaration()?.into()),
            TokenTag::Keyword(Keyword::Var | Keyword::Let | Keyword::Inout) => Ok(self
                .parse_binding_declaration(BindingRole::Unconditional)?
                .into()),
            TokenTag::Keyword(Keyword::Import) => Ok(self.parse_import_declaration()?.into()),
            _ => Err(self.unexpected()),
        }
    }

    // var (x, y) = e
    fn parse_binding_declaration(&mut self, role: BindingRole) -> Parse<NodeId<BindingDecl>> {
        let introducer_token = self.next_token().expect("caller checked the introducer");
        let introducer = match introducer_token.tag {
            TokenTag::Keyword(Keyword::Let) => BindingIntroducer::Let,
            TokenTag::Keyword(Keyword::Var) => BindingIntroducer::Var,
            TokenTag::Keyword(Keyword::Inout) => BindingIntroducer::Inout,
            _ => unreachable!("caller checked the introducer"),
        };

        let subpattern = self.parse_pattern(true)?;
        let pattern = self.insert(BindingPattern {
            introducer,
            subpattern,
            site: introducer_token
                .site
                .extended_to_cover(self.site_of(subpattern)),
        });

        let initializer = if self.take(TokenTag::Assign).is_some() {
            Some(self.parse_expression()?)
        } else {
            None
        };

        let end = initializer
            .map(|i| self.site_of(i))
            .unwrap_or_else(|| self.site_of(pattern));

        Ok(self.insert(BindingDecl {
            pattern,
            initializer,
            role,
            site: introducer_token.site.extended_to_cover(end),
        }))
    }

    // fun f(x, y) = body
    // subscript s(self) = body
    // fun infix + (rhs) = body
    fn parse_function_declaration(&mut self) -> Parse<NodeId<FunctionDecl>> {
        let introducer_token = self.next_token().expect("caller checked the introducer");
        let introducer = match introducer_token.tag {
            TokenTag::Keyword(Keyword::Fun) => FunctionIntroducer::Fun,
            TokenTag::Keyword(Keyword::Subscript) => FunctionIntroducer::Subscript,
            _ => unreachable!("caller checked the introducer"),
        };

        let name = self.parse_function_name()?;
        let parameters = self.parse_parameter_list()?;

        let (body, end) = if self.take(TokenTag::Assign).is_some() {
            let (statements, site) = self.parse_block_body()?;
            (Some(statements), site)
        } else {
            (None, self.here())
        };

        Ok(self.insert(FunctionDecl {
            introducer,
            name,
            parameters,
            body,
            site: introducer_token.site.extended_up_to(end.end),
        }))
    }

    fn parse_function_name(&mut self) -> Parse<Name> {
        let notation = match self.peek().map(|t| t.tag) {
            Some(TokenTag::Keyword(Keyword::Infix)) => Some(OperatorNotation::Infix),
            Some(TokenTag::Keyword(Keyword::Prefix)) => Some(OperatorNotation::Prefix),
            Some(TokenTag::Keyword(Keyword::Postfix)) => Some(OperatorNotation::Postfix),
            _ => None,
        };

        if notation.is_some() {
            self.next_token();
            let token = self
                .take(TokenTag::Operator)
                .or_else(|| self.take(TokenTag::Assign))
                .or_else(|| self.take(TokenTag::ThickArrow))
                .ok_or_else(|| self.expected("operator"))?;

            return Ok(Name {
                identifier: token.text(self.source).to_owned(),
                notation,
                site: token.site,
            });
        }

        let token = self.expect(TokenTag::Name, "function name")?;
        Ok(Name {
            identifier: identifier_text(token, self.source),
            notation: None,
            site: token.site,
        })
    }

    // (x, label y, _ z: inout, w = default)
    fn parse_parameter_list(&mut self) -> Parse<Vec<NodeId<ParameterDecl>>> {
        self.expect(TokenTag::LeftParenthesis, "parameter list")?;

        let mut parameters = Vec::new();
        if !self.at(TokenTag::RightParenthesis) {
            parameters.push(self.parse_parameter()?);
            while self.take(TokenTag::Comma).is_some() {
                parameters.push(self.parse_parameter()?);
            }
        }

        self.expect(TokenTag::RightParenthesis, ")")?;
        Ok(parameters)
    }

    fn parse_parameter(&mut self) -> Parse<NodeId<ParameterDecl>> {
        let first = self
            .take(TokenTag::Name)
            .or_else(|| self.take(TokenTag::Underscore))
            .ok_or_else(|| self.expected("parameter"))?;

        // Two leading words: the first is the argument label (`_` suppresses
        // it), the second is the parameter's own name.
        let (label, name_token) = if self.at(TokenTag::Name) {
            let second = self.next_token().expect("peeked");
            let label = (first.tag == TokenTag::Name).then(|| Identifier {
                value: identifier_text(first, self.source),
                site: first.site,
            });
            (label, second)
        } else {
            if first.tag != TokenTag::Name {
                return Err(self.expected("parameter name"));
            }
            let identifier = Identifier {
                value: identifier_text(first, self.source),
                site: first.site,
            };
            (Some(identifier), first)
        };

        let identifier = Identifier {
            value: identifier_text(name_token, self.source),
            site: name_token.site,
        };

        let convention = if self.take(TokenTag::Colon).is_some() {
            Some(self.parse_passing_convention()?)
        } else {
            None
        };

        let default = if self.take(TokenTag::Assign).is_some() {
            Some(self.parse_expression()?)
        } else {
            None
        };

        let end = default
            .map(|d| self.site_of(d).end)
            .unwrap_or(self.position);

        Ok(self.insert(ParameterDecl {
            label,
            identifier,
            convention,
            default,
            site: first.site.extended_up_to(end),
        }))
    }

    fn parse_passing_convention(&mut self) -> Parse<PassingConvention> {
        if self.take_keyword(Keyword::Let).is_some() {
            return Ok(PassingConvention::Let);
        }
        if self.take_keyword(Keyword::Inout).is_some() {
            return Ok(PassingConvention::Inout);
        }
        if let Some(token) = self.peek() {
            if token.tag == TokenTag::Name && token.text(self.source) == "sink" {
                self.next_token();
                return Ok(PassingConvention::Sink);
            }
        }
        Err(self.expected("passing convention"))
    }

    // struct Point: Comparable =
    //   var x
    //   fun norm() = ...
    fn parse_struct_declaration(&mut self) -> Parse<NodeId<StructDecl>> {
        let introducer = self.expect_keyword(Keyword::Struct, "struct")?;
        let (identifier, parents, members, end) = self.parse_type_declaration_parts()?;

        Ok(self.insert(StructDecl {
            identifier,
            parents,
            members,
            site: introducer.site.extended_to_cover(end),
        }))
    }

    fn parse_trait_declaration(&mut self) -> Parse<NodeId<TraitDecl>> {
        let introducer = self.expect_keyword(Keyword::Trait, "trait")?;
        let (identifier, parents, members, end) = self.parse_type_declaration_parts()?;

        Ok(self.insert(TraitDecl {
            identifier,
            parents,
            members,
            site: introducer.site.extended_to_cover(end),
        }))
    }

    #[allow(clippy::type_complexity)]
    fn parse_type_declaration_parts(
        &mut self,
    ) -> Parse<(Identifier, Vec<ExpressionId>, Vec<DeclarationId>, SourceSpan)> {
        let name_token = self.expect(TokenTag::Name, "type name")?;
        let identifier = Identifier {
            value: identifier_text(name_token, self.source),
            site: name_token.site,
        };

        let mut parents = Vec::new();
        if self.take(TokenTag::Colon).is_some() {
            parents.push(self.parse_compound_expression()?);
            while self.take(TokenTag::Comma).is_some() {
                parents.push(self.parse_compound_expression()?);
            }
        }

        let mut members = Vec::new();
        if self.take(TokenTag::Assign).is_some() {
            if self.at(TokenTag::Indentation) {
                self.enter_indentation();
                loop {
                    while self.take(TokenTag::Semicolon).is_some() {}
                    match self.peek().map(|t| t.tag) {
                        None | Some(TokenTag::Dedentation) => break,
                        Some(TokenTag::Indentation) => return Err(self.indentation_mismatch()),
                        _ => {}
                    }
                    let member = self.parse_member_declaration()?;
                    self.check_statement_boundary(member.raw())?;
                    members.push(member);
                }
                self.exit_indentation()?;
            } else {
                members.push(self.parse_member_declaration()?);
            }
        }

        let end = members
            .last()
            .map(|m| self.arena.site(m.raw()))
            .or_else(|| parents.last().map(|p| self.site_of(*p)))
            .unwrap_or(identifier.site);

        Ok((identifier, parents, members, end))
    }

    fn parse_member_declaration(&mut self) -> Parse<DeclarationId> {
        let Some(token) = self.peek() else {
            return Err(self.expected("member declaration"));
        };

        match token.tag {
            TokenTag::Keyword(Keyword::Var) => {
                let introducer = self.next_token().expect("peeked");
                let name_token = self.expect(TokenTag::Name, "field name")?;
                let default = if self.take(TokenTag::Assign).is_some() {
                    Some(self.parse_expression()?)
                } else {
                    None
                };
                Ok(self
                    .insert(FieldDecl {
                        identifier: Identifier {
                            value: identifier_text(name_token, self.source),
                            site: name_token.site,
                        },
                        default,
                        site: introducer.site.extended_up_to(self.position),
                    })
                    .into())
            }
            TokenTag::Keyword(Keyword::Fun) | TokenTag::Keyword(Keyword::Subscript) => {
                Ok(self.parse_function_declaration()?.into())
            }
            _ => Err(self.unexpected()),
        }
    }

    fn parse_import_declaration(&mut self) -> Parse<NodeId<ImportDecl>> {
        let introducer = self.expect_keyword(Keyword::Import, "import")?;
        let name_token = self.expect(TokenTag::Name, "module name")?;

        Ok(self.insert(ImportDecl {
            name: Identifier {
                value: identifier_text(name_token, self.source),
                site: name_token.site,
            },
            site: introducer.site.extended_to_cover(name_token.site),
        }))
    }

    /* Statements */

    fn parse_statement(&mut self) -> Parse<StatementId> {
        let Some(token) = self.peek() else {
            return Err(self.expected("statement"));
        };

        match token.tag {
            TokenTag::Keyword(Keyword::Var | Keyword::Let | Keyword::Inout) => Ok(
                DeclarationId::from(self.parse_binding_declaration(BindingRole::Unconditional)?)
                    .into(),
            ),
            TokenTag::Keyword(Keyword::Fun | Keyword::Subscript) => {
                Ok(DeclarationId::from(self.parse_function_declaration()?).into())
            }
            TokenTag::Keyword(Keyword::Struct) => {
                Ok(DeclarationId::from(self.parse_struct_declaration()?).into())
            }
            TokenTag::Keyword(Keyword::Trait) => {
                Ok(DeclarationId::from(self.parse_trait_declaration()?).into())
            }
            TokenTag::Keyword(Keyword::Import) => {
                Ok(DeclarationId::from(self.parse_import_declaration()?).into())
            }
            TokenTag::Keyword(Keyword::Do) => {
                self.next_token();
                Ok(self.parse_block()?.into())
            }
            TokenTag::Keyword(Keyword::Defer) => {
                let introducer = self.next_token().expect("peeked");
                let body = self.parse_block()?;
                let site = introducer.site.extended_to_cover(self.site_of(body));
                Ok(self.insert(Defer { body, site }).into())
            }
            TokenTag::Keyword(Keyword::For) => self.parse_for_statement(),
            TokenTag::Keyword(Keyword::While) => self.parse_while_statement(),
            TokenTag::Keyword(Keyword::Break) => {
                let token = self.next_token().expect("peeked");
                Ok(self.insert(Break { site: token.site }).into())
            }
            TokenTag::Keyword(Keyword::Continue) => {
                let token = self.next_token().expect("peeked");
                Ok(self.insert(Continue { site: token.site }).into())
            }
            TokenTag::Keyword(Keyword::Return) => self.parse_return_statement(),
            TokenTag::Keyword(Keyword::Throw) => {
                let introducer = self.next_token().expect("peeked");
                let value = self.parse_expression()?;
                Ok(self
                    .insert(Throw {
                        value,
                        site: introducer.site.extended_to_cover(self.site_of(value)),
                    })
                    .into())
            }
            TokenTag::Keyword(Keyword::Yield) => {
                let introducer = self.next_token().expect("peeked");
                let value = self.parse_expression()?;
                Ok(self
                    .insert(Yield {
                        value,
                        site: introducer.site.extended_to_cover(self.site_of(value)),
                    })
                    .into())
            }
            _ => {
                let expression = self.parse_expression()?;

                if self.take(TokenTag::Assign).is_some() {
                    let value = self.parse_expression()?;
                    return Ok(self
                        .insert(Assignment {
                            target: expression,
                            value,
                            site: self
                                .site_of(expression)
                                .extended_to_cover(self.site_of(value)),
                        })
                        .into());
                }

                Ok(expression.into())
            }
        }
    }

    // for x in domain where filter do body
    fn parse_for_statement(&mut self) -> Parse<StatementId> {
        let introducer = self.expect_keyword(Keyword::For, "for")?;

        let binding = if let Some(token) = self.peek() {
            if let TokenTag::Keyword(k @ (Keyword::Let | Keyword::Var | Keyword::Inout)) = token.tag
            {
                self.next_token();
                let kind = match k {
                    Keyword::Let => BindingIntroducer::Let,
                    Keyword::Var => BindingIntroducer::Var,
                    _ => BindingIntroducer::Inout,
                };
                let subpattern = self.parse_pattern(true)?;
                self.insert(BindingPattern {
                    introducer: kind,
                    subpattern,
                    site: token.site.extended_to_cover(self.site_of(subpattern)),
                })
            } else {
                // A bare pattern introduces immutable bindings
                let subpattern = self.parse_pattern(true)?;
                self.insert(BindingPattern {
                    introducer: BindingIntroducer::Let,
                    subpattern,
                    site: self.site_of(subpattern),
                })
            }
        } else {
            return Err(self.expected("loop pattern"));
        };

        self.expect_keyword(Keyword::In, "in")?;
        let domain = self.parse_expression()?;

        let filter = if self.take_keyword(Keyword::Where).is_some() {
            Some(self.parse_expression()?)
        } else {
            None
        };

        self.expect_keyword(Keyword::Do, "do")?;
        let body = self.parse_block()?;
        let site = introducer.site.extended_to_cover(self.site_of(body));

        Ok(self
            .insert(For {
                binding,
                domain,
                filter,
                body,
                site,
            })
            .into())
    }

    // while condition do body
    fn parse_while_statement(&mut self) -> Parse<StatementId> {
        let introducer = self.expect_keyword(Keyword::While, "while")?;
        let conditions = self.parse_condition_list()?;
        self.expect_keyword(Keyword::Do, "do")?;
        let body = self.parse_block()?;
        let site = introducer.site.extended_to_cover(self.site_of(body));

        Ok(self
            .insert(While {
                conditions,
                body,
                site,
            })
            .into())
    }

    fn parse_return_statement(&mut self) -> Parse<StatementId> {
        let introducer = self.expect_keyword(Keyword::Return, "return")?;

        // The returned value must start on the same line
        let value = match self.peek() {
            Some(token)
                if !matches!(
                    token.tag,
                    TokenTag::Semicolon | TokenTag::Indentation | TokenTag::Dedentation
                ) && self.line_of(token.site.start) == self.line_of(introducer.site.end) =>
            {
                Some(self.parse_expression()?)
            }
            _ => None,
        };

        let end = value.map(|v| self.site_of(v).end).unwrap_or(self.position);
        Ok(self
            .insert(Return {
                value,
                site: introducer.site.extended_up_to(end),
            })
            .into())
    }

    /* Blocks */

    /// A block body: an indented statement sequence when the next token is
    /// an indentation, otherwise exactly one statement on the same line.
    fn parse_block_body(&mut self) -> Parse<(Vec<StatementId>, SourceSpan)> {
        if self.at(TokenTag::Indentation) {
            let start = self.here();
            self.enter_indentation();

            let mut statements = Vec::new();
            loop {
                while self.take(TokenTag::Semicolon).is_some() {}
                match self.peek().map(|t| t.tag) {
                    None | Some(TokenTag::Dedentation) => break,
                    Some(TokenTag::Indentation) => return Err(self.indentation_mismatch()),
                    _ => {}
                }
                let statement = self.parse_statement()?;
                self.check_statement_boundary(statement.raw())?;
                statements.push(statement);
            }

            self.exit_indentation()?;

            let site = statements
                .iter()
                .fold(start, |site, s| site.extended_to_cover(self.site_of(*s)));
            Ok((statements, site))
        } else {
            let statement = self.parse_statement()?;
            let site = self.site_of(statement);
            Ok((vec![statement], site))
        }
    }

    fn parse_block(&mut self) -> Parse<NodeId<Block>> {
        let (statements, site) = self.parse_block_body()?;
        Ok(self.insert(Block { statements, site }))
    }

    /* Conditions */

    fn parse_condition_list(&mut self) -> Parse<Vec<ConditionId>> {
        let mut conditions = vec![self.parse_condition()?];
        while self.take(TokenTag::Comma).is_some() {
            conditions.push(self.parse_condition()?);
        }
        Ok(conditions)
    }

    fn parse_condition(&mut self) -> Parse<ConditionId> {
        let Some(token) = self.peek() else {
            return Err(self.expected("condition"));
        };

        match token.tag {
            // case pattern = subject
            TokenTag::Keyword(Keyword::Case) => {
                let introducer = self.next_token().expect("peeked");
                let pattern = self.parse_pattern(false)?;
                self.expect(TokenTag::Assign, "=")?;
                let subject = self.parse_expression()?;

                Ok(self
                    .insert(MatchCondition {
                        pattern,
                        subject,
                        site: introducer.site.extended_to_cover(self.site_of(subject)),
                    })
                    .into())
            }
            // let x = subject
            TokenTag::Keyword(Keyword::Let | Keyword::Var | Keyword::Inout) => {
                Ok(self.parse_binding_declaration(BindingRole::Condition)?.into())
            }
            _ => Ok(self.parse_expression()?.into()),
        }
    }

    /* Expressions */

    /// expression -> infix ( "is" compound )*
    fn parse_expression(&mut self) -> Parse<ExpressionId> {
        let mut lhs = self.parse_infix_expression(0)?;

        while self.take_keyword(Keyword::Is).is_some() {
            let rhs = self.parse_compound_expression()?;
            let site = self
                .site_of(lhs)
                .extended_to_cover(self.site_of(rhs));
            lhs = self.insert(TypeTest { lhs, rhs, site }).into();
        }

        Ok(lhs)
    }

    /// Pratt-style precedence climbing. An operator token is infix only when
    /// whitespace surrounds it on both sides.
    fn parse_infix_expression(&mut self, min_power: u8) -> Parse<ExpressionId> {
        let mut lhs = self.parse_prefix_expression()?;

        loop {
            let Some(token) = self.peek() else { break };
            if token.tag != TokenTag::Operator || !self.gap_before(token) {
                break;
            }
            let followed_by_gap = self
                .peek_nth(1)
                .map_or(true, |next| next.site.start > token.site.end);
            if !followed_by_gap {
                break;
            }

            let text = token.text(self.source).to_owned();
            let group = PrecedenceGroup::of(&text);
            let power = group.binding_power();
            if power < min_power {
                break;
            }

            self.next_token();
            let next_min = if group.is_right_associative() {
                power
            } else {
                power + 1
            };
            let rhs = self.parse_infix_expression(next_min)?;

            lhs = self.operator_call(lhs, text, OperatorNotation::Infix, token.site, Some(rhs));
        }

        Ok(lhs)
    }

    /// A leading operator adjacent to its operand is a prefix operator.
    fn parse_prefix_expression(&mut self) -> Parse<ExpressionId> {
        let Some(token) = self.peek() else {
            return Err(self.expected("expression"));
        };
        if token.tag != TokenTag::Operator {
            return self.parse_postfix_expression();
        }

        let operator = self.next_token().expect("peeked");
        let text = operator.text(self.source).to_owned();

        let separated = self
            .peek()
            .map_or(true, |next| next.site.start > operator.site.end);
        if separated {
            return Err(Diagnostic::error(
                format!("unary operator '{text}' cannot be separated from its operand"),
                operator.site,
            ));
        }

        let operand = self.parse_postfix_expression()?;
        Ok(self.operator_call(operand, text, OperatorNotation::Prefix, operator.site, None))
    }

    /// A compound followed by an adjacent operator is a postfix application.
    fn parse_postfix_expression(&mut self) -> Parse<ExpressionId> {
        let operand = self.parse_compound_expression()?;

        if let Some(token) = self.peek() {
            if token.tag == TokenTag::Operator && !self.gap_before(token) {
                self.next_token();
                let text = token.text(self.source).to_owned();
                return Ok(self.operator_call(
                    operand,
                    text,
                    OperatorNotation::Postfix,
                    token.site,
                    None,
                ));
            }
        }

        Ok(operand)
    }

    /// Encodes an operator application as a call of a name qualified by its
    /// operand.
    fn operator_call(
        &mut self,
        qualification: ExpressionId,
        operator: String,
        notation: OperatorNotation,
        operator_site: SourceSpan,
        argument: Option<ExpressionId>,
    ) -> ExpressionId {
        let whole = argument
            .map(|a| self.site_of(a))
            .unwrap_or(operator_site)
            .extended_to_cover(self.site_of(qualification))
            .extended_to_cover(operator_site);

        let callee = self.insert(NameExpr {
            qualification: Some(qualification),
            name: Name {
                identifier: operator,
                notation: Some(notation),
                site: operator_site,
            },
            site: self.site_of(qualification).extended_to_cover(operator_site),
        });

        let arguments = argument
            .map(|value| vec![LabeledExpression { label: None, value }])
            .unwrap_or_default();

        self.insert(Call {
            callee: callee.into(),
            arguments,
            style: CallStyle::Parenthesized,
            site: whole,
        })
        .into()
    }

    /// compound -> primary ( "." member | "(" arguments ")" | "[" arguments "]" )*
    ///
    /// A suffix binds only if it starts on the same line as the head.
    fn parse_compound_expression(&mut self) -> Parse<ExpressionId> {
        let mut expression = self.parse_primary_expression()?;
        let head_line = self.line_of(self.site_of(expression).start);

        loop {
            let Some(token) = self.peek() else { break };
            if self.line_of(token.site.start) != head_line {
                break;
            }

            match token.tag {
                TokenTag::Dot => {
                    self.next_token();
                    let name = self.parse_member_name()?;
                    let site = self.site_of(expression).extended_to_cover(name.site);
                    expression = self
                        .insert(NameExpr {
                            qualification: Some(expression),
                            name,
                            site,
                        })
                        .into();
                }
                TokenTag::LeftParenthesis => {
                    self.next_token();
                    let arguments = self.parse_call_arguments(TokenTag::RightParenthesis)?;
                    let site = self.site_of(expression).extended_up_to(self.position);
                    expression = self
                        .insert(Call {
                            callee: expression,
                            arguments,
                            style: CallStyle::Parenthesized,
                            site,
                        })
                        .into();
                }
                TokenTag::LeftBracket => {
                    self.next_token();
                    let arguments = self.parse_call_arguments(TokenTag::RightBracket)?;
                    let site = self.site_of(expression).extended_up_to(self.position);
                    expression = self
                        .insert(Call {
                            callee: expression,
                            arguments,
                            style: CallStyle::Bracketed,
                            site,
                        })
                        .into();
                }
                _ => break,
            }
        }

        Ok(expression)
    }

    fn parse_member_name(&mut self) -> Parse<Name> {
        if let Some(token) = self.take(TokenTag::Name) {
            return Ok(Name {
                identifier: identifier_text(token, self.source),
                notation: None,
                site: token.site,
            });
        }
        // Tuple projections: `pair.0`
        if let Some(token) = self.take(TokenTag::IntegerLiteral) {
            return Ok(Name {
                identifier: token.text(self.source).to_owned(),
                notation: None,
                site: token.site,
            });
        }
        Err(self.expected("member name"))
    }

    fn parse_call_arguments(&mut self, close: TokenTag) -> Parse<Vec<LabeledExpression>> {
        let mut arguments = Vec::new();

        if !self.at(close) {
            loop {
                let label = self.parse_argument_label();
                let value = self.parse_expression()?;
                arguments.push(LabeledExpression { label, value });

                if self.take(TokenTag::Comma).is_none() {
                    break;
                }
            }
        }

        let closing = if close == TokenTag::RightParenthesis {
            ")"
        } else {
            "]"
        };
        self.expect(close, closing)?;
        Ok(arguments)
    }

    /// An identifier followed by `:` consumes a label; otherwise nothing is
    /// consumed.
    fn parse_argument_label(&mut self) -> Option<Identifier> {
        let first = self.peek()?;
        if first.tag != TokenTag::Name || self.peek_nth(1)?.tag != TokenTag::Colon {
            return None;
        }

        self.next_token();
        self.next_token();
        Some(Identifier {
            value: identifier_text(first, self.source),
            site: first.site,
        })
    }

    fn parse_primary_expression(&mut self) -> Parse<ExpressionId> {
        let Some(token) = self.peek() else {
            return Err(self.expected("expression"));
        };

        match token.tag {
            TokenTag::LeftParenthesis => self.parse_tuple_or_parenthesized(),
            TokenTag::LeftBracket => self.parse_array_or_dictionary(),
            TokenTag::BooleanLiteral => {
                let token = self.next_token().expect("peeked");
                Ok(self
                    .insert(BoolLiteral {
                        value: token.text(self.source) == "true",
                        site: token.site,
                    })
                    .into())
            }
            TokenTag::IntegerLiteral => {
                let token = self.next_token().expect("peeked");
                Ok(self.insert(IntegerLiteral { site: token.site }).into())
            }
            TokenTag::FloatingPointLiteral => {
                let token = self.next_token().expect("peeked");
                Ok(self.insert(FloatLiteral { site: token.site }).into())
            }
            TokenTag::StringLiteral => {
                let token = self.next_token().expect("peeked");
                Ok(self
                    .insert(StringLiteral {
                        value: unescape_string_literal(token.text(self.source)),
                        site: token.site,
                    })
                    .into())
            }
            TokenTag::Backslash => self.parse_lambda(),
            TokenTag::Keyword(Keyword::If) => Ok(self.parse_conditional()?.into()),
            TokenTag::Keyword(Keyword::Match) => self.parse_match(),
            TokenTag::Keyword(Keyword::Try) => self.parse_try(),
            TokenTag::Name => {
                let token = self.next_token().expect("peeked");
                Ok(self
                    .insert(NameExpr {
                        qualification: None,
                        name: Name {
                            identifier: identifier_text(token, self.source),
                            notation: None,
                            site: token.site,
                        },
                        site: token.site,
                    })
                    .into())
            }
            TokenTag::UnterminatedStringLiteral => {
                Err(Diagnostic::error("unterminated string literal", token.site))
            }
            TokenTag::UnterminatedBackquotedIdentifier => Err(Diagnostic::error(
                "unterminated backquoted identifier",
                token.site,
            )),
            TokenTag::Error => Err(Diagnostic::error("invalid token", token.site)),
            _ => Err(self.unexpected()),
        }
    }

    // (e) is e; (e,) and (l: e, ...) are tuples
    fn parse_tuple_or_parenthesized(&mut self) -> Parse<ExpressionId> {
        let open = self.expect(TokenTag::LeftParenthesis, "(")?;

        if let Some(close) = self.take(TokenTag::RightParenthesis) {
            return Ok(self
                .insert(TupleLiteral {
                    elements: Vec::new(),
                    site: open.site.extended_to_cover(close.site),
                })
                .into());
        }

        let mut elements = Vec::new();
        let mut trailing_comma = false;
        loop {
            let label = self.parse_argument_label();
            let value = self.parse_expression()?;
            elements.push(LabeledExpression { label, value });

            if self.take(TokenTag::Comma).is_none() {
                trailing_comma = false;
                break;
            }
            trailing_comma = true;
            if self.at(TokenTag::RightParenthesis) {
                break;
            }
        }

        let close = self.expect(TokenTag::RightParenthesis, ")")?;

        if elements.len() == 1 && !trailing_comma && elements[0].label.is_none() {
            return Ok(elements.pop().expect("checked length").value);
        }

        Ok(self
            .insert(TupleLiteral {
                elements,
                site: open.site.extended_to_cover(close.site),
            })
            .into())
    }

    // [] and [e, ...] are arrays; [:] and [k: v, ...] are dictionaries
    fn parse_array_or_dictionary(&mut self) -> Parse<ExpressionId> {
        let open = self.expect(TokenTag::LeftBracket, "[")?;

        if let Some(close) = self.take(TokenTag::RightBracket) {
            return Ok(self
                .insert(ArrayLiteral {
                    elements: Vec::new(),
                    site: open.site.extended_to_cover(close.site),
                })
                .into());
        }

        if self.take(TokenTag::Colon).is_some() {
            let close = self.expect(TokenTag::RightBracket, "]")?;
            return Ok(self
                .insert(DictionaryLiteral {
                    entries: Vec::new(),
                    site: open.site.extended_to_cover(close.site),
                })
                .into());
        }

        let first = self.parse_expression()?;

        if self.take(TokenTag::Colon).is_some() {
            let value = self.parse_expression()?;
            let mut entries = vec![DictionaryEntry { key: first, value }];

            while self.take(TokenTag::Comma).is_some() {
                if self.at(TokenTag::RightBracket) {
                    break;
                }
                let key = self.parse_expression()?;
                self.expect(TokenTag::Colon, ":")?;
                let value = self.parse_expression()?;
                entries.push(DictionaryEntry { key, value });
            }

            let close = self.expect(TokenTag::RightBracket, "]")?;
            return Ok(self
                .insert(DictionaryLiteral {
                    entries,
                    site: open.site.extended_to_cover(close.site),
                })
                .into());
        }

        let mut elements = vec![first];
        while self.take(TokenTag::Comma).is_some() {
            if self.at(TokenTag::RightBracket) {
                break;
            }
            elements.push(self.parse_expression()?);
        }

        let close = self.expect(TokenTag::RightBracket, "]")?;
        Ok(self
            .insert(ArrayLiteral {
                elements,
                site: open.site.extended_to_cover(close.site),
            })
            .into())
    }

    // \x, y => body
    fn parse_lambda(&mut self) -> Parse<ExpressionId> {
        let introducer = self.expect(TokenTag::Backslash, "\\")?;

        let mut parameters = Vec::new();
        if !self.at(TokenTag::ThickArrow) {
            loop {
                let token = self.expect(TokenTag::Name, "lambda parameter")?;
                let identifier = Identifier {
                    value: identifier_text(token, self.source),
                    site: token.site,
                };
                parameters.push(self.insert(ParameterDecl {
                    label: Some(identifier.clone()),
                    identifier,
                    convention: None,
                    default: None,
                    site: token.site,
                }));

                if self.take(TokenTag::Comma).is_none() {
                    break;
                }
            }
        }

        self.expect(TokenTag::ThickArrow, "=>")?;
        let (body, end) = self.parse_block_body()?;

        Ok(self
            .insert(Lambda {
                parameters,
                body,
                site: introducer.site.extended_up_to(end.end),
            })
            .into())
    }

    // if condition do success else failure
    fn parse_conditional(&mut self) -> Parse<NodeId<Conditional>> {
        let introducer = self.expect_keyword(Keyword::If, "if")?;
        let conditions = self.parse_condition_list()?;
        self.expect_keyword(Keyword::Do, "do")?;
        let success = self.parse_block()?;

        let failure: Option<ElseId> = if self.take_keyword(Keyword::Else).is_some() {
            if self.at_keyword(Keyword::If) {
                Some(self.parse_conditional()?.into())
            } else {
                Some(self.parse_block()?.into())
            }
        } else {
            None
        };

        let end = failure
            .map(|f| self.arena.site(f.raw()))
            .unwrap_or_else(|| self.site_of(success));

        Ok(self.insert(Conditional {
            conditions,
            success,
            failure,
            site: introducer.site.extended_to_cover(end),
        }))
    }

    // match subject do
    //   pattern => body
    fn parse_match(&mut self) -> Parse<ExpressionId> {
        let introducer = self.expect_keyword(Keyword::Match, "match")?;
        let subject = self.parse_expression()?;
        self.expect_keyword(Keyword::Do, "do")?;

        let cases = self.parse_match_cases()?;
        let end = cases
            .last()
            .map(|c| self.site_of(*c))
            .unwrap_or_else(|| self.site_of(subject));

        Ok(self
            .insert(Match {
                subject,
                cases,
                site: introducer.site.extended_to_cover(end),
            })
            .into())
    }

    fn parse_match_cases(&mut self) -> Parse<Vec<NodeId<MatchCase>>> {
        if !self.at(TokenTag::Indentation) {
            return Err(self.expected("match cases"));
        }
        self.enter_indentation();

        let mut cases = Vec::new();
        loop {
            match self.peek().map(|t| t.tag) {
                None | Some(TokenTag::Dedentation) => break,
                Some(TokenTag::Indentation) => return Err(self.indentation_mismatch()),
                _ => {}
            }

            let pattern = self.parse_pattern(false)?;
            self.expect(TokenTag::ThickArrow, "=>")?;
            let body = self.parse_block()?;
            let site = self
                .site_of(pattern)
                .extended_to_cover(self.site_of(body));
            cases.push(self.insert(MatchCase {
                pattern,
                body,
                site,
            }));
        }

        self.exit_indentation()?;
        Ok(cases)
    }

    // try body catch
    //   pattern => handler
    fn parse_try(&mut self) -> Parse<ExpressionId> {
        let introducer = self.expect_keyword(Keyword::Try, "try")?;
        let body = self.parse_block()?;

        let handlers = if self.take_keyword(Keyword::Catch).is_some() {
            self.parse_match_cases()?
        } else {
            Vec::new()
        };

        let end = handlers
            .last()
            .map(|h| self.site_of(*h))
            .unwrap_or_else(|| self.site_of(body));

        Ok(self
            .insert(Try {
                body,
                handlers,
                site: introducer.site.extended_to_cover(end),
            })
            .into())
    }

    /* Patterns */

    /// pattern -> primary_pattern ( "as" compound )?
    fn parse_pattern(&mut self, in_binding: bool) -> Parse<PatternId> {
        let lhs = self.parse_primary_pattern(in_binding)?;

        if self.take_keyword(Keyword::As).is_some() {
            let rhs = self.parse_compound_expression()?;
            let site = self.site_of(lhs).extended_to_cover(self.site_of(rhs));
            return Ok(self.insert(TypePattern { lhs, rhs, site }).into());
        }

        Ok(lhs)
    }

    fn parse_primary_pattern(&mut self, in_binding: bool) -> Parse<PatternId> {
        let Some(token) = self.peek() else {
            return Err(self.expected("pattern"));
        };

        match token.tag {
            TokenTag::LeftParenthesis => self.parse_tuple_pattern(in_binding),
            // A bare name under a binding introducer declares a variable
            TokenTag::Name if in_binding => {
                let token = self.next_token().expect("peeked");
                Ok(self
                    .insert(VariableDecl {
                        identifier: Identifier {
                            value: identifier_text(token, self.source),
                            site: token.site,
                        },
                        site: token.site,
                    })
                    .into())
            }
            TokenTag::Dot => self.parse_extractor_pattern(in_binding),
            TokenTag::Keyword(k @ (Keyword::Var | Keyword::Let | Keyword::Inout)) => {
                let introducer_token = self.next_token().expect("peeked");
                let introducer = match k {
                    Keyword::Let => BindingIntroducer::Let,
                    Keyword::Var => BindingIntroducer::Var,
                    _ => BindingIntroducer::Inout,
                };
                let subpattern = self.parse_pattern(true)?;
                Ok(self
                    .insert(BindingPattern {
                        introducer,
                        subpattern,
                        site: introducer_token
                            .site
                            .extended_to_cover(self.site_of(subpattern)),
                    })
                    .into())
            }
            TokenTag::Underscore => {
                let token = self.next_token().expect("peeked");
                Ok(self.insert(WildcardPattern { site: token.site }).into())
            }
            // Anything else is an expression used as an equality pattern
            _ => Ok(self.parse_expression()?.into()),
        }
    }

    fn parse_tuple_pattern(&mut self, in_binding: bool) -> Parse<PatternId> {
        let open = self.expect(TokenTag::LeftParenthesis, "(")?;

        let mut elements = Vec::new();
        let mut trailing_comma = false;
        if !self.at(TokenTag::RightParenthesis) {
            loop {
                let label = self.parse_argument_label();
                let pattern = self.parse_pattern(in_binding)?;
                elements.push(LabeledPattern { label, pattern });

                if self.take(TokenTag::Comma).is_none() {
                    trailing_comma = false;
                    break;
                }
                trailing_comma = true;
                if self.at(TokenTag::RightParenthesis) {
                    break;
                }
            }
        }

        let close = self.expect(TokenTag::RightParenthesis, ")")?;

        if elements.len() == 1 && !trailing_comma && elements[0].label.is_none() {
            return Ok(elements.pop().expect("checked length").pattern);
        }

        Ok(self
            .insert(TuplePattern {
                elements,
                site: open.site.extended_to_cover(close.site),
            })
            .into())
    }

    // .callee(arguments)
    fn parse_extractor_pattern(&mut self, in_binding: bool) -> Parse<PatternId> {
        let dot = self.expect(TokenTag::Dot, ".")?;
        let name_token = self.expect(TokenTag::Name, "extractor name")?;

        let callee: ExpressionId = self
            .insert(NameExpr {
                qualification: None,
                name: Name {
                    identifier: identifier_text(name_token, self.source),
                    notation: None,
                    site: name_token.site,
                },
                site: dot.site.extended_to_cover(name_token.site),
            })
            .into();

        let mut arguments = Vec::new();
        if self.take(TokenTag::LeftParenthesis).is_some() {
            if !self.at(TokenTag::RightParenthesis) {
                loop {
                    let label = self.parse_argument_label();
                    let pattern = self.parse_pattern(in_binding)?;
                    arguments.push(LabeledPattern { label, pattern });

                    if self.take(TokenTag::Comma).is_none() {
                        break;
                    }
                }
            }
            self.expect(TokenTag::RightParenthesis, ")")?;
        }

        Ok(self
            .insert(ExtractorPattern {
                callee,
                arguments,
                site: dot.site.extended_up_to(self.position),
            })
            .into())
    }
}

/// The identifier a `name` token denotes, with backquotes stripped.
fn identifier_text(token: Token, source: &SourceFile) -> String {
    let text = token.text(source);
    text.strip_prefix('`')
        .and_then(|t| t.strip_suffix('`'))
        .unwrap_or(text)
        .to_owned()
}
