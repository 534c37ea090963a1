use std::marker::PhantomData;

use crate::index::{simple_index, Index};
use crate::source::SourceSpan;

simple_index! {
    /// Identifies a module within a program
    pub struct ModuleIndex;
}

/// The type-erased identity of a syntax node: a module index and an offset
/// into that module's arena. The reserved offset `u32::MAX` denotes the
/// module itself when it acts as a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeRef {
    pub module: ModuleIndex,
    pub offset: u32,
}

impl NodeRef {
    pub const MODULE_OFFSET: u32 = u32::MAX;

    pub fn new(module: ModuleIndex, offset: u32) -> Self {
        Self { module, offset }
    }

    /// The identity of the module-as-a-scope.
    pub fn module_scope(module: ModuleIndex) -> Self {
        Self {
            module,
            offset: Self::MODULE_OFFSET,
        }
    }

    pub fn is_module_scope(self) -> bool {
        self.offset == Self::MODULE_OFFSET
    }

    /// The 64-bit packed form: module index in the high half, offset in the
    /// low half.
    pub fn pack(self) -> u64 {
        ((self.module.index() as u64) << 32) | self.offset as u64
    }

    pub fn unpack(bits: u64) -> Self {
        Self {
            module: ModuleIndex::new((bits >> 32) as usize),
            offset: bits as u32,
        }
    }
}

/// A node identity tagged with the node kind it refers to.
pub struct NodeId<T: SyntaxNode> {
    pub raw: NodeRef,
    _marker: PhantomData<fn(&T)>,
}

impl<T: SyntaxNode> NodeId<T> {
    fn new(raw: NodeRef) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }
}

impl<T: SyntaxNode> Clone for NodeId<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: SyntaxNode> Copy for NodeId<T> {}

impl<T: SyntaxNode> PartialEq for NodeId<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T: SyntaxNode> From<NodeId<T>> for NodeRef {
    fn from(id: NodeId<T>) -> Self {
        id.raw
    }
}

impl<T: SyntaxNode> Eq for NodeId<T> {}

impl<T: SyntaxNode> std::hash::Hash for NodeId<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<T: SyntaxNode> std::fmt::Debug for NodeId<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({}.{})", self.raw.module.index(), self.raw.offset)
    }
}

macro_rules! category_id {
    ($(#[$attr:meta])* $vis:vis struct $name:ident;) => {
        $(#[$attr])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis struct $name(pub NodeRef);

        impl $name {
            pub fn raw(self) -> NodeRef {
                self.0
            }
        }

        impl From<$name> for NodeRef {
            fn from(id: $name) -> NodeRef {
                id.0
            }
        }
    };
}

category_id! {
    /// The identity of a node known to be a declaration
    pub struct DeclarationId;
}
category_id! {
    /// The identity of a node known to be an expression
    pub struct ExpressionId;
}
category_id! {
    /// The identity of a node usable as a pattern
    pub struct PatternId;
}
category_id! {
    /// The identity of a node usable at statement position
    pub struct StatementId;
}
category_id! {
    /// The identity of a node usable as a branch condition
    pub struct ConditionId;
}
category_id! {
    /// The identity of a node usable as an `else` branch
    pub struct ElseId;
}
category_id! {
    /// The identity of a node that introduces a lexical scope
    pub struct ScopeId;
}

/// Marker for node kinds in the declaration category.
pub trait DeclarationNode: SyntaxNode {}
/// Marker for node kinds in the expression category.
pub trait ExpressionNode: SyntaxNode {}
/// Marker for node kinds that are patterns proper (expressions also appear
/// at pattern position, as equality patterns).
pub trait PatternNode: SyntaxNode {}
/// Marker for node kinds that are statements proper (declarations and
/// expressions also appear at statement position).
pub trait StatementNode: SyntaxNode {}

impl<T: DeclarationNode> From<NodeId<T>> for DeclarationId {
    fn from(id: NodeId<T>) -> Self {
        DeclarationId(id.raw)
    }
}

impl<T: ExpressionNode> From<NodeId<T>> for ExpressionId {
    fn from(id: NodeId<T>) -> Self {
        ExpressionId(id.raw)
    }
}

impl<T: PatternNode> From<NodeId<T>> for PatternId {
    fn from(id: NodeId<T>) -> Self {
        PatternId(id.raw)
    }
}

impl<T: StatementNode> From<NodeId<T>> for StatementId {
    fn from(id: NodeId<T>) -> Self {
        StatementId(id.raw)
    }
}

impl From<ExpressionId> for PatternId {
    fn from(id: ExpressionId) -> Self {
        PatternId(id.0)
    }
}

impl From<ExpressionId> for StatementId {
    fn from(id: ExpressionId) -> Self {
        StatementId(id.0)
    }
}

impl From<DeclarationId> for StatementId {
    fn from(id: DeclarationId) -> Self {
        StatementId(id.0)
    }
}

impl From<ExpressionId> for ConditionId {
    fn from(id: ExpressionId) -> Self {
        ConditionId(id.0)
    }
}

impl From<NodeId<MatchCondition>> for ConditionId {
    fn from(id: NodeId<MatchCondition>) -> Self {
        ConditionId(id.raw)
    }
}

impl From<NodeId<BindingDecl>> for ConditionId {
    fn from(id: NodeId<BindingDecl>) -> Self {
        ConditionId(id.raw)
    }
}

impl From<NodeId<Conditional>> for ElseId {
    fn from(id: NodeId<Conditional>) -> Self {
        ElseId(id.raw)
    }
}

impl From<NodeId<Block>> for ElseId {
    fn from(id: NodeId<Block>) -> Self {
        ElseId(id.raw)
    }
}

/* Shared pieces */

/// A plain identifier with its source span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identifier {
    pub value: String,
    pub site: SourceSpan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatorNotation {
    Infix,
    Prefix,
    Postfix,
}

impl core::fmt::Display for OperatorNotation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperatorNotation::Infix => f.write_str("infix"),
            OperatorNotation::Prefix => f.write_str("prefix"),
            OperatorNotation::Postfix => f.write_str("postfix"),
        }
    }
}

/// A possibly operator-notated name, e.g. `f` or `infix+`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Name {
    pub identifier: String,
    pub notation: Option<OperatorNotation>,
    pub site: SourceSpan,
}

impl Name {
    /// The stable rendering used as a lookup key and IR function name.
    pub fn mangled(&self) -> String {
        match self.notation {
            Some(notation) => format!("{notation}{}", self.identifier),
            None => self.identifier.clone(),
        }
    }
}

/* Declarations */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingRole {
    Unconditional,
    Condition,
}

/// `let (x, y) = e`, `var n = 0`, or a conditional binding.
#[derive(Debug)]
pub struct BindingDecl {
    pub pattern: NodeId<BindingPattern>,
    pub initializer: Option<ExpressionId>,
    pub role: BindingRole,
    pub site: SourceSpan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionIntroducer {
    Fun,
    Subscript,
}

/// `fun f(x) = ...` or `subscript s(self) = ...`; a missing body makes the
/// declaration a stub.
#[derive(Debug)]
pub struct FunctionDecl {
    pub introducer: FunctionIntroducer,
    pub name: Name,
    pub parameters: Vec<NodeId<ParameterDecl>>,
    pub body: Option<Vec<StatementId>>,
    pub site: SourceSpan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassingConvention {
    Let,
    Inout,
    Sink,
}

/// One parameter: `x`, `label x`, `_ x`, `x: inout`, `x = default`.
///
/// The parsed `label` is the argument label at call sites: the identifier
/// itself when none is spelled out, `None` when suppressed with `_`.
#[derive(Debug)]
pub struct ParameterDecl {
    pub label: Option<Identifier>,
    pub identifier: Identifier,
    pub convention: Option<PassingConvention>,
    pub default: Option<ExpressionId>,
    pub site: SourceSpan,
}

#[derive(Debug)]
pub struct StructDecl {
    pub identifier: Identifier,
    pub parents: Vec<ExpressionId>,
    pub members: Vec<DeclarationId>,
    pub site: SourceSpan,
}

#[derive(Debug)]
pub struct TraitDecl {
    pub identifier: Identifier,
    pub parents: Vec<ExpressionId>,
    pub members: Vec<DeclarationId>,
    pub site: SourceSpan,
}

/// A stored property inside a struct.
#[derive(Debug)]
pub struct FieldDecl {
    pub identifier: Identifier,
    pub default: Option<ExpressionId>,
    pub site: SourceSpan,
}

/// The declaration of one variable, introduced by a name inside a binding
/// pattern.
#[derive(Debug)]
pub struct VariableDecl {
    pub identifier: Identifier,
    pub site: SourceSpan,
}

#[derive(Debug)]
pub struct ImportDecl {
    pub name: Identifier,
    pub site: SourceSpan,
}

/* Expressions */

#[derive(Debug)]
pub struct BoolLiteral {
    pub value: bool,
    pub site: SourceSpan,
}

/// The literal's text is recovered from its site when it is lowered.
#[derive(Debug)]
pub struct IntegerLiteral {
    pub site: SourceSpan,
}

#[derive(Debug)]
pub struct FloatLiteral {
    pub site: SourceSpan,
}

#[derive(Debug)]
pub struct StringLiteral {
    pub value: String,
    pub site: SourceSpan,
}

#[derive(Debug)]
pub struct ArrayLiteral {
    pub elements: Vec<ExpressionId>,
    pub site: SourceSpan,
}

#[derive(Debug, Clone, Copy)]
pub struct DictionaryEntry {
    pub key: ExpressionId,
    pub value: ExpressionId,
}

#[derive(Debug)]
pub struct DictionaryLiteral {
    pub entries: Vec<DictionaryEntry>,
    pub site: SourceSpan,
}

#[derive(Debug, Clone)]
pub struct LabeledExpression {
    pub label: Option<Identifier>,
    pub value: ExpressionId,
}

#[derive(Debug)]
pub struct TupleLiteral {
    pub elements: Vec<LabeledExpression>,
    pub site: SourceSpan,
}

/// A name occurrence, optionally qualified: `x`, `point.x`, `a.infix+`.
#[derive(Debug)]
pub struct NameExpr {
    pub qualification: Option<ExpressionId>,
    pub name: Name,
    pub site: SourceSpan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStyle {
    /// `f(x)`, a function application
    Parenthesized,
    /// `s[x]`, a subscript projection
    Bracketed,
}

#[derive(Debug)]
pub struct Call {
    pub callee: ExpressionId,
    pub arguments: Vec<LabeledExpression>,
    pub style: CallStyle,
    pub site: SourceSpan,
}

/// `lhs is rhs`
#[derive(Debug)]
pub struct TypeTest {
    pub lhs: ExpressionId,
    pub rhs: ExpressionId,
    pub site: SourceSpan,
}

/// `\x, y => body`
#[derive(Debug)]
pub struct Lambda {
    pub parameters: Vec<NodeId<ParameterDecl>>,
    pub body: Vec<StatementId>,
    pub site: SourceSpan,
}

/// `if conditions do success else failure`
#[derive(Debug)]
pub struct Conditional {
    pub conditions: Vec<ConditionId>,
    pub success: NodeId<Block>,
    pub failure: Option<ElseId>,
    pub site: SourceSpan,
}

#[derive(Debug)]
pub struct Match {
    pub subject: ExpressionId,
    pub cases: Vec<NodeId<MatchCase>>,
    pub site: SourceSpan,
}

#[derive(Debug)]
pub struct MatchCase {
    pub pattern: PatternId,
    pub body: NodeId<Block>,
    pub site: SourceSpan,
}

/// `try body catch handlers`
#[derive(Debug)]
pub struct Try {
    pub body: NodeId<Block>,
    pub handlers: Vec<NodeId<MatchCase>>,
    pub site: SourceSpan,
}

/* Conditions */

/// `case pattern = subject` in a condition list.
#[derive(Debug)]
pub struct MatchCondition {
    pub pattern: PatternId,
    pub subject: ExpressionId,
    pub site: SourceSpan,
}

/* Patterns */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingIntroducer {
    Let,
    Var,
    Inout,
}

#[derive(Debug)]
pub struct BindingPattern {
    pub introducer: BindingIntroducer,
    pub subpattern: PatternId,
    pub site: SourceSpan,
}

#[derive(Debug, Clone)]
pub struct LabeledPattern {
    pub label: Option<Identifier>,
    pub pattern: PatternId,
}

#[derive(Debug)]
pub struct TuplePattern {
    pub elements: Vec<LabeledPattern>,
    pub site: SourceSpan,
}

/// `.callee(arguments)`
#[derive(Debug)]
pub struct ExtractorPattern {
    pub callee: ExpressionId,
    pub arguments: Vec<LabeledPattern>,
    pub site: SourceSpan,
}

/// `lhs as rhs`
#[derive(Debug)]
pub struct TypePattern {
    pub lhs: PatternId,
    pub rhs: ExpressionId,
    pub site: SourceSpan,
}

#[derive(Debug)]
pub struct WildcardPattern {
    pub site: SourceSpan,
}

/* Statements */

/// A list of statements in an opened scope.
#[derive(Debug)]
pub struct Block {
    pub statements: Vec<StatementId>,
    pub site: SourceSpan,
}

#[derive(Debug)]
pub struct Break {
    pub site: SourceSpan,
}

#[derive(Debug)]
pub struct Continue {
    pub site: SourceSpan,
}

#[derive(Debug)]
pub struct Defer {
    pub body: NodeId<Block>,
    pub site: SourceSpan,
}

/// `for binding in domain where filter do body`
#[derive(Debug)]
pub struct For {
    pub binding: NodeId<BindingPattern>,
    pub domain: ExpressionId,
    pub filter: Option<ExpressionId>,
    pub body: NodeId<Block>,
    pub site: SourceSpan,
}

#[derive(Debug)]
pub struct While {
    pub conditions: Vec<ConditionId>,
    pub body: NodeId<Block>,
    pub site: SourceSpan,
}

#[derive(Debug)]
pub struct Return {
    pub value: Option<ExpressionId>,
    pub site: SourceSpan,
}

#[derive(Debug)]
pub struct Throw {
    pub value: ExpressionId,
    pub site: SourceSpan,
}

#[derive(Debug)]
pub struct Yield {
    pub value: ExpressionId,
    pub site: SourceSpan,
}

/// `target = value`
#[derive(Debug)]
pub struct Assignment {
    pub target: ExpressionId,
    pub value: ExpressionId,
    pub site: SourceSpan,
}

/* The arena */

/// The payload of one syntax node.
pub trait SyntaxNode: Sized {
    const TAG: SyntaxTag;

    fn wrap(self) -> Syntax;

    fn project(syntax: &Syntax) -> Option<&Self>;
}

macro_rules! define_syntax {
    ($($name:ident),+ $(,)?) => {
        /// A syntax node payload; one variant per node kind.
        #[derive(Debug)]
        pub enum Syntax {
            $($name($name)),+
        }

        /// The kind of a syntax node, stored alongside its payload.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum SyntaxTag {
            $($name),+
        }

        impl Syntax {
            pub fn tag(&self) -> SyntaxTag {
                match self {
                    $(Syntax::$name(_) => SyntaxTag::$name),+
                }
            }

            pub fn site(&self) -> SourceSpan {
                match self {
                    $(Syntax::$name(node) => node.site),+
                }
            }
        }

        $(
            impl SyntaxNode for $name {
                const TAG: SyntaxTag = SyntaxTag::$name;

                fn wrap(self) -> Syntax {
                    Syntax::$name(self)
                }

                fn project(syntax: &Syntax) -> Option<&Self> {
                    match syntax {
                        Syntax::$name(node) => Some(node),
                        _ => None,
                    }
                }
            }
        )+
    };
}

define_syntax! {
    BindingDecl, FunctionDecl, ParameterDecl, StructDecl, TraitDecl,
    FieldDecl, VariableDecl, ImportDecl,
    BoolLiteral, IntegerLiteral, FloatLiteral, StringLiteral,
    ArrayLiteral, DictionaryLiteral, TupleLiteral,
    NameExpr, Call, TypeTest, Lambda, Conditional, Match, MatchCase, Try,
    MatchCondition,
    BindingPattern, TuplePattern, ExtractorPattern, TypePattern,
    WildcardPattern,
    Block, Break, Continue, Defer, For, While, Return, Throw, Yield,
    Assignment,
}

impl DeclarationNode for BindingDecl {}
impl DeclarationNode for FunctionDecl {}
impl DeclarationNode for ParameterDecl {}
impl DeclarationNode for StructDecl {}
impl DeclarationNode for TraitDecl {}
impl DeclarationNode for FieldDecl {}
impl DeclarationNode for VariableDecl {}
impl DeclarationNode for ImportDecl {}

impl ExpressionNode for BoolLiteral {}
impl ExpressionNode for IntegerLiteral {}
impl ExpressionNode for FloatLiteral {}
impl ExpressionNode for StringLiteral {}
impl ExpressionNode for ArrayLiteral {}
impl ExpressionNode for DictionaryLiteral {}
impl ExpressionNode for TupleLiteral {}
impl ExpressionNode for NameExpr {}
impl ExpressionNode for Call {}
impl ExpressionNode for TypeTest {}
impl ExpressionNode for Lambda {}
impl ExpressionNode for Conditional {}
impl ExpressionNode for Match {}
impl ExpressionNode for Try {}

impl PatternNode for BindingPattern {}
impl PatternNode for TuplePattern {}
impl PatternNode for ExtractorPattern {}
impl PatternNode for TypePattern {}
impl PatternNode for WildcardPattern {}
impl PatternNode for VariableDecl {}

impl StatementNode for Block {}
impl StatementNode for Break {}
impl StatementNode for Continue {}
impl StatementNode for Defer {}
impl StatementNode for For {}
impl StatementNode for While {}
impl StatementNode for Return {}
impl StatementNode for Throw {}
impl StatementNode for Yield {}
impl StatementNode for Assignment {}

impl SyntaxTag {
    pub fn is_declaration(self) -> bool {
        matches!(
            self,
            SyntaxTag::BindingDecl
                | SyntaxTag::FunctionDecl
                | SyntaxTag::ParameterDecl
                | SyntaxTag::StructDecl
                | SyntaxTag::TraitDecl
                | SyntaxTag::FieldDecl
                | SyntaxTag::VariableDecl
                | SyntaxTag::ImportDecl
        )
    }

    pub fn is_expression(self) -> bool {
        matches!(
            self,
            SyntaxTag::BoolLiteral
                | SyntaxTag::IntegerLiteral
                | SyntaxTag::FloatLiteral
                | SyntaxTag::StringLiteral
                | SyntaxTag::ArrayLiteral
                | SyntaxTag::DictionaryLiteral
                | SyntaxTag::TupleLiteral
                | SyntaxTag::NameExpr
                | SyntaxTag::Call
                | SyntaxTag::TypeTest
                | SyntaxTag::Lambda
                | SyntaxTag::Conditional
                | SyntaxTag::Match
                | SyntaxTag::Try
        )
    }

    pub fn is_pattern(self) -> bool {
        matches!(
            self,
            SyntaxTag::BindingPattern
                | SyntaxTag::TuplePattern
                | SyntaxTag::ExtractorPattern
                | SyntaxTag::TypePattern
                | SyntaxTag::WildcardPattern
                | SyntaxTag::VariableDecl
        ) || self.is_expression()
    }

    pub fn is_statement(self) -> bool {
        matches!(
            self,
            SyntaxTag::Block
                | SyntaxTag::Break
                | SyntaxTag::Continue
                | SyntaxTag::Defer
                | SyntaxTag::For
                | SyntaxTag::While
                | SyntaxTag::Return
                | SyntaxTag::Throw
                | SyntaxTag::Yield
                | SyntaxTag::Assignment
        ) || self.is_declaration()
            || self.is_expression()
    }

    pub fn is_condition(self) -> bool {
        matches!(self, SyntaxTag::MatchCondition | SyntaxTag::BindingDecl) || self.is_expression()
    }

    pub fn is_else(self) -> bool {
        matches!(self, SyntaxTag::Conditional | SyntaxTag::Block)
    }

    /// The node kinds that introduce a lexical scope.
    pub fn is_scope(self) -> bool {
        matches!(
            self,
            SyntaxTag::FunctionDecl
                | SyntaxTag::Lambda
                | SyntaxTag::Conditional
                | SyntaxTag::MatchCase
                | SyntaxTag::Block
                | SyntaxTag::StructDecl
                | SyntaxTag::TraitDecl
                | SyntaxTag::For
                | SyntaxTag::While
                | SyntaxTag::Try
        )
    }
}

/// A per-module store of syntax nodes. Node payloads and their tags live in
/// two vectors kept in lockstep; identities are stable for the lifetime of
/// the module and nodes are never deleted.
#[derive(Debug)]
pub struct SyntaxArena {
    module: ModuleIndex,
    nodes: Vec<Syntax>,
    tags: Vec<SyntaxTag>,
}

impl SyntaxArena {
    pub fn new(module: ModuleIndex) -> Self {
        Self {
            module,
            nodes: Vec::new(),
            tags: Vec::new(),
        }
    }

    pub fn module(&self) -> ModuleIndex {
        self.module
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Appends a node, returning a typed identity referring to its position.
    pub fn insert<T: SyntaxNode>(&mut self, node: T) -> NodeId<T> {
        let offset = self.nodes.len() as u32;
        self.tags.push(T::TAG);
        self.nodes.push(node.wrap());
        NodeId::new(NodeRef::new(self.module, offset))
    }

    pub fn node(&self, r: NodeRef) -> &Syntax {
        assert_eq!(r.module, self.module, "node identity from another module");
        &self.nodes[r.offset as usize]
    }

    pub fn tag(&self, r: NodeRef) -> SyntaxTag {
        assert_eq!(r.module, self.module, "node identity from another module");
        self.tags[r.offset as usize]
    }

    pub fn site(&self, r: NodeRef) -> SourceSpan {
        self.node(r).site()
    }

    /// Projects the payload stored at a typed identity.
    pub fn get<T: SyntaxNode>(&self, id: NodeId<T>) -> &T {
        T::project(self.node(id.raw)).expect("node tag does not match its identity")
    }

    /// Re-tags an erased identity, or `None` if the node has a different kind.
    pub fn cast<T: SyntaxNode>(&self, r: NodeRef) -> Option<NodeId<T>> {
        (self.tag(r) == T::TAG).then(|| NodeId::new(r))
    }

    pub fn cast_to_declaration(&self, r: NodeRef) -> Option<DeclarationId> {
        self.tag(r).is_declaration().then_some(DeclarationId(r))
    }

    pub fn cast_to_expression(&self, r: NodeRef) -> Option<ExpressionId> {
        self.tag(r).is_expression().then_some(ExpressionId(r))
    }

    pub fn cast_to_pattern(&self, r: NodeRef) -> Option<PatternId> {
        self.tag(r).is_pattern().then_some(PatternId(r))
    }

    pub fn cast_to_statement(&self, r: NodeRef) -> Option<StatementId> {
        self.tag(r).is_statement().then_some(StatementId(r))
    }

    pub fn cast_to_scope(&self, r: NodeRef) -> Option<ScopeId> {
        self.tag(r).is_scope().then_some(ScopeId(r))
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeRef, &Syntax)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (NodeRef::new(self.module, i as u32), n))
    }

    pub fn refs(&self) -> impl Iterator<Item = NodeRef> + '_ {
        (0..self.nodes.len()).map(|i| NodeRef::new(self.module, i as u32))
    }

    /// The argument labels of a function, in parameter order, for the call
    /// ABI.
    pub fn labels_of(&self, function: NodeId<FunctionDecl>) -> Vec<Option<String>> {
        self.get(function)
            .parameters
            .iter()
            .map(|p| self.get(*p).label.as_ref().map(|l| l.value.clone()))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn tags_agree_with_payloads(&self) -> bool {
        self.nodes.len() == self.tags.len()
            && self
                .nodes
                .iter()
                .zip(self.tags.iter())
                .all(|(node, tag)| node.tag() == *tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{SourceId, SourceSpan};

    fn span() -> SourceSpan {
        SourceSpan::new(SourceId::new(0), 0, 1)
    }

    fn arena() -> SyntaxArena {
        SyntaxArena::new(ModuleIndex::new(0))
    }

    #[test]
    fn insert_and_project() {
        let mut arena = arena();
        let id = arena.insert(WildcardPattern { site: span() });

        assert_eq!(arena.tag(id.raw), SyntaxTag::WildcardPattern);
        assert_eq!(arena.get(id).site, span());
        assert!(arena.tags_agree_with_payloads());
    }

    #[test]
    fn casts_respect_categories() {
        let mut arena = arena();
        let wildcard = arena.insert(WildcardPattern { site: span() });
        let literal = arena.insert(BoolLiteral {
            value: true,
            site: span(),
        });

        assert!(arena.cast_to_pattern(wildcard.raw).is_some());
        assert!(arena.cast_to_expression(wildcard.raw).is_none());
        assert!(arena.cast_to_statement(wildcard.raw).is_none());

        // Expressions appear at pattern and statement position
        assert!(arena.cast_to_expression(literal.raw).is_some());
        assert!(arena.cast_to_pattern(literal.raw).is_some());
        assert!(arena.cast_to_statement(literal.raw).is_some());

        assert!(arena.cast::<BoolLiteral>(literal.raw).is_some());
        assert!(arena.cast::<WildcardPattern>(literal.raw).is_none());
    }

    #[test]
    fn node_ref_packing() {
        let r = NodeRef::new(ModuleIndex::new(7), 42);
        assert_eq!(NodeRef::unpack(r.pack()), r);

        let module = NodeRef::module_scope(ModuleIndex::new(7));
        assert!(module.is_module_scope());
        assert_eq!(NodeRef::unpack(module.pack()), module);
    }

    #[test]
    fn labels_of_function() {
        let mut arena = arena();

        let labeled = arena.insert(ParameterDecl {
            label: Some(Identifier {
                value: "into".to_owned(),
                site: span(),
            }),
            identifier: Identifier {
                value: "x".to_owned(),
                site: span(),
            },
            convention: None,
            default: None,
            site: span(),
        });
        let suppressed = arena.insert(ParameterDecl {
            label: None,
            identifier: Identifier {
                value: "y".to_owned(),
                site: span(),
            },
            convention: None,
            default: None,
            site: span(),
        });

        let function = arena.insert(FunctionDecl {
            introducer: FunctionIntroducer::Fun,
            name: Name {
                identifier: "f".to_owned(),
                notation: None,
                site: span(),
            },
            parameters: vec![labeled, suppressed],
            body: None,
            site: span(),
        });

        assert_eq!(
            arena.labels_of(function),
            vec![Some("into".to_owned()), None]
        );
    }
}
