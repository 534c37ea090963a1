//! AST to IR lowering: a single traversal of the module driven by an
//! insertion context of frames, a current function, and an insertion point.

use hashbrown::{HashMap, HashSet};

use crate::diagnostics::{Diagnostic, DiagnosticSet};
use crate::frontend::ast::{
    BindingDecl, BindingIntroducer, Block, CallStyle, Conditional, ConditionId, DeclarationId,
    ExpressionId, FunctionDecl, FunctionIntroducer, Lambda, MatchCase, Name, NameExpr, NodeId,
    NodeRef, PatternId, StatementId, Syntax, SyntaxArena, SyntaxTag,
};
use crate::frontend::scope::ScopeTables;
use crate::frontend::visit::{for_each_declaration, visit_pattern_with};
use crate::ir::{
    self, BlockId, Capability, Constant, InsertionPoint, Instruction, InstructionId,
    InstructionKind, Member, Value,
};
use crate::source::{SourceFile, SourceSpan};

/// One lexical frame of the lowering context.
struct Frame {
    scope: NodeRef,
    locals: HashMap<String, Value>,
    deferred: Vec<NodeId<Block>>,
}

impl Frame {
    fn new(scope: NodeRef) -> Self {
        Self {
            scope,
            locals: HashMap::new(),
            deferred: Vec::new(),
        }
    }
}

struct CurrentFunction {
    function: ir::Function,
    point: InsertionPoint,
}

struct LoopContext {
    head: BlockId,
    exit: BlockId,
}

pub struct Lowerer<'a> {
    arena: &'a SyntaxArena,
    scopes: &'a ScopeTables,
    source: &'a SourceFile,
    roots: &'a [NodeRef],
    diagnostics: &'a mut DiagnosticSet,
    module: ir::Module,
    frames: Vec<Frame>,
    current: Option<CurrentFunction>,
    loops: Vec<LoopContext>,
    function_names: HashMap<NodeRef, String>,
    used_names: HashSet<String>,
    lambda_counter: u32,
}

/// Lowers one module. When `as_main`, the roots are statements forming the
/// body of a synthesized zero-parameter `$main`; otherwise the roots are
/// declarations and only the free functions among them produce IR.
pub fn lower_module(
    arena: &SyntaxArena,
    roots: &[NodeRef],
    scopes: &ScopeTables,
    source: &SourceFile,
    as_main: bool,
    diagnostics: &mut DiagnosticSet,
) -> ir::Module {
    let mut lowerer = Lowerer {
        arena,
        scopes,
        source,
        roots,
        diagnostics,
        module: ir::Module::new(),
        frames: vec![Frame::new(NodeRef::module_scope(arena.module()))],
        current: None,
        loops: Vec::new(),
        function_names: HashMap::new(),
        used_names: ["$main".to_owned()].into_iter().collect(),
        lambda_counter: 0,
    };

    if as_main {
        lowerer.lower_entry();
    } else {
        for root in roots {
            if let Some(function) = arena.cast::<FunctionDecl>(*root) {
                lowerer.lower_function_declaration(function);
            }
        }
    }

    lowerer.module
}

impl<'a> Lowerer<'a> {
    /* Context plumbing */

    fn function_mut(&mut self) -> &mut ir::Function {
        &mut self
            .current
            .as_mut()
            .expect("lowering outside a function")
            .function
    }

    fn current_block(&self) -> BlockId {
        let current = self.current.as_ref().expect("lowering outside a function");
        match current.point {
            InsertionPoint::Start(block) | InsertionPoint::End(block) => block,
            InsertionPoint::Before(id) | InsertionPoint::After(id) => {
                current.function.container(id)
            }
        }
    }

    fn move_to(&mut self, block: BlockId) {
        self.current
            .as_mut()
            .expect("lowering outside a function")
            .point = InsertionPoint::End(block);
    }

    /// Whether the current block already ends in a terminator.
    fn terminated(&self) -> bool {
        let current = self.current.as_ref().expect("lowering outside a function");
        current.function.terminator(self.current_block()).is_some()
    }

    /// The single construction primitive: splices at the insertion point and
    /// keeps def-use chains current.
    fn emit(&mut self, kind: InstructionKind, site: SourceSpan) -> InstructionId {
        let current = self.current.as_mut().expect("lowering outside a function");
        current.function.insert(Instruction { kind, site }, current.point)
    }

    fn within<R>(&mut self, frame: Frame, f: impl FnOnce(&mut Self) -> R) -> R {
        self.frames.push(frame);
        let result = f(self);
        let frame = self.frames.pop().expect("frame pushed above");
        for deferred in frame.deferred.into_iter().rev() {
            if self.current.is_some() && !self.terminated() {
                self.lower_scoped_block(deferred);
            }
        }
        result
    }

    /// Saves and restores the full insertion context around the lowering of
    /// another function's body; only the module frame stays reachable.
    fn with_clear_context<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let saved_current = self.current.take();
        let saved_frames = if self.frames.len() > 1 {
            self.frames.split_off(1)
        } else {
            Vec::new()
        };
        let saved_loops = std::mem::take(&mut self.loops);

        let result = f(self);

        self.loops = saved_loops;
        self.frames.truncate(1);
        self.frames.extend(saved_frames);
        self.current = saved_current;
        result
    }

    fn locals_mut(&mut self) -> &mut HashMap<String, Value> {
        &mut self.frames.last_mut().expect("at least the module frame").locals
    }

    fn site_of(&self, node: impl Into<NodeRef>) -> SourceSpan {
        self.arena.site(node.into())
    }

    /// The declarations lexically contained in `scope`; the module's are its
    /// roots.
    fn declarations_in(&self, scope: NodeRef) -> Vec<DeclarationId> {
        if scope.is_module_scope() {
            self.roots
                .iter()
                .filter_map(|r| self.arena.cast_to_declaration(*r))
                .collect()
        } else {
            self.scopes.declarations(scope).to_vec()
        }
    }

    /// The stable IR name for a function declaration.
    fn ir_name_of(&mut self, declaration: NodeId<FunctionDecl>) -> String {
        if let Some(name) = self.function_names.get(&declaration.raw) {
            return name.clone();
        }

        let base = self.arena.get(declaration).name.mangled();
        let name = if self.used_names.contains(&base) {
            format!("{base}@{}", declaration.raw.offset)
        } else {
            base
        };

        self.used_names.insert(name.clone());
        self.function_names.insert(declaration.raw, name.clone());
        name
    }

    /* Module entry */

    /// Synthesizes `$main` from the module's root statements.
    fn lower_entry(&mut self) {
        let arena = self.arena;

        let mut function = ir::Function::new("$main", Vec::new(), false, self.source.full_span());
        let entry = function.append_block(0);
        self.current = Some(CurrentFunction {
            function,
            point: InsertionPoint::End(entry),
        });

        let statements: Vec<StatementId> = self
            .roots
            .iter()
            .filter_map(|r| arena.cast_to_statement(*r))
            .collect();
        let body_scope = NodeRef::module_scope(arena.module());
        self.within(Frame::new(body_scope), |this| {
            this.lower_statements(&statements);
        });

        if !self.terminated() {
            self.emit(
                InstructionKind::Return {
                    value: Value::unit(),
                },
                self.source.end_span(),
            );
        }

        let function = self.current.take().expect("installed above").function;
        self.module.replace(function);
    }

    /* Declarations */

    /// Lowers a function declaration in a cleared context, registering it in
    /// the module eagerly so it can be referred to even while incomplete.
    fn lower_function_declaration(&mut self, declaration: NodeId<FunctionDecl>) -> String {
        let arena = self.arena;
        let name = self.ir_name_of(declaration);

        if self.module.contains(&name) {
            return name;
        }

        let node = arena.get(declaration);
        let labels = arena.labels_of(declaration);
        let is_subscript = node.introducer == FunctionIntroducer::Subscript;

        self.module.declare(ir::Function::new(
            name.clone(),
            labels.clone(),
            is_subscript,
            node.site,
        ));

        let Some(body) = &node.body else {
            self.diagnostics.insert(Diagnostic::error(
                format!("{} requires an implementation", node.name.mangled()),
                node.name.site,
            ));
            return name;
        };

        self.with_clear_context(|this| {
            let mut function =
                ir::Function::new(name.clone(), labels, is_subscript, node.site);
            let entry = function.append_block(node.parameters.len() as u32);
            this.current = Some(CurrentFunction {
                function,
                point: InsertionPoint::End(entry),
            });

            let mut frame = Frame::new(declaration.raw);
            for (i, parameter) in node.parameters.iter().enumerate() {
                let identifier = &arena.get(*parameter).identifier;
                frame
                    .locals
                    .insert(identifier.value.clone(), Value::Parameter(entry, i as u32));
            }

            this.within(frame, |this| this.lower_function_body(body, node.site));

            let function = this.current.take().expect("installed above").function;
            this.module.replace(function);
        });

        name
    }

    /// A single-expression body returns its value; otherwise the body lowers
    /// as a block and falls back to returning unit at `end`.
    fn lower_function_body(&mut self, body: &[StatementId], site: SourceSpan) {
        let arena = self.arena;

        if body.len() == 1 {
            if let Some(expression) = arena.cast_to_expression(body[0].raw()) {
                let value = self.lower_expression(expression);
                let value_site = self.site_of(expression);
                self.emit(InstructionKind::Return { value }, value_site);
                return;
            }
        }

        self.lower_statements(body);

        if !self.terminated() {
            let end = SourceSpan::new(site.source, site.end, site.end);
            self.emit(
                InstructionKind::Return {
                    value: Value::unit(),
                },
                end,
            );
        }
    }

    /// First hoists pure nested functions, then lowers the remaining
    /// statements in order, stopping after one that ends control flow.
    fn lower_statements(&mut self, statements: &[StatementId]) {
        let remaining = self.hoist_pure_functions(statements);

        for statement in remaining {
            self.lower_statement(statement);
            if ends_control_flow(self.arena.tag(statement.raw())) {
                break;
            }
        }
    }

    /// Registers function declarations with no free variables as function
    /// constants in the current frame and lowers them eagerly; everything
    /// else is kept, in order.
    fn hoist_pure_functions(&mut self, statements: &[StatementId]) -> Vec<StatementId> {
        let arena = self.arena;
        let mut remaining = Vec::new();

        for statement in statements {
            if let Some(function) = arena.cast::<FunctionDecl>(statement.raw()) {
                if self.captures_of(function).is_empty() {
                    let ir_name = self.lower_function_declaration(function);
                    let source_name = arena.get(function).name.mangled();
                    self.locals_mut()
                        .insert(source_name, Value::Constant(Constant::FunctionRef(ir_name)));
                    continue;
                }
            }
            remaining.push(*statement);
        }

        remaining
    }

    fn lower_statement(&mut self, statement: StatementId) {
        let arena = self.arena;
        let raw = statement.raw();

        match arena.node(raw) {
            Syntax::BindingDecl(_) => {
                let id = arena.cast::<BindingDecl>(raw).expect("matched the variant");
                self.lower_binding_declaration(id);
            }
            Syntax::FunctionDecl(_) => {
                let id = arena.cast::<FunctionDecl>(raw).expect("matched the variant");
                let ir_name = self.lower_function_declaration(id);
                let source_name = arena.get(id).name.mangled();
                self.locals_mut()
                    .insert(source_name, Value::Constant(Constant::FunctionRef(ir_name)));
            }
            // Type declarations and imports have no operational content here
            Syntax::StructDecl(_)
            | Syntax::TraitDecl(_)
            | Syntax::FieldDecl(_)
            | Syntax::VariableDecl(_)
            | Syntax::ImportDecl(_)
            | Syntax::ParameterDecl(_) => {}

            Syntax::Block(_) => {
                let id = arena.cast::<Block>(raw).expect("matched the variant");
                self.lower_scoped_block(id);
            }
            Syntax::Defer(n) => {
                let body = n.body;
                self.frames
                    .last_mut()
                    .expect("at least the module frame")
                    .deferred
                    .push(body);
            }
            Syntax::Break(n) => {
                let site = n.site;
                let target = self.loops.last().map(|ctx| ctx.exit);
                match target {
                    Some(target) => {
                        self.emit(
                            InstructionKind::Branch {
                                target,
                                arguments: Vec::new(),
                            },
                            site,
                        );
                    }
                    None => self.diagnostics.insert(Diagnostic::error(
                        "'break' can only occur in a loop",
                        site,
                    )),
                }
            }
            Syntax::Continue(n) => {
                let site = n.site;
                let target = self.loops.last().map(|ctx| ctx.head);
                match target {
                    Some(target) => {
                        self.emit(
                            InstructionKind::Branch {
                                target,
                                arguments: Vec::new(),
                            },
                            site,
                        );
                    }
                    None => self.diagnostics.insert(Diagnostic::error(
                        "'continue' can only occur in a loop",
                        site,
                    )),
                }
            }
            Syntax::For(_) => self.lower_for(raw),
            Syntax::While(_) => self.lower_while(raw),
            Syntax::Return(n) => {
                let site = n.site;
                let value = match n.value {
                    Some(value) => self.lower_expression(value),
                    None => Value::unit(),
                };
                self.emit(InstructionKind::Return { value }, site);
            }
            // No unwinding exists in the IR; a throw leaves the function
            Syntax::Throw(n) => {
                let site = n.site;
                let value = self.lower_expression(n.value);
                self.emit(InstructionKind::Return { value }, site);
            }
            Syntax::Yield(n) => {
                let site = n.site;
                let value_id = n.value;
                let is_subscript = self
                    .current
                    .as_ref()
                    .map(|c| c.function.is_subscript)
                    .unwrap_or(false);
                if is_subscript {
                    let value = self.lower_expression(value_id);
                    self.emit(InstructionKind::Yield { value }, site);
                } else {
                    self.diagnostics.insert(Diagnostic::error(
                        "'yield' can only occur in a subscript",
                        site,
                    ));
                }
            }
            Syntax::Assignment(n) => {
                let site = n.site;
                let (target_id, value_id) = (n.target, n.value);
                let value = self.lower_expression(value_id);
                let target = self.lower_expression(target_id);
                self.emit(InstructionKind::Store { value, target }, site);
            }
            _ => {
                let expression = arena
                    .cast_to_expression(raw)
                    .expect("statements are declarations, statements proper, or expressions");
                self.lower_expression(expression);
            }
        }
    }

    /* Bindings */

    fn lower_binding_declaration(&mut self, id: NodeId<BindingDecl>) {
        let arena = self.arena;
        let node = arena.get(id);
        let introducer = arena.get(node.pattern).introducer;

        match introducer {
            BindingIntroducer::Var => self.lower_var_binding(id),
            BindingIntroducer::Let => self.lower_projected_binding(id, Capability::Let),
            BindingIntroducer::Inout => self.lower_projected_binding(id, Capability::Inout),
        }
    }

    /// `var` bindings allocate storage, store each leaf initializer through
    /// its tuple path, and name the projections of the storage.
    fn lower_var_binding(&mut self, id: NodeId<BindingDecl>) {
        let arena = self.arena;
        let node = arena.get(id);
        let pattern_site = self.site_of(node.pattern);

        let storage = self.emit(InstructionKind::Alloc, pattern_site);
        let storage = Value::Register(storage);

        let Some(initializer) = node.initializer else {
            // Declaration without a value: name the storage projections
            let mut path = Vec::new();
            let mut bindings = Vec::new();
            for_each_declaration(
                arena,
                node.pattern.into(),
                &mut path,
                &mut |variable, path| {
                    bindings.push((variable, path.to_vec()));
                },
            );
            for (variable, path) in bindings {
                let site = self.site_of(variable);
                let w = self.project_path(storage.clone(), &path, site);
                let name = arena.get(variable).identifier.value.clone();
                self.locals_mut().insert(name, w);
            }
            return;
        };

        let mut leaves = Vec::new();
        visit_pattern_with(
            arena,
            node.pattern.into(),
            initializer,
            &mut Vec::new(),
            &mut |pattern, expression, path| {
                leaves.push((pattern, expression, path.to_vec()));
            },
        );

        for (pattern, expression, path) in leaves {
            let leaf_site = self.site_of(pattern);
            let w = self.project_path(storage.clone(), &path, leaf_site);
            let value = self.lower_expression(expression);
            self.emit(
                InstructionKind::Store {
                    value,
                    target: w.clone(),
                },
                leaf_site,
            );

            let mut bindings = Vec::new();
            for_each_declaration(arena, pattern, &mut Vec::new(), &mut |variable, sub| {
                bindings.push((variable, sub.to_vec()));
            });
            for (variable, sub) in bindings {
                let site = self.site_of(variable);
                let target = self.project_path(w.clone(), &sub, site);
                let name = arena.get(variable).identifier.value.clone();
                self.locals_mut().insert(name, target);
            }
        }
    }

    /// `let`/`inout` bindings lower the initializer once and name accesses
    /// over its projections.
    fn lower_projected_binding(&mut self, id: NodeId<BindingDecl>, capability: Capability) {
        let arena = self.arena;
        let node = arena.get(id);

        let whole = match node.initializer {
            Some(initializer) => self.lower_expression(initializer),
            None => Value::Poison(self.site_of(node.pattern)),
        };

        let mut bindings = Vec::new();
        for_each_declaration(
            arena,
            node.pattern.into(),
            &mut Vec::new(),
            &mut |variable, path| {
                bindings.push((variable, path.to_vec()));
            },
        );

        for (variable, path) in bindings {
            let site = self.site_of(variable);
            let w = self.project_path(whole.clone(), &path, site);
            let access = self.emit(
                InstructionKind::Access {
                    source: w,
                    capability,
                },
                site,
            );
            let name = arena.get(variable).identifier.value.clone();
            self.locals_mut().insert(name, Value::Register(access));
        }
    }

    /// Projects `base` through a tuple path with `member` instructions.
    fn project_path(&mut self, base: Value, path: &[u32], site: SourceSpan) -> Value {
        let mut w = base;
        for index in path {
            let m = self.emit(
                InstructionKind::Member {
                    whole: w,
                    member: Member::Index(*index),
                },
                site,
            );
            w = Value::Register(m);
        }
        w
    }

    /* Expressions */

    fn lower_expression(&mut self, expression: ExpressionId) -> Value {
        let arena = self.arena;
        let raw = expression.raw();
        let site = arena.site(raw);

        match arena.node(raw) {
            Syntax::BoolLiteral(n) => Value::Constant(Constant::Bool(n.value)),
            Syntax::IntegerLiteral(_) => {
                let text = self.source.text_of(site);
                match parse_integer_literal(text) {
                    Some(value) => Value::Constant(Constant::Int(value)),
                    None => {
                        self.diagnostics.insert(Diagnostic::error(
                            format!("cannot represent '{text}' as a 64-bit signed integer"),
                            site,
                        ));
                        Value::Poison(site)
                    }
                }
            }
            Syntax::FloatLiteral(_) => {
                let text = self.source.text_of(site);
                self.diagnostics.insert(Diagnostic::error(
                    format!("cannot represent '{text}' as an IR constant"),
                    site,
                ));
                Value::Poison(site)
            }
            Syntax::StringLiteral(n) => Value::Constant(Constant::String(n.value.clone())),
            Syntax::ArrayLiteral(n) => {
                let elements = n.elements.clone();
                let storage = self.emit(InstructionKind::Alloc, site);
                let storage = Value::Register(storage);
                for (i, element) in elements.iter().enumerate() {
                    let value = self.lower_expression(*element);
                    let slot = self.project_path(storage.clone(), &[i as u32], site);
                    self.emit(InstructionKind::Store { value, target: slot }, site);
                }
                storage
            }
            Syntax::DictionaryLiteral(n) => {
                let entries = n.entries.clone();
                let storage = self.emit(InstructionKind::Alloc, site);
                let storage = Value::Register(storage);
                for (i, entry) in entries.iter().enumerate() {
                    let pair = self.emit(InstructionKind::Alloc, site);
                    let pair = Value::Register(pair);

                    let key = self.lower_expression(entry.key);
                    let key_slot = self.project_path(pair.clone(), &[0], site);
                    self.emit(
                        InstructionKind::Store {
                            value: key,
                            target: key_slot,
                        },
                        site,
                    );

                    let value = self.lower_expression(entry.value);
                    let value_slot = self.project_path(pair.clone(), &[1], site);
                    self.emit(
                        InstructionKind::Store {
                            value,
                            target: value_slot,
                        },
                        site,
                    );

                    let slot = self.project_path(storage.clone(), &[i as u32], site);
                    self.emit(
                        InstructionKind::Store {
                            value: pair,
                            target: slot,
                        },
                        site,
                    );
                }
                storage
            }
            Syntax::TupleLiteral(n) => {
                let elements = n.elements.clone();
                let storage = self.emit(InstructionKind::Alloc, site);
                let storage = Value::Register(storage);
                for (i, element) in elements.iter().enumerate() {
                    let value = self.lower_expression(element.value);
                    let slot = self.project_path(storage.clone(), &[i as u32], site);
                    self.emit(InstructionKind::Store { value, target: slot }, site);
                }
                storage
            }
            Syntax::NameExpr(_) => {
                let id = arena.cast::<NameExpr>(raw).expect("matched the variant");
                self.lower_name(id)
            }
            Syntax::Call(n) => {
                let callee_id = n.callee;
                let style = n.style;
                let labels: Vec<Option<String>> = n
                    .arguments
                    .iter()
                    .map(|a| a.label.as_ref().map(|l| l.value.clone()))
                    .collect();
                let argument_ids: Vec<ExpressionId> =
                    n.arguments.iter().map(|a| a.value).collect();

                let callee = self.lower_expression(callee_id);
                let arguments: Vec<Value> = argument_ids
                    .iter()
                    .map(|a| self.lower_expression(*a))
                    .collect();

                let kind = match style {
                    CallStyle::Parenthesized => InstructionKind::Invoke {
                        callee,
                        labels,
                        arguments,
                    },
                    CallStyle::Bracketed => InstructionKind::Project {
                        callee,
                        labels,
                        arguments,
                    },
                };
                Value::Register(self.emit(kind, site))
            }
            Syntax::TypeTest(n) => {
                let (lhs, rhs) = (n.lhs, n.rhs);
                let value = self.lower_expression(lhs);
                self.lower_type_equality(value, rhs, site)
            }
            Syntax::Lambda(_) => {
                let id = arena.cast::<Lambda>(raw).expect("matched the variant");
                self.lower_lambda(id)
            }
            Syntax::Conditional(_) => {
                let id = arena.cast::<Conditional>(raw).expect("matched the variant");
                self.lower_conditional(id)
            }
            Syntax::Match(n) => {
                let subject = n.subject;
                let cases = n.cases.clone();
                self.lower_match(subject, &cases, site)
            }
            // No unwinding reaches the handlers; the body is the expression
            Syntax::Try(n) => {
                let body = n.body;
                self.lower_block_for_value(body).unwrap_or_else(Value::unit)
            }
            _ => unreachable!("not an expression"),
        }
    }

    /// Qualified names project members; unqualified names go through the
    /// frame walk.
    fn lower_name(&mut self, id: NodeId<NameExpr>) -> Value {
        let arena = self.arena;
        let node = arena.get(id);
        let site = node.site;

        if let Some(qualification) = node.qualification {
            let whole = self.lower_expression(qualification);
            let member = self.emit(
                InstructionKind::Member {
                    whole,
                    member: Member::Name(node.name.mangled()),
                },
                site,
            );
            return Value::Register(member);
        }

        let name = node.name.clone();
        match self.lookup_unqualified(&name) {
            Some(value) => value,
            None => {
                self.diagnostics.insert(Diagnostic::error(
                    format!("undefined symbol '{}'", name.mangled()),
                    site,
                ));
                Value::Poison(site)
            }
        }
    }

    /// Unqualified name lookup: the frame stack innermost-out; then, popping
    /// frames one at a time, the function (and type) declarations lexically
    /// contained in each frame's scope; then the built-ins.
    fn lookup_unqualified(&mut self, name: &Name) -> Option<Value> {
        let arena = self.arena;
        let key = name.mangled();

        for frame in self.frames.iter().rev() {
            if let Some(value) = frame.locals.get(&key) {
                return Some(value.clone());
            }
        }

        let mut popped = Vec::new();
        let mut found = None;

        while !self.frames.is_empty() && found.is_none() {
            let scope = self.frames.last().expect("checked non-empty").scope;

            for declaration in self.declarations_in(scope) {
                let raw = declaration.raw();
                match arena.tag(raw) {
                    SyntaxTag::FunctionDecl => {
                        let function = arena.cast::<FunctionDecl>(raw).expect("tag checked");
                        if arena.get(function).name.mangled() == key {
                            let ir_name = self.lower_function_declaration(function);
                            let value = Value::Constant(Constant::FunctionRef(ir_name));
                            self.frames
                                .last_mut()
                                .expect("checked non-empty")
                                .locals
                                .insert(key.clone(), value.clone());
                            found = Some(value);
                            break;
                        }
                    }
                    // Type names denote their tag
                    SyntaxTag::StructDecl => {
                        let node = arena.cast::<crate::frontend::ast::StructDecl>(raw).expect("tag checked");
                        if arena.get(node).identifier.value == key {
                            found = Some(Value::Constant(Constant::String(key.clone())));
                            break;
                        }
                    }
                    SyntaxTag::TraitDecl => {
                        let node = arena.cast::<crate::frontend::ast::TraitDecl>(raw).expect("tag checked");
                        if arena.get(node).identifier.value == key {
                            found = Some(Value::Constant(Constant::String(key.clone())));
                            break;
                        }
                    }
                    _ => {}
                }
            }

            if found.is_none() {
                popped.push(self.frames.pop().expect("checked non-empty"));
            }
        }

        while let Some(frame) = popped.pop() {
            self.frames.push(frame);
        }
        if found.is_some() {
            return found;
        }

        match key.as_str() {
            "print" => Some(Value::Constant(Constant::BuiltinPrint)),
            "type" => Some(Value::Constant(Constant::BuiltinType)),
            _ => None,
        }
    }

    /// `lhs is rhs` compares the dynamic type tag of `lhs` with `rhs`.
    fn lower_type_equality(
        &mut self,
        value: Value,
        type_expression: ExpressionId,
        site: SourceSpan,
    ) -> Value {
        let type_of = self.emit(
            InstructionKind::Invoke {
                callee: Value::Constant(Constant::BuiltinType),
                labels: vec![None],
                arguments: vec![value],
            },
            site,
        );
        let rhs = self.lower_expression(type_expression);
        let equals = self.emit(
            InstructionKind::Member {
                whole: Value::Register(type_of),
                member: Member::Name("infix==".to_owned()),
            },
            site,
        );
        Value::Register(self.emit(
            InstructionKind::Invoke {
                callee: Value::Register(equals),
                labels: vec![None],
                arguments: vec![rhs],
            },
            site,
        ))
    }

    /// A lambda lowers as an anonymous module function; its value is a
    /// function reference.
    fn lower_lambda(&mut self, id: NodeId<Lambda>) -> Value {
        let arena = self.arena;
        let node = arena.get(id);

        let name = format!("$lambda{}", self.lambda_counter);
        self.lambda_counter += 1;
        self.used_names.insert(name.clone());

        let labels: Vec<Option<String>> = node
            .parameters
            .iter()
            .map(|p| arena.get(*p).label.as_ref().map(|l| l.value.clone()))
            .collect();

        self.module
            .declare(ir::Function::new(name.clone(), labels.clone(), false, node.site));

        self.with_clear_context(|this| {
            let mut function = ir::Function::new(name.clone(), labels, false, node.site);
            let entry = function.append_block(node.parameters.len() as u32);
            this.current = Some(CurrentFunction {
                function,
                point: InsertionPoint::End(entry),
            });

            let mut frame = Frame::new(id.raw);
            for (i, parameter) in node.parameters.iter().enumerate() {
                let identifier = &arena.get(*parameter).identifier;
                frame
                    .locals
                    .insert(identifier.value.clone(), Value::Parameter(entry, i as u32));
            }

            this.within(frame, |this| this.lower_function_body(&node.body, node.site));

            let function = this.current.take().expect("installed above").function;
            this.module.replace(function);
        });

        Value::Constant(Constant::FunctionRef(name))
    }

    /* Control flow */

    /// Lowers a conditional expression: each condition branches to a fresh
    /// success block or to the shared failure target; the arms join in a
    /// block that carries the result iff an else branch exists.
    fn lower_conditional(&mut self, id: NodeId<Conditional>) -> Value {
        let arena = self.arena;
        let node = arena.get(id);
        let site = node.site;
        let conditions = node.conditions.clone();
        let success_block = node.success;
        let failure_else = node.failure;

        let has_failure = failure_else.is_some();
        let join = self
            .function_mut()
            .append_block(if has_failure { 1 } else { 0 });
        let failure_target = if has_failure {
            self.function_mut().append_block(0)
        } else {
            join
        };

        self.within(Frame::new(id.raw), |this| {
            for condition in &conditions {
                this.lower_condition(*condition, failure_target);
            }

            let value = this.lower_block_for_value(success_block);
            if let Some(value) = value {
                if !this.terminated() {
                    let arguments = if has_failure { vec![value] } else { Vec::new() };
                    this.emit(
                        InstructionKind::Branch {
                            target: join,
                            arguments,
                        },
                        site,
                    );
                }
            }
        });

        if let Some(failure) = failure_else {
            self.move_to(failure_target);
            let raw = failure.raw();

            let value = match arena.tag(raw) {
                SyntaxTag::Conditional => {
                    let nested = arena.cast::<Conditional>(raw).expect("tag checked");
                    Some(self.lower_conditional(nested))
                }
                SyntaxTag::Block => {
                    let block = arena.cast::<Block>(raw).expect("tag checked");
                    self.lower_block_for_value(block)
                }
                _ => unreachable!("an else branch is a block or a conditional"),
            };

            if let Some(value) = value {
                if !self.terminated() {
                    self.emit(
                        InstructionKind::Branch {
                            target: join,
                            arguments: vec![value],
                        },
                        site,
                    );
                }
            }
        }

        self.move_to(join);
        if has_failure {
            Value::Parameter(join, 0)
        } else {
            Value::unit()
        }
    }

    /// Lowers one condition; on success the insertion point falls into a
    /// fresh block, on failure control transfers to `failure`.
    fn lower_condition(&mut self, condition: ConditionId, failure: BlockId) {
        let arena = self.arena;
        let raw = condition.raw();
        let site = arena.site(raw);

        match arena.node(raw) {
            Syntax::MatchCondition(n) => {
                let (pattern, subject) = (n.pattern, n.subject);
                let scrutinee = self.lower_expression(subject);
                self.lower_pattern_match(pattern, scrutinee, Capability::Let, failure);
                self.branch_to_fresh_block(site);
            }
            Syntax::BindingDecl(n) => {
                let pattern = n.pattern;
                let initializer = n.initializer;
                let scrutinee = match initializer {
                    Some(initializer) => self.lower_expression(initializer),
                    None => Value::Poison(site),
                };
                let capability = match arena.get(pattern).introducer {
                    BindingIntroducer::Let => Capability::Let,
                    BindingIntroducer::Inout => Capability::Inout,
                    BindingIntroducer::Var => Capability::Sink,
                };
                self.lower_pattern_match(pattern.into(), scrutinee, capability, failure);
                self.branch_to_fresh_block(site);
            }
            _ => {
                let expression = arena
                    .cast_to_expression(raw)
                    .expect("conditions are expressions, bindings, or match conditions");
                let value = self.lower_expression(expression);
                let success = self.function_mut().append_block(0);
                self.emit(
                    InstructionKind::CondBranch {
                        condition: value,
                        success,
                        failure,
                    },
                    site,
                );
                self.move_to(success);
            }
        }
    }

    fn branch_to_fresh_block(&mut self, site: SourceSpan) {
        let success = self.function_mut().append_block(0);
        self.emit(
            InstructionKind::Branch {
                target: success,
                arguments: Vec::new(),
            },
            site,
        );
        self.move_to(success);
    }

    /// Binds a pattern against a scrutinee value, emitting equality and type
    /// tests that transfer to `failure` when they do not hold.
    fn lower_pattern_match(
        &mut self,
        pattern: PatternId,
        scrutinee: Value,
        capability: Capability,
        failure: BlockId,
    ) {
        let arena = self.arena;
        let raw = pattern.raw();
        let site = arena.site(raw);

        match arena.node(raw) {
            Syntax::BindingPattern(n) => {
                let introducer = n.introducer;
                let subpattern = n.subpattern;
                let capability = match introducer {
                    BindingIntroducer::Let => Capability::Let,
                    BindingIntroducer::Inout => Capability::Inout,
                    BindingIntroducer::Var => Capability::Sink,
                };
                self.lower_pattern_match(subpattern, scrutinee, capability, failure);
            }
            Syntax::TuplePattern(n) => {
                let elements: Vec<PatternId> = n.elements.iter().map(|e| e.pattern).collect();
                for (i, element) in elements.iter().enumerate() {
                    let w = self.project_path(scrutinee.clone(), &[i as u32], site);
                    self.lower_pattern_match(*element, w, capability, failure);
                }
            }
            Syntax::WildcardPattern(_) => {}
            Syntax::VariableDecl(n) => {
                let name = n.identifier.value.clone();
                let access = self.emit(
                    InstructionKind::Access {
                        source: scrutinee,
                        capability,
                    },
                    site,
                );
                self.locals_mut().insert(name, Value::Register(access));
            }
            Syntax::TypePattern(n) => {
                let (lhs, rhs) = (n.lhs, n.rhs);
                let test = self.lower_type_equality(scrutinee.clone(), rhs, site);
                let success = self.function_mut().append_block(0);
                self.emit(
                    InstructionKind::CondBranch {
                        condition: test,
                        success,
                        failure,
                    },
                    site,
                );
                self.move_to(success);
                self.lower_pattern_match(lhs, scrutinee, capability, failure);
            }
            // An extractor projects the named member and binds its parts
            Syntax::ExtractorPattern(n) => {
                let callee = n.callee;
                let arguments: Vec<PatternId> = n.arguments.iter().map(|a| a.pattern).collect();

                let member_name = match arena.node(callee.raw()) {
                    Syntax::NameExpr(name) => name.name.mangled(),
                    _ => String::new(),
                };
                let m = self.emit(
                    InstructionKind::Member {
                        whole: scrutinee,
                        member: Member::Name(member_name),
                    },
                    site,
                );
                for (i, argument) in arguments.iter().enumerate() {
                    let w = self.project_path(Value::Register(m), &[i as u32], site);
                    self.lower_pattern_match(*argument, w, capability, failure);
                }
            }
            // Anything else is an equality pattern
            _ => {
                let expression = arena
                    .cast_to_expression(raw)
                    .expect("pattern leaves are patterns proper or expressions");
                let leaf = self.lower_expression(expression);
                let equals = self.emit(
                    InstructionKind::Member {
                        whole: leaf,
                        member: Member::Name("infix==".to_owned()),
                    },
                    site,
                );
                let test = self.emit(
                    InstructionKind::Invoke {
                        callee: Value::Register(equals),
                        labels: vec![None],
                        arguments: vec![scrutinee],
                    },
                    site,
                );
                let success = self.function_mut().append_block(0);
                self.emit(
                    InstructionKind::CondBranch {
                        condition: Value::Register(test),
                        success,
                        failure,
                    },
                    site,
                );
                self.move_to(success);
            }
        }
    }

    fn lower_match(
        &mut self,
        subject: ExpressionId,
        cases: &[NodeId<MatchCase>],
        site: SourceSpan,
    ) -> Value {
        let arena = self.arena;
        let scrutinee = self.lower_expression(subject);
        let join = self.function_mut().append_block(1);

        for case in cases {
            let node = arena.get(*case);
            let (pattern, body) = (node.pattern, node.body);
            let next = self.function_mut().append_block(0);

            self.within(Frame::new(case.raw), |this| {
                this.lower_pattern_match(pattern, scrutinee.clone(), Capability::Let, next);
                let value = this.lower_block_for_value(body);
                if let Some(value) = value {
                    if !this.terminated() {
                        this.emit(
                            InstructionKind::Branch {
                                target: join,
                                arguments: vec![value],
                            },
                            site,
                        );
                    }
                }
            });

            self.move_to(next);
        }

        // No case matched
        self.emit(
            InstructionKind::Branch {
                target: join,
                arguments: vec![Value::Poison(site)],
            },
            site,
        );

        self.move_to(join);
        Value::Parameter(join, 0)
    }

    fn lower_while(&mut self, raw: NodeRef) {
        let arena = self.arena;
        let Syntax::While(node) = arena.node(raw) else {
            unreachable!("caller matched the tag")
        };
        let site = node.site;
        let conditions = node.conditions.clone();
        let body = node.body;

        let head = self.function_mut().append_block(0);
        self.emit(
            InstructionKind::Branch {
                target: head,
                arguments: Vec::new(),
            },
            site,
        );
        self.move_to(head);

        let exit = self.function_mut().append_block(0);

        self.within(Frame::new(raw), |this| {
            for condition in &conditions {
                this.lower_condition(*condition, exit);
            }

            this.loops.push(LoopContext { head, exit });
            let finished = this.lower_block_for_value(body);
            this.loops.pop();

            if finished.is_some() && !this.terminated() {
                this.emit(
                    InstructionKind::Branch {
                        target: head,
                        arguments: Vec::new(),
                    },
                    site,
                );
            }
        });

        self.move_to(exit);
    }

    /// A `for` loop drives the domain through its `has_next`/`next` members.
    fn lower_for(&mut self, raw: NodeRef) {
        let arena = self.arena;
        let Syntax::For(node) = arena.node(raw) else {
            unreachable!("caller matched the tag")
        };
        let site = node.site;
        let binding = node.binding;
        let domain = node.domain;
        let filter = node.filter;
        let body = node.body;

        let d = self.lower_expression(domain);

        let head = self.function_mut().append_block(0);
        self.emit(
            InstructionKind::Branch {
                target: head,
                arguments: Vec::new(),
            },
            site,
        );
        self.move_to(head);

        let exit = self.function_mut().append_block(0);

        self.within(Frame::new(raw), |this| {
            let has_next = this.emit(
                InstructionKind::Member {
                    whole: d.clone(),
                    member: Member::Name("has_next".to_owned()),
                },
                site,
            );
            let test = this.emit(
                InstructionKind::Invoke {
                    callee: Value::Register(has_next),
                    labels: Vec::new(),
                    arguments: Vec::new(),
                },
                site,
            );
            let body_entry = this.function_mut().append_block(0);
            this.emit(
                InstructionKind::CondBranch {
                    condition: Value::Register(test),
                    success: body_entry,
                    failure: exit,
                },
                site,
            );
            this.move_to(body_entry);

            let next = this.emit(
                InstructionKind::Member {
                    whole: d.clone(),
                    member: Member::Name("next".to_owned()),
                },
                site,
            );
            let element = this.emit(
                InstructionKind::Invoke {
                    callee: Value::Register(next),
                    labels: Vec::new(),
                    arguments: Vec::new(),
                },
                site,
            );

            let capability = match arena.get(binding).introducer {
                BindingIntroducer::Let => Capability::Let,
                BindingIntroducer::Inout => Capability::Inout,
                BindingIntroducer::Var => Capability::Sink,
            };
            this.lower_pattern_match(
                binding.into(),
                Value::Register(element),
                capability,
                exit,
            );

            if let Some(filter) = filter {
                let value = this.lower_expression(filter);
                let matched = this.function_mut().append_block(0);
                this.emit(
                    InstructionKind::CondBranch {
                        condition: value,
                        success: matched,
                        failure: head,
                    },
                    site,
                );
                this.move_to(matched);
            }

            this.loops.push(LoopContext { head, exit });
            let finished = this.lower_block_for_value(body);
            this.loops.pop();

            if finished.is_some() && !this.terminated() {
                this.emit(
                    InstructionKind::Branch {
                        target: head,
                        arguments: Vec::new(),
                    },
                    site,
                );
            }
        });

        self.move_to(exit);
    }

    /* Blocks */

    /// Lowers a block statement in its own frame, discarding its value.
    fn lower_scoped_block(&mut self, block: NodeId<Block>) {
        self.lower_block_for_value(block);
    }

    /// Lowers a block, producing the value of its trailing expression (or
    /// unit); `None` when the block ended control flow.
    fn lower_block_for_value(&mut self, block: NodeId<Block>) -> Option<Value> {
        let arena = self.arena;
        let statements = arena.get(block).statements.clone();

        self.within(Frame::new(block.raw), |this| {
            let mut remaining = this.hoist_pure_functions(&statements);

            let trailing = remaining
                .last()
                .and_then(|s| arena.cast_to_expression(s.raw()));
            if trailing.is_some() {
                remaining.pop();
            }

            for statement in &remaining {
                this.lower_statement(*statement);
                if ends_control_flow(arena.tag(statement.raw())) {
                    return None;
                }
            }

            if this.terminated() {
                return None;
            }

            match trailing {
                Some(expression) => Some(this.lower_expression(expression)),
                None => Some(Value::unit()),
            }
        })
    }

    /* Capture enumeration */

    /// The free names of a function declaration, each with its occurrence
    /// sites.
    pub fn captures_of(
        &self,
        function: NodeId<FunctionDecl>,
    ) -> HashMap<String, Vec<SourceSpan>> {
        let mut captures = HashMap::new();
        let bound = HashSet::new();
        enumerate_function_captures(self.arena, function, &bound, &mut captures);
        captures
    }
}

fn ends_control_flow(tag: SyntaxTag) -> bool {
    matches!(
        tag,
        SyntaxTag::Return | SyntaxTag::Throw | SyntaxTag::Break | SyntaxTag::Continue
    )
}

fn enumerate_function_captures(
    arena: &SyntaxArena,
    function: NodeId<FunctionDecl>,
    inherited: &HashSet<String>,
    captures: &mut HashMap<String, Vec<SourceSpan>>,
) {
    let node = arena.get(function);
    let mut bound = inherited.clone();
    bound.insert(node.name.mangled());
    for parameter in &node.parameters {
        bound.insert(arena.get(*parameter).identifier.value.clone());
    }

    if let Some(body) = &node.body {
        for statement in body {
            collect_free_names(arena, statement.raw(), &mut bound, captures);
        }
    }
}

fn collect_free_names(
    arena: &SyntaxArena,
    node: NodeRef,
    bound: &mut HashSet<String>,
    captures: &mut HashMap<String, Vec<SourceSpan>>,
) {
    match arena.node(node) {
        // Nested scopes get a child enumerator inheriting the bound set
        Syntax::FunctionDecl(n) => {
            bound.insert(n.name.mangled());
            let id = arena.cast::<FunctionDecl>(node).expect("matched the variant");
            enumerate_function_captures(arena, id, bound, captures);
        }
        Syntax::StructDecl(n) => {
            bound.insert(n.identifier.value.clone());
            let mut child = bound.clone();
            for member in &n.members {
                collect_free_names(arena, member.raw(), &mut child, captures);
            }
        }
        Syntax::TraitDecl(n) => {
            bound.insert(n.identifier.value.clone());
            let mut child = bound.clone();
            for member in &n.members {
                collect_free_names(arena, member.raw(), &mut child, captures);
            }
        }
        Syntax::Lambda(n) => {
            let mut child = bound.clone();
            for parameter in &n.parameters {
                child.insert(arena.get(*parameter).identifier.value.clone());
            }
            for statement in &n.body {
                collect_free_names(arena, statement.raw(), &mut child, captures);
            }
        }

        Syntax::VariableDecl(n) => {
            bound.insert(n.identifier.value.clone());
        }

        Syntax::NameExpr(n) => match n.qualification {
            Some(qualification) => {
                collect_free_names(arena, qualification.raw(), bound, captures)
            }
            None => {
                let key = n.name.mangled();
                if !bound.contains(&key) {
                    captures.entry(key).or_default().push(n.site);
                }
            }
        },

        _ => {
            crate::frontend::visit::for_each_child(arena, node, &mut |child| {
                collect_free_names(arena, child, bound, captures);
            });
        }
    }
}

/// Parses an integer literal's text (decimal, `0x`/`0o`/`0b`, `_`
/// separators, optional leading minus) into a 64-bit signed value.
pub fn parse_integer_literal(text: &str) -> Option<i64> {
    let cleaned: String = text.chars().filter(|c| *c != '_').collect();
    let (negative, digits) = match cleaned.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, cleaned.as_str()),
    };

    let magnitude = if let Some(hex) = digits.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).ok()?
    } else if let Some(oct) = digits.strip_prefix("0o") {
        u64::from_str_radix(oct, 8).ok()?
    } else if let Some(bin) = digits.strip_prefix("0b") {
        u64::from_str_radix(bin, 2).ok()?
    } else {
        digits.parse::<u64>().ok()?
    };

    if negative {
        if magnitude > (i64::MAX as u64) + 1 {
            return None;
        }
        Some((magnitude as i64).wrapping_neg())
    } else {
        i64::try_from(magnitude).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::ast::ModuleIndex;
    use crate::frontend::parser::parse_module;
    use crate::frontend::scope::scope_module;
    use crate::index::Index;
    use crate::source::SourceMap;

    fn lower(text: &str) -> (ir::Module, DiagnosticSet) {
        let mut sources = SourceMap::new();
        let id = sources.insert_virtual(0, text.to_owned());
        let file = sources.get(id);

        let result = parse_module(file, ModuleIndex::new(0), true);
        assert!(
            !result.diagnostics.contains_error(),
            "parse failed: {:?}",
            result.diagnostics.iter().collect::<Vec<_>>()
        );

        let tables = scope_module(&result.arena, &result.roots);
        let mut diagnostics = DiagnosticSet::new();
        let module = lower_module(
            &result.arena,
            &result.roots,
            &tables,
            file,
            true,
            &mut diagnostics,
        );
        (module, diagnostics)
    }

    fn messages(diagnostics: &DiagnosticSet) -> Vec<String> {
        diagnostics.iter().map(|d| d.message.clone()).collect()
    }

    #[test]
    fn entry_function_is_synthesized() {
        let (module, diagnostics) = lower("print(\"Hello\")\n");
        assert!(!diagnostics.contains_error());

        let main = module.get("$main").expect("the entry exists");
        assert_eq!(main.entry(), Some(BlockId::new(0)));

        let kinds: Vec<_> = main
            .instructions_in(BlockId::new(0))
            .map(|i| &main.instruction(i).kind)
            .collect();
        assert!(matches!(kinds[0], InstructionKind::Invoke { callee, .. }
            if *callee == Value::Constant(Constant::BuiltinPrint)));
        assert!(matches!(kinds[1], InstructionKind::Return { value }
            if *value == Value::unit()));
    }

    #[test]
    fn undefined_symbols_poison() {
        let (module, diagnostics) = lower("print(x)\n");
        assert_eq!(messages(&diagnostics), vec!["undefined symbol 'x'"]);

        let main = module.get("$main").unwrap();
        let has_poison = main.instruction_ids().any(|i| {
            main.instruction(i)
                .kind
                .operands()
                .iter()
                .any(|v| matches!(v, Value::Poison(_)))
        });
        assert!(has_poison);
    }

    #[test]
    fn missing_implementation_is_reported() {
        let (module, diagnostics) = lower("fun f(x)\n");
        assert_eq!(messages(&diagnostics), vec!["f requires an implementation"]);

        // The stub is registered regardless
        let f = module.get("f").expect("eagerly registered");
        assert!(!f.is_defined());
    }

    #[test]
    fn yield_outside_a_subscript_is_reported() {
        let (_, diagnostics) = lower("fun g(x) = yield x\n");
        assert_eq!(
            messages(&diagnostics),
            vec!["'yield' can only occur in a subscript"]
        );
    }

    #[test]
    fn subscripts_may_yield() {
        let (module, diagnostics) = lower("subscript s(x) =\n  yield x\n");
        assert!(!diagnostics.contains_error());

        let s = module.get("s").unwrap();
        assert!(s.is_subscript);
        let has_yield = s
            .instruction_ids()
            .any(|i| matches!(s.instruction(i).kind, InstructionKind::Yield { .. }));
        assert!(has_yield);
    }

    #[test]
    fn unrepresentable_integers_poison() {
        let (_, diagnostics) = lower("print(99999999999999999999)\n");
        assert_eq!(
            messages(&diagnostics),
            vec!["cannot represent '99999999999999999999' as a 64-bit signed integer"]
        );
    }

    #[test]
    fn var_bindings_allocate_and_store() {
        let (module, diagnostics) = lower("var x = 1\nprint(x)\n");
        assert!(!diagnostics.contains_error());

        let main = module.get("$main").unwrap();
        let kinds: Vec<_> = main
            .instructions_in(BlockId::new(0))
            .map(|i| &main.instruction(i).kind)
            .collect();

        assert!(matches!(kinds[0], InstructionKind::Alloc));
        assert!(matches!(
            kinds[1],
            InstructionKind::Store {
                value: Value::Constant(Constant::Int(1)),
                ..
            }
        ));
    }

    #[test]
    fn let_bindings_project_accesses() {
        let (module, diagnostics) = lower("let (a, b) = (1, 2)\nprint(a)\n");
        assert!(!diagnostics.contains_error());

        let main = module.get("$main").unwrap();
        let accesses: Vec<_> = main
            .instruction_ids()
            .filter(|i| {
                matches!(
                    main.instruction(*i).kind,
                    InstructionKind::Access {
                        capability: Capability::Let,
                        ..
                    }
                )
            })
            .collect();
        assert_eq!(accesses.len(), 2);

        // Two projections build the tuple, two project the bindings out
        let members = main
            .instruction_ids()
            .filter(|i| matches!(main.instruction(*i).kind, InstructionKind::Member { .. }))
            .count();
        assert_eq!(members, 4);
    }

    #[test]
    fn tuple_pattern_destructuring_stores_elementwise() {
        let (module, diagnostics) = lower("var (a, b) = (1, 2)\nprint(a)\nprint(b)\n");
        assert!(!diagnostics.contains_error());

        let main = module.get("$main").unwrap();
        let stores = main
            .instruction_ids()
            .filter(|i| matches!(main.instruction(*i).kind, InstructionKind::Store { .. }))
            .count();
        assert_eq!(stores, 2);
    }

    #[test]
    fn functions_resolve_lexically_before_their_statement() {
        let (module, diagnostics) = lower("print(f(1))\nfun f(x) = x\n");
        assert!(!diagnostics.contains_error());
        assert!(module.get("f").is_some());
    }

    #[test]
    fn calls_lower_with_labels() {
        let (module, diagnostics) = lower("fun f(x, y) = x\nprint(f(x: 1, y: 2))\n");
        assert!(!diagnostics.contains_error());

        let main = module.get("$main").unwrap();
        let invoke_labels = main
            .instruction_ids()
            .find_map(|i| match &main.instruction(i).kind {
                InstructionKind::Invoke {
                    callee: Value::Constant(Constant::FunctionRef(name)),
                    labels,
                    ..
                } if name == "f" => Some(labels.clone()),
                _ => None,
            })
            .expect("f is invoked");
        assert_eq!(invoke_labels, vec![Some("x".to_owned()), Some("y".to_owned())]);
    }

    #[test]
    fn bracketed_calls_project() {
        let (module, diagnostics) = lower("subscript s(x) =\n  yield x\nprint(s[1])\n");
        assert!(!diagnostics.contains_error());

        let main = module.get("$main").unwrap();
        let has_project = main
            .instruction_ids()
            .any(|i| matches!(main.instruction(i).kind, InstructionKind::Project { .. }));
        assert!(has_project);
    }

    #[test]
    fn conditional_expressions_join_with_a_parameter() {
        let (module, diagnostics) = lower("let r = if true do 1 else 2\nprint(r)\n");
        assert!(!diagnostics.contains_error());

        let main = module.get("$main").unwrap();
        let join = main
            .blocks
            .enumerate()
            .find(|(_, b)| b.parameter_count == 1)
            .map(|(id, _)| id)
            .expect("the join carries the result");

        // Both arms branch to the join with one argument
        let feeders = main
            .instruction_ids()
            .filter(|i| match &main.instruction(*i).kind {
                InstructionKind::Branch { target, arguments } => {
                    *target == join && arguments.len() == 1
                }
                _ => false,
            })
            .count();
        assert_eq!(feeders, 2);
    }

    #[test]
    fn conditional_statements_join_without_parameters() {
        let (module, diagnostics) = lower("if true do\n  print(1)\nprint(2)\n");
        assert!(!diagnostics.contains_error());

        let main = module.get("$main").unwrap();
        for (_, block) in main.blocks.enumerate() {
            assert_eq!(block.parameter_count, 0);
        }
    }

    #[test]
    fn while_loops_branch_back() {
        let (module, diagnostics) = lower("while true do\n  print(1)\n");
        assert!(!diagnostics.contains_error());

        let main = module.get("$main").unwrap();
        let cond_branches = main
            .instruction_ids()
            .filter(|i| matches!(main.instruction(*i).kind, InstructionKind::CondBranch { .. }))
            .count();
        assert_eq!(cond_branches, 1);
    }

    #[test]
    fn break_outside_a_loop_is_reported() {
        let (_, diagnostics) = lower("break\n");
        assert_eq!(messages(&diagnostics), vec!["'break' can only occur in a loop"]);
    }

    #[test]
    fn nested_pure_functions_are_hoisted() {
        let (module, diagnostics) = lower("fun outer(x) =\n  fun inner(y) = y\n  return inner(x)\n");
        assert!(!diagnostics.contains_error());
        assert!(module.get("outer").is_some());
        assert!(module.get("inner").is_some());
    }

    #[test]
    fn lookup_walks_out_of_nested_scopes() {
        // `helper` is declared lexically after its use, in an outer scope of
        // the use site; the frame walk pops out, finds it, and lowers it
        let (module, diagnostics) = lower(
            "fun outer(x) =\n  if x do\n    return helper(x)\n  return x\nfun helper(y) = y\nprint(outer(1))\n",
        );
        assert!(
            !diagnostics.contains_error(),
            "diagnostics: {:?}",
            diagnostics.iter().collect::<Vec<_>>()
        );
        assert!(module.get("helper").is_some());

        let outer = module.get("outer").unwrap();
        let calls_helper = outer.instruction_ids().any(|i| {
            matches!(
                &outer.instruction(i).kind,
                InstructionKind::Invoke {
                    callee: Value::Constant(Constant::FunctionRef(name)),
                    ..
                } if name == "helper"
            )
        });
        assert!(calls_helper);
    }

    #[test]
    fn match_expressions_join_on_a_parameter() {
        let (module, diagnostics) = lower("let r = match 1 do\n  0 => 10\n  _ => 20\nprint(r)\n");
        assert!(!diagnostics.contains_error());

        let main = module.get("$main").unwrap();
        let join = main
            .blocks
            .enumerate()
            .find(|(_, b)| b.parameter_count == 1)
            .map(|(id, _)| id)
            .expect("the join carries the result");

        // Both case bodies and the no-match fallback feed the join
        let feeders = main
            .instruction_ids()
            .filter(|i| match &main.instruction(*i).kind {
                InstructionKind::Branch { target, arguments } => {
                    *target == join && arguments.len() == 1
                }
                _ => false,
            })
            .count();
        assert_eq!(feeders, 3);

        let poison_feeders = main
            .instruction_ids()
            .filter(|i| match &main.instruction(*i).kind {
                InstructionKind::Branch { target, arguments } => {
                    *target == join && matches!(arguments[0], Value::Poison(_))
                }
                _ => false,
            })
            .count();
        assert_eq!(poison_feeders, 1);
    }

    #[test]
    fn binding_conditions_bind_through_accesses() {
        let (module, diagnostics) = lower("if let x = compute() do\n  print(x)\nfun compute() = 1\n");
        assert!(!diagnostics.contains_error());

        let main = module.get("$main").unwrap();
        let has_let_access = main.instruction_ids().any(|i| {
            matches!(
                main.instruction(i).kind,
                InstructionKind::Access {
                    capability: Capability::Let,
                    ..
                }
            )
        });
        assert!(has_let_access);
    }

    #[test]
    fn captures_are_enumerated() {
        let mut sources = SourceMap::new();
        let id = sources.insert_virtual(0, "fun f(x) =\n  return x + y\n".to_owned());
        let file = sources.get(id);
        let result = parse_module(file, ModuleIndex::new(0), true);
        let tables = scope_module(&result.arena, &result.roots);
        let mut diagnostics = DiagnosticSet::new();

        let lowerer = Lowerer {
            arena: &result.arena,
            scopes: &tables,
            source: file,
            roots: &result.roots,
            diagnostics: &mut diagnostics,
            module: ir::Module::new(),
            frames: vec![Frame::new(NodeRef::module_scope(result.arena.module()))],
            current: None,
            loops: Vec::new(),
            function_names: HashMap::new(),
            used_names: HashSet::new(),
            lambda_counter: 0,
        };

        let function = result
            .arena
            .cast::<FunctionDecl>(result.roots[0])
            .expect("root is a function");
        let captures = lowerer.captures_of(function);

        // `x` is a parameter, `infix+` is the operator method on `x`;
        // only `y` is free
        assert_eq!(captures.len(), 1);
        assert!(captures.contains_key("y"));
    }

    #[test]
    fn def_use_chains_hold_after_lowering() {
        let (module, diagnostics) =
            lower("fun f(x, y) =\n  let (a, b) = (x, y)\n  return a + b\nprint(f(x: 1, y: 2))\n");
        assert!(!diagnostics.contains_error());

        for function in module.functions.values() {
            if !function.is_defined() {
                continue;
            }
            function.validate_uses();

            for block in function.blocks.indices() {
                for id in function.instructions_in(block) {
                    assert_eq!(function.container(id), block);
                }
            }
        }
    }

    #[test]
    fn integer_literal_parsing() {
        assert_eq!(parse_integer_literal("42"), Some(42));
        assert_eq!(parse_integer_literal("1_000"), Some(1000));
        assert_eq!(parse_integer_literal("0x1f"), Some(31));
        assert_eq!(parse_integer_literal("0o17"), Some(15));
        assert_eq!(parse_integer_literal("0b1010"), Some(10));
        assert_eq!(parse_integer_literal("-7"), Some(-7));
        assert_eq!(
            parse_integer_literal("9223372036854775807"),
            Some(i64::MAX)
        );
        assert_eq!(
            parse_integer_literal("-9223372036854775808"),
            Some(i64::MIN)
        );
        assert_eq!(parse_integer_literal("9223372036854775808"), None);
        assert_eq!(parse_integer_literal("99999999999999999999"), None);
    }

    #[test]
    fn lambdas_become_module_functions() {
        let (module, diagnostics) = lower("let f = \\x => x\nprint(f(1))\n");
        assert!(!diagnostics.contains_error());
        assert!(module.get("$lambda0").is_some());
    }

    #[test]
    fn operators_lower_as_member_invokes() {
        let (module, diagnostics) = lower("print(1 + 2)\n");
        assert!(!diagnostics.contains_error());

        let main = module.get("$main").unwrap();
        let member = main
            .instruction_ids()
            .find_map(|i| match &main.instruction(i).kind {
                InstructionKind::Member {
                    member: Member::Name(name),
                    ..
                } => Some(name.clone()),
                _ => None,
            })
            .expect("the operator projects a member");
        assert_eq!(member, "infix+");
    }
}
