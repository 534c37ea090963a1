//! The typed control-flow IR: functions made of basic blocks over one
//! function-wide instruction list, with def-use chains maintained on every
//! mutation.

use hashbrown::HashMap;
use indexmap::IndexMap;

use crate::index::{simple_index, Index, IndexVec};
use crate::source::SourceSpan;

pub mod dominators;
pub mod liveness;
pub mod lower;
pub mod print;
pub mod regions;
pub mod yields;

simple_index! {
    /// Identifies a basic block within a function
    pub struct BlockId;
}

simple_index! {
    /// Identifies an instruction position; positions are stable under
    /// insertion and removal and are never reused
    pub struct InstructionId;
}

/// The kind of access granted over a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Let,
    Inout,
    Sink,
}

impl core::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::Let => f.write_str("let"),
            Capability::Inout => f.write_str("inout"),
            Capability::Sink => f.write_str("sink"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Constant {
    Unit,
    Bool(bool),
    Int(i64),
    String(String),
    /// A reference to a free function by its stable name.
    FunctionRef(String),
    BuiltinPrint,
    BuiltinType,
}

/// An IR value: the result of an instruction, a block parameter, a constant,
/// or a poison standing in for an ill-formed computation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    Register(InstructionId),
    Parameter(BlockId, u32),
    Constant(Constant),
    Poison(SourceSpan),
}

impl Value {
    pub fn unit() -> Self {
        Value::Constant(Constant::Unit)
    }

    pub fn as_register(&self) -> Option<InstructionId> {
        match self {
            Value::Register(id) => Some(*id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Member {
    Name(String),
    Index(u32),
}

impl core::fmt::Display for Member {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Member::Name(name) => f.write_str(name),
            Member::Index(index) => write!(f, "{index}"),
        }
    }
}

/// One instruction with its source anchor.
#[derive(Debug, Clone)]
pub struct Instruction {
    pub kind: InstructionKind,
    pub site: SourceSpan,
}

#[derive(Debug, Clone)]
pub enum InstructionKind {
    /// Allocate storage for a local.
    Alloc,
    /// Open an access region over a value.
    Access {
        source: Value,
        capability: Capability,
    },
    /// Close the region opened by `start` (a register of an `access`).
    EndAccess { start: Value },
    Store {
        value: Value,
        target: Value,
    },
    /// Project a member out of a whole; does not extend the operand's
    /// lifetime.
    Member {
        whole: Value,
        member: Member,
    },
    /// Function application.
    Invoke {
        callee: Value,
        labels: Vec<Option<String>>,
        arguments: Vec<Value>,
    },
    /// Subscript application.
    Project {
        callee: Value,
        labels: Vec<Option<String>>,
        arguments: Vec<Value>,
    },
    Branch {
        target: BlockId,
        arguments: Vec<Value>,
    },
    CondBranch {
        condition: Value,
        success: BlockId,
        failure: BlockId,
    },
    Return {
        value: Value,
    },
    /// A subscript's projection point; not a terminator.
    Yield {
        value: Value,
    },
}

impl InstructionKind {
    /// Enumerates operand positions in order.
    pub fn for_each_operand<'a>(&'a self, f: &mut impl FnMut(usize, &'a Value)) {
        match self {
            InstructionKind::Alloc => {}
            InstructionKind::Access { source, .. } => f(0, source),
            InstructionKind::EndAccess { start } => f(0, start),
            InstructionKind::Store { value, target } => {
                f(0, value);
                f(1, target);
            }
            InstructionKind::Member { whole, .. } => f(0, whole),
            InstructionKind::Invoke {
                callee, arguments, ..
            }
            | InstructionKind::Project {
                callee, arguments, ..
            } => {
                f(0, callee);
                for (i, argument) in arguments.iter().enumerate() {
                    f(i + 1, argument);
                }
            }
            InstructionKind::Branch { arguments, .. } => {
                for (i, argument) in arguments.iter().enumerate() {
                    f(i, argument);
                }
            }
            InstructionKind::CondBranch { condition, .. } => f(0, condition),
            InstructionKind::Return { value } => f(0, value),
            InstructionKind::Yield { value } => f(0, value),
        }
    }

    pub fn operands(&self) -> Vec<&Value> {
        let mut out = Vec::new();
        self.for_each_operand(&mut |_, v| out.push(v));
        out
    }

    pub fn operand(&self, index: usize) -> Option<&Value> {
        let mut found = None;
        self.for_each_operand(&mut |i, v| {
            if i == index {
                found = Some(v);
            }
        });
        found
    }

    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            InstructionKind::Branch { target, .. } => vec![*target],
            InstructionKind::CondBranch {
                success, failure, ..
            } => vec![*success, *failure],
            _ => Vec::new(),
        }
    }

    /// A terminator ends its block: a jump or a `return`. `yield` is not a
    /// terminator.
    pub fn is_terminator(&self) -> bool {
        !self.successors().is_empty() || matches!(self, InstructionKind::Return { .. })
    }

    /// Whether this instruction defines a register.
    pub fn produces_value(&self) -> bool {
        matches!(
            self,
            InstructionKind::Alloc
                | InstructionKind::Access { .. }
                | InstructionKind::Member { .. }
                | InstructionKind::Invoke { .. }
                | InstructionKind::Project { .. }
        )
    }

    /// Whether a use by this instruction extends the used value's lifetime.
    pub fn extends_operand_lifetimes(&self) -> bool {
        !matches!(
            self,
            InstructionKind::Member { .. }
                | InstructionKind::Access { .. }
                | InstructionKind::EndAccess { .. }
        )
    }

    /// The region entry this instruction closes, if it is a region end.
    pub fn region_start(&self) -> Option<InstructionId> {
        match self {
            InstructionKind::EndAccess { start } => start.as_register(),
            _ => None,
        }
    }
}

/// A basic block: its parameter arity and a `(first, last)` window into the
/// function-wide instruction list.
#[derive(Debug, Clone)]
pub struct Block {
    pub parameter_count: u32,
    pub first: Option<InstructionId>,
    pub last: Option<InstructionId>,
}

/// One use of a value: the using instruction and the operand position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Use {
    pub user: InstructionId,
    pub index: u32,
}

/// Where the next instruction goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertionPoint {
    Start(BlockId),
    End(BlockId),
    Before(InstructionId),
    After(InstructionId),
}

#[derive(Debug, Clone)]
struct Slot {
    /// `None` once the position has been vacated by removal.
    instruction: Option<Instruction>,
    prev: Option<InstructionId>,
    next: Option<InstructionId>,
    block: BlockId,
}

/// An IR function. A function with no blocks is a declaration stub.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub labels: Vec<Option<String>>,
    pub is_subscript: bool,
    pub site: SourceSpan,
    pub blocks: IndexVec<BlockId, Block>,
    slots: IndexVec<InstructionId, Slot>,
    head: Option<InstructionId>,
    tail: Option<InstructionId>,
    uses: HashMap<Value, Vec<Use>>,
}

impl Function {
    pub fn new(
        name: impl Into<String>,
        labels: Vec<Option<String>>,
        is_subscript: bool,
        site: SourceSpan,
    ) -> Self {
        Self {
            name: name.into(),
            labels,
            is_subscript,
            site,
            blocks: IndexVec::new(),
            slots: IndexVec::new(),
            head: None,
            tail: None,
            uses: HashMap::new(),
        }
    }

    pub fn is_defined(&self) -> bool {
        !self.blocks.is_empty()
    }

    pub fn entry(&self) -> Option<BlockId> {
        (!self.blocks.is_empty()).then(|| BlockId::new(0))
    }

    pub fn append_block(&mut self, parameter_count: u32) -> BlockId {
        self.blocks.push(Block {
            parameter_count,
            first: None,
            last: None,
        })
    }

    pub fn instruction(&self, id: InstructionId) -> &Instruction {
        self.slots[id]
            .instruction
            .as_ref()
            .expect("instruction was removed")
    }

    pub fn try_instruction(&self, id: InstructionId) -> Option<&Instruction> {
        self.slots.get(id).and_then(|s| s.instruction.as_ref())
    }

    /// The block containing an instruction.
    pub fn container(&self, id: InstructionId) -> BlockId {
        self.slots[id].block
    }

    pub fn uses_of(&self, value: &Value) -> &[Use] {
        self.uses.get(value).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The single mutation primitive: splices `instruction` into the list at
    /// `point` and records a use for every operand.
    pub fn insert(&mut self, instruction: Instruction, point: InsertionPoint) -> InstructionId {
        let id = self.slots.next_index();

        let (block, prev, next) = match point {
            InsertionPoint::Start(block) => match self.blocks[block].first {
                Some(first) => (block, self.slots[first].prev, Some(first)),
                None => self.empty_block_anchor(block),
            },
            InsertionPoint::End(block) => match self.blocks[block].last {
                Some(last) => (block, Some(last), self.slots[last].next),
                None => self.empty_block_anchor(block),
            },
            InsertionPoint::Before(anchor) => {
                (self.slots[anchor].block, self.slots[anchor].prev, Some(anchor))
            }
            InsertionPoint::After(anchor) => {
                (self.slots[anchor].block, Some(anchor), self.slots[anchor].next)
            }
        };

        instruction
            .kind
            .for_each_operand(&mut |index, value| {
                self.uses.entry(value.clone()).or_default().push(Use {
                    user: id,
                    index: index as u32,
                });
            });

        self.slots.push(Slot {
            instruction: Some(instruction),
            prev,
            next,
            block,
        });

        match prev {
            Some(prev) => self.slots[prev].next = Some(id),
            None => self.head = Some(id),
        }
        match next {
            Some(next) => self.slots[next].prev = Some(id),
            None => self.tail = Some(id),
        }

        let window = &mut self.blocks[block];
        if window.first.is_none() {
            window.first = Some(id);
            window.last = Some(id);
        } else {
            if window.first == next {
                window.first = Some(id);
            }
            if window.last == prev {
                window.last = Some(id);
            }
        }

        id
    }

    /// The splice position for the first instruction of an empty block: after
    /// the last instruction of the nearest preceding non-empty block.
    fn empty_block_anchor(
        &self,
        block: BlockId,
    ) -> (BlockId, Option<InstructionId>, Option<InstructionId>) {
        let mut prev = None;
        for b in (0..block.index()).rev() {
            if let Some(last) = self.blocks[BlockId::new(b)].last {
                prev = Some(last);
                break;
            }
        }
        let next = match prev {
            Some(prev) => self.slots[prev].next,
            None => self.head,
        };
        (block, prev, next)
    }

    /// Unlinks an instruction and erases the uses it held. Its position is
    /// never reused.
    pub fn remove(&mut self, id: InstructionId) {
        let instruction = self.slots[id]
            .instruction
            .take()
            .expect("instruction was already removed");

        instruction.kind.for_each_operand(&mut |_, value| {
            if let Some(uses) = self.uses.get_mut(value) {
                uses.retain(|u| u.user != id);
            }
        });

        debug_assert!(
            self.uses_of(&Value::Register(id)).is_empty(),
            "removed an instruction whose result is still in use"
        );

        let (prev, next, block) = {
            let slot = &self.slots[id];
            (slot.prev, slot.next, slot.block)
        };

        match prev {
            Some(prev) => self.slots[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.slots[next].prev = prev,
            None => self.tail = prev,
        }

        let window = &mut self.blocks[block];
        if window.first == Some(id) && window.last == Some(id) {
            window.first = None;
            window.last = None;
        } else if window.first == Some(id) {
            window.first = next;
        } else if window.last == Some(id) {
            window.last = prev;
        }
    }

    /// The instructions of one block, in order.
    pub fn instructions_in(&self, block: BlockId) -> BlockInstructions<'_> {
        BlockInstructions {
            function: self,
            cursor: self.blocks[block].first,
            block,
        }
    }

    /// Every live instruction of the function, in list order.
    pub fn instruction_ids(&self) -> impl Iterator<Item = InstructionId> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let id = cursor?;
            cursor = self.slots[id].next;
            Some(id)
        })
    }

    pub fn terminator(&self, block: BlockId) -> Option<InstructionId> {
        let last = self.blocks[block].last?;
        self.instruction(last).kind.is_terminator().then_some(last)
    }

    pub fn successors_of(&self, block: BlockId) -> Vec<BlockId> {
        self.terminator(block)
            .map(|t| self.instruction(t).kind.successors())
            .unwrap_or_default()
    }

    pub fn predecessors(&self) -> IndexVec<BlockId, Vec<BlockId>> {
        let mut predecessors = IndexVec::from_raw(vec![Vec::new(); self.blocks.len()]);
        for block in self.blocks.indices() {
            for successor in self.successors_of(block) {
                predecessors[successor].push(block);
            }
        }
        predecessors
    }

    /// Whether `a` comes before `b` within their (shared) block.
    pub fn comes_before(&self, a: InstructionId, b: InstructionId) -> bool {
        debug_assert_eq!(self.slots[a].block, self.slots[b].block);
        let block = self.slots[a].block;
        let mut cursor = Some(a);
        while let Some(id) = cursor {
            if self.slots[id].block != block {
                break;
            }
            if id == b {
                return a != b;
            }
            cursor = self.slots[id].next;
        }
        false
    }

    /// Asserts the def-use bookkeeping: every recorded use names an operand
    /// position that currently holds the value.
    #[cfg(test)]
    pub(crate) fn validate_uses(&self) {
        for (value, uses) in &self.uses {
            for u in uses {
                let instruction = self.instruction(u.user);
                assert_eq!(
                    instruction.kind.operand(u.index as usize),
                    Some(value),
                    "use does not point at its value"
                );
            }
        }
    }
}

pub struct BlockInstructions<'a> {
    function: &'a Function,
    cursor: Option<InstructionId>,
    block: BlockId,
}

impl<'a> Iterator for BlockInstructions<'a> {
    type Item = InstructionId;

    fn next(&mut self) -> Option<InstructionId> {
        let id = self.cursor?;
        if self.function.slots[id].block != self.block {
            return None;
        }
        let last = self.function.blocks[self.block].last;
        self.cursor = if Some(id) == last {
            None
        } else {
            self.function.slots[id].next
        };
        Some(id)
    }
}

/// A compiled module: an ordered map from function name to function.
#[derive(Debug, Default)]
pub struct Module {
    pub functions: IndexMap<String, Function>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Function> {
        self.functions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn declare(&mut self, function: Function) {
        self.functions.entry(function.name.clone()).or_insert(function);
    }

    /// Replaces a function after a pass mutated a moved-out copy.
    pub fn replace(&mut self, function: Function) {
        self.functions.insert(function.name.clone(), function);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{SourceId, SourceSpan};

    fn span() -> SourceSpan {
        SourceSpan::new(SourceId::new(0), 0, 0)
    }

    fn instruction(kind: InstructionKind) -> Instruction {
        Instruction { kind, site: span() }
    }

    #[test]
    fn insertion_maintains_block_windows() {
        let mut f = Function::new("f", Vec::new(), false, span());
        let b0 = f.append_block(0);

        let alloc = f.insert(instruction(InstructionKind::Alloc), InsertionPoint::End(b0));
        let ret = f.insert(
            instruction(InstructionKind::Return {
                value: Value::unit(),
            }),
            InsertionPoint::End(b0),
        );
        let store = f.insert(
            instruction(InstructionKind::Store {
                value: Value::unit(),
                target: Value::Register(alloc),
            }),
            InsertionPoint::Before(ret),
        );

        assert_eq!(
            f.instructions_in(b0).collect::<Vec<_>>(),
            vec![alloc, store, ret]
        );
        assert_eq!(f.blocks[b0].first, Some(alloc));
        assert_eq!(f.blocks[b0].last, Some(ret));
        for id in f.instructions_in(b0) {
            assert_eq!(f.container(id), b0);
        }
        f.validate_uses();
    }

    #[test]
    fn def_use_chains_point_at_operands() {
        let mut f = Function::new("f", Vec::new(), false, span());
        let b0 = f.append_block(1);

        let parameter = Value::Parameter(b0, 0);
        let access = f.insert(
            instruction(InstructionKind::Access {
                source: parameter.clone(),
                capability: Capability::Let,
            }),
            InsertionPoint::End(b0),
        );
        let _ret = f.insert(
            instruction(InstructionKind::Return {
                value: Value::Register(access),
            }),
            InsertionPoint::End(b0),
        );

        let uses = f.uses_of(&parameter);
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].user, access);
        assert_eq!(uses[0].index, 0);

        assert_eq!(f.uses_of(&Value::Register(access)).len(), 1);
        f.validate_uses();
    }

    #[test]
    fn removal_unlinks_and_drops_uses() {
        let mut f = Function::new("f", Vec::new(), false, span());
        let b0 = f.append_block(1);

        let parameter = Value::Parameter(b0, 0);
        let access = f.insert(
            instruction(InstructionKind::Access {
                source: parameter.clone(),
                capability: Capability::Let,
            }),
            InsertionPoint::End(b0),
        );
        let ret = f.insert(
            instruction(InstructionKind::Return {
                value: Value::unit(),
            }),
            InsertionPoint::End(b0),
        );

        f.remove(access);

        assert!(f.try_instruction(access).is_none());
        assert!(f.uses_of(&parameter).is_empty());
        assert_eq!(f.instructions_in(b0).collect::<Vec<_>>(), vec![ret]);
        assert_eq!(f.blocks[b0].first, Some(ret));
        f.validate_uses();
    }

    #[test]
    fn instructions_interleave_across_blocks() {
        let mut f = Function::new("f", Vec::new(), false, span());
        let b0 = f.append_block(0);
        let b1 = f.append_block(0);

        // Fill b1 first, then b0; each block's window stays coherent
        let ret1 = f.insert(
            instruction(InstructionKind::Return {
                value: Value::unit(),
            }),
            InsertionPoint::End(b1),
        );
        let br = f.insert(
            instruction(InstructionKind::Branch {
                target: b1,
                arguments: Vec::new(),
            }),
            InsertionPoint::End(b0),
        );

        assert_eq!(f.instructions_in(b0).collect::<Vec<_>>(), vec![br]);
        assert_eq!(f.instructions_in(b1).collect::<Vec<_>>(), vec![ret1]);
        assert_eq!(f.successors_of(b0), vec![b1]);
        assert_eq!(f.terminator(b1), Some(ret1));
    }

    #[test]
    fn comes_before_orders_a_block() {
        let mut f = Function::new("f", Vec::new(), false, span());
        let b0 = f.append_block(0);
        let first = f.insert(instruction(InstructionKind::Alloc), InsertionPoint::End(b0));
        let second = f.insert(instruction(InstructionKind::Alloc), InsertionPoint::End(b0));

        assert!(f.comes_before(first, second));
        assert!(!f.comes_before(second, first));
        assert!(!f.comes_before(first, first));
    }

    #[test]
    fn yield_is_not_a_terminator() {
        let kind = InstructionKind::Yield {
            value: Value::unit(),
        };
        assert!(!kind.is_terminator());

        let kind = InstructionKind::Return {
            value: Value::unit(),
        };
        assert!(kind.is_terminator());
        assert!(kind.successors().is_empty());
    }

    #[test]
    fn member_and_access_do_not_extend_lifetimes() {
        assert!(!InstructionKind::Member {
            whole: Value::unit(),
            member: Member::Index(0),
        }
        .extends_operand_lifetimes());
        assert!(!InstructionKind::Access {
            source: Value::unit(),
            capability: Capability::Let,
        }
        .extends_operand_lifetimes());
        assert!(InstructionKind::Invoke {
            callee: Value::unit(),
            labels: Vec::new(),
            arguments: Vec::new(),
        }
        .extends_operand_lifetimes());
    }

    #[test]
    fn module_function_order_is_stable() {
        let mut module = Module::new();
        module.declare(Function::new("zebra", Vec::new(), false, span()));
        module.declare(Function::new("aardvark", Vec::new(), false, span()));

        let names: Vec<_> = module.functions.keys().cloned().collect();
        assert_eq!(names, vec!["zebra".to_owned(), "aardvark".to_owned()]);
    }
}
