//! Live-range computation: per-block coverage resolved from a use-driven
//! path exploration, plus the extended ranges that follow values through the
//! uses that prolong their lifetimes.

use hashbrown::{HashMap, HashSet};

use crate::ir::{BlockId, Function, Use, Value};

/// How a value's live-range covers one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coverage {
    /// Live on entry and on exit.
    LiveInAndOut,
    /// Defined here and live on exit.
    LiveOut,
    /// Live on entry, dead past its last use.
    LiveIn { last_use: Option<Use> },
    /// Defined and dead within the block.
    Closed { last_use: Option<Use> },
}

impl Coverage {
    fn rank(self) -> u8 {
        match self {
            Coverage::LiveInAndOut => 3,
            Coverage::LiveOut => 2,
            Coverage::LiveIn { .. } => 1,
            Coverage::Closed { .. } => 0,
        }
    }

    pub fn last_use(self) -> Option<Use> {
        match self {
            Coverage::LiveIn { last_use } | Coverage::Closed { last_use } => last_use,
            _ => None,
        }
    }
}

/// The blocks a value is live in, with per-block coverage.
#[derive(Debug)]
pub struct LiveRange {
    pub value: Value,
    /// The block holding the value's definition.
    pub origin: BlockId,
    pub coverage: HashMap<BlockId, Coverage>,
}

impl LiveRange {
    /// A range with no uses and nothing live out of its origin.
    pub fn is_empty(&self) -> bool {
        self.coverage
            .values()
            .all(|c| matches!(c, Coverage::Closed { last_use: None }))
    }
}

/// The last position in `block` at which any instruction's operand
/// references `value`.
fn last_use_in(function: &Function, value: &Value, block: BlockId) -> Option<Use> {
    let mut last = None;
    for id in function.instructions_in(block) {
        function.instruction(id).kind.for_each_operand(&mut |index, operand| {
            if operand == value {
                last = Some(Use {
                    user: id,
                    index: index as u32,
                });
            }
        });
    }
    last
}

fn later_use(function: &Function, a: Option<Use>, b: Option<Use>) -> Option<Use> {
    match (a, b) {
        (Some(a), Some(b)) => {
            if a.user == b.user {
                Some(if a.index >= b.index { a } else { b })
            } else if function.comes_before(a.user, b.user) {
                Some(b)
            } else {
                Some(a)
            }
        }
        (a, None) => a,
        (None, b) => b,
    }
}

/// Merges two coverages of the same block: `InAndOut > Out > In > Closed`,
/// with the later last-use winning among equals.
pub fn merge_coverage(function: &Function, a: Coverage, b: Coverage) -> Coverage {
    use std::cmp::Ordering;

    match a.rank().cmp(&b.rank()) {
        Ordering::Greater => a,
        Ordering::Less => b,
        Ordering::Equal => match (a, b) {
            (Coverage::LiveIn { last_use: x }, Coverage::LiveIn { last_use: y }) => {
                Coverage::LiveIn {
                    last_use: later_use(function, x, y),
                }
            }
            (Coverage::Closed { last_use: x }, Coverage::Closed { last_use: y }) => {
                Coverage::Closed {
                    last_use: later_use(function, x, y),
                }
            }
            _ => a,
        },
    }
}

/// Computes the live-range of `value`, defined in `origin`, by exploring
/// paths backwards from its use sites.
pub fn live_range(function: &Function, value: &Value, origin: BlockId) -> LiveRange {
    let predecessors = function.predecessors();

    let mut live_in: HashSet<BlockId> = HashSet::new();
    let mut live_out: HashSet<BlockId> = HashSet::new();
    let mut user_blocks: HashSet<BlockId> = HashSet::new();

    let mut worklist: Vec<BlockId> = Vec::new();
    for u in function.uses_of(value) {
        let block = function.container(u.user);
        user_blocks.insert(block);
        worklist.push(block);
    }

    while let Some(w) = worklist.pop() {
        if w == origin {
            continue;
        }
        if !live_in.insert(w) {
            continue;
        }
        for &p in &predecessors[w] {
            live_out.insert(p);
            worklist.push(p);
        }
    }

    let mut interesting: HashSet<BlockId> = HashSet::new();
    interesting.insert(origin);
    interesting.extend(live_in.iter().copied());
    interesting.extend(live_out.iter().copied());
    interesting.extend(user_blocks.iter().copied());

    let mut coverage = HashMap::new();
    for block in interesting {
        let is_in = live_in.contains(&block);
        let is_out = live_out.contains(&block);

        let c = match (is_in, is_out) {
            (true, true) => Coverage::LiveInAndOut,
            (false, true) => Coverage::LiveOut,
            (true, false) => Coverage::LiveIn {
                last_use: last_use_in(function, value, block),
            },
            (false, false) => Coverage::Closed {
                last_use: last_use_in(function, value, block),
            },
        };
        coverage.insert(block, c);
    }

    LiveRange {
        value: value.clone(),
        origin,
        coverage,
    }
}

/// The live-range of `value` merged with the extended live-ranges of all
/// its lifetime-extending uses. Uses by `member` and `access` instructions
/// do not extend lifetimes.
pub fn extended_live_range(function: &Function, value: &Value, origin: BlockId) -> LiveRange {
    let mut range = live_range(function, value, origin);

    for u in function.uses_of(value).to_vec() {
        let kind = &function.instruction(u.user).kind;
        if !kind.extends_operand_lifetimes() || !kind.produces_value() {
            continue;
        }

        let result = Value::Register(u.user);
        if function.uses_of(&result).is_empty() {
            continue;
        }

        let sub = extended_live_range(function, &result, function.container(u.user));
        for (block, c) in sub.coverage {
            let merged = match range.coverage.get(&block) {
                Some(existing) => merge_coverage(function, *existing, c),
                None => c,
            };
            range.coverage.insert(block, merged);
        }
    }

    range
}
