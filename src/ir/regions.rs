//! Access-region closing: after lowering, every live `access` gets a
//! matching `end_access` at each upper boundary of its extended live-range.
//! Dead accesses, used only by their own region ends, are swept afterwards.

use crate::ir::liveness::{extended_live_range, Coverage};
use crate::ir::{
    Function, InsertionPoint, Instruction, InstructionId, InstructionKind, Value,
};

fn region_entries(function: &Function) -> Vec<InstructionId> {
    function
        .instruction_ids()
        .filter(|id| {
            matches!(
                function.instruction(*id).kind,
                InstructionKind::Access { .. }
            )
        })
        .collect()
}

/// Inserts a `end_access` at each upper boundary of every access's extended
/// live-range. Accesses with no uses at all are removed instead.
pub fn close_regions(function: &mut Function) {
    for entry in region_entries(function) {
        let value = Value::Register(entry);

        if function.uses_of(&value).is_empty() {
            function.remove(entry);
            continue;
        }

        let range = extended_live_range(function, &value, function.container(entry));
        let site = function.instruction(entry).site;

        for (&block, &coverage) in &range.coverage.clone() {
            // A region end never displaces a block's terminator
            let after_user = |function: &Function, u: crate::ir::Use| {
                if function.instruction(u.user).kind.is_terminator() {
                    InsertionPoint::Before(u.user)
                } else {
                    InsertionPoint::After(u.user)
                }
            };

            let point = match coverage {
                // The region continues past this block
                Coverage::LiveInAndOut | Coverage::LiveOut => continue,
                Coverage::LiveIn { last_use } => match last_use {
                    Some(u) => after_user(function, u),
                    None => InsertionPoint::Start(block),
                },
                Coverage::Closed { last_use } => match last_use {
                    Some(u) => after_user(function, u),
                    None => InsertionPoint::After(entry),
                },
            };

            // The last user may already close the region
            let already_closed = coverage.last_use().is_some_and(|u| {
                function.instruction(u.user).kind.region_start() == Some(entry)
            });
            if already_closed {
                continue;
            }

            function.insert(
                Instruction {
                    kind: InstructionKind::EndAccess {
                        start: value.clone(),
                    },
                    site,
                },
                point,
            );
        }
    }
}

/// Whether every live access has a matching region end at each upper
/// boundary of its extended live-range. After `close_regions` the last use
/// of an access in every boundary block is one of its own region ends.
pub fn regions_are_closed(function: &Function) -> bool {
    for entry in region_entries(function) {
        let value = Value::Register(entry);
        if function.uses_of(&value).is_empty() {
            return false;
        }

        let range = extended_live_range(function, &value, function.container(entry));
        for (&block, coverage) in &range.coverage {
            match coverage {
                Coverage::LiveInAndOut | Coverage::LiveOut => {}
                // An upper boundary block must hold one of this entry's ends
                Coverage::LiveIn { .. } | Coverage::Closed { .. } => {
                    let has_end = function.instructions_in(block).any(|id| {
                        function.instruction(id).kind.region_start() == Some(entry)
                    });
                    if !has_end {
                        return false;
                    }
                }
            }
        }
    }
    true
}

/// Removes accesses whose only uses are their own region ends, iterating to
/// a fixed point.
pub fn eliminate_dead_accesses(function: &mut Function) {
    loop {
        let mut changed = false;

        for access in region_entries(function) {
            let value = Value::Register(access);
            let uses = function.uses_of(&value).to_vec();

            if uses.is_empty() {
                function.remove(access);
                changed = true;
                continue;
            }

            let only_region_ends = uses.iter().all(|u| {
                function.instruction(u.user).kind.region_start() == Some(access)
            });
            if only_region_ends {
                for u in uses {
                    function.remove(u.user);
                }
                function.remove(access);
                changed = true;
            }
        }

        if !changed {
            break;
        }
    }
}
