//! Subscript yield coherence: every path from the entry to a return must
//! pass through exactly one `yield`. The blocks before the projection form
//! the ramp, the blocks after it the slide.

use std::collections::VecDeque;

use hashbrown::HashSet;

use crate::diagnostics::{Diagnostic, DiagnosticSet};
use crate::ir::{BlockId, Function, InstructionId, InstructionKind};

fn yields_in(function: &Function, block: BlockId) -> Vec<InstructionId> {
    function
        .instructions_in(block)
        .filter(|id| matches!(function.instruction(*id).kind, InstructionKind::Yield { .. }))
        .collect()
}

fn report_extraneous(
    function: &Function,
    diagnostics: &mut DiagnosticSet,
    second: InstructionId,
    witness: InstructionId,
) {
    diagnostics.insert(
        Diagnostic::error(
            "subscript cannot project more than once",
            function.instruction(second).site,
        )
        .with_note(Diagnostic::note(
            "previous projection is here",
            function.instruction(witness).site,
        )),
    );
}

/// Checks a defined subscript; at most one diagnostic is reported.
pub fn check_yield_coherence(function: &Function, diagnostics: &mut DiagnosticSet) {
    if !function.is_subscript || !function.is_defined() {
        return;
    }
    let entry = function.entry().expect("the function is defined");

    // Phase 1: explore the ramp; stop descending where a yield is found and
    // remember its successors as slide starts
    let mut visited: HashSet<BlockId> = HashSet::new();
    let mut queue: VecDeque<BlockId> = VecDeque::new();
    let mut slide: Vec<(BlockId, InstructionId)> = Vec::new();

    visited.insert(entry);
    queue.push_back(entry);

    while let Some(block) = queue.pop_front() {
        let yields = yields_in(function, block);

        if let Some(&witness) = yields.first() {
            if let Some(&second) = yields.get(1) {
                report_extraneous(function, diagnostics, second, witness);
                return;
            }
            for successor in function.successors_of(block) {
                slide.push((successor, witness));
            }
            continue;
        }

        let successors = function.successors_of(block);
        if successors.is_empty() {
            if let Some(terminator) = function.terminator(block) {
                diagnostics.insert(Diagnostic::error(
                    "subscript must yield before returning",
                    function.instruction(terminator).site,
                ));
                return;
            }
        }
        for successor in successors {
            if visited.insert(successor) {
                queue.push_back(successor);
            }
        }
    }

    // Phase 2: any yield reachable from a slide block is a second
    // projection
    let mut visited: HashSet<BlockId> = HashSet::new();
    let mut queue: VecDeque<(BlockId, InstructionId)> = VecDeque::new();

    for (block, witness) in slide {
        if visited.insert(block) {
            queue.push_back((block, witness));
        }
    }

    while let Some((block, witness)) = queue.pop_front() {
        if let Some(&second) = yields_in(function, block).first() {
            report_extraneous(function, diagnostics, second, witness);
            return;
        }
        for successor in function.successors_of(block) {
            if visited.insert(successor) {
                queue.push_back((successor, witness));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Index;
    use crate::ir::{InsertionPoint, Instruction, Value};
    use crate::source::{SourceId, SourceSpan};

    fn span() -> SourceSpan {
        SourceSpan::new(SourceId::new(0), 0, 0)
    }

    fn insert(f: &mut Function, block: BlockId, kind: InstructionKind) {
        f.insert(Instruction { kind, site: span() }, InsertionPoint::End(block));
    }

    fn subscript() -> Function {
        Function::new("s", vec![Some("self".to_owned())], true, span())
    }

    fn check(f: &Function) -> Vec<String> {
        let mut diagnostics = DiagnosticSet::new();
        check_yield_coherence(f, &mut diagnostics);
        diagnostics.iter().map(|d| d.message.clone()).collect()
    }

    #[test]
    fn single_yield_is_coherent() {
        let mut f = subscript();
        let b0 = f.append_block(1);
        insert(
            &mut f,
            b0,
            InstructionKind::Yield {
                value: Value::Parameter(b0, 0),
            },
        );
        insert(
            &mut f,
            b0,
            InstructionKind::Return {
                value: Value::unit(),
            },
        );

        assert!(check(&f).is_empty());
    }

    #[test]
    fn two_yields_in_one_block() {
        let mut f = subscript();
        let b0 = f.append_block(1);
        insert(
            &mut f,
            b0,
            InstructionKind::Yield {
                value: Value::Parameter(b0, 0),
            },
        );
        insert(
            &mut f,
            b0,
            InstructionKind::Yield {
                value: Value::Parameter(b0, 0),
            },
        );
        insert(
            &mut f,
            b0,
            InstructionKind::Return {
                value: Value::unit(),
            },
        );

        assert_eq!(check(&f), vec!["subscript cannot project more than once"]);
    }

    #[test]
    fn yield_in_the_slide_is_extraneous() {
        let mut f = subscript();
        let b0 = f.append_block(1);
        let b1 = f.append_block(0);

        insert(
            &mut f,
            b0,
            InstructionKind::Yield {
                value: Value::Parameter(b0, 0),
            },
        );
        insert(
            &mut f,
            b0,
            InstructionKind::Branch {
                target: b1,
                arguments: Vec::new(),
            },
        );
        insert(
            &mut f,
            b1,
            InstructionKind::Yield {
                value: Value::Parameter(b0, 0),
            },
        );
        insert(
            &mut f,
            b1,
            InstructionKind::Return {
                value: Value::unit(),
            },
        );

        let messages = check(&f);
        assert_eq!(messages, vec!["subscript cannot project more than once"]);
    }

    #[test]
    fn return_without_yield_is_missing() {
        let mut f = subscript();
        let b0 = f.append_block(1);
        insert(
            &mut f,
            b0,
            InstructionKind::Return {
                value: Value::unit(),
            },
        );

        assert_eq!(check(&f), vec!["subscript must yield before returning"]);
    }

    #[test]
    fn one_armed_yield_is_missing_on_the_other_path() {
        let mut f = subscript();
        let b0 = f.append_block(1);
        let b1 = f.append_block(0);
        let b2 = f.append_block(0);
        let b3 = f.append_block(0);

        insert(
            &mut f,
            b0,
            InstructionKind::CondBranch {
                condition: Value::Parameter(b0, 0),
                success: b1,
                failure: b2,
            },
        );
        insert(
            &mut f,
            b1,
            InstructionKind::Yield {
                value: Value::Parameter(b0, 0),
            },
        );
        insert(
            &mut f,
            b1,
            InstructionKind::Branch {
                target: b3,
                arguments: Vec::new(),
            },
        );
        insert(
            &mut f,
            b2,
            InstructionKind::Branch {
                target: b3,
                arguments: Vec::new(),
            },
        );
        insert(
            &mut f,
            b3,
            InstructionKind::Return {
                value: Value::unit(),
            },
        );

        assert_eq!(check(&f), vec!["subscript must yield before returning"]);
    }

    #[test]
    fn non_subscripts_are_ignored() {
        let mut f = Function::new("f", Vec::new(), false, span());
        let b0 = f.append_block(0);
        insert(
            &mut f,
            b0,
            InstructionKind::Return {
                value: Value::unit(),
            },
        );

        assert!(check(&f).is_empty());
    }
}
