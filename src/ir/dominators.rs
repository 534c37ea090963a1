//! Dominator computation over a function's control-flow graph, using the
//! Cooper-Harvey-Kennedy iterative scheme: a spanning tree refined by
//! depth-matched least-common-ancestor steps until it stabilizes.

use crate::index::{Index, IndexVec};
use crate::ir::{BlockId, Function, InstructionId, Value};

#[derive(Debug)]
pub struct DominatorTree {
    /// The immediate dominator of each block; `None` for the entry and for
    /// unreachable blocks.
    parent: IndexVec<BlockId, Option<BlockId>>,
    reachable: IndexVec<BlockId, bool>,
    bfs: Vec<BlockId>,
}

impl DominatorTree {
    pub fn compute(function: &Function) -> Self {
        let block_count = function.blocks.len();
        let mut parent = IndexVec::from_raw(vec![None; block_count]);
        let mut reachable = IndexVec::from_raw(vec![false; block_count]);
        let mut bfs = Vec::new();

        let Some(entry) = function.entry() else {
            return Self {
                parent,
                reachable,
                bfs,
            };
        };

        // Spanning tree rooted at the entry, in BFS order
        reachable[entry] = true;
        bfs.push(entry);
        let mut cursor = 0;
        while cursor < bfs.len() {
            let block = bfs[cursor];
            cursor += 1;
            for successor in function.successors_of(block) {
                if !reachable[successor] {
                    reachable[successor] = true;
                    parent[successor] = Some(block);
                    bfs.push(successor);
                }
            }
        }

        let predecessors = function.predecessors();
        let mut tree = Self {
            parent,
            reachable,
            bfs,
        };

        // Refine: each predecessor edge pulls a block's parent up to the
        // least common ancestor, until a fixed point
        loop {
            let mut changed = false;

            for i in 1..tree.bfs.len() {
                let v = tree.bfs[i];
                for &u in &predecessors[v] {
                    if !tree.reachable[u] || Some(u) == tree.parent[v] {
                        continue;
                    }
                    let p = tree.parent[v].expect("non-entry reachable blocks have parents");
                    let l = tree.lca(u, p);
                    if Some(l) != tree.parent[v] {
                        tree.parent[v] = Some(l);
                        changed = true;
                    }
                }
            }

            if !changed {
                break;
            }
        }

        tree
    }

    fn depth(&self, block: BlockId) -> usize {
        let mut depth = 0;
        let mut cursor = block;
        while let Some(parent) = self.parent[cursor] {
            depth += 1;
            cursor = parent;
        }
        depth
    }

    /// Walks the two ancestor chains, matching by depth.
    fn lca(&self, a: BlockId, b: BlockId) -> BlockId {
        let mut a = a;
        let mut b = b;
        let mut depth_a = self.depth(a);
        let mut depth_b = self.depth(b);

        while depth_a > depth_b {
            a = self.parent[a].expect("deeper node has a parent");
            depth_a -= 1;
        }
        while depth_b > depth_a {
            b = self.parent[b].expect("deeper node has a parent");
            depth_b -= 1;
        }
        while a != b {
            a = self.parent[a].expect("roots meet");
            b = self.parent[b].expect("roots meet");
        }
        a
    }

    pub fn immediate_dominator(&self, block: BlockId) -> Option<BlockId> {
        self.parent.get(block).copied().flatten()
    }

    /// The strict dominators of `block`, ordered from `block` towards the
    /// root.
    pub fn strict_dominators(&self, block: BlockId) -> Vec<BlockId> {
        let mut dominators = Vec::new();
        let mut cursor = block;
        while let Some(parent) = self.parent[cursor] {
            dominators.push(parent);
            cursor = parent;
        }
        dominators
    }

    /// The reachable blocks in BFS order from the entry.
    pub fn bfs(&self) -> &[BlockId] {
        &self.bfs
    }

    pub fn is_reachable(&self, block: BlockId) -> bool {
        self.reachable.get(block).copied().unwrap_or(false)
    }

    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if a == b {
            return true;
        }
        let mut cursor = b;
        while let Some(parent) = self.parent[cursor] {
            if parent == a {
                return true;
            }
            cursor = parent;
        }
        false
    }

    /// Whether a value's definition dominates a use; collapses to "which
    /// comes first" when definition and use share a block.
    pub fn value_dominates(
        &self,
        definition: &Value,
        user: InstructionId,
        function: &Function,
    ) -> bool {
        match definition {
            Value::Constant(_) | Value::Poison(_) => true,
            Value::Parameter(block, _) => self.dominates(*block, function.container(user)),
            Value::Register(instruction) => {
                let def_block = function.container(*instruction);
                let use_block = function.container(user);
                if def_block == use_block {
                    function.comes_before(*instruction, user)
                } else {
                    self.dominates(def_block, use_block)
                }
            }
        }
    }
}

/// Whether every register definition in `function` dominates each of its
/// uses; programs violating this are rejected by the downstream analyses.
pub fn definitions_dominate_uses(function: &Function, tree: &DominatorTree) -> bool {
    for id in function.instruction_ids() {
        let value = Value::Register(id);
        for u in function.uses_of(&value) {
            if !tree.value_dominates(&value, u.user, function) {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{InsertionPoint, Instruction, InstructionKind, Value};
    use crate::source::{SourceId, SourceSpan};

    fn span() -> SourceSpan {
        SourceSpan::new(SourceId::new(0), 0, 0)
    }

    fn branch(f: &mut Function, from: BlockId, to: BlockId) {
        f.insert(
            Instruction {
                kind: InstructionKind::Branch {
                    target: to,
                    arguments: Vec::new(),
                },
                site: span(),
            },
            InsertionPoint::End(from),
        );
    }

    fn cond_branch(f: &mut Function, from: BlockId, success: BlockId, failure: BlockId) {
        f.insert(
            Instruction {
                kind: InstructionKind::CondBranch {
                    condition: Value::Constant(crate::ir::Constant::Bool(true)),
                    success,
                    failure,
                },
                site: span(),
            },
            InsertionPoint::End(from),
        );
    }

    fn ret(f: &mut Function, from: BlockId) {
        f.insert(
            Instruction {
                kind: InstructionKind::Return {
                    value: Value::unit(),
                },
                site: span(),
            },
            InsertionPoint::End(from),
        );
    }

    #[test]
    fn diamond() {
        let mut f = Function::new("f", Vec::new(), false, span());
        let b0 = f.append_block(0);
        let b1 = f.append_block(0);
        let b2 = f.append_block(0);
        let b3 = f.append_block(0);

        cond_branch(&mut f, b0, b1, b2);
        branch(&mut f, b1, b3);
        branch(&mut f, b2, b3);
        ret(&mut f, b3);

        let tree = DominatorTree::compute(&f);

        assert_eq!(tree.immediate_dominator(b0), None);
        assert_eq!(tree.immediate_dominator(b1), Some(b0));
        assert_eq!(tree.immediate_dominator(b2), Some(b0));
        // The join is dominated by the fork, not by either arm
        assert_eq!(tree.immediate_dominator(b3), Some(b0));

        assert!(tree.dominates(b0, b3));
        assert!(!tree.dominates(b1, b3));
        assert_eq!(tree.strict_dominators(b3), vec![b0]);
        assert_eq!(tree.bfs()[0], b0);
    }

    #[test]
    fn chain_and_loop() {
        let mut f = Function::new("f", Vec::new(), false, span());
        let b0 = f.append_block(0);
        let b1 = f.append_block(0);
        let b2 = f.append_block(0);
        let b3 = f.append_block(0);

        branch(&mut f, b0, b1);
        cond_branch(&mut f, b1, b2, b3);
        branch(&mut f, b2, b1); // back edge
        ret(&mut f, b3);

        let tree = DominatorTree::compute(&f);
        assert_eq!(tree.immediate_dominator(b1), Some(b0));
        assert_eq!(tree.immediate_dominator(b2), Some(b1));
        assert_eq!(tree.immediate_dominator(b3), Some(b1));
        assert_eq!(tree.strict_dominators(b3), vec![b1, b0]);
    }

    #[test]
    fn unreachable_blocks_are_marked() {
        let mut f = Function::new("f", Vec::new(), false, span());
        let b0 = f.append_block(0);
        let b1 = f.append_block(0);
        ret(&mut f, b0);
        ret(&mut f, b1);

        let tree = DominatorTree::compute(&f);
        assert!(tree.is_reachable(b0));
        assert!(!tree.is_reachable(b1));
        assert_eq!(tree.bfs().len(), 1);
    }

    #[test]
    fn definitions_dominate_across_blocks() {
        let mut f = Function::new("f", Vec::new(), false, span());
        let b0 = f.append_block(1);
        let b1 = f.append_block(0);
        let b2 = f.append_block(0);

        let a = f.insert(
            Instruction {
                kind: InstructionKind::Alloc,
                site: span(),
            },
            InsertionPoint::End(b0),
        );
        cond_branch(&mut f, b0, b1, b2);
        f.insert(
            Instruction {
                kind: InstructionKind::Return {
                    value: Value::Register(a),
                },
                site: span(),
            },
            InsertionPoint::End(b1),
        );
        ret(&mut f, b2);

        let tree = DominatorTree::compute(&f);
        assert!(definitions_dominate_uses(&f, &tree));

        // A parameter of the entry dominates every use
        let use_site = f.terminator(b1).unwrap();
        assert!(tree.value_dominates(&Value::Parameter(b0, 0), use_site, &f));
        // A sibling arm does not dominate the other
        assert!(!tree.dominates(b1, b2));
    }

    #[test]
    fn use_before_definition_is_rejected() {
        let mut f = Function::new("f", Vec::new(), false, span());
        let b0 = f.append_block(0);

        // The store references the alloc spliced in after it
        let store_site = f.insert(
            Instruction {
                kind: InstructionKind::Alloc,
                site: span(),
            },
            InsertionPoint::End(b0),
        );
        let late = f.insert(
            Instruction {
                kind: InstructionKind::Alloc,
                site: span(),
            },
            InsertionPoint::End(b0),
        );
        f.insert(
            Instruction {
                kind: InstructionKind::Store {
                    value: Value::unit(),
                    target: Value::Register(late),
                },
                site: span(),
            },
            InsertionPoint::Before(store_site),
        );
        ret(&mut f, b0);

        let tree = DominatorTree::compute(&f);
        assert!(!definitions_dominate_uses(&f, &tree));
    }

    #[test]
    fn same_block_dominance_is_list_order() {
        let mut f = Function::new("f", Vec::new(), false, span());
        let b0 = f.append_block(0);
        let a = f.insert(
            Instruction {
                kind: InstructionKind::Alloc,
                site: span(),
            },
            InsertionPoint::End(b0),
        );
        let store = f.insert(
            Instruction {
                kind: InstructionKind::Store {
                    value: Value::unit(),
                    target: Value::Register(a),
                },
                site: span(),
            },
            InsertionPoint::End(b0),
        );
        ret(&mut f, b0);

        let tree = DominatorTree::compute(&f);
        assert!(tree.value_dominates(&Value::Register(a), store, &f));
        assert!(!tree.value_dominates(&Value::Register(store), a, &f));
        assert!(definitions_dominate_uses(&f, &tree));
    }
}
