//! The monotonic fixpoint iterator.
//!
//! Given a block-level CFG, a block transfer function and an optional
//! edge transfer, computes the least fixed point of the analysis over an
//! abstract-domain lattice. Forward is the default direction; backward
//! analyses (liveness) invert the successor/predecessor roles.
//!
//! Each block's in-state is the join of the edge contributions from its
//! predecessors; widening replaces join at loop-header blocks once the head
//! has been revisited, guaranteeing termination on infinite-height lattices.

use rustc_hash::FxHashSet;

use crate::analysis::cfg::{BlockId, ControlFlowGraph, Edge};
use crate::ir::IrCode;

/// Direction of a dataflow analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// States flow from the entry toward the exits.
    Forward,
    /// States flow from the exits toward the entry.
    Backward,
}

/// The lattice operations the iterator needs from a state.
pub trait FixpointDomain: Clone {
    /// The least element; the initial state of every block.
    fn bottom() -> Self;
    /// Partial order.
    fn leq(&self, other: &Self) -> bool;
    /// Semantic equality.
    fn equals(&self, other: &Self) -> bool;
    /// Least upper bound, in place.
    fn join_with(&mut self, other: &Self);
    /// Widening, in place. Defaults to join for finite lattices.
    fn widen_with(&mut self, other: &Self) {
        self.join_with(other);
    }
}

impl<V: crate::analysis::domain::AbstractValue> FixpointDomain
    for crate::analysis::domain::AbstractDomain<V>
{
    fn bottom() -> Self {
        crate::analysis::domain::Domain::bottom()
    }

    fn leq(&self, other: &Self) -> bool {
        crate::analysis::domain::Domain::leq(self, other)
    }

    fn equals(&self, other: &Self) -> bool {
        crate::analysis::domain::Domain::equals(self, other)
    }

    fn join_with(&mut self, other: &Self) {
        crate::analysis::domain::Domain::join_with(self, other);
    }

    fn widen_with(&mut self, other: &Self) {
        crate::analysis::domain::Domain::widen_with(self, other);
    }
}

impl<Var, D> FixpointDomain for crate::analysis::HashedAbstractEnvironment<Var, D>
where
    Var: Eq + std::hash::Hash + Clone,
    D: crate::analysis::domain::Domain,
{
    fn bottom() -> Self {
        Self::bottom()
    }

    fn leq(&self, other: &Self) -> bool {
        Self::leq(self, other)
    }

    fn equals(&self, other: &Self) -> bool {
        Self::equals(self, other)
    }

    fn join_with(&mut self, other: &Self) {
        Self::join_with(self, other);
    }

    fn widen_with(&mut self, other: &Self) {
        Self::widen_with(self, other);
    }
}

impl<K, D> FixpointDomain for crate::analysis::PatriciaTreeMapAbstractEnvironment<K, D>
where
    K: crate::collections::PatriciaKey,
    D: crate::analysis::domain::Domain + crate::collections::AbstractMapValue,
{
    fn bottom() -> Self {
        Self::bottom()
    }

    fn leq(&self, other: &Self) -> bool {
        Self::leq(self, other)
    }

    fn equals(&self, other: &Self) -> bool {
        Self::equals(self, other)
    }

    fn join_with(&mut self, other: &Self) {
        Self::join_with(self, other);
    }

    fn widen_with(&mut self, other: &Self) {
        Self::widen_with(self, other);
    }
}

/// A dataflow analysis: a direction plus node and edge transfer functions.
pub trait FixpointTransfer {
    /// The state lattice.
    type Domain: FixpointDomain;

    /// The direction of the analysis.
    fn direction(&self) -> Direction {
        Direction::Forward
    }

    /// Transforms the state across one block.
    ///
    /// Forward: receives the entry state, produces the exit state.
    /// Backward: receives the exit state, produces the entry state.
    fn analyze_node(
        &self,
        code: &IrCode,
        cfg: &ControlFlowGraph,
        block: BlockId,
        state: &mut Self::Domain,
    );

    /// The contribution an edge makes to its target's input; identity by
    /// default.
    fn analyze_edge(&self, edge: &Edge, state: &Self::Domain) -> Self::Domain {
        let _ = edge;
        state.clone()
    }
}

// Revisits of a widening point beyond this switch from join to widening.
const WIDENING_THRESHOLD: usize = 2;

/// Runs an analysis to its least fixed point and answers state queries.
///
/// `entry_state_at` / `exit_state_at` are in program order for both
/// directions: for a backward analysis the entry state is what the transfer
/// produced, the exit state what the successors contributed.
pub struct MonotonicFixpointIterator<T: FixpointTransfer> {
    transfer: T,
    entry_states: Vec<T::Domain>,
    exit_states: Vec<T::Domain>,
    iterations: usize,
}

impl<T: FixpointTransfer> MonotonicFixpointIterator<T> {
    /// Creates an iterator for the given transfer functions.
    #[must_use]
    pub fn new(transfer: T) -> Self {
        MonotonicFixpointIterator {
            transfer,
            entry_states: Vec::new(),
            exit_states: Vec::new(),
            iterations: 0,
        }
    }

    /// The wrapped transfer.
    #[must_use]
    pub fn transfer(&self) -> &T {
        &self.transfer
    }

    /// Number of node evaluations of the last run.
    #[must_use]
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// State at a block's entry, in program order.
    #[must_use]
    pub fn entry_state_at(&self, block: BlockId) -> &T::Domain {
        &self.entry_states[block]
    }

    /// State at a block's exit, in program order.
    #[must_use]
    pub fn exit_state_at(&self, block: BlockId) -> &T::Domain {
        &self.exit_states[block]
    }

    /// Runs to a fixpoint, seeding the boundary blocks with `init`.
    pub fn run(&mut self, code: &IrCode, cfg: &ControlFlowGraph, init: T::Domain) {
        let n = cfg.block_count();
        self.entry_states = vec![T::Domain::bottom(); n];
        self.exit_states = vec![T::Domain::bottom(); n];
        self.iterations = 0;
        if n == 0 {
            return;
        }

        let direction = self.transfer.direction();
        let (order, seeds): (Vec<BlockId>, Vec<BlockId>) = match direction {
            Direction::Forward => (cfg.reverse_postorder(), vec![cfg.entry()]),
            Direction::Backward => (cfg.postorder(), cfg.exits().to_vec()),
        };
        let widening_points: FxHashSet<BlockId> = cfg.loop_heads();

        match direction {
            Direction::Forward => {
                for &seed in &seeds {
                    self.entry_states[seed] = init.clone();
                }
            }
            Direction::Backward => {
                for &seed in &seeds {
                    self.exit_states[seed] = init.clone();
                }
            }
        }

        let mut worklist: Vec<BlockId> = order.clone();
        let mut on_worklist = vec![false; n];
        for &b in &worklist {
            on_worklist[b] = true;
        }
        let mut visits = vec![0usize; n];
        // Progress-or-terminate: the lattice or the widening must bound the
        // chain. Overrunning this is a bug in the domain, not an input.
        let cap = 64 * n.max(1) * (WIDENING_THRESHOLD + 2) + 4096;

        let mut cursor = 0usize;
        while cursor < worklist.len() {
            let block = worklist[cursor];
            cursor += 1;
            on_worklist[block] = false;
            self.iterations += 1;
            assert!(
                self.iterations <= cap,
                "fixpoint failed to stabilize after {cap} node evaluations"
            );
            visits[block] += 1;

            // Join the contributions of the incoming edges.
            let mut input = T::Domain::bottom();
            let contributions: Vec<T::Domain> = match direction {
                Direction::Forward => cfg
                    .pred_edges(block)
                    .map(|e| self.transfer.analyze_edge(e, &self.exit_states[e.src]))
                    .collect(),
                Direction::Backward => cfg
                    .succ_edges(block)
                    .map(|e| self.transfer.analyze_edge(e, &self.entry_states[e.dst]))
                    .collect(),
            };
            for c in &contributions {
                input.join_with(c);
            }
            if seeds.contains(&block) {
                input.join_with(&init);
            }

            let (incoming, outgoing): (&mut Vec<T::Domain>, &mut Vec<T::Domain>) = match direction
            {
                Direction::Forward => (&mut self.entry_states, &mut self.exit_states),
                Direction::Backward => (&mut self.exit_states, &mut self.entry_states),
            };

            let old_in = incoming[block].clone();
            let mut new_in = old_in.clone();
            if widening_points.contains(&block) && visits[block] > WIDENING_THRESHOLD {
                new_in.widen_with(&input);
            } else {
                new_in.join_with(&input);
            }
            let in_changed = !new_in.equals(&old_in);
            incoming[block] = new_in.clone();

            if !in_changed && visits[block] > 1 {
                continue;
            }

            let mut output = new_in;
            self.transfer.analyze_node(code, cfg, block, &mut output);
            let out_changed = !output.equals(&outgoing[block]);
            outgoing[block] = output;

            if out_changed {
                let affected: Vec<BlockId> = match direction {
                    Direction::Forward => cfg.succs(block).collect(),
                    Direction::Backward => cfg.preds(block).collect(),
                };
                for a in affected {
                    if !on_worklist[a] {
                        on_worklist[a] = true;
                        worklist.push(a);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::domain::{Domain, SimpleValueAbstractDomain};
    use crate::ir::{IrInstruction, Opcode};

    type ConstDomain = SimpleValueAbstractDomain<i64>;

    // Propagates the last constant assigned to register 0 through the CFG.
    struct ConstOfV0;

    impl FixpointTransfer for ConstOfV0 {
        type Domain = ConstDomain;

        fn analyze_node(
            &self,
            code: &IrCode,
            cfg: &ControlFlowGraph,
            block: BlockId,
            state: &mut ConstDomain,
        ) {
            for (_, insn) in cfg.block_insns(code, block) {
                if insn.opcode() == Opcode::Const16 && insn.dest() == Some(0) {
                    *state = ConstDomain::of(insn.literal());
                }
            }
        }
    }

    fn push_const(code: &mut IrCode, dest: u32, lit: i64) {
        let mut insn = IrInstruction::new(Opcode::Const16);
        insn.set_dest(dest);
        insn.set_literal(lit);
        code.push_insn(insn);
    }

    #[test]
    fn test_straight_line_propagation() {
        let mut code = IrCode::new(1);
        push_const(&mut code, 0, 42);
        code.push_insn(IrInstruction::new(Opcode::ReturnVoid));
        let cfg = ControlFlowGraph::build(&code);
        let mut iter = MonotonicFixpointIterator::new(ConstOfV0);
        iter.run(&code, &cfg, ConstDomain::top());
        assert_eq!(iter.exit_state_at(cfg.entry()).concrete(), Some(&42));
    }

    #[test]
    fn test_merge_of_disagreeing_paths_is_top() {
        // if v1 goto T; v0 = 1; goto M; T: v0 = 2; M: return
        let mut code = IrCode::new(2);
        let mut iff = IrInstruction::new(Opcode::IfNez);
        iff.set_srcs(vec![1]);
        let iff_id = code.push_insn(iff);
        push_const(&mut code, 0, 1);
        let goto_id = code.push_insn(IrInstruction::new(Opcode::Goto));
        code.push(crate::ir::MethodItemEntry::Target { branch: iff_id });
        push_const(&mut code, 0, 2);
        code.push(crate::ir::MethodItemEntry::Target { branch: goto_id });
        code.push_insn(IrInstruction::new(Opcode::ReturnVoid));

        let cfg = ControlFlowGraph::build(&code);
        let mut iter = MonotonicFixpointIterator::new(ConstOfV0);
        iter.run(&code, &cfg, ConstDomain::top());
        let merge = *cfg.exits().first().unwrap();
        assert!(Domain::is_top(iter.entry_state_at(merge)));
    }

    #[test]
    fn test_terminates_on_loop() {
        // header: if v0 goto exit; body: v0 = 1; goto header; exit: return
        let mut code = IrCode::new(1);
        let mut iff = IrInstruction::new(Opcode::IfEqz);
        iff.set_srcs(vec![0]);
        let iff_id = code.push_insn(iff);
        push_const(&mut code, 0, 1);
        let goto_back = code.push_insn(IrInstruction::new(Opcode::Goto));
        code.insert_before(0, crate::ir::MethodItemEntry::Target { branch: goto_back });
        code.push(crate::ir::MethodItemEntry::Target { branch: iff_id });
        code.push_insn(IrInstruction::new(Opcode::ReturnVoid));

        let cfg = ControlFlowGraph::build(&code);
        let mut iter = MonotonicFixpointIterator::new(ConstOfV0);
        iter.run(&code, &cfg, ConstDomain::top());
        assert!(iter.iterations() > 0);
    }
}
