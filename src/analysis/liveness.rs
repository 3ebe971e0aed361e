//! Backward liveness over Patricia-tree register sets.
//!
//! The hidden result register of invoke/filled-new-array is modelled as an
//! extra slot at index `registers_size`, so result flows through
//! move-result are tracked like any other register.

use crate::analysis::cfg::{BlockId, ControlFlowGraph};
use crate::analysis::fixpoint::{
    Direction, FixpointDomain, FixpointTransfer, MonotonicFixpointIterator,
};
use crate::collections::PatriciaTreeSet;
use crate::ir::{IrCode, IrInstruction, Reg};

/// A set of live registers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LivenessDomain {
    set: PatriciaTreeSet<Reg>,
}

impl LivenessDomain {
    /// The empty set.
    #[must_use]
    pub fn new() -> Self {
        LivenessDomain::default()
    }

    /// Membership test.
    #[must_use]
    pub fn contains(&self, reg: Reg) -> bool {
        self.set.contains(reg)
    }

    /// Marks a register live.
    pub fn add(&mut self, reg: Reg) {
        self.set.insert(reg);
    }

    /// Marks a register dead.
    pub fn remove(&mut self, reg: Reg) {
        self.set.remove(reg);
    }

    /// The live registers.
    pub fn elements(&self) -> impl Iterator<Item = Reg> + '_ {
        self.set.iter()
    }

    /// Number of live registers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.set.len()
    }

    /// True when nothing is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

impl FixpointDomain for LivenessDomain {
    fn bottom() -> Self {
        LivenessDomain::default()
    }

    fn leq(&self, other: &Self) -> bool {
        self.set.is_subset_of(&other.set)
    }

    fn equals(&self, other: &Self) -> bool {
        self.set.equals(&other.set)
    }

    fn join_with(&mut self, other: &Self) {
        self.set.union_with(&other.set);
    }
}

struct LivenessTransfer {
    result_register: Reg,
}

impl FixpointTransfer for LivenessTransfer {
    type Domain = LivenessDomain;

    fn direction(&self) -> Direction {
        Direction::Backward
    }

    fn analyze_node(
        &self,
        code: &IrCode,
        cfg: &ControlFlowGraph,
        block: BlockId,
        state: &mut LivenessDomain,
    ) {
        let insns: Vec<(usize, &IrInstruction)> = cfg.block_insns(code, block).collect();
        for (_, insn) in insns.into_iter().rev() {
            analyze_instruction_with(insn, state, self.result_register);
        }
    }
}

// Registers are tracked by name only; the second slot of a wide pair is the
// interference graph's concern, via node widths.
fn analyze_instruction_with(insn: &IrInstruction, state: &mut LivenessDomain, result_reg: Reg) {
    let op = insn.opcode();
    if op.writes_result_register() {
        state.remove(result_reg);
    } else if let Some(dest) = insn.dest() {
        state.remove(dest);
    }
    if op.is_move_result() {
        state.add(result_reg);
    }
    for i in 0..insn.srcs_size() {
        state.add(insn.src(i));
    }
}

/// Runs and caches backward liveness for one method body.
pub struct LivenessFixpointIterator {
    iter: MonotonicFixpointIterator<LivenessTransfer>,
    result_register: Reg,
}

impl LivenessFixpointIterator {
    /// Creates the analysis for a body with `registers_size` registers. The
    /// result register gets the next slot.
    #[must_use]
    pub fn new(registers_size: Reg) -> Self {
        LivenessFixpointIterator {
            iter: MonotonicFixpointIterator::new(LivenessTransfer {
                result_register: registers_size,
            }),
            result_register: registers_size,
        }
    }

    /// The slot modelling the hidden result register.
    #[must_use]
    pub fn result_register(&self) -> Reg {
        self.result_register
    }

    /// Runs the fixpoint.
    pub fn run(&mut self, code: &IrCode, cfg: &ControlFlowGraph) {
        self.iter.run(code, cfg, LivenessDomain::default());
    }

    /// Registers live on entry to `block`.
    #[must_use]
    pub fn live_in_at(&self, block: BlockId) -> &LivenessDomain {
        self.iter.entry_state_at(block)
    }

    /// Registers live on exit from `block`.
    #[must_use]
    pub fn live_out_at(&self, block: BlockId) -> &LivenessDomain {
        self.iter.exit_state_at(block)
    }

    /// Replays the transfer of one instruction: turns the live-out state
    /// after `insn` into the live-in state before it.
    pub fn analyze_instruction(&self, insn: &IrInstruction, state: &mut LivenessDomain) {
        analyze_instruction_with(insn, state, self.result_register);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Opcode;

    fn def(dest: Reg) -> IrInstruction {
        let mut insn = IrInstruction::new(Opcode::Const16);
        insn.set_dest(dest);
        insn
    }

    fn use_reg(src: Reg) -> IrInstruction {
        let mut insn = IrInstruction::new(Opcode::Return);
        insn.set_srcs(vec![src]);
        insn
    }

    #[test]
    fn test_straight_line_liveness() {
        // B1: def v0; def v1 | B2: use v0
        let mut code = IrCode::new(2);
        code.push_insn(def(0));
        code.push_insn(def(1));
        let goto = code.push_insn(IrInstruction::new(Opcode::Goto));
        code.push(crate::ir::MethodItemEntry::Target { branch: goto });
        code.push_insn(use_reg(0));

        let cfg = ControlFlowGraph::build(&code);
        assert_eq!(cfg.block_count(), 2);
        let mut liveness = LivenessFixpointIterator::new(code.registers_size());
        liveness.run(&code, &cfg);

        // live-in(B2) = {v0}
        assert!(liveness.live_in_at(1).contains(0));
        assert_eq!(liveness.live_in_at(1).len(), 1);
        // live-out(B1) = {v0}
        assert!(liveness.live_out_at(0).contains(0));
        assert_eq!(liveness.live_out_at(0).len(), 1);
        // Both defs are dead on entry.
        assert!(liveness.live_in_at(0).is_empty());
    }

    #[test]
    fn test_transfer_kills_defs() {
        let mut state = LivenessDomain::new();
        state.add(0);
        state.add(1);
        let liveness = LivenessFixpointIterator::new(4);
        liveness.analyze_instruction(&def(1), &mut state);
        assert!(state.contains(0));
        assert!(!state.contains(1));
        liveness.analyze_instruction(&def(0), &mut state);
        assert!(state.is_empty());
    }

    #[test]
    fn test_result_register_flow() {
        let liveness = LivenessFixpointIterator::new(4);
        let result = liveness.result_register();
        let mut state = LivenessDomain::new();

        // Backward over: invoke v0; move-result v1; use v1
        let mut mv = IrInstruction::new(Opcode::MoveResult);
        mv.set_dest(1);
        let mut invoke = IrInstruction::new(Opcode::InvokeStatic);
        invoke.set_srcs(vec![0]);

        state.add(1); // v1 live after move-result
        liveness.analyze_instruction(&mv, &mut state);
        assert!(state.contains(result));
        assert!(!state.contains(1));
        liveness.analyze_instruction(&invoke, &mut state);
        assert!(!state.contains(result));
        assert!(state.contains(0));
    }

    #[test]
    fn test_wide_sources_tracked_by_name() {
        let liveness = LivenessFixpointIterator::new(6);
        let mut state = LivenessDomain::new();
        let mut ret = IrInstruction::new(Opcode::ReturnWide);
        ret.set_srcs(vec![2]);
        liveness.analyze_instruction(&ret, &mut state);
        assert!(state.contains(2));
        assert!(!state.contains(3));
    }
}
