//! The graph-colouring register allocator.
//!
//! A Chaitin-Briggs allocator specialised for a bytecode whose operand
//! encodings limit register indices per opcode slot, which has range
//! (contiguous-operand) instruction forms, and which places parameters
//! implicitly at the high end of the frame.
//!
//! The pipeline per iteration: build the interference graph, coalesce
//! (first iteration only), simplify, select, promote and place range
//! instructions, place parameters, then split or spill whatever did not fit
//! and go around again. There is no user-visible failure mode: unbounded
//! spilling always reaches a legal colouring, and the reiteration cap only
//! guards against allocator bugs.

mod graph_coloring;
mod interference;
mod split;
mod vreg_file;

pub use graph_coloring::{Allocator, SpillPlan, Stats};
pub use interference::{build_graph, Graph, Node};
pub use split::{calc_split_costs, split, SplitCosts, SplitPlan};
pub use vreg_file::VirtualRegistersFile;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::ir::opcode::NON_RANGE_MAX;
use crate::ir::{EntryId, IrCode, IrInstruction, Opcode, Reg};

/// Final register assignment: symbolic register → virtual register.
pub type RegMap = FxHashMap<Reg, Reg>;

/// Instructions pinned to (or promoted into) range form, identified by their
/// stable entry ids.
pub type RangeSet = FxHashSet<EntryId>;

/// The allocator's output: the assignment plus the resulting frame size.
#[derive(Debug, Clone, Default)]
pub struct RegisterTransform {
    /// Symbolic register → virtual register.
    pub map: RegMap,
    /// Number of virtual registers in the frame.
    pub size: Reg,
}

/// The value category of a register, deciding which move flavour a spill
/// uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegType {
    /// A 32-bit primitive.
    #[default]
    Normal,
    /// A 64-bit primitive pair.
    Wide,
    /// A reference.
    Object,
}

/// Builds a move of the right flavour, using the 16-bit encodings so spill
/// temporaries always fit.
#[must_use]
pub fn gen_move(type_: RegType, dest: Reg, src: Reg) -> IrInstruction {
    let op = match type_ {
        RegType::Normal => Opcode::Move16,
        RegType::Wide => Opcode::MoveWide16,
        RegType::Object => Opcode::MoveObject16,
    };
    let mut insn = IrInstruction::new(op);
    insn.set_dest(dest);
    insn.set_srcs(vec![src]);
    insn
}

/// Rewrites every register operand through `map`; unmapped registers keep
/// their index.
pub fn remap_registers(code: &mut IrCode, map: &RegMap) {
    for pos in 0..code.len() {
        if let Some(insn) = code.insn_at_mut(pos) {
            if let Some(dest) = insn.dest() {
                if let Some(&new) = map.get(&dest) {
                    insn.set_dest(new);
                }
            }
            for i in 0..insn.srcs_size() {
                if let Some(&new) = map.get(&insn.src(i)) {
                    insn.set_src(i, new);
                }
            }
        }
    }
}

/// Number of virtual registers an instruction's sources require.
#[must_use]
pub fn sum_src_sizes(insn: &IrInstruction) -> usize {
    (0..insn.srcs_size()).map(|i| insn.src_width(i) as usize).sum()
}

/// Gathers the instructions that must be encoded in range form: any
/// filled-new-array or invoke whose summed source width exceeds the
/// non-range encoding's capacity.
#[must_use]
pub fn init_range_set(code: &IrCode) -> RangeSet {
    let mut range_set = RangeSet::default();
    for (pos, insn) in code.iter_insns() {
        let op = insn.opcode();
        let is_range = if op == Opcode::FilledNewArray {
            insn.srcs_size() > NON_RANGE_MAX
        } else if op.is_invoke() && !op.has_range() {
            sum_src_sizes(insn) > NON_RANGE_MAX
        } else {
            false
        };
        if is_range {
            range_set.insert(code.entry_id(pos));
        }
    }
    range_set
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remap_registers() {
        let mut code = IrCode::new(3);
        let mut insn = IrInstruction::new(Opcode::AddInt);
        insn.set_dest(0);
        insn.set_srcs(vec![1, 2]);
        code.push_insn(insn);
        let mut map = RegMap::default();
        map.insert(0, 5);
        map.insert(2, 7);
        remap_registers(&mut code, &map);
        let insn = code.insn_at(0).unwrap();
        assert_eq!(insn.dest(), Some(5));
        assert_eq!(insn.srcs(), &[1, 7]);
    }

    #[test]
    fn test_init_range_set_pins_big_invokes() {
        let mut code = IrCode::new(8);
        let mut small = IrInstruction::new(Opcode::InvokeStatic);
        small.set_srcs(vec![0, 1]);
        code.push_insn(small);
        let mut big = IrInstruction::new(Opcode::InvokeStatic);
        big.set_srcs(vec![0, 1, 2, 3, 4, 5]);
        let big_id = code.push_insn(big);
        let ranges = init_range_set(&code);
        assert_eq!(ranges.len(), 1);
        assert!(ranges.contains(&big_id));
    }
}
