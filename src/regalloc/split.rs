//! Live-range splitting.
//!
//! Splitting narrows a live range by storing it to a temporary before the
//! defs of the register it is split around and reloading it where it
//! resumes, so the other register's colour can be reused in between. Loads
//! for values that die on a control-flow edge go either directly at the head
//! of the successor (when every predecessor edge agrees the value is dead)
//! or into a trampoline appended at the end of the body with the branch
//! retargeted through it.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::analysis::{BlockId, ControlFlowGraph, EdgeKind, LivenessFixpointIterator};
use crate::ir::{EntryId, IrCode, IrInstruction, MethodItemEntry, Opcode, Reg};
use crate::regalloc::{gen_move, Graph};

/// Split bookkeeping for one register.
#[derive(Debug, Default)]
pub struct SplitConstraints {
    /// Catch blocks reached by edges on which this register dies, with the
    /// count of such edges.
    pub catch_blocks: FxHashMap<BlockId, usize>,
    /// Non-catch blocks reached by edges on which this register dies, with
    /// the count of such edges.
    pub other_blocks: FxHashMap<BlockId, usize>,
    /// Result-writing instructions whose move-result defines this register.
    pub write_result: FxHashSet<EntryId>,
    /// Stores needed if this register is split.
    pub split_store: usize,
    /// Loads needed if this register is split.
    pub split_load: usize,
}

/// Per-register split costs and veto information.
#[derive(Debug, Default)]
pub struct SplitCosts {
    constraints: FxHashMap<Reg, SplitConstraints>,
}

impl SplitCosts {
    /// Total moves splitting `reg` would insert.
    #[must_use]
    pub fn total_value_at(&self, reg: Reg) -> usize {
        self.constraints
            .get(&reg)
            .map_or(0, |c| c.split_store + c.split_load)
    }

    /// The catch blocks on whose incoming edges `reg` dies.
    #[must_use]
    pub fn death_at_catch(&self, reg: Reg) -> Option<&FxHashMap<BlockId, usize>> {
        self.constraints.get(&reg).map(|c| &c.catch_blocks)
    }

    /// The non-catch blocks on whose incoming edges `reg` dies.
    #[must_use]
    pub fn death_at_other(&self, reg: Reg) -> Option<&FxHashMap<BlockId, usize>> {
        self.constraints.get(&reg).map(|c| &c.other_blocks)
    }

    /// Result writers feeding a move-result that defines `reg`.
    #[must_use]
    pub fn get_write_result(&self, reg: Reg) -> Option<&FxHashSet<EntryId>> {
        self.constraints.get(&reg).map(|c| &c.write_result)
    }

    fn entry(&mut self, reg: Reg) -> &mut SplitConstraints {
        self.constraints.entry(reg).or_default()
    }
}

/// The chosen splits: `split_around[reg]` is the set of registers whose live
/// ranges get narrowed around `reg` so they can share its colour.
#[derive(Debug, Default)]
pub struct SplitPlan {
    /// Register → registers split around it.
    pub split_around: FxHashMap<Reg, FxHashSet<Reg>>,
}

impl SplitPlan {
    /// True when no split was chosen.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.split_around.is_empty()
    }
}

/// Counts the loads and stores each register would cost to split, and
/// records the catch-edge and move-result facts the split chooser vetoes on.
pub fn calc_split_costs(
    code: &IrCode,
    cfg: &ControlFlowGraph,
    liveness: &LivenessFixpointIterator,
    costs: &mut SplitCosts,
) {
    for block in cfg.blocks() {
        let mut live_out = liveness.live_out_at(block.id).clone();

        // A death on an edge means a reload at the target if we split.
        for edge in cfg.succ_edges(block.id) {
            let live_in = liveness.live_in_at(edge.dst);
            for reg in live_out.elements() {
                if live_in.contains(reg) {
                    continue;
                }
                costs.entry(reg).split_load += 1;
                if edge.kind == EdgeKind::Throw {
                    *costs.entry(reg).catch_blocks.entry(edge.dst).or_insert(0) += 1;
                } else {
                    *costs.entry(reg).other_blocks.entry(edge.dst).or_insert(0) += 1;
                }
            }
        }

        let insns: Vec<(usize, &IrInstruction)> = cfg.block_insns(code, block.id).collect();
        for (idx, (pos, insn)) in insns.iter().enumerate().rev() {
            if let Some(dest) = insn.dest() {
                costs.entry(dest).split_store += 1;
                if insn.opcode().is_move_result() {
                    // The invoke (or filled-new-array) feeding this
                    // move-result; a split may not come between them.
                    if let Some(&(prev_pos, _)) = idx.checked_sub(1).map(|i| &insns[i]) {
                        costs
                            .entry(dest)
                            .write_result
                            .insert(code.entry_id(prev_pos));
                    }
                }
            }
            for i in 0..insn.srcs_size() {
                let src = insn.src(i);
                if !live_out.contains(src) {
                    costs.entry(src).split_load += 1;
                }
            }
            let _ = pos;
            liveness.analyze_instruction(insn, &mut live_out);
        }
    }
}

// All edits are planned against stable entry ids and applied at the end; the
// planning phase never moves an entry.
enum DeferredEdit {
    InsertBefore(EntryId, IrInstruction),
    InsertAfter(EntryId, IrInstruction),
}

// A detour through the end of the body for loads on an edge where a direct
// head insertion would be visible to other predecessors.
struct Trampoline {
    // The branch whose taken edge this is, with the target entry to
    // repoint; None for a fallthrough edge.
    branch: Option<(EntryId, EntryId)>,
    // For fallthrough edges: the last instruction of the predecessor (the
    // detour goto goes after it) and the successor head entry.
    fallthrough: Option<(Option<EntryId>, EntryId)>,
    loads: Vec<IrInstruction>,
}

struct SplitState<'a> {
    plan: &'a SplitPlan,
    costs: &'a SplitCosts,
    ig: &'a Graph,
    // Which temp holds each split register, shared between its stores and
    // loads.
    load_store_reg: FxHashMap<Reg, Reg>,
    edits: Vec<DeferredEdit>,
    trampolines: FxHashMap<(BlockId, BlockId), Trampoline>,
    // (block, reg) pairs already loaded at a block head.
    loaded_at_head: FxHashSet<(BlockId, Reg)>,
}

impl SplitState<'_> {
    fn temp_for(&mut self, code: &mut IrCode, reg: Reg) -> Reg {
        if let Some(&temp) = self.load_store_reg.get(&reg) {
            return temp;
        }
        let temp = code.allocate_temp();
        self.load_store_reg.insert(reg, temp);
        temp
    }

    fn gen_load(&mut self, code: &mut IrCode, reg: Reg) -> IrInstruction {
        let temp = self.temp_for(code, reg);
        gen_move(self.ig.get_node(reg).type_(), reg, temp)
    }

    fn gen_store(&mut self, code: &mut IrCode, reg: Reg) -> IrInstruction {
        let temp = self.temp_for(code, reg);
        gen_move(self.ig.get_node(reg).type_(), temp, reg)
    }
}

// The first instruction entry of a block, skipping past move-exception in
// catch handlers.
fn block_load_anchor(code: &IrCode, cfg: &ControlFlowGraph, block: BlockId) -> Option<EntryId> {
    let b = cfg.block(block);
    for pos in b.start..b.end {
        if let Some(insn) = code.insn_at(pos) {
            if insn.opcode() == Opcode::MoveException {
                continue;
            }
            return Some(code.entry_id(pos));
        }
    }
    None
}

/// Applies a split plan: inserts the stores and loads that narrow the chosen
/// live ranges. Returns the number of moves inserted. The caller rebuilds
/// the CFG afterwards.
pub fn split(
    plan: &SplitPlan,
    costs: &SplitCosts,
    ig: &Graph,
    code: &mut IrCode,
    cfg: &ControlFlowGraph,
    liveness: &LivenessFixpointIterator,
) -> usize {
    let mut state = SplitState {
        plan,
        costs,
        ig,
        load_store_reg: FxHashMap::default(),
        edits: Vec::new(),
        trampolines: FxHashMap::default(),
        loaded_at_head: FxHashSet::default(),
    };

    for block in cfg.blocks() {
        plan_block_edge_loads(&mut state, code, cfg, liveness, block.id);

        let mut live_out = liveness.live_out_at(block.id).clone();
        let insns: Vec<(usize, EntryId)> = cfg
            .block_insns(code, block.id)
            .map(|(pos, _)| (pos, code.entry_id(pos)))
            .collect();
        for (idx, &(pos, entry)) in insns.iter().enumerate().rev() {
            let Some(insn) = code.insn_at(pos).cloned() else {
                continue;
            };
            plan_define_stores(&mut state, code, &insns, idx, entry, &insn, &live_out);
            plan_last_use_loads(&mut state, code, &insns, idx, entry, &insn, &live_out);
            liveness.analyze_instruction(&insn, &mut live_out);
        }
    }

    let mut moves = 0;

    // Mid-body insertions: resolve positions one edit at a time, since each
    // insertion shifts everything after it.
    let edits = std::mem::take(&mut state.edits);
    for edit in edits {
        match edit {
            DeferredEdit::InsertBefore(anchor, insn) => {
                if let Some(pos) = code.position_of(anchor) {
                    code.insert_before(pos, MethodItemEntry::Insn(insn));
                    moves += 1;
                }
            }
            DeferredEdit::InsertAfter(anchor, insn) => {
                if let Some(pos) = code.position_of(anchor) {
                    code.insert_after(pos, MethodItemEntry::Insn(insn));
                    moves += 1;
                }
            }
        }
    }

    // Trampolines go at the end of the body so they never disturb an
    // existing fallthrough.
    let trampolines = std::mem::take(&mut state.trampolines);
    for (_, tramp) in trampolines {
        match (tramp.branch, tramp.fallthrough) {
            (Some((branch, target_entry)), _) => {
                code.push(MethodItemEntry::Target { branch });
                for mv in tramp.loads {
                    code.push(MethodItemEntry::Insn(mv));
                    moves += 1;
                }
                let goto_back = code.push_insn(IrInstruction::new(Opcode::Goto));
                if let Some(pos) = code.position_of(target_entry) {
                    if let MethodItemEntry::Target { branch: b } = code.item_mut(pos) {
                        *b = goto_back;
                    }
                }
            }
            (None, Some((pred_last, succ_head))) => {
                let detour = IrInstruction::new(Opcode::Goto);
                let detour_id = match pred_last.and_then(|a| code.position_of(a)) {
                    Some(pos) => code.insert_after(pos, MethodItemEntry::Insn(detour)),
                    None => code.push_insn(detour),
                };
                code.push(MethodItemEntry::Target { branch: detour_id });
                for mv in tramp.loads {
                    code.push(MethodItemEntry::Insn(mv));
                    moves += 1;
                }
                let goto_back = code.push_insn(IrInstruction::new(Opcode::Goto));
                if let Some(pos) = code.position_of(succ_head) {
                    code.insert_before(pos, MethodItemEntry::Target { branch: goto_back });
                }
            }
            (None, None) => {}
        }
    }

    moves
}

// Loads for registers dying on an edge out of `block`: directly at the head
// of the successor when every incoming edge agrees, otherwise through a
// trampoline.
fn plan_block_edge_loads(
    state: &mut SplitState<'_>,
    code: &mut IrCode,
    cfg: &ControlFlowGraph,
    liveness: &LivenessFixpointIterator,
    block: BlockId,
) {
    let live_out = liveness.live_out_at(block).clone();
    let succ_edges: Vec<_> = cfg.succ_edges(block).copied().collect();
    for edge in succ_edges {
        let live_in = liveness.live_in_at(edge.dst).clone();
        for reg in live_out.elements() {
            if live_in.contains(reg) {
                continue;
            }
            let Some(around) = state.plan.split_around.get(&reg) else {
                continue;
            };
            let splittees: Vec<Reg> = around
                .iter()
                .copied()
                .filter(|l| live_in.contains(*l))
                .collect();

            let pred_count = cfg.preds(edge.dst).count();
            let deaths_here = state
                .costs
                .death_at_other(reg)
                .and_then(|m| m.get(&edge.dst))
                .copied()
                .unwrap_or(0);
            // Catch handlers were vetted in find_split: the value dies on
            // every exceptional edge in, so a head load is understood from
            // all predecessors.
            let direct_ok = edge.kind == EdgeKind::Throw || deaths_here == pred_count;

            for l in splittees {
                if direct_ok {
                    if !state.loaded_at_head.insert((edge.dst, l)) {
                        continue;
                    }
                    let mv = state.gen_load(code, l);
                    if let Some(anchor) = block_load_anchor(code, cfg, edge.dst) {
                        state.edits.push(DeferredEdit::InsertBefore(anchor, mv));
                    }
                } else {
                    plan_trampoline_load(state, code, cfg, block, edge.dst, l);
                }
            }
        }
    }
}

fn plan_trampoline_load(
    state: &mut SplitState<'_>,
    code: &mut IrCode,
    cfg: &ControlFlowGraph,
    pred: BlockId,
    succ: BlockId,
    reg: Reg,
) {
    let mv = state.gen_load(code, reg);
    if let Some(existing) = state.trampolines.get_mut(&(pred, succ)) {
        existing.loads.push(mv);
        return;
    }

    let pred_block = cfg.block(pred);
    let last_insn_pos = (pred_block.start..pred_block.end)
        .rev()
        .find(|&pos| code.insn_at(pos).is_some());
    let is_branch_edge = last_insn_pos
        .and_then(|pos| code.insn_at(pos))
        .is_some_and(|insn| insn.opcode().is_branch());

    let mut branch = None;
    if is_branch_edge {
        let branch_id = code.entry_id(last_insn_pos.expect("branch position"));
        // The successor's target entry for this branch, if the edge is the
        // taken side.
        let succ_block = cfg.block(succ);
        for pos in succ_block.start..succ_block.end {
            if let MethodItemEntry::Target { branch: b } = code.item(pos) {
                if *b == branch_id {
                    branch = Some((branch_id, code.entry_id(pos)));
                    break;
                }
            }
        }
    }

    let fallthrough = if branch.is_none() {
        let pred_last = last_insn_pos.map(|pos| code.entry_id(pos));
        let succ_head = cfg.block(succ).start;
        if succ_head < code.len() {
            Some((pred_last, code.entry_id(succ_head)))
        } else {
            None
        }
    } else {
        None
    };

    state.trampolines.insert(
        (pred, succ),
        Trampoline {
            branch,
            fallthrough,
            loads: vec![mv],
        },
    );
}

// Stores before each def of a register that others are split around.
fn plan_define_stores(
    state: &mut SplitState<'_>,
    code: &mut IrCode,
    insns: &[(usize, EntryId)],
    idx: usize,
    entry: EntryId,
    insn: &IrInstruction,
    live_out: &crate::analysis::LivenessDomain,
) {
    let Some(dest) = insn.dest() else { return };
    // A def that also reads the register is not a fresh value; storing
    // around `add v0, v0, v1` once is enough.
    if insn.srcs().contains(&dest) {
        return;
    }
    let Some(around) = state.plan.split_around.get(&dest) else {
        return;
    };
    // Stores may not come between a result writer and its move-result.
    let anchor = if insn.opcode().is_move_result() {
        idx.checked_sub(1).map_or(entry, |i| insns[i].1)
    } else {
        entry
    };
    let splittees: Vec<Reg> = around
        .iter()
        .copied()
        .filter(|l| live_out.contains(*l))
        .collect();
    for l in splittees {
        let mv = state.gen_store(code, l);
        state.edits.push(DeferredEdit::InsertBefore(anchor, mv));
    }
}

// Loads after the death (last use) of a register that others are split
// around.
fn plan_last_use_loads(
    state: &mut SplitState<'_>,
    code: &mut IrCode,
    insns: &[(usize, EntryId)],
    idx: usize,
    entry: EntryId,
    insn: &IrInstruction,
    live_out: &crate::analysis::LivenessDomain,
) {
    for i in 0..insn.srcs_size() {
        let src = insn.src(i);
        if live_out.contains(src) {
            continue;
        }
        let Some(around) = state.plan.split_around.get(&src) else {
            continue;
        };
        // A last use in a terminating conditional branch is an edge death;
        // plan_block_edge_loads covers both successors.
        if insn.opcode().is_conditional_branch() && idx == insns.len() - 1 {
            continue;
        }
        let splittees: Vec<Reg> = around
            .iter()
            .copied()
            .filter(|l| live_out.contains(*l))
            .collect();
        // A load may not come between a result writer and its move-result.
        let anchor = if insn.opcode().writes_result_register() {
            insns.get(idx + 1).map_or(entry, |&(pos, id)| {
                if code
                    .insn_at(pos)
                    .is_some_and(|next| next.opcode().is_move_result())
                {
                    id
                } else {
                    entry
                }
            })
        } else {
            entry
        };
        for l in splittees {
            let mv = state.gen_load(code, l);
            state.edits.push(DeferredEdit::InsertAfter(anchor, mv));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regalloc::{build_graph, RangeSet};

    fn const_insn(dest: Reg) -> IrInstruction {
        let mut insn = IrInstruction::new(Opcode::Const16);
        insn.set_dest(dest);
        insn
    }

    #[test]
    fn test_calc_split_costs_counts_defs_and_deaths() {
        // v0 = c; v1 = c; if v1 goto T; T: return
        let mut code = IrCode::new(2);
        code.push_insn(const_insn(0));
        code.push_insn(const_insn(1));
        let mut iff = IrInstruction::new(Opcode::IfEqz);
        iff.set_srcs(vec![1]);
        let iff_id = code.push_insn(iff);
        code.push(MethodItemEntry::Target { branch: iff_id });
        code.push_insn(IrInstruction::new(Opcode::ReturnVoid));

        let cfg = ControlFlowGraph::build(&code);
        let mut liveness = LivenessFixpointIterator::new(code.registers_size());
        liveness.run(&code, &cfg);
        let mut costs = SplitCosts::default();
        calc_split_costs(&code, &cfg, &liveness, &mut costs);

        // Each def costs one store; v1 dies at its use.
        assert!(costs.total_value_at(0) >= 1);
        assert!(costs.total_value_at(1) >= 2);
    }

    #[test]
    fn test_split_inserts_store_and_load() {
        // v0 = c; v1 = c; v1 = v1 + v1; return v0  — split v0 around v1.
        let mut code = IrCode::new(2);
        code.push_insn(const_insn(0));
        code.push_insn(const_insn(1));
        let mut add = IrInstruction::new(Opcode::AddInt);
        add.set_dest(1);
        add.set_srcs(vec![1, 1]);
        code.push_insn(add);
        let mut ret = IrInstruction::new(Opcode::Return);
        ret.set_srcs(vec![0]);
        code.push_insn(ret);

        let cfg = ControlFlowGraph::build(&code);
        let mut liveness = LivenessFixpointIterator::new(code.registers_size());
        liveness.run(&code, &cfg);
        let ig = build_graph(
            &code,
            &cfg,
            &liveness,
            code.registers_size(),
            &RangeSet::default(),
        );
        let mut costs = SplitCosts::default();
        calc_split_costs(&code, &cfg, &liveness, &mut costs);

        let mut plan = SplitPlan::default();
        plan.split_around.entry(1).or_default().insert(0);

        let before = code.len();
        let moves = split(&plan, &costs, &ig, &mut code, &cfg, &liveness);
        assert!(moves >= 2, "expected store+load, got {moves}");
        assert!(code.len() > before);
        assert_eq!(code.registers_size(), 3);
    }
}
