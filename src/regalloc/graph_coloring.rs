//! The Chaitin-Briggs allocation loop.
//!
//! Main differences from the textbook build-coalesce-simplify-spill loop:
//! coalescing only runs on the first iteration (spill and reload moves would
//! otherwise be coalesced right back), range instructions are placed after
//! ordinary nodes so the low registers go to the constrained encodings
//! first, and parameters are fitted last against the high end of the frame.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::analysis::{ControlFlowGraph, LivenessFixpointIterator};
use crate::ir::opcode::max_unsigned_value;
use crate::ir::{EntryId, IrCode, MethodItemEntry, Opcode, Reg};
use crate::regalloc::interference::{self, build_graph, Graph};
use crate::regalloc::split::{calc_split_costs, split, SplitCosts, SplitPlan};
use crate::regalloc::vreg_file::VirtualRegistersFile;
use crate::regalloc::{
    gen_move, init_range_set, remap_registers, RangeSet, RegMap, RegisterTransform,
};

// Non-range encodings address at most this virtual register.
const NON_RANGE_MAX_VREG: Reg = 15;

// Progress-or-terminate: iterating anywhere near this deep means the spiller
// stopped making progress, which is an allocator bug.
const REITERATION_CAP: usize = 200;

/// Counters accumulated across allocations.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    /// Times the allocation loop went around beyond the first pass.
    pub reiteration_count: usize,
    /// Moves inserted to relocate spilt parameters.
    pub param_spill_moves: usize,
    /// Loads inserted in front of range instructions.
    pub range_spill_moves: usize,
    /// Loads and stores inserted for ordinary spills.
    pub global_spill_moves: usize,
    /// Moves inserted by live-range splitting.
    pub split_moves: usize,
    /// Moves removed by coalescing.
    pub moves_coalesced: usize,
    /// Parameters whose spill load landed at the top of the method because
    /// an instruction overwrites the parameter register.
    pub params_spill_early: usize,
}

impl Stats {
    /// Folds another allocation's counters into this one.
    pub fn accumulate(&mut self, that: &Stats) {
        self.reiteration_count += that.reiteration_count;
        self.param_spill_moves += that.param_spill_moves;
        self.range_spill_moves += that.range_spill_moves;
        self.global_spill_moves += that.global_spill_moves;
        self.split_moves += that.split_moves;
        self.moves_coalesced += that.moves_coalesced;
        self.params_spill_early += that.params_spill_early;
    }

    /// Total moves inserted.
    #[must_use]
    pub fn moves_inserted(&self) -> usize {
        self.param_spill_moves
            + self.range_spill_moves
            + self.global_spill_moves
            + self.split_moves
    }

    /// Moves inserted minus moves coalesced away.
    #[must_use]
    pub fn net_moves(&self) -> isize {
        self.moves_inserted() as isize - self.moves_coalesced as isize
    }
}

/// What could not be coloured this iteration and how it will be fixed.
#[derive(Debug, Default)]
pub struct SpillPlan {
    /// Registers whose first-fit slot exceeded their encoding cap, with the
    /// slot they would have taken.
    pub global_spills: FxHashMap<Reg, Reg>,
    /// Parameter registers that could not stay in the parameter area.
    pub param_spills: FxHashSet<Reg>,
    /// Per range instruction, the operands that need a load in front of it.
    pub range_spills: FxHashMap<EntryId, FxHashSet<Reg>>,
    /// Spill cost per global-spill candidate (uses and defs that would have
    /// needed the wider encoding).
    pub spill_costs: FxHashMap<Reg, usize>,
}

impl SpillPlan {
    /// True when everything fit.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.global_spills.is_empty()
            && self.param_spills.is_empty()
            && self.range_spills.is_empty()
    }
}

// Where a spilt parameter's reload lands.
#[derive(Debug, Clone, Copy)]
enum ParamLoadSite {
    Before(EntryId),
    After(EntryId),
    // Right after the load-param block.
    EndOfParams,
}

// Simple union-find over register names for coalescing.
struct RegisterAliasSets {
    parent: Vec<Reg>,
    rank: Vec<u32>,
}

impl RegisterAliasSets {
    fn new(count: Reg) -> Self {
        RegisterAliasSets {
            parent: (0..count).collect(),
            rank: vec![0; count as usize],
        }
    }

    fn find(&mut self, reg: Reg) -> Reg {
        let mut root = reg;
        while self.parent[root as usize] != root {
            root = self.parent[root as usize];
        }
        let mut cur = reg;
        while self.parent[cur as usize] != root {
            let next = self.parent[cur as usize];
            self.parent[cur as usize] = root;
            cur = next;
        }
        root
    }

    fn link(&mut self, a: Reg, b: Reg) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        let (ra_us, rb_us) = (ra as usize, rb as usize);
        if self.rank[ra_us] < self.rank[rb_us] {
            self.parent[ra_us] = rb;
        } else if self.rank[ra_us] > self.rank[rb_us] {
            self.parent[rb_us] = ra;
        } else {
            self.parent[rb_us] = ra;
            self.rank[ra_us] += 1;
        }
    }
}

// Marks the vregs already taken by coloured neighbours of `reg`.
fn mark_adjacent(ig: &Graph, reg: Reg, reg_map: &RegMap, vreg_file: &mut VirtualRegistersFile) {
    for &adj in ig.get_node(reg).adjacent() {
        if let Some(&vreg) = reg_map.get(&adj) {
            vreg_file.alloc_at(vreg, ig.get_node(adj).width());
        }
    }
}

const INVALID_SCORE: usize = usize::MAX;

// Number of vregs we would have to spill if the contiguous run started at
// `range_base`.
fn score_range_fit(
    ig: &Graph,
    range_regs: &[Reg],
    range_base: Reg,
    vreg_files: &FxHashMap<Reg, VirtualRegistersFile>,
    reg_map: &RegMap,
) -> usize {
    let mut score = 0;
    let mut vreg = range_base;
    for &reg in range_regs {
        let node = ig.get_node(reg);
        let vreg_file = &vreg_files[&reg];
        if !vreg_file.is_free(vreg, node.width()) {
            return INVALID_SCORE;
        }
        let mapped_elsewhere = reg_map.get(&reg).is_some_and(|&assigned| assigned != vreg);
        if mapped_elsewhere || vreg > node.max_vreg() {
            score += 1;
        }
        vreg += node.width();
    }
    score
}

// The base in [range_base_start, range_base_end] with the fewest spills.
fn find_best_range_fit(
    ig: &Graph,
    range_regs: &[Reg],
    range_base_start: Reg,
    range_base_end: Reg,
    vreg_files: &FxHashMap<Reg, VirtualRegistersFile>,
    reg_map: &RegMap,
) -> Reg {
    let mut min_score = INVALID_SCORE;
    let mut range_base = 0;
    for base in range_base_start..=range_base_end {
        let score = score_range_fit(ig, range_regs, base, vreg_files, reg_map);
        if score < min_score {
            min_score = score;
            range_base = base;
        }
        if min_score == 0 {
            break;
        }
    }
    assert!(min_score != INVALID_SCORE, "no feasible range base found");
    range_base
}

/// The graph-colouring register allocator.
#[derive(Debug, Default)]
pub struct Allocator {
    stats: Stats,
    no_splitting: bool,
}

impl Allocator {
    /// An allocator with live-range splitting enabled.
    #[must_use]
    pub fn new() -> Self {
        Allocator::default()
    }

    /// An allocator that only spills, never splits.
    #[must_use]
    pub fn without_splitting() -> Self {
        Allocator {
            no_splitting: true,
            ..Allocator::default()
        }
    }

    /// The counters accumulated so far.
    #[must_use]
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Coalesces move-related registers over a union-find and deletes the
    /// moves made redundant. Instructions with a two-address form and
    /// check-cast are coalesced without deletion; their compact encodings
    /// need src and dest in one register.
    ///
    /// Runs only once, before the first simplify: spill and reload moves
    /// must survive later iterations.
    fn coalesce(&mut self, ig: &mut Graph, code: &mut IrCode) -> bool {
        let mut aliases = RegisterAliasSets::new(code.registers_size());
        let old_count = self.stats.moves_coalesced;
        let mut removals: Vec<usize> = Vec::new();

        for pos in 0..code.len() {
            let Some(insn) = code.insn_at(pos) else { continue };
            let op = insn.opcode();
            if !op.is_move() && !op.has_2addr_form() && op != Opcode::CheckCast {
                continue;
            }
            let (Some(raw_dest), true) = (insn.dest(), insn.srcs_size() > 0) else {
                continue;
            };
            let raw_src = insn.src(0);
            let dest = aliases.find(raw_dest);
            let src = aliases.find(raw_src);
            if dest == src {
                if op.is_move() {
                    self.stats.moves_coalesced += 1;
                    removals.push(pos);
                }
            } else if ig.is_coalesceable(dest, src) {
                aliases.link(dest, src);
                // link() does not say which side became the root.
                let parent = aliases.find(dest);
                let child = if parent == dest { src } else { dest };
                ig.combine(parent, child);
                if op.is_move() {
                    self.stats.moves_coalesced += 1;
                    removals.push(pos);
                }
            }
        }

        for pos in removals.into_iter().rev() {
            code.remove_at(pos);
        }

        let mut reg_map = RegMap::default();
        for reg in 0..code.registers_size() {
            let root = aliases.find(reg);
            if root != reg {
                reg_map.insert(reg, root);
            }
        }
        remap_registers(code, &reg_map);

        self.stats.moves_coalesced != old_count
    }

    /// Removes definitely-colourable nodes onto the select stack; when none
    /// remain, optimistically promotes one high node (preferring nodes that
    /// have not been spilt yet) and keeps going. Parameter and range nodes
    /// never enter the stack here.
    fn simplify(&self, ig: &mut Graph, select_stack: &mut Vec<Reg>) {
        use std::collections::BTreeSet;
        let mut low: BTreeSet<Reg> = BTreeSet::new();
        let mut high: BTreeSet<Reg> = BTreeSet::new();

        for (reg, node) in ig.active_nodes() {
            if node.is_param() || node.is_range() {
                continue;
            }
            if ig.definitely_colorable(reg) {
                low.insert(reg);
            } else {
                high.insert(reg);
            }
        }
        loop {
            while let Some(&reg) = low.iter().next() {
                low.remove(&reg);
                select_stack.push(reg);
                let adjacent: Vec<Reg> =
                    ig.get_node(reg).adjacent().iter().copied().collect();
                ig.remove_node(reg);
                for adj in adjacent {
                    let Some(adj_node) = ig.try_node(adj) else { continue };
                    if !adj_node.is_active() || adj_node.is_param() || adj_node.is_range() {
                        continue;
                    }
                    if ig.definitely_colorable(adj) {
                        low.insert(adj);
                        high.remove(&adj);
                    }
                }
            }
            if high.is_empty() {
                break;
            }
            // Optimistic colouring: the candidate goes onto the stack below
            // the neighbours that made it high; by the time select reaches
            // it those neighbours are coloured and may share slots.
            let candidate = high
                .iter()
                .copied()
                .find(|&reg| !ig.get_node(reg).is_spilt())
                .or_else(|| high.iter().next().copied())
                .expect("high set is non-empty");
            high.remove(&candidate);
            low.insert(candidate);
        }
    }

    /// Pops the select stack assigning the lowest contiguous free slots; a
    /// node whose slot exceeds its encoding cap becomes a global spill.
    fn select(
        &self,
        ig: &Graph,
        select_stack: &mut Vec<Reg>,
        reg_transform: &mut RegisterTransform,
        spill_plan: &mut SpillPlan,
    ) {
        let mut vregs_size: Reg = 0;
        while let Some(reg) = select_stack.pop() {
            let node = ig.get_node(reg);
            let mut vreg_file = VirtualRegistersFile::new();
            mark_adjacent(ig, reg, &reg_transform.map, &mut vreg_file);
            let vreg = vreg_file.alloc(node.width());
            if vreg <= node.max_vreg() {
                reg_transform.map.insert(reg, vreg);
            } else {
                spill_plan.global_spills.insert(reg, vreg);
                spill_plan.spill_costs.insert(reg, 0);
            }
            vregs_size = vregs_size.max(vreg_file.size());
        }
        reg_transform.size = vregs_size;
    }

    /// The range-promotion heuristic: if a non-range instruction with N
    /// operands is to be allocated without spilling, N vregs must be free of
    /// other live values in the low space. Liberal on purpose — the operands
    /// may interfere elsewhere and still miss the low slots.
    fn should_convert_to_range(
        &self,
        ig: &Graph,
        spill_plan: &SpillPlan,
        entry: EntryId,
        insn: &crate::ir::IrInstruction,
    ) -> bool {
        if !insn.opcode().has_range_form() {
            return false;
        }
        let mut has_wide = false;
        let mut has_spill = false;
        let mut src_reg_set: FxHashSet<Reg> = FxHashSet::default();
        for i in 0..insn.srcs_size() {
            let src = insn.src(i);
            src_reg_set.insert(src);
            if ig.try_node(src).is_some_and(|n| n.width() > 1) {
                has_wide = true;
            }
            if spill_plan.global_spills.contains_key(&src) {
                has_spill = true;
            }
        }
        if !has_spill {
            return false;
        }
        if has_wide {
            return true;
        }

        let mut low_regs_occupied: Reg = 0;
        for &reg in ig.get_liveness(entry) {
            let Some(node) = ig.try_node(reg) else { continue };
            if node.max_vreg() > NON_RANGE_MAX_VREG || src_reg_set.contains(&reg) {
                continue;
            }
            if node.width() > 1 {
                return true;
            }
            low_regs_occupied += 1;
        }
        insn.srcs_size() as Reg + low_regs_occupied > NON_RANGE_MAX_VREG + 1
    }

    fn choose_range_promotions(
        &self,
        code: &IrCode,
        ig: &Graph,
        spill_plan: &SpillPlan,
        range_set: &mut RangeSet,
    ) {
        for (pos, insn) in code.iter_insns() {
            let entry = code.entry_id(pos);
            if self.should_convert_to_range(ig, spill_plan, entry, insn) {
                range_set.insert(entry);
            }
        }
    }

    /// Places each range instruction's operands contiguously, picking the
    /// base with the fewest conflicts; operands that cannot land in their
    /// slot are recorded as range spills. Runs after ordinary select so the
    /// constrained encodings keep priority on the low vregs.
    fn select_ranges(
        &self,
        code: &IrCode,
        ig: &Graph,
        range_set: &RangeSet,
        reg_transform: &mut RegisterTransform,
        spill_plan: &mut SpillPlan,
    ) {
        for (pos, insn) in code.iter_insns() {
            let entry = code.entry_id(pos);
            if !range_set.contains(&entry) {
                continue;
            }
            let mut vreg_files: FxHashMap<Reg, VirtualRegistersFile> = FxHashMap::default();
            for i in 0..insn.srcs_size() {
                let src = insn.src(i);
                let mut file = VirtualRegistersFile::new();
                mark_adjacent(ig, src, &reg_transform.map, &mut file);
                vreg_files.insert(src, file);
            }

            let range_base = find_best_range_fit(
                ig,
                insn.srcs(),
                0,
                reg_transform.size,
                &vreg_files,
                &reg_transform.map,
            );

            let mut vreg = range_base;
            for i in 0..insn.srcs_size() {
                let src = insn.src(i);
                let node = ig.get_node(src);
                // Too large for the slot, or already pinned elsewhere: load
                // it into the slot just before the instruction instead.
                if vreg > node.max_vreg() || reg_transform.map.contains_key(&src) {
                    spill_plan.range_spills.entry(entry).or_default().insert(src);
                } else {
                    assert!(vreg_files[&src].is_free(vreg, node.width()));
                    reg_transform.map.insert(src, vreg);
                }
                vreg += node.width();
            }
            reg_transform.size = reg_transform.size.max(vreg);
        }
    }

    /// Fits the parameters contiguously against the high end of the frame;
    /// parameters that collide or overflow their cap become param spills.
    fn select_params(
        &self,
        code: &IrCode,
        ig: &Graph,
        reg_transform: &mut RegisterTransform,
        spill_plan: &mut SpillPlan,
    ) {
        let param_positions = code.param_instruction_positions();
        let mut vreg_files: FxHashMap<Reg, VirtualRegistersFile> = FxHashMap::default();
        let mut param_regs: Vec<Reg> = Vec::new();
        let mut params_size: Reg = 0;
        for &pos in &param_positions {
            let dest = code
                .insn_at(pos)
                .and_then(|insn| insn.dest())
                .expect("load-param has a dest");
            let node = ig.get_node(dest);
            params_size += node.width();
            param_regs.push(dest);
            let mut file = VirtualRegistersFile::new();
            mark_adjacent(ig, dest, &reg_transform.map, &mut file);
            vreg_files.insert(dest, file);
        }
        if param_regs.is_empty() {
            return;
        }

        let min_param_reg = if reg_transform.size < params_size {
            0
        } else {
            reg_transform.size - params_size
        };
        let params_base = find_best_range_fit(
            ig,
            &param_regs,
            min_param_reg,
            reg_transform.size,
            &vreg_files,
            &reg_transform.map,
        );

        let mut vreg = params_base;
        for &dest in &param_regs {
            let node = ig.get_node(dest);
            if vreg > node.max_vreg() || reg_transform.map.contains_key(&dest) {
                spill_plan.param_spills.insert(dest);
            } else {
                assert!(vreg_files[&dest].is_free(vreg, node.width()));
                reg_transform.map.insert(dest, vreg);
            }
            vreg += node.width();
        }
        reg_transform.size = reg_transform.size.max(vreg);
    }

    /// One increment per use or def that would have required the wider
    /// encoding; the split chooser compares against these.
    fn spill_costs(
        &self,
        code: &IrCode,
        ig: &Graph,
        range_set: &RangeSet,
        spill_plan: &mut SpillPlan,
    ) {
        for (pos, insn) in code.iter_insns() {
            if range_set.contains(&code.entry_id(pos)) {
                continue;
            }
            for i in 0..insn.srcs_size() {
                let src = insn.src(i);
                let Some(node) = ig.try_node(src) else { continue };
                let max_value = interference::max_value_for_src(node.width(), insn, i);
                if spill_plan
                    .global_spills
                    .get(&src)
                    .is_some_and(|&slot| slot > max_value)
                {
                    *spill_plan.spill_costs.entry(src).or_insert(0) += 1;
                }
            }
            if let Some(dest) = insn.dest() {
                let max_value = max_unsigned_value(insn.opcode().dest_bit_width());
                if spill_plan
                    .global_spills
                    .get(&dest)
                    .is_some_and(|&slot| slot > max_value)
                {
                    *spill_plan.spill_costs.entry(dest).or_insert(0) += 1;
                }
            }
        }
    }

    // There is an invoke/filled-new-array whose move-result defines `u` and
    // uses `v`: splitting v around u would slide a move between them.
    fn bad_move_result(
        &self,
        code: &IrCode,
        u: Reg,
        v: Reg,
        split_costs: &SplitCosts,
    ) -> bool {
        let Some(writers) = split_costs.get_write_result(u) else {
            return false;
        };
        for &writer in writers {
            let Some(pos) = code.position_of(writer) else { continue };
            if let Some(insn) = code.insn_at(pos) {
                if insn.srcs().contains(&v) {
                    return true;
                }
            }
        }
        false
    }

    // Splitting around a value that dies on only some of the exceptional
    // edges into a catch block cannot place its reload correctly.
    fn bad_catch(&self, cfg: &ControlFlowGraph, reg: Reg, split_costs: &SplitCosts) -> bool {
        let Some(deaths) = split_costs.death_at_catch(reg) else {
            return false;
        };
        deaths
            .iter()
            .any(|(&block, &count)| cfg.preds(block).count() != count)
    }

    /// For each global-spill candidate, looks for a neighbour colour to
    /// split around instead of spilling; a successful split assigns the
    /// colour immediately and drops the candidate from the spill plan.
    #[allow(clippy::too_many_arguments)]
    fn find_split(
        &self,
        code: &IrCode,
        cfg: &ControlFlowGraph,
        ig: &Graph,
        split_costs: &SplitCosts,
        reg_transform: &mut RegisterTransform,
        spill_plan: &mut SpillPlan,
        split_plan: &mut SplitPlan,
    ) {
        let candidates: Vec<Reg> = spill_plan.global_spills.keys().copied().collect();
        for reg in candidates {
            let mut best_cost = spill_plan.spill_costs.get(&reg).copied().unwrap_or(0);
            if best_cost == 0 {
                continue;
            }
            let mut best_vreg = 0;
            let mut split_found = false;
            let mut split_around_reg = false;

            // vreg → the neighbours currently holding it.
            let mut mapped_neighbors: FxHashMap<Reg, FxHashSet<Reg>> = FxHashMap::default();
            for &adj in ig.get_node(reg).adjacent() {
                if let Some(&vreg) = reg_transform.map.get(&adj) {
                    mapped_neighbors.entry(vreg).or_default().insert(adj);
                }
            }
            let max_reg_bound = ig.get_node(reg).max_vreg();

            for (&vreg, neighbors) in &mapped_neighbors {
                if vreg > max_reg_bound {
                    continue;
                }

                // Split the neighbours around reg.
                let mut split_ok = true;
                let mut cost = 0;
                for &neighbor in neighbors {
                    if self.bad_move_result(code, reg, neighbor, split_costs)
                        || ig.has_containment_edge(neighbor, reg)
                    {
                        split_ok = false;
                        break;
                    }
                    cost += split_costs.total_value_at(reg);
                }
                if split_ok && cost < best_cost && !self.bad_catch(cfg, reg, split_costs) {
                    best_cost = cost;
                    best_vreg = vreg;
                    split_around_reg = true;
                    split_found = true;
                }

                // Split reg around the neighbours.
                split_ok = true;
                cost = 0;
                for &neighbor in neighbors {
                    if self.bad_move_result(code, neighbor, reg, split_costs)
                        || ig.has_containment_edge(reg, neighbor)
                        || self.bad_catch(cfg, neighbor, split_costs)
                    {
                        split_ok = false;
                        break;
                    }
                    cost += split_costs.total_value_at(neighbor);
                }
                if split_ok && cost < best_cost {
                    best_cost = cost;
                    best_vreg = vreg;
                    split_around_reg = false;
                    split_found = true;
                }
            }

            if split_found {
                reg_transform.map.insert(reg, best_vreg);
                let neighbors = mapped_neighbors.remove(&best_vreg).unwrap_or_default();
                if split_around_reg {
                    split_plan
                        .split_around
                        .entry(reg)
                        .or_default()
                        .extend(neighbors);
                } else {
                    for neighbor in neighbors {
                        split_plan
                            .split_around
                            .entry(neighbor)
                            .or_default()
                            .insert(reg);
                    }
                }
                spill_plan.global_spills.remove(&reg);
            }
        }
    }

    // Finds where each spilt parameter's reload must go: at its first use
    // (searched breadth-first along live paths), or at the end of the
    // load-param block when an instruction overwrites the register anyway.
    fn find_param_first_uses(
        &mut self,
        param_spills: &FxHashSet<Reg>,
        code: &IrCode,
        cfg: &ControlFlowGraph,
        liveness: &LivenessFixpointIterator,
    ) -> FxHashMap<Reg, Vec<ParamLoadSite>> {
        let mut load_param: FxHashMap<Reg, Vec<ParamLoadSite>> = FxHashMap::default();
        if param_spills.is_empty() {
            return load_param;
        }
        let mut params = param_spills.clone();

        // A param overwritten by a later def can be reloaded immediately.
        for (_, insn) in code.iter_insns() {
            if insn.opcode().is_load_param() {
                continue;
            }
            if let Some(dest) = insn.dest() {
                if params.remove(&dest) {
                    load_param.entry(dest).or_default().push(ParamLoadSite::EndOfParams);
                    self.stats.params_spill_early += 1;
                }
            }
        }
        if params.is_empty() {
            return load_param;
        }

        for &param in &params {
            let mut visited: FxHashSet<usize> = FxHashSet::default();
            self.find_first_uses_dfs(
                param,
                cfg.entry(),
                code,
                cfg,
                liveness,
                &mut load_param,
                &mut visited,
            );
        }
        load_param
    }

    #[allow(clippy::too_many_arguments)]
    fn find_first_uses_dfs(
        &self,
        param: Reg,
        block: usize,
        code: &IrCode,
        cfg: &ControlFlowGraph,
        liveness: &LivenessFixpointIterator,
        load_param: &mut FxHashMap<Reg, Vec<ParamLoadSite>>,
        visited: &mut FxHashSet<usize>,
    ) {
        visited.insert(block);
        // A use inside this block anchors the load right before it.
        for (pos, insn) in cfg.block_insns(code, block) {
            if insn.opcode().is_load_param() {
                continue;
            }
            if insn.srcs().contains(&param) {
                load_param
                    .entry(param)
                    .or_default()
                    .push(ParamLoadSite::Before(code.entry_id(pos)));
                return;
            }
        }
        let live_succs: Vec<usize> = cfg
            .succs(block)
            .filter(|&s| liveness.live_in_at(s).contains(param) && !visited.contains(&s))
            .collect();
        if live_succs.len() > 1 {
            // The value flows into several branches: load once at the end of
            // this block rather than once per path, keeping the load before
            // the block's branch or throwing terminator.
            let b = cfg.block(block);
            let site = (b.start..b.end)
                .rev()
                .find_map(|pos| {
                    code.insn_at(pos).and_then(|insn| {
                        let op = insn.opcode();
                        if op.is_branch() || op.may_throw() {
                            Some(ParamLoadSite::Before(code.entry_id(pos)))
                        } else {
                            None
                        }
                    })
                })
                .or_else(|| {
                    (b.start..b.end)
                        .rev()
                        .next()
                        .map(|pos| ParamLoadSite::After(code.entry_id(pos)))
                });
            if let Some(site) = site {
                load_param.entry(param).or_default().push(site);
            }
            return;
        }
        for s in live_succs {
            self.find_first_uses_dfs(param, s, code, cfg, liveness, load_param, visited);
        }
    }

    // Redirects spilt params into fresh temps at the load-param block and
    // inserts the reloads at the recorded first-use sites.
    fn spill_params(
        &mut self,
        ig: &Graph,
        load_param: &FxHashMap<Reg, Vec<ParamLoadSite>>,
        code: &mut IrCode,
        new_temps: &mut FxHashSet<Reg>,
    ) {
        let mut param_to_temp: FxHashMap<Reg, Reg> = FxHashMap::default();
        let param_positions = code.param_instruction_positions();
        let last_param_entry = param_positions.last().map(|&pos| code.entry_id(pos));
        for pos in param_positions {
            let Some(dest) = code.insn_at(pos).and_then(|i| i.dest()) else {
                continue;
            };
            if load_param.contains_key(&dest) {
                let temp = code.allocate_temp();
                if let Some(insn) = code.insn_at_mut(pos) {
                    insn.set_dest(temp);
                }
                new_temps.insert(temp);
                param_to_temp.insert(dest, temp);
            }
        }
        for (&dest, sites) in load_param {
            let Some(&temp) = param_to_temp.get(&dest) else { continue };
            let type_ = ig.get_node(dest).type_();
            for site in sites {
                let mv = gen_move(type_, dest, temp);
                let applied = match site {
                    ParamLoadSite::Before(anchor) => code
                        .position_of(*anchor)
                        .map(|pos| code.insert_before(pos, MethodItemEntry::Insn(mv))),
                    ParamLoadSite::After(anchor) => code
                        .position_of(*anchor)
                        .map(|pos| code.insert_after(pos, MethodItemEntry::Insn(mv))),
                    ParamLoadSite::EndOfParams => last_param_entry
                        .and_then(|anchor| code.position_of(anchor))
                        .map(|pos| code.insert_after(pos, MethodItemEntry::Insn(mv))),
                };
                if applied.is_some() {
                    self.stats.param_spill_moves += 1;
                }
            }
        }
    }

    /// Inserts loads before every use of a globally spilt register and
    /// stores after its defs. Range operands get a single load in front of
    /// the range instruction, turning one range-constrained register into a
    /// range-constrained temp plus an ordinary one.
    fn spill(
        &mut self,
        ig: &Graph,
        spill_plan: &SpillPlan,
        range_set: &RangeSet,
        code: &mut IrCode,
        new_temps: &mut FxHashSet<Reg>,
    ) {
        let mut pos = 0;
        while pos < code.len() {
            let Some(insn) = code.insn_at(pos).cloned() else {
                pos += 1;
                continue;
            };
            let entry = code.entry_id(pos);
            if range_set.contains(&entry) {
                if let Some(to_spill) = spill_plan.range_spills.get(&entry) {
                    for i in 0..insn.srcs_size() {
                        let src = insn.src(i);
                        if !to_spill.contains(&src) {
                            continue;
                        }
                        let type_ = ig.get_node(src).type_();
                        let temp = code.allocate_temp();
                        if let Some(cur) = code.insn_at_mut(pos) {
                            cur.set_src(i, temp);
                        }
                        new_temps.insert(temp);
                        let mv = gen_move(type_, temp, src);
                        code.insert_before(pos, MethodItemEntry::Insn(mv));
                        pos += 1;
                        self.stats.range_spill_moves += 1;
                    }
                }
            } else {
                for i in 0..insn.srcs_size() {
                    let src = insn.src(i);
                    // Already handled while spilling range or param nodes.
                    if new_temps.contains(&src) {
                        continue;
                    }
                    let Some(node) = ig.try_node(src) else { continue };
                    let max_value = interference::max_value_for_src(node.width(), &insn, i);
                    if spill_plan
                        .global_spills
                        .get(&src)
                        .is_some_and(|&slot| slot > max_value)
                    {
                        let temp = code.allocate_temp();
                        if let Some(cur) = code.insn_at_mut(pos) {
                            cur.set_src(i, temp);
                        }
                        let mv = gen_move(node.type_(), temp, src);
                        code.insert_before(pos, MethodItemEntry::Insn(mv));
                        pos += 1;
                        self.stats.global_spill_moves += 1;
                    }
                }
                if let Some(dest) = insn.dest() {
                    let max_value = max_unsigned_value(insn.opcode().dest_bit_width());
                    if spill_plan
                        .global_spills
                        .get(&dest)
                        .is_some_and(|&slot| slot > max_value)
                    {
                        let type_ = ig.get_node(dest).type_();
                        let temp = code.allocate_temp();
                        if let Some(cur) = code.insn_at_mut(pos) {
                            cur.set_dest(temp);
                        }
                        code.insert_after(pos, MethodItemEntry::Insn(gen_move(type_, dest, temp)));
                        // Step over the store we just inserted.
                        pos += 1;
                        self.stats.global_spill_moves += 1;
                    }
                }
            }
            pos += 1;
        }
    }

    /// Runs the allocation loop to completion, rewriting `code` with final
    /// virtual registers and frame size, and converting promoted
    /// instructions to their range opcodes.
    pub fn allocate(&mut self, code: &mut IrCode) {
        // Any temp above this is the product of the spilling process.
        let initial_regs = code.registers_size();
        // Monotonically increasing: promotion never reverts.
        let mut range_set = init_range_set(code);

        let mut first = true;
        loop {
            let mut cfg = ControlFlowGraph::build(code);
            let mut liveness = LivenessFixpointIterator::new(code.registers_size());
            liveness.run(code, &cfg);
            let mut ig = build_graph(code, &cfg, &liveness, initial_regs, &range_set);

            if first {
                // Coalescing deletes moves and rewrites registers, so the
                // graph views must follow; the interference graph itself was
                // already updated in place by combine().
                self.coalesce(&mut ig, code);
                cfg = ControlFlowGraph::build(code);
                liveness = LivenessFixpointIterator::new(code.registers_size());
                liveness.run(code, &cfg);
                first = false;
            } else {
                self.stats.reiteration_count += 1;
                assert!(
                    self.stats.reiteration_count < REITERATION_CAP,
                    "register allocator failed to make progress"
                );
            }

            let mut select_stack: Vec<Reg> = Vec::new();
            self.simplify(&mut ig, &mut select_stack);
            let mut reg_transform = RegisterTransform::default();
            let mut spill_plan = SpillPlan::default();
            self.select(&ig, &mut select_stack, &mut reg_transform, &mut spill_plan);

            self.choose_range_promotions(code, &ig, &spill_plan, &mut range_set);
            self.select_ranges(code, &ig, &range_set, &mut reg_transform, &mut spill_plan);
            self.select_params(code, &ig, &mut reg_transform, &mut spill_plan);

            if spill_plan.is_empty() {
                remap_registers(code, &reg_transform.map);
                code.set_registers_size(reg_transform.size);
                break;
            }

            let mut split_costs = SplitCosts::default();
            let mut split_plan = SplitPlan::default();
            if !self.no_splitting {
                self.spill_costs(code, &ig, &range_set, &mut spill_plan);
                calc_split_costs(code, &cfg, &liveness, &mut split_costs);
                self.find_split(
                    code,
                    &cfg,
                    &ig,
                    &split_costs,
                    &mut reg_transform,
                    &mut spill_plan,
                    &mut split_plan,
                );
            }
            // First-use sites are recorded as stable entry ids before any
            // mutation; splitting goes first because it walks the CFG's
            // entry ranges, which the spill rewrites below would shift.
            let load_param =
                self.find_param_first_uses(&spill_plan.param_spills, code, &cfg, &liveness);
            if !split_plan.is_empty() {
                self.stats.split_moves +=
                    split(&split_plan, &split_costs, &ig, code, &cfg, &liveness);
            }
            let mut new_temps: FxHashSet<Reg> = FxHashSet::default();
            if !load_param.is_empty() {
                self.spill_params(&ig, &load_param, code, &mut new_temps);
            }
            self.spill(&ig, &spill_plan, &range_set, code, &mut new_temps);
        }

        // Promoted instructions take their contiguous-operand opcode.
        for pos in 0..code.len() {
            let entry = code.entry_id(pos);
            if !range_set.contains(&entry) {
                continue;
            }
            if let Some(insn) = code.insn_at_mut(pos) {
                if let Some(range_op) = insn.opcode().range_version() {
                    insn.set_opcode(range_op);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::IrInstruction;

    fn const_insn(dest: Reg) -> IrInstruction {
        let mut insn = IrInstruction::new(Opcode::Const16);
        insn.set_dest(dest);
        insn
    }

    fn assert_legal_assignment(code: &IrCode) {
        let cfg = ControlFlowGraph::build(code);
        let mut liveness = LivenessFixpointIterator::new(code.registers_size());
        liveness.run(code, &cfg);
        // Every operand must fit its slot.
        for (_, insn) in code.iter_insns() {
            if let Some(dest) = insn.dest() {
                let extra = if insn.dest_is_wide() { 1 } else { 0 };
                assert!(
                    dest + extra <= max_unsigned_value(insn.opcode().dest_bit_width()),
                    "dest v{dest} does not fit {:?}",
                    insn.opcode()
                );
            }
            if !insn.opcode().has_range() {
                for i in 0..insn.srcs_size() {
                    assert!(
                        insn.src(i) <= max_unsigned_value(insn.opcode().src_bit_width(i)),
                        "src v{} does not fit {:?}",
                        insn.src(i),
                        insn.opcode()
                    );
                }
            }
        }
    }

    #[test]
    fn test_straight_line_allocation() {
        let mut code = IrCode::new(3);
        code.push_insn(const_insn(0));
        code.push_insn(const_insn(1));
        let mut add = IrInstruction::new(Opcode::AddInt);
        add.set_dest(2);
        add.set_srcs(vec![0, 1]);
        code.push_insn(add);
        let mut ret = IrInstruction::new(Opcode::Return);
        ret.set_srcs(vec![2]);
        code.push_insn(ret);

        let mut allocator = Allocator::new();
        allocator.allocate(&mut code);
        assert!(code.registers_size() <= 3);
        assert_legal_assignment(&code);
    }

    #[test]
    fn test_move_coalescing_removes_moves() {
        // v0 = c; v1 = move v0; return v1
        let mut code = IrCode::new(2);
        code.push_insn(const_insn(0));
        let mut mv = IrInstruction::new(Opcode::Move);
        mv.set_dest(1);
        mv.set_srcs(vec![0]);
        code.push_insn(mv);
        let mut ret = IrInstruction::new(Opcode::Return);
        ret.set_srcs(vec![1]);
        code.push_insn(ret);

        let mut allocator = Allocator::new();
        allocator.allocate(&mut code);
        assert_eq!(allocator.stats().moves_coalesced, 1);
        let moves = code
            .iter_insns()
            .filter(|(_, i)| i.opcode().is_move())
            .count();
        assert_eq!(moves, 0);
        assert_eq!(code.registers_size(), 1);
    }

    #[test]
    fn test_params_at_frame_tail() {
        // Two params, one local.
        let mut code = IrCode::new(3);
        let mut p0 = IrInstruction::new(Opcode::LoadParam);
        p0.set_dest(1);
        code.push_insn(p0);
        let mut p1 = IrInstruction::new(Opcode::LoadParam);
        p1.set_dest(2);
        code.push_insn(p1);
        code.push_insn(const_insn(0));
        let mut add = IrInstruction::new(Opcode::AddInt);
        add.set_dest(0);
        add.set_srcs(vec![0, 1]);
        code.push_insn(add);
        let mut ret = IrInstruction::new(Opcode::Return);
        ret.set_srcs(vec![0]);
        code.push_insn(ret);

        let mut allocator = Allocator::new();
        allocator.allocate(&mut code);
        assert_legal_assignment(&code);

        let params: Vec<Reg> = code
            .param_instruction_positions()
            .into_iter()
            .map(|pos| code.insn_at(pos).unwrap().dest().unwrap())
            .collect();
        let size = code.registers_size();
        // Parameters occupy the contiguous suffix of the frame.
        assert_eq!(params, vec![size - 2, size - 1]);
    }

    #[test]
    fn test_allocate_is_idempotent_when_tight() {
        let mut code = IrCode::new(1);
        code.push_insn(const_insn(0));
        let mut ret = IrInstruction::new(Opcode::Return);
        ret.set_srcs(vec![0]);
        code.push_insn(ret);
        let mut allocator = Allocator::new();
        allocator.allocate(&mut code);
        assert_eq!(code.registers_size(), 1);
        assert_eq!(allocator.stats().moves_inserted(), 0);
    }
}
