//! Interference-graph construction.
//!
//! One node per symbolic register, one edge per pair of registers that are
//! ever simultaneously live. Each node carries its width (1 or 2 slots), the
//! maximum virtual register its most restrictive operand slot can encode,
//! and the param/range/spilt markers the allocator stages consult.
//! Containment edges — "this register is live at a def or use of that one" —
//! are tracked separately and only consulted to veto split candidates.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::analysis::{ControlFlowGraph, LivenessFixpointIterator};
use crate::ir::opcode::max_unsigned_value;
use crate::ir::{EntryId, IrCode, IrInstruction, Opcode, Reg};
use crate::regalloc::{RangeSet, RegType};

/// A node of the interference graph.
#[derive(Debug, Clone)]
pub struct Node {
    width: u32,
    max_vreg: Reg,
    is_param: bool,
    is_range: bool,
    is_spilt: bool,
    type_: RegType,
    active: bool,
    adjacent: FxHashSet<Reg>,
}

impl Default for Node {
    fn default() -> Self {
        Node {
            width: 1,
            max_vreg: max_unsigned_value(16),
            is_param: false,
            is_range: false,
            is_spilt: false,
            type_: RegType::Normal,
            active: true,
            adjacent: FxHashSet::default(),
        }
    }
}

impl Node {
    /// Slots this register occupies (1 or 2).
    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// The largest virtual register every operand slot of this register can
    /// encode.
    #[must_use]
    pub fn max_vreg(&self) -> Reg {
        self.max_vreg
    }

    /// True for parameter registers (placed at the frame tail, never
    /// simplified).
    #[must_use]
    pub fn is_param(&self) -> bool {
        self.is_param
    }

    /// True for operands of range-form instructions.
    #[must_use]
    pub fn is_range(&self) -> bool {
        self.is_range
    }

    /// True once the register has been spilt in a previous iteration.
    #[must_use]
    pub fn is_spilt(&self) -> bool {
        self.is_spilt
    }

    /// The move flavour this register's values need.
    #[must_use]
    pub fn type_(&self) -> RegType {
        self.type_
    }

    /// True while the node is in the graph (not yet simplified away).
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// The interfering registers.
    #[must_use]
    pub fn adjacent(&self) -> &FxHashSet<Reg> {
        &self.adjacent
    }

    fn absorb_type(&mut self, type_: RegType) {
        // Wide wins over everything, Object over Normal.
        match (self.type_, type_) {
            (RegType::Normal, t) => self.type_ = t,
            (RegType::Object, RegType::Wide) => self.type_ = RegType::Wide,
            _ => {}
        }
    }
}

/// The interference graph of one method body.
#[derive(Debug, Default)]
pub struct Graph {
    nodes: FxHashMap<Reg, Node>,
    containment: FxHashSet<(Reg, Reg)>,
    // Live-out snapshots at range-form candidates, for the range-promotion
    // heuristic.
    liveness_at: FxHashMap<EntryId, Vec<Reg>>,
}

impl Graph {
    /// The node for `reg`.
    ///
    /// # Panics
    /// When `reg` has no node; the allocator only queries registers it saw
    /// during the build.
    #[must_use]
    pub fn get_node(&self, reg: Reg) -> &Node {
        &self.nodes[&reg]
    }

    /// All nodes.
    pub fn nodes(&self) -> impl Iterator<Item = (Reg, &Node)> {
        self.nodes.iter().map(|(r, n)| (*r, n))
    }

    /// Nodes still in the graph.
    pub fn active_nodes(&self) -> impl Iterator<Item = (Reg, &Node)> {
        self.nodes().filter(|(_, n)| n.active)
    }

    /// True when `a` and `b` interfere.
    #[must_use]
    pub fn is_adjacent(&self, a: Reg, b: Reg) -> bool {
        self.nodes.get(&a).is_some_and(|n| n.adjacent.contains(&b))
    }

    /// True when `b` is live at a def or use of `a`.
    #[must_use]
    pub fn has_containment_edge(&self, a: Reg, b: Reg) -> bool {
        self.containment.contains(&(a, b))
    }

    /// Live-out registers recorded at a range-candidate instruction.
    #[must_use]
    pub fn get_liveness(&self, insn: EntryId) -> &[Reg] {
        self.liveness_at.get(&insn).map_or(&[], Vec::as_slice)
    }

    /// Two nodes can be coalesced when they do not interfere and occupy the
    /// same number of slots.
    #[must_use]
    pub fn is_coalesceable(&self, a: Reg, b: Reg) -> bool {
        if a == b || self.is_adjacent(a, b) {
            return false;
        }
        match (self.nodes.get(&a), self.nodes.get(&b)) {
            (Some(na), Some(nb)) => na.width == nb.width,
            _ => false,
        }
    }

    /// The node for `reg`, when one exists.
    #[must_use]
    pub fn try_node(&self, reg: Reg) -> Option<&Node> {
        self.nodes.get(&reg)
    }

    /// Merges `child` into `parent`: constraints tighten to the minimum,
    /// markers accumulate, adjacency is combined. `child` goes inactive but
    /// stays queryable (stale liveness snapshots may still name it).
    pub fn combine(&mut self, parent: Reg, child: Reg) {
        let Some(child_node) = self.nodes.get(&child).cloned() else {
            return;
        };
        if let Some(c) = self.nodes.get_mut(&child) {
            c.active = false;
            c.adjacent.clear();
        }
        for adj in &child_node.adjacent {
            if let Some(n) = self.nodes.get_mut(adj) {
                n.adjacent.remove(&child);
                if *adj != parent {
                    n.adjacent.insert(parent);
                }
            }
        }
        let containment: Vec<(Reg, Reg)> = self.containment.iter().copied().collect();
        for (a, b) in containment {
            if a == child || b == child {
                self.containment.remove(&(a, b));
                let a = if a == child { parent } else { a };
                let b = if b == child { parent } else { b };
                if a != b {
                    self.containment.insert((a, b));
                }
            }
        }
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.max_vreg = p.max_vreg.min(child_node.max_vreg);
            p.is_param |= child_node.is_param;
            p.is_range |= child_node.is_range;
            p.is_spilt |= child_node.is_spilt;
            p.absorb_type(child_node.type_);
            for adj in child_node.adjacent {
                if adj != parent {
                    p.adjacent.insert(adj);
                }
            }
        }
    }

    /// Takes a node out of the graph (its adjacency stays queryable for
    /// select).
    pub fn remove_node(&mut self, reg: Reg) {
        if let Some(n) = self.nodes.get_mut(&reg) {
            n.active = false;
        }
    }

    /// Colourability test for simplify: the active neighbours cannot exhaust
    /// the encodable space even in the worst packing.
    #[must_use]
    pub fn definitely_colorable(&self, reg: Reg) -> bool {
        let node = &self.nodes[&reg];
        let weight: u32 = node
            .adjacent
            .iter()
            .filter_map(|adj| self.nodes.get(adj))
            .filter(|n| n.active)
            .map(|n| n.width)
            .sum();
        weight + node.width <= node.max_vreg + 1
    }

    fn add_edge(&mut self, a: Reg, b: Reg) {
        if a == b {
            return;
        }
        self.nodes.entry(a).or_default().adjacent.insert(b);
        self.nodes.entry(b).or_default().adjacent.insert(a);
    }

    fn add_containment_edge(&mut self, a: Reg, b: Reg) {
        if a != b {
            self.containment.insert((a, b));
        }
    }

    fn node_mut(&mut self, reg: Reg) -> &mut Node {
        self.nodes.entry(reg).or_default()
    }
}

pub(crate) fn max_value_for_src(node_width: u32, insn: &IrInstruction, src_index: usize) -> Reg {
    let op = insn.opcode();
    let mut max_value = max_unsigned_value(op.src_bit_width(src_index));
    if op.is_invoke() && node_width == 2 {
        // One register is reserved for unpacking the wide pair when the
        // invoke gets denormalized to range form.
        max_value -= 1;
    }
    max_value
}

/// Builds the interference graph from per-instruction liveness.
///
/// `initial_regs` is the register count before any spill-introduced
/// temporaries; registers at or above it are marked spilt.
#[must_use]
pub fn build_graph(
    code: &IrCode,
    cfg: &ControlFlowGraph,
    liveness: &LivenessFixpointIterator,
    initial_regs: Reg,
    range_set: &RangeSet,
) -> Graph {
    let mut graph = Graph::default();
    for reg in 0..code.registers_size() {
        let node = graph.node_mut(reg);
        node.is_spilt = reg >= initial_regs;
    }

    for block in cfg.blocks() {
        let mut live = liveness.live_out_at(block.id).clone();
        let insns: Vec<(usize, &IrInstruction)> = cfg.block_insns(code, block.id).collect();
        for (pos, insn) in insns.into_iter().rev() {
            let op = insn.opcode();
            let entry = code.entry_id(pos);
            let in_range_form = range_set.contains(&entry) || op.has_range();

            if op.has_range_form() || op.has_range() {
                // Snapshot for the range-promotion heuristic.
                graph.liveness_at.insert(entry, live.elements().collect());
            }

            if op.writes_result_register() {
                // The hidden result register is not allocatable.
            } else if let Some(dest) = insn.dest() {
                let width = if insn.dest_is_wide() { 2 } else { 1 };
                let node = graph.node_mut(dest);
                node.width = node.width.max(width);
                if op.is_load_param() {
                    node.is_param = true;
                    node.absorb_type(match op {
                        Opcode::LoadParamWide => RegType::Wide,
                        Opcode::LoadParamObject => RegType::Object,
                        _ => RegType::Normal,
                    });
                } else {
                    node.max_vreg = node
                        .max_vreg
                        .min(max_unsigned_value(op.dest_bit_width()));
                    if insn.dest_is_wide() {
                        node.absorb_type(RegType::Wide);
                    } else if matches!(
                        op,
                        Opcode::MoveObject
                            | Opcode::MoveObjectFrom16
                            | Opcode::MoveObject16
                            | Opcode::MoveResultObject
                            | Opcode::MoveException
                            | Opcode::ConstString
                            | Opcode::ConstClass
                            | Opcode::NewInstance
                            | Opcode::CheckCast
                    ) {
                        node.absorb_type(RegType::Object);
                    }
                }
                let move_src = if op.is_move() { Some(insn.src(0)) } else { None };
                let live_regs: Vec<Reg> = live.elements().collect();
                for u in live_regs {
                    if u == dest || u >= code.registers_size() {
                        continue;
                    }
                    // The source of a move does not interfere with its
                    // destination; that pair is the coalescing opportunity.
                    if move_src != Some(u) {
                        graph.add_edge(dest, u);
                    }
                    graph.add_containment_edge(dest, u);
                }
            }

            for i in 0..insn.srcs_size() {
                let src = insn.src(i);
                let width = insn.src_width(i);
                {
                    let node = graph.node_mut(src);
                    node.width = node.width.max(width);
                    if width == 2 {
                        node.absorb_type(RegType::Wide);
                    }
                }
                if in_range_form {
                    graph.node_mut(src).is_range = true;
                } else {
                    let node_width = graph.node_mut(src).width;
                    let cap = max_value_for_src(node_width, insn, i);
                    let node = graph.node_mut(src);
                    node.max_vreg = node.max_vreg.min(cap);
                }
                let live_regs: Vec<Reg> = live.elements().collect();
                for u in live_regs {
                    if u != src && u < code.registers_size() {
                        graph.add_containment_edge(src, u);
                    }
                }
            }

            liveness.analyze_instruction(insn, &mut live);
        }
    }
    graph
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ControlFlowGraph;
    use crate::ir::IrInstruction;

    fn const_insn(dest: Reg) -> IrInstruction {
        let mut insn = IrInstruction::new(Opcode::Const16);
        insn.set_dest(dest);
        insn
    }

    fn build(code: &IrCode) -> Graph {
        let cfg = ControlFlowGraph::build(code);
        let mut liveness = LivenessFixpointIterator::new(code.registers_size());
        liveness.run(code, &cfg);
        build_graph(code, &cfg, &liveness, code.registers_size(), &RangeSet::default())
    }

    #[test]
    fn test_simultaneously_live_registers_interfere() {
        // v0 = c; v1 = c; add v2, v0, v1; return v2
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

        let graph = build(&code);
        assert!(graph.is_adjacent(0, 1));
        assert!(!graph.is_adjacent(0, 2));
        assert!(!graph.is_adjacent(1, 2));
    }

    #[test]
    fn test_move_source_does_not_interfere() {
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

        let graph = build(&code);
        assert!(!graph.is_adjacent(0, 1));
        assert!(graph.is_coalesceable(0, 1));
    }

    #[test]
    fn test_slot_constraints() {
        // An if-test source slot is 4 bits wide.
        let mut code = IrCode::new(2);
        code.push_insn(const_insn(0));
        let mut iff = IrInstruction::new(Opcode::IfEq);
        iff.set_srcs(vec![0, 1]);
        let iff_id = code.push_insn(iff);
        code.push(crate::ir::MethodItemEntry::Target { branch: iff_id });
        code.push_insn(IrInstruction::new(Opcode::ReturnVoid));

        let graph = build(&code);
        assert_eq!(graph.get_node(0).max_vreg(), 15);
    }

    #[test]
    fn test_params_marked() {
        let mut code = IrCode::new(2);
        let mut lp = IrInstruction::new(Opcode::LoadParam);
        lp.set_dest(1);
        code.push_insn(lp);
        code.push_insn(IrInstruction::new(Opcode::ReturnVoid));
        let graph = build(&code);
        assert!(graph.get_node(1).is_param());
        assert!(!graph.get_node(0).is_param());
    }

    #[test]
    fn test_combine_merges_constraints() {
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

        let mut graph = build(&code);
        let min = graph.get_node(0).max_vreg().min(graph.get_node(2).max_vreg());
        graph.combine(2, 0);
        assert_eq!(graph.get_node(2).max_vreg(), min);
        // 0's interference with 1 transfers to 2.
        assert!(graph.is_adjacent(2, 1));
        assert!(!graph.get_node(0).is_active());
    }
}
