//! Basic-block control-flow graphs over editable method bodies.
//!
//! Blocks are maximal straight-line entry ranges terminating at a branch,
//! throw, return or fallthrough; edges carry a small kind tag. Building the
//! graph is cheap, and rebuilding it is the required response to any edit
//! that moves entries around.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::ir::{EntryId, IrCode, IrInstruction, MethodItemEntry};

/// Index of a block within its graph.
pub type BlockId = usize;

/// The kind of a control-flow edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// Unconditional transfer (including fallthrough).
    Goto,
    /// Taken side of a conditional branch.
    Branch,
    /// Exceptional transfer into a catch handler.
    Throw,
}

/// A control-flow edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    /// Source block.
    pub src: BlockId,
    /// Target block.
    pub dst: BlockId,
    /// Kind tag.
    pub kind: EdgeKind,
}

/// A basic block: the entry positions `[start, end)` of the underlying body.
#[derive(Debug, Clone)]
pub struct Block {
    /// This block's id.
    pub id: BlockId,
    /// First entry position.
    pub start: usize,
    /// One past the last entry position.
    pub end: usize,
    /// True when the block is a catch-handler entry point.
    pub is_catch: bool,
    preds: Vec<usize>,
    succs: Vec<usize>,
}

/// The control-flow graph of one method body.
#[derive(Debug, Clone)]
pub struct ControlFlowGraph {
    blocks: Vec<Block>,
    edges: Vec<Edge>,
    entry: BlockId,
    exits: Vec<BlockId>,
}

impl ControlFlowGraph {
    /// Builds the graph for `code`. Call again after any structural edit.
    #[must_use]
    pub fn build(code: &IrCode) -> Self {
        let len = code.len();
        // Leaders: entry 0, every target/catch marker, every entry following
        // a terminator instruction.
        let mut leader = vec![false; len.max(1)];
        if len > 0 {
            leader[0] = true;
        }
        for (pos, item) in code.iter() {
            match item {
                MethodItemEntry::Target { .. } | MethodItemEntry::Catch { .. } => {
                    leader[pos] = true;
                }
                MethodItemEntry::Insn(insn) => {
                    let op = insn.opcode();
                    if (op.is_branch() || op.is_return() || op == crate::ir::Opcode::Throw)
                        && pos + 1 < len
                    {
                        leader[pos + 1] = true;
                    }
                }
                _ => {}
            }
        }

        let mut blocks: Vec<Block> = Vec::new();
        let mut block_of_pos = vec![0usize; len];
        for pos in 0..len {
            if leader[pos] {
                let id = blocks.len();
                if let Some(prev) = blocks.last_mut() {
                    prev.end = pos;
                }
                blocks.push(Block {
                    id,
                    start: pos,
                    end: len,
                    is_catch: matches!(code.item(pos), MethodItemEntry::Catch { .. }),
                    preds: Vec::new(),
                    succs: Vec::new(),
                });
            }
            if !blocks.is_empty() {
                block_of_pos[pos] = blocks.len() - 1;
            }
        }
        if blocks.is_empty() {
            blocks.push(Block {
                id: 0,
                start: 0,
                end: 0,
                is_catch: false,
                preds: Vec::new(),
                succs: Vec::new(),
            });
        }

        // Branch-entry → target-block mapping.
        let mut target_blocks: FxHashMap<EntryId, Vec<BlockId>> = FxHashMap::default();
        for (pos, item) in code.iter() {
            if let MethodItemEntry::Target { branch } = item {
                target_blocks
                    .entry(*branch)
                    .or_default()
                    .push(block_of_pos[pos]);
            }
        }

        // Try ranges: position intervals and their catch blocks.
        let mut try_start: FxHashMap<u32, usize> = FxHashMap::default();
        let mut try_end: FxHashMap<u32, usize> = FxHashMap::default();
        let mut catch_blocks: FxHashMap<u32, Vec<BlockId>> = FxHashMap::default();
        for (pos, item) in code.iter() {
            match item {
                MethodItemEntry::TryStart { try_id } => {
                    try_start.insert(*try_id, pos);
                }
                MethodItemEntry::TryEnd { try_id } => {
                    try_end.insert(*try_id, pos);
                }
                MethodItemEntry::Catch { try_id, .. } => {
                    catch_blocks
                        .entry(*try_id)
                        .or_default()
                        .push(block_of_pos[pos]);
                }
                _ => {}
            }
        }
        let covering_tries = |pos: usize| -> Vec<u32> {
            try_start
                .iter()
                .filter(|(id, &start)| {
                    pos >= start && try_end.get(id).copied().is_some_and(|end| pos < end)
                })
                .map(|(id, _)| *id)
                .collect()
        };

        let mut graph = ControlFlowGraph {
            blocks,
            edges: Vec::new(),
            entry: 0,
            exits: Vec::new(),
        };

        let block_count = graph.blocks.len();
        for id in 0..block_count {
            let (start, end) = (graph.blocks[id].start, graph.blocks[id].end);
            // The last instruction decides the out-edges.
            let last_insn: Option<(usize, &IrInstruction)> = (start..end)
                .rev()
                .find_map(|pos| code.insn_at(pos).map(|insn| (pos, insn)));
            let mut throw_targets: FxHashSet<BlockId> = FxHashSet::default();
            for pos in start..end {
                if let Some(insn) = code.insn_at(pos) {
                    if insn.opcode().may_throw() {
                        for try_id in covering_tries(pos) {
                            for &catch in catch_blocks.get(&try_id).into_iter().flatten() {
                                throw_targets.insert(catch);
                            }
                        }
                    }
                }
            }

            match last_insn {
                Some((_, insn)) if insn.opcode().is_goto() => {
                    let branch = Self::branch_entry(code, start, end);
                    for &dst in target_blocks.get(&branch).into_iter().flatten() {
                        graph.add_edge(id, dst, EdgeKind::Goto);
                    }
                }
                Some((_, insn)) if insn.opcode().is_conditional_branch() => {
                    let branch = Self::branch_entry(code, start, end);
                    for &dst in target_blocks.get(&branch).into_iter().flatten() {
                        graph.add_edge(id, dst, EdgeKind::Branch);
                    }
                    if id + 1 < block_count {
                        graph.add_edge(id, id + 1, EdgeKind::Goto);
                    }
                }
                Some((_, insn))
                    if insn.opcode().is_return() || insn.opcode() == crate::ir::Opcode::Throw =>
                {
                    // Terminators; only exceptional successors apply.
                }
                _ => {
                    // Straight-line fallthrough into the next block.
                    if id + 1 < block_count {
                        graph.add_edge(id, id + 1, EdgeKind::Goto);
                    }
                }
            }

            for dst in throw_targets {
                graph.add_edge(id, dst, EdgeKind::Throw);
            }
        }

        for id in 0..graph.blocks.len() {
            if graph.blocks[id].succs.is_empty() {
                graph.exits.push(id);
            }
        }
        graph
    }

    // The entry id of the last instruction in [start, end); branches are
    // always last in their block.
    fn branch_entry(code: &IrCode, start: usize, end: usize) -> EntryId {
        (start..end)
            .rev()
            .find(|&pos| code.insn_at(pos).is_some())
            .map(|pos| code.entry_id(pos))
            .expect("block has an instruction")
    }

    fn add_edge(&mut self, src: BlockId, dst: BlockId, kind: EdgeKind) {
        if self
            .edges
            .iter()
            .any(|e| e.src == src && e.dst == dst && e.kind == kind)
        {
            return;
        }
        let idx = self.edges.len();
        self.edges.push(Edge { src, dst, kind });
        self.blocks[src].succs.push(idx);
        self.blocks[dst].preds.push(idx);
    }

    /// Number of blocks.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// All blocks in layout order.
    #[must_use]
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// The block with the given id.
    #[must_use]
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id]
    }

    /// The entry block.
    #[must_use]
    pub fn entry(&self) -> BlockId {
        self.entry
    }

    /// Blocks with no successors (returns/throws).
    #[must_use]
    pub fn exits(&self) -> &[BlockId] {
        &self.exits
    }

    /// Successor edges of a block.
    pub fn succ_edges(&self, id: BlockId) -> impl Iterator<Item = &Edge> {
        self.blocks[id].succs.iter().map(|&e| &self.edges[e])
    }

    /// Predecessor edges of a block.
    pub fn pred_edges(&self, id: BlockId) -> impl Iterator<Item = &Edge> {
        self.blocks[id].preds.iter().map(|&e| &self.edges[e])
    }

    /// Successor block ids.
    pub fn succs(&self, id: BlockId) -> impl Iterator<Item = BlockId> + '_ {
        self.succ_edges(id).map(|e| e.dst)
    }

    /// Predecessor block ids.
    pub fn preds(&self, id: BlockId) -> impl Iterator<Item = BlockId> + '_ {
        self.pred_edges(id).map(|e| e.src)
    }

    /// The kinds of edges between `src` and `dst`.
    #[must_use]
    pub fn edge_kinds(&self, src: BlockId, dst: BlockId) -> Vec<EdgeKind> {
        self.edges
            .iter()
            .filter(|e| e.src == src && e.dst == dst)
            .map(|e| e.kind)
            .collect()
    }

    /// Iterates `(position, instruction)` of a block.
    pub fn block_insns<'a>(
        &self,
        code: &'a IrCode,
        id: BlockId,
    ) -> impl Iterator<Item = (usize, &'a IrInstruction)> {
        let (start, end) = (self.blocks[id].start, self.blocks[id].end);
        (start..end).filter_map(move |pos| code.insn_at(pos).map(|i| (pos, i)))
    }

    /// Reachable blocks in postorder from the entry.
    #[must_use]
    pub fn postorder(&self) -> Vec<BlockId> {
        let mut order = Vec::with_capacity(self.blocks.len());
        let mut visited = vec![false; self.blocks.len()];
        self.postorder_visit(self.entry, &mut visited, &mut order);
        order
    }

    fn postorder_visit(&self, id: BlockId, visited: &mut Vec<bool>, order: &mut Vec<BlockId>) {
        if visited[id] {
            return;
        }
        visited[id] = true;
        let succs: Vec<BlockId> = self.succs(id).collect();
        for s in succs {
            self.postorder_visit(s, visited, order);
        }
        order.push(id);
    }

    /// Reachable blocks in reverse postorder from the entry.
    #[must_use]
    pub fn reverse_postorder(&self) -> Vec<BlockId> {
        let mut order = self.postorder();
        order.reverse();
        order
    }

    /// Targets of back edges with respect to a DFS from the entry — the
    /// widening points of a forward analysis.
    #[must_use]
    pub fn loop_heads(&self) -> FxHashSet<BlockId> {
        let mut heads = FxHashSet::default();
        let mut state = vec![0u8; self.blocks.len()]; // 0 unvisited, 1 open, 2 done
        let mut stack: Vec<(BlockId, Vec<BlockId>)> = Vec::new();
        state[self.entry] = 1;
        stack.push((self.entry, self.succs(self.entry).collect()));
        loop {
            let next = match stack.last_mut() {
                None => break,
                Some((_, succs)) => succs.pop(),
            };
            match next {
                Some(next) => match state[next] {
                    0 => {
                        state[next] = 1;
                        let next_succs: Vec<BlockId> = self.succs(next).collect();
                        stack.push((next, next_succs));
                    }
                    // An edge into an open block is a back edge.
                    1 => {
                        heads.insert(next);
                    }
                    _ => {}
                },
                None => {
                    if let Some((id, _)) = stack.pop() {
                        state[id] = 2;
                    }
                }
            }
        }
        heads
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{IrInstruction, Opcode};

    // entry: if v0 goto T; v1 = 1; goto T2; T: v1 = 2; T2: return
    fn diamond() -> IrCode {
        let mut code = IrCode::new(2);
        let mut iff = IrInstruction::new(Opcode::IfNez);
        iff.set_srcs(vec![0]);
        let iff_id = code.push_insn(iff);
        let mut c1 = IrInstruction::new(Opcode::Const16);
        c1.set_dest(1);
        c1.set_literal(1);
        code.push_insn(c1);
        let goto_id = code.push_insn(IrInstruction::new(Opcode::Goto));
        code.push(MethodItemEntry::Target { branch: iff_id });
        let mut c2 = IrInstruction::new(Opcode::Const16);
        c2.set_dest(1);
        c2.set_literal(2);
        code.push_insn(c2);
        code.push(MethodItemEntry::Target { branch: goto_id });
        code.push_insn(IrInstruction::new(Opcode::ReturnVoid));
        code
    }

    #[test]
    fn test_diamond_shape() {
        let code = diamond();
        let cfg = ControlFlowGraph::build(&code);
        assert_eq!(cfg.block_count(), 4);
        assert_eq!(cfg.entry(), 0);
        assert_eq!(cfg.exits(), &[3]);

        let entry_succs: Vec<_> = cfg.succs(0).collect();
        assert_eq!(entry_succs.len(), 2);
        assert!(cfg.edge_kinds(0, 2).contains(&EdgeKind::Branch));
        assert!(cfg.edge_kinds(0, 1).contains(&EdgeKind::Goto));

        let merge_preds: Vec<_> = cfg.preds(3).collect();
        assert_eq!(merge_preds.len(), 2);
    }

    #[test]
    fn test_orders() {
        let code = diamond();
        let cfg = ControlFlowGraph::build(&code);
        let rpo = cfg.reverse_postorder();
        assert_eq!(rpo[0], cfg.entry());
        let po = cfg.postorder();
        assert_eq!(po.len(), rpo.len());
        for (i, b) in po.iter().enumerate() {
            assert_eq!(*b, rpo[rpo.len() - 1 - i]);
        }
        assert!(cfg.loop_heads().is_empty());
    }

    #[test]
    fn test_loop_head_detection() {
        // header: if v0 goto exit; body: goto header; exit: return
        let mut code = IrCode::new(1);
        let mut iff = IrInstruction::new(Opcode::IfEqz);
        iff.set_srcs(vec![0]);
        // Loop header target sits at position 0.
        let header_target_pos = 0;
        let iff_id = code.push_insn(iff);
        let goto_back = code.push_insn(IrInstruction::new(Opcode::Goto));
        code.insert_before(header_target_pos, MethodItemEntry::Target { branch: goto_back });
        code.push(MethodItemEntry::Target { branch: iff_id });
        code.push_insn(IrInstruction::new(Opcode::ReturnVoid));
        let cfg = ControlFlowGraph::build(&code);
        assert!(!cfg.loop_heads().is_empty());
    }

    #[test]
    fn test_throw_edges_into_catch() {
        let mut code = IrCode::new(2);
        let try_id = code.allocate_try_id();
        code.push(MethodItemEntry::TryStart { try_id });
        let mut invoke = IrInstruction::new(Opcode::InvokeStatic);
        invoke.set_srcs(vec![]);
        code.push_insn(invoke);
        code.push(MethodItemEntry::TryEnd { try_id });
        code.push_insn(IrInstruction::new(Opcode::ReturnVoid));
        code.push(MethodItemEntry::Catch {
            try_id,
            catch_type: None,
        });
        let mut mv = IrInstruction::new(Opcode::MoveException);
        mv.set_dest(0);
        code.push_insn(mv);
        code.push_insn(IrInstruction::new(Opcode::ReturnVoid));

        let cfg = ControlFlowGraph::build(&code);
        let catch_block = cfg
            .blocks()
            .iter()
            .find(|b| b.is_catch)
            .expect("catch block exists");
        let kinds = cfg.edge_kinds(0, catch_block.id);
        assert_eq!(kinds, vec![EdgeKind::Throw]);
    }
}
