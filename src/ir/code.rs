//! Method bodies: the raw container form and the editable IR form.
//!
//! [`DexCode`] is the flat shape found in a container: a vector of
//! instructions whose branches target instruction indices, plus try ranges
//! addressed by index. It only exists at the load/store boundary.
//!
//! [`IrCode`] is what every pass works on: an ordered sequence of
//! [`MethodItemEntry`] items. Control flow is expressed positionally —
//! a branch instruction entry is referenced back by the [`MethodItemEntry::Target`]
//! entries sitting where it jumps to. Entry ids are stable across inserts and
//! removes, so targets never go stale while instructions move around.

use crate::ir::{DexTypeRef, IrInstruction, Opcode, ProtoRef, Reg};

/// Stable identity of one entry in an [`IrCode`]. Never reused within a body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub(crate) u32);

/// A source position attached to the following instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DexPosition {
    /// Source line.
    pub line: u32,
}

/// A raw debug-stream event carried through the editable form untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DexDebugEvent {
    /// Debug opcode byte.
    pub kind: u8,
    /// Operands, already decoded.
    pub args: Vec<u32>,
}

/// Debug metadata of a method body.
#[derive(Debug, Clone, Default)]
pub struct DexDebugItem {
    /// Starting line number.
    pub line_start: u32,
    /// Parameter names, when recorded.
    pub param_names: Vec<Option<crate::ir::DexStringRef>>,
}

/// A try range in the raw form, addressed by instruction index.
#[derive(Debug, Clone)]
pub struct DexTryItem {
    /// First covered instruction index.
    pub start: usize,
    /// Number of covered instructions.
    pub count: usize,
    /// Catch handlers: (type filter or catch-all, handler instruction index).
    pub catches: Vec<(Option<DexTypeRef>, usize)>,
}

/// The raw method body as stored in a container.
#[derive(Debug, Clone, Default)]
pub struct DexCode {
    /// Total registers, including the trailing parameter registers.
    pub registers_size: u16,
    /// Registers consumed by parameters.
    pub ins_size: u16,
    /// Registers needed for outgoing arguments.
    pub outs_size: u16,
    /// Flat instruction vector. Branch instructions keep the absolute index
    /// of their target in the literal slot.
    pub insns: Vec<IrInstruction>,
    /// Try ranges.
    pub tries: Vec<DexTryItem>,
    /// Debug metadata.
    pub debug: Option<DexDebugItem>,
}

/// One element of the editable body.
#[derive(Debug, Clone)]
pub enum MethodItemEntry {
    /// An instruction.
    Insn(IrInstruction),
    /// A branch target: control arrives here from the branch entry named by
    /// `branch`.
    Target {
        /// The branch instruction entry jumping here.
        branch: EntryId,
    },
    /// Start of try range `try_id`.
    TryStart {
        /// Try range identity within this body.
        try_id: u32,
    },
    /// End of try range `try_id`.
    TryEnd {
        /// Try range identity within this body.
        try_id: u32,
    },
    /// Catch handler entry point for try range `try_id`.
    Catch {
        /// Try range identity within this body.
        try_id: u32,
        /// Caught type; `None` is the catch-all.
        catch_type: Option<DexTypeRef>,
    },
    /// A source position for the following instructions.
    Position(DexPosition),
    /// A raw debug-stream event.
    Debug(DexDebugEvent),
    /// An explicit fallthrough marker.
    Fallthrough,
}

impl MethodItemEntry {
    /// The instruction, when this entry is one.
    #[must_use]
    pub fn insn(&self) -> Option<&IrInstruction> {
        match self {
            MethodItemEntry::Insn(insn) => Some(insn),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    id: EntryId,
    item: MethodItemEntry,
}

/// The editable method body.
#[derive(Debug, Clone, Default)]
pub struct IrCode {
    entries: Vec<Entry>,
    regs_size: Reg,
    next_id: u32,
    next_try: u32,
    debug: Option<DexDebugItem>,
}

impl IrCode {
    /// Creates an empty body with `regs_size` symbolic registers.
    #[must_use]
    pub fn new(regs_size: Reg) -> Self {
        IrCode {
            regs_size,
            ..IrCode::default()
        }
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the body has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current symbolic register count.
    #[must_use]
    pub fn registers_size(&self) -> Reg {
        self.regs_size
    }

    /// Replaces the register count (the allocator does this on completion).
    pub fn set_registers_size(&mut self, regs_size: Reg) {
        self.regs_size = regs_size;
    }

    /// Allocates a fresh symbolic register.
    pub fn allocate_temp(&mut self) -> Reg {
        let temp = self.regs_size;
        self.regs_size += 1;
        temp
    }

    /// Allocates a fresh try-range id.
    pub fn allocate_try_id(&mut self) -> u32 {
        let id = self.next_try;
        self.next_try += 1;
        id
    }

    /// Debug metadata.
    #[must_use]
    pub fn debug_item(&self) -> Option<&DexDebugItem> {
        self.debug.as_ref()
    }

    /// Replaces the debug metadata.
    pub fn set_debug_item(&mut self, debug: Option<DexDebugItem>) {
        self.debug = debug;
    }

    fn fresh_id(&mut self) -> EntryId {
        let id = EntryId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Appends an entry, returning its stable id.
    pub fn push(&mut self, item: MethodItemEntry) -> EntryId {
        let id = self.fresh_id();
        self.entries.push(Entry { id, item });
        id
    }

    /// Appends an instruction entry.
    pub fn push_insn(&mut self, insn: IrInstruction) -> EntryId {
        self.push(MethodItemEntry::Insn(insn))
    }

    /// Inserts an entry before position `pos`, returning its stable id.
    pub fn insert_before(&mut self, pos: usize, item: MethodItemEntry) -> EntryId {
        let id = self.fresh_id();
        self.entries.insert(pos, Entry { id, item });
        id
    }

    /// Inserts an entry after position `pos`, returning its stable id.
    pub fn insert_after(&mut self, pos: usize, item: MethodItemEntry) -> EntryId {
        let id = self.fresh_id();
        self.entries.insert(pos + 1, Entry { id, item });
        id
    }

    /// Removes the entry at `pos`.
    pub fn remove_at(&mut self, pos: usize) -> MethodItemEntry {
        self.entries.remove(pos).item
    }

    /// The entry at `pos`.
    #[must_use]
    pub fn item(&self, pos: usize) -> &MethodItemEntry {
        &self.entries[pos].item
    }

    /// Mutable access to the entry at `pos`.
    pub fn item_mut(&mut self, pos: usize) -> &mut MethodItemEntry {
        &mut self.entries[pos].item
    }

    /// The stable id of the entry at `pos`.
    #[must_use]
    pub fn entry_id(&self, pos: usize) -> EntryId {
        self.entries[pos].id
    }

    /// Current position of the entry with id `id`.
    #[must_use]
    pub fn position_of(&self, id: EntryId) -> Option<usize> {
        self.entries.iter().position(|e| e.id == id)
    }

    /// The instruction at `pos`, when that entry is one.
    #[must_use]
    pub fn insn_at(&self, pos: usize) -> Option<&IrInstruction> {
        self.entries[pos].item.insn()
    }

    /// Mutable instruction access at `pos`.
    pub fn insn_at_mut(&mut self, pos: usize) -> Option<&mut IrInstruction> {
        match &mut self.entries[pos].item {
            MethodItemEntry::Insn(insn) => Some(insn),
            _ => None,
        }
    }

    /// Iterates `(position, entry)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &MethodItemEntry)> {
        self.entries.iter().enumerate().map(|(i, e)| (i, &e.item))
    }

    /// Iterates `(position, instruction)` pairs.
    pub fn iter_insns(&self) -> impl Iterator<Item = (usize, &IrInstruction)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.item.insn().map(|insn| (i, insn)))
    }

    /// Positions of every [`MethodItemEntry::Target`] pointing at `branch`.
    #[must_use]
    pub fn targets_of(&self, branch: EntryId) -> Vec<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| match &e.item {
                MethodItemEntry::Target { branch: b } if *b == branch => Some(i),
                _ => None,
            })
            .collect()
    }

    /// Positions of the leading load-param pseudo-instructions.
    #[must_use]
    pub fn param_instruction_positions(&self) -> Vec<usize> {
        let mut positions = Vec::new();
        for (pos, entry) in self.entries.iter().enumerate() {
            match &entry.item {
                MethodItemEntry::Insn(insn) if insn.opcode().is_load_param() => {
                    positions.push(pos);
                }
                MethodItemEntry::Insn(_) => break,
                _ => {}
            }
        }
        positions
    }

    /// Converts a raw body into editable form. Parameter registers occupy
    /// the tail of the frame and are materialized as load-param
    /// pseudo-instructions derived from `proto`.
    #[must_use]
    pub fn balloon(raw: &DexCode, proto: &ProtoRef, is_static: bool) -> Self {
        let mut code = IrCode::new(Reg::from(raw.registers_size));
        code.debug.clone_from(&raw.debug);

        // Parameter pseudo-instructions first.
        let mut param_reg = Reg::from(raw.registers_size - raw.ins_size);
        if !is_static {
            let mut insn = IrInstruction::new(Opcode::LoadParamObject);
            insn.set_dest(param_reg);
            code.push_insn(insn);
            param_reg += 1;
        }
        for arg in proto.args().types() {
            let op = if arg.is_wide() {
                Opcode::LoadParamWide
            } else if arg.is_object() {
                Opcode::LoadParamObject
            } else {
                Opcode::LoadParam
            };
            let mut insn = IrInstruction::new(op);
            insn.set_dest(param_reg);
            param_reg += if arg.is_wide() { 2 } else { 1 };
            code.push_insn(insn);
        }

        // First pass: one entry per instruction, remembering ids by index.
        let mut insn_entry: Vec<EntryId> = Vec::with_capacity(raw.insns.len());
        for insn in &raw.insns {
            insn_entry.push(code.push_insn(insn.clone()));
        }

        // Second pass: materialize branch targets in front of their
        // destination instructions.
        for (idx, insn) in raw.insns.iter().enumerate() {
            if !insn.opcode().is_branch() {
                continue;
            }
            let target_idx = insn.literal() as usize;
            let branch = insn_entry[idx];
            let pos = code
                .position_of(insn_entry[target_idx])
                .expect("target instruction present");
            code.insert_before(pos, MethodItemEntry::Target { branch });
        }

        // Third pass: try ranges and catch markers.
        for raw_try in &raw.tries {
            let try_id = code.allocate_try_id();
            let start_pos = code
                .position_of(insn_entry[raw_try.start])
                .expect("try start present");
            code.insert_before(start_pos, MethodItemEntry::TryStart { try_id });
            let last = raw_try.start + raw_try.count - 1;
            let end_pos = code
                .position_of(insn_entry[last])
                .expect("try end present");
            code.insert_after(end_pos, MethodItemEntry::TryEnd { try_id });
            for (catch_type, handler) in &raw_try.catches {
                let handler_pos = code
                    .position_of(insn_entry[*handler])
                    .expect("handler present");
                code.insert_before(
                    handler_pos,
                    MethodItemEntry::Catch {
                        try_id,
                        catch_type: catch_type.clone(),
                    },
                );
            }
        }

        code
    }

    /// Converts the editable form back into a raw body. Load-param
    /// pseudo-instructions disappear (parameter placement is implicit in the
    /// container); branch targets become instruction indices.
    #[must_use]
    pub fn sync(&self) -> DexCode {
        // Map every kept instruction entry to its raw index.
        let mut index_of_entry: rustc_hash::FxHashMap<EntryId, usize> =
            rustc_hash::FxHashMap::default();
        let mut insns = Vec::new();
        let mut ins_size: u16 = 0;
        let mut outs_size: u16 = 0;
        for entry in &self.entries {
            if let MethodItemEntry::Insn(insn) = &entry.item {
                if insn.opcode().is_load_param() {
                    ins_size += if matches!(insn.opcode(), Opcode::LoadParamWide) {
                        2
                    } else {
                        1
                    };
                    continue;
                }
                if insn.opcode().is_invoke() {
                    let words: u32 = (0..insn.srcs_size()).map(|i| insn.src_width(i)).sum();
                    outs_size = outs_size.max(words as u16);
                }
                index_of_entry.insert(entry.id, insns.len());
                insns.push(insn.clone());
            }
        }

        // Resolve targets: for each Target entry, find the next kept
        // instruction at or after it; that's where the branch lands.
        let next_insn_index = |from: usize| -> Option<usize> {
            self.entries[from..].iter().find_map(|e| match &e.item {
                MethodItemEntry::Insn(insn) if !insn.opcode().is_load_param() => {
                    index_of_entry.get(&e.id).copied()
                }
                _ => None,
            })
        };
        // Catch markers usually sit after their try range; collect them
        // before resolving the ranges.
        let mut catches: rustc_hash::FxHashMap<u32, Vec<(Option<DexTypeRef>, usize)>> =
            rustc_hash::FxHashMap::default();
        for (pos, entry) in self.entries.iter().enumerate() {
            if let MethodItemEntry::Catch {
                try_id,
                catch_type,
            } = &entry.item
            {
                let handler = next_insn_index(pos).unwrap_or(0);
                catches
                    .entry(*try_id)
                    .or_default()
                    .push((catch_type.clone(), handler));
            }
        }

        let mut tries: Vec<DexTryItem> = Vec::new();
        let mut open_tries: rustc_hash::FxHashMap<u32, usize> = rustc_hash::FxHashMap::default();
        for (pos, entry) in self.entries.iter().enumerate() {
            match &entry.item {
                MethodItemEntry::Target { branch } => {
                    let landing = next_insn_index(pos).expect("branch target has an instruction");
                    if let Some(branch_pos) = self.position_of(*branch) {
                        if let Some(MethodItemEntry::Insn(_)) =
                            self.entries.get(branch_pos).map(|e| &e.item)
                        {
                            let branch_idx = index_of_entry[&self.entries[branch_pos].id];
                            insns[branch_idx].set_literal(landing as i64);
                        }
                    }
                }
                MethodItemEntry::TryStart { try_id } => {
                    let start = next_insn_index(pos).unwrap_or(insns.len());
                    open_tries.insert(*try_id, start);
                }
                MethodItemEntry::TryEnd { try_id } => {
                    if let Some(start) = open_tries.remove(try_id) {
                        // The covered range ends at the last instruction
                        // before this marker.
                        let end = self.entries[..pos]
                            .iter()
                            .rev()
                            .find_map(|e| index_of_entry.get(&e.id).copied())
                            .map_or(start, |idx| idx + 1);
                        tries.push(DexTryItem {
                            start,
                            count: end.saturating_sub(start).max(1),
                            catches: catches.remove(try_id).unwrap_or_default(),
                        });
                    }
                }
                _ => {}
            }
        }
        DexCode {
            registers_size: self.regs_size as u16,
            ins_size,
            outs_size,
            insns,
            tries,
            debug: self.debug.clone(),
        }
    }
}
