//! The IR instruction: an opcode plus register operands and payload.

use std::fmt;

use crate::ir::{DexStringRef, DexTypeRef, MethodRef, Opcode};

/// A virtual register index.
///
/// Wide values occupy the pair (r, r+1); instructions always name the low
/// register.
pub type Reg = u32;

/// One instruction in editable form.
///
/// Register operands are symbolic until the register allocator assigns final
/// vregs; branch offsets do not exist here (control flow is expressed through
/// [`crate::ir::MethodItemEntry::Target`] entries).
#[derive(Clone)]
pub struct IrInstruction {
    opcode: Opcode,
    dest: Option<Reg>,
    srcs: Vec<Reg>,
    literal: i64,
    string: Option<DexStringRef>,
    type_ref: Option<DexTypeRef>,
    method: Option<MethodRef>,
}

impl IrInstruction {
    /// Creates an instruction with no operands set.
    #[must_use]
    pub fn new(opcode: Opcode) -> Self {
        IrInstruction {
            opcode,
            dest: None,
            srcs: Vec::new(),
            literal: 0,
            string: None,
            type_ref: None,
            method: None,
        }
    }

    /// The opcode.
    #[must_use]
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Replaces the opcode, keeping operands. Used for range promotion.
    pub fn set_opcode(&mut self, opcode: Opcode) {
        self.opcode = opcode;
    }

    /// The destination register, if the opcode defines one.
    #[must_use]
    pub fn dest(&self) -> Option<Reg> {
        self.dest
    }

    /// Number of destination registers (0 or 1).
    #[must_use]
    pub fn dests_size(&self) -> usize {
        usize::from(self.dest.is_some())
    }

    /// Sets the destination register.
    pub fn set_dest(&mut self, reg: Reg) {
        self.dest = Some(reg);
    }

    /// Source registers in operand order.
    #[must_use]
    pub fn srcs(&self) -> &[Reg] {
        &self.srcs
    }

    /// Source register `i`.
    ///
    /// # Panics
    /// When `i` is out of range; operand indices are a program invariant.
    #[must_use]
    pub fn src(&self, i: usize) -> Reg {
        self.srcs[i]
    }

    /// Number of source registers.
    #[must_use]
    pub fn srcs_size(&self) -> usize {
        self.srcs.len()
    }

    /// Replaces source register `i`.
    pub fn set_src(&mut self, i: usize, reg: Reg) {
        self.srcs[i] = reg;
    }

    /// Replaces all source registers.
    pub fn set_srcs(&mut self, srcs: Vec<Reg>) {
        self.srcs = srcs;
    }

    /// The literal payload (const values, branch-free arithmetic).
    #[must_use]
    pub fn literal(&self) -> i64 {
        self.literal
    }

    /// Sets the literal payload.
    pub fn set_literal(&mut self, literal: i64) {
        self.literal = literal;
    }

    /// String payload (const-string).
    #[must_use]
    pub fn string(&self) -> Option<&DexStringRef> {
        self.string.as_ref()
    }

    /// Sets the string payload.
    pub fn set_string(&mut self, s: DexStringRef) {
        self.string = Some(s);
    }

    /// Type payload (const-class, check-cast, new-instance,
    /// filled-new-array).
    #[must_use]
    pub fn type_ref(&self) -> Option<&DexTypeRef> {
        self.type_ref.as_ref()
    }

    /// Sets the type payload.
    pub fn set_type_ref(&mut self, t: DexTypeRef) {
        self.type_ref = Some(t);
    }

    /// Method payload (invokes).
    #[must_use]
    pub fn method(&self) -> Option<&MethodRef> {
        self.method.as_ref()
    }

    /// Sets the method payload.
    pub fn set_method(&mut self, m: MethodRef) {
        self.method = Some(m);
    }

    /// True when the destination holds a wide (two-register) value.
    #[must_use]
    pub fn dest_is_wide(&self) -> bool {
        use Opcode::*;
        matches!(
            self.opcode,
            MoveWide
                | MoveWideFrom16
                | MoveWide16
                | MoveResultWide
                | ConstWide16
                | ConstWide
                | AddLong
                | SubLong
                | MulLong
                | DivLong
                | RemLong
                | AddDouble
                | SubDouble
                | MulDouble
                | DivDouble
                | RemDouble
                | LoadParamWide
        )
    }

    /// True when source operand `i` holds a wide value.
    ///
    /// For invokes the answer comes from the callee prototype; the implicit
    /// `this` argument of non-static invokes is never wide.
    #[must_use]
    pub fn src_is_wide(&self, i: usize) -> bool {
        use Opcode::*;
        match self.opcode {
            MoveWide | MoveWideFrom16 | MoveWide16 | ReturnWide => true,
            AddLong | SubLong | MulLong | DivLong | RemLong | AddDouble | SubDouble | MulDouble
            | DivDouble | RemDouble => true,
            op if op.is_invoke() => {
                let Some(method) = &self.method else {
                    return false;
                };
                let implicit_this = usize::from(!op.is_invoke_static());
                if i < implicit_this {
                    return false;
                }
                method
                    .proto()
                    .args()
                    .types()
                    .get(i - implicit_this)
                    .is_some_and(DexTypeRef::is_wide)
            }
            _ => false,
        }
    }

    /// Width in registers (1 or 2) of source operand `i`.
    #[must_use]
    pub fn src_width(&self, i: usize) -> u32 {
        if self.src_is_wide(i) {
            2
        } else {
            1
        }
    }
}

impl fmt::Debug for IrInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode)?;
        if let Some(d) = self.dest {
            write!(f, " v{d}")?;
        }
        for s in &self.srcs {
            write!(f, " v{s}")?;
        }
        if let Some(m) = &self.method {
            write!(f, " {}", m.spec())?;
        }
        if let Some(t) = &self.type_ref {
            write!(f, " {t}")?;
        }
        Ok(())
    }
}
