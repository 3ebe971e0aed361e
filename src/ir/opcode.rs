//! Opcodes, encoding formats, and table-driven predicates.
//!
//! Every question a pass can ask about an opcode — can it throw, does it
//! write the result register, how many bits does operand slot `i` get — is
//! answered from the [`Format`] table rather than ad-hoc switches, so the
//! encoding limits the register allocator enforces stay consistent with the
//! instruction set in one place.

use strum::{Display, EnumIter};

/// Maximum number of enumerated sources in a non-range encoding (`35c`).
pub const NON_RANGE_MAX: usize = 5;

/// The instruction set operated on. The variants are the standard dex
/// mnemonics.
///
/// Load-param opcodes are IR pseudo-instructions marking implicit parameter
/// placement; they never reach a container.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumIter)]
pub enum Opcode {
    Nop,
    Move,
    MoveFrom16,
    Move16,
    MoveWide,
    MoveWideFrom16,
    MoveWide16,
    MoveObject,
    MoveObjectFrom16,
    MoveObject16,
    MoveResult,
    MoveResultWide,
    MoveResultObject,
    MoveException,
    ReturnVoid,
    Return,
    ReturnWide,
    ReturnObject,
    Const4,
    Const16,
    Const,
    ConstWide16,
    ConstWide,
    ConstString,
    ConstClass,
    CheckCast,
    NewInstance,
    FilledNewArray,
    FilledNewArrayRange,
    Throw,
    Goto,
    IfEq,
    IfNe,
    IfLt,
    IfGe,
    IfGt,
    IfLe,
    IfEqz,
    IfNez,
    IfLtz,
    IfGez,
    IfGtz,
    IfLez,
    AddInt,
    SubInt,
    MulInt,
    DivInt,
    RemInt,
    AddLong,
    SubLong,
    MulLong,
    DivLong,
    RemLong,
    AddFloat,
    SubFloat,
    MulFloat,
    DivFloat,
    RemFloat,
    AddDouble,
    SubDouble,
    MulDouble,
    DivDouble,
    RemDouble,
    InvokeVirtual,
    InvokeSuper,
    InvokeDirect,
    InvokeStatic,
    InvokeInterface,
    InvokeVirtualRange,
    InvokeSuperRange,
    InvokeDirectRange,
    InvokeStaticRange,
    InvokeInterfaceRange,
    LoadParam,
    LoadParamWide,
    LoadParamObject,
}

/// Operand encoding formats, named after the dex instruction formats they
/// mirror. The format fixes the bit width of every register slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    /// No operands.
    F10x,
    /// 4-bit dest, 4-bit literal.
    F11n,
    /// One 8-bit register (dest or src depending on opcode).
    F11x,
    /// 4-bit dest, 4-bit src.
    F12x,
    /// 10/20/30-bit branch, no registers.
    F10t,
    /// 8-bit register + constant-pool reference.
    F21c,
    /// 8-bit dest, 16-bit literal.
    F21s,
    /// 8-bit src + branch.
    F21t,
    /// 8-bit dest, 16-bit src.
    F22x,
    /// Two 4-bit srcs + branch.
    F22t,
    /// 8-bit dest, two 8-bit srcs.
    F23x,
    /// 8-bit dest, 32-bit literal.
    F31i,
    /// 16-bit dest, 16-bit src.
    F32x,
    /// Up to five enumerated 4-bit srcs + reference.
    F35c,
    /// Range form: 16-bit base + count.
    F3rc,
    /// 8-bit dest, 64-bit literal.
    F51l,
    /// IR pseudo-instruction; 16-bit register.
    FPseudo,
}

use Format::*;
use Opcode::*;

impl Opcode {
    /// The encoding format of this opcode.
    #[must_use]
    pub fn format(self) -> Format {
        match self {
            Nop => F10x,
            Move | MoveWide | MoveObject => F12x,
            MoveFrom16 | MoveWideFrom16 | MoveObjectFrom16 => F22x,
            Move16 | MoveWide16 | MoveObject16 => F32x,
            MoveResult | MoveResultWide | MoveResultObject | MoveException => F11x,
            ReturnVoid => F10x,
            Return | ReturnWide | ReturnObject | Throw => F11x,
            Const4 => F11n,
            Const16 | ConstWide16 => F21s,
            Const => F31i,
            ConstWide => F51l,
            ConstString | ConstClass | NewInstance | CheckCast => F21c,
            FilledNewArray => F35c,
            FilledNewArrayRange => F3rc,
            Goto => F10t,
            IfEq | IfNe | IfLt | IfGe | IfGt | IfLe => F22t,
            IfEqz | IfNez | IfLtz | IfGez | IfGtz | IfLez => F21t,
            AddInt | SubInt | MulInt | DivInt | RemInt | AddLong | SubLong | MulLong | DivLong
            | RemLong | AddFloat | SubFloat | MulFloat | DivFloat | RemFloat | AddDouble
            | SubDouble | MulDouble | DivDouble | RemDouble => F23x,
            InvokeVirtual | InvokeSuper | InvokeDirect | InvokeStatic | InvokeInterface => F35c,
            InvokeVirtualRange | InvokeSuperRange | InvokeDirectRange | InvokeStaticRange
            | InvokeInterfaceRange => F3rc,
            LoadParam | LoadParamWide | LoadParamObject => FPseudo,
        }
    }

    /// Bit width of the destination register slot. Zero when the opcode has
    /// no destination.
    #[must_use]
    pub fn dest_bit_width(self) -> u8 {
        match self.format() {
            F11n | F12x => 4,
            F11x | F21c | F21s | F22x | F23x | F31i | F51l => 8,
            F32x | FPseudo => 16,
            F10x | F10t | F21t | F22t | F35c | F3rc => 0,
        }
    }

    /// Bit width of source register slot `i`.
    #[must_use]
    pub fn src_bit_width(self, _i: usize) -> u8 {
        match self.format() {
            F12x | F22t | F35c => 4,
            F11x | F21c | F21t | F23x => 8,
            F22x | F32x | F3rc => 16,
            F10x | F10t | F11n | F21s | F31i | F51l | FPseudo => 16,
        }
    }

    /// True for every move between registers (not move-result).
    #[must_use]
    pub fn is_move(self) -> bool {
        matches!(
            self,
            Move | MoveFrom16
                | Move16
                | MoveWide
                | MoveWideFrom16
                | MoveWide16
                | MoveObject
                | MoveObjectFrom16
                | MoveObject16
        )
    }

    /// True for move-result variants (not move-exception).
    #[must_use]
    pub fn is_move_result(self) -> bool {
        matches!(self, MoveResult | MoveResultWide | MoveResultObject)
    }

    /// True for every invoke, range or not.
    #[must_use]
    pub fn is_invoke(self) -> bool {
        matches!(
            self,
            InvokeVirtual
                | InvokeSuper
                | InvokeDirect
                | InvokeStatic
                | InvokeInterface
                | InvokeVirtualRange
                | InvokeSuperRange
                | InvokeDirectRange
                | InvokeStaticRange
                | InvokeInterfaceRange
        )
    }

    /// True for invoke-static and its range form, which carry no implicit
    /// `this` argument.
    #[must_use]
    pub fn is_invoke_static(self) -> bool {
        matches!(self, InvokeStatic | InvokeStaticRange)
    }

    /// True when the opcode is encoded in contiguous-operand (range) form.
    #[must_use]
    pub fn has_range(self) -> bool {
        matches!(
            self,
            FilledNewArrayRange
                | InvokeVirtualRange
                | InvokeSuperRange
                | InvokeDirectRange
                | InvokeStaticRange
                | InvokeInterfaceRange
        )
    }

    /// True when a range form of this opcode exists.
    #[must_use]
    pub fn has_range_form(self) -> bool {
        self.range_version().is_some()
    }

    /// The range form of this opcode, when one exists.
    #[must_use]
    pub fn range_version(self) -> Option<Opcode> {
        match self {
            InvokeVirtual => Some(InvokeVirtualRange),
            InvokeSuper => Some(InvokeSuperRange),
            InvokeDirect => Some(InvokeDirectRange),
            InvokeStatic => Some(InvokeStaticRange),
            InvokeInterface => Some(InvokeInterfaceRange),
            FilledNewArray => Some(FilledNewArrayRange),
            _ => None,
        }
    }

    /// True for goto and conditional branches.
    #[must_use]
    pub fn is_branch(self) -> bool {
        self == Goto || self.is_conditional_branch()
    }

    /// True for the if-test family.
    #[must_use]
    pub fn is_conditional_branch(self) -> bool {
        matches!(
            self,
            IfEq | IfNe | IfLt | IfGe | IfGt | IfLe | IfEqz | IfNez | IfLtz | IfGez | IfGtz | IfLez
        )
    }

    /// True for unconditional goto.
    #[must_use]
    pub fn is_goto(self) -> bool {
        self == Goto
    }

    /// True for the return family.
    #[must_use]
    pub fn is_return(self) -> bool {
        matches!(self, ReturnVoid | Return | ReturnWide | ReturnObject)
    }

    /// True when executing the instruction can transfer control to a catch
    /// handler.
    #[must_use]
    pub fn may_throw(self) -> bool {
        self.is_invoke()
            || matches!(
                self,
                CheckCast
                    | NewInstance
                    | FilledNewArray
                    | FilledNewArrayRange
                    | ConstString
                    | ConstClass
                    | Throw
                    | DivInt
                    | RemInt
                    | DivLong
                    | RemLong
            )
    }

    /// True for the parameter-loading pseudo-instructions.
    #[must_use]
    pub fn is_load_param(self) -> bool {
        matches!(self, LoadParam | LoadParamWide | LoadParamObject)
    }

    /// True when the instruction writes the hidden result register (read by
    /// a following move-result).
    #[must_use]
    pub fn writes_result_register(self) -> bool {
        self.is_invoke() || matches!(self, FilledNewArray | FilledNewArrayRange)
    }

    /// True for binops with a compact two-address encoding.
    #[must_use]
    pub fn has_2addr_form(self) -> bool {
        self >= AddInt && self <= RemDouble
    }
}

/// Largest value encodable in `bits` bits.
#[must_use]
pub fn max_unsigned_value(bits: u8) -> u32 {
    if bits >= 32 {
        u32::MAX
    } else {
        (1u32 << bits) - 1
    }
}


impl Opcode {
    #[cfg(test)]
    fn dests_size_hint(self) -> usize {
        usize::from(self.dest_bit_width() > 0)
    }
}
