//! The nullness lattice and its per-opcode transfer.
//!
//! ```text
//!          Top (Nullable)
//!         /      \
//!       Null    NotNull
//!         \      /
//!          Bottom
//! ```
//!
//! Tracks, per register, whether a reference value is definitely null,
//! definitely not null, or unknown.

use crate::analysis::domain::{Domain, SimpleValueAbstractDomain};
use crate::analysis::HashedAbstractEnvironment;
use crate::ir::{IrInstruction, Opcode, Reg};

/// The two proper elements of the lattice; Nullable and Bottom come from the
/// domain sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nullness {
    /// Definitely the null reference.
    IsNull,
    /// Definitely a non-null reference.
    NotNull,
}

/// The 4-element nullness domain.
pub type NullnessDomain = SimpleValueAbstractDomain<Nullness>;

/// Register environment for nullness analysis.
pub type NullnessEnvironment = HashedAbstractEnvironment<Reg, NullnessDomain>;

/// Forward transfer of one instruction over a nullness environment.
pub fn analyze_instruction(insn: &IrInstruction, env: &mut NullnessEnvironment) {
    use Opcode::*;
    match insn.opcode() {
        Const4 | Const16 | Const => {
            if let Some(dest) = insn.dest() {
                // The zero constant doubles as the null reference.
                let value = if insn.literal() == 0 {
                    NullnessDomain::of(Nullness::IsNull)
                } else {
                    NullnessDomain::of(Nullness::NotNull)
                };
                env.set(dest, value);
            }
        }
        ConstString | ConstClass | NewInstance => {
            if let Some(dest) = insn.dest() {
                env.set(dest, NullnessDomain::of(Nullness::NotNull));
            }
        }
        MoveException => {
            if let Some(dest) = insn.dest() {
                env.set(dest, NullnessDomain::of(Nullness::NotNull));
            }
        }
        op if op.is_move() => {
            if let Some(dest) = insn.dest() {
                let value = env.get(&insn.src(0));
                env.set(dest, value);
            }
        }
        CheckCast => {
            // check-cast passes null through, so the incoming value stands.
        }
        _ => {
            // Any other def loses the information.
            if let Some(dest) = insn.dest() {
                env.set(dest, NullnessDomain::top());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::Domain;

    fn const_insn(dest: Reg, literal: i64) -> IrInstruction {
        let mut insn = IrInstruction::new(Opcode::Const16);
        insn.set_dest(dest);
        insn.set_literal(literal);
        insn
    }

    #[test]
    fn test_lattice_shape() {
        let null = NullnessDomain::of(Nullness::IsNull);
        let not_null = NullnessDomain::of(Nullness::NotNull);
        let mut join = null.clone();
        join.join_with(&not_null);
        assert!(Domain::is_top(&join)); // Nullable
        let mut meet = null.clone();
        meet.meet_with(&not_null);
        assert!(meet.is_bottom());
        assert!(null.leq(&NullnessDomain::top()));
        assert!(NullnessDomain::bottom().leq(&not_null));
    }

    #[test]
    fn test_transfer() {
        let mut env = NullnessEnvironment::top();
        analyze_instruction(&const_insn(0, 0), &mut env);
        assert_eq!(env.get(&0).concrete(), Some(&Nullness::IsNull));
        analyze_instruction(&const_insn(1, 7), &mut env);
        assert_eq!(env.get(&1).concrete(), Some(&Nullness::NotNull));

        let mut mv = IrInstruction::new(Opcode::MoveObject);
        mv.set_dest(2);
        mv.set_srcs(vec![0]);
        analyze_instruction(&mv, &mut env);
        assert_eq!(env.get(&2).concrete(), Some(&Nullness::IsNull));

        let mut new_inst = IrInstruction::new(Opcode::NewInstance);
        new_inst.set_dest(0);
        analyze_instruction(&new_inst, &mut env);
        assert_eq!(env.get(&0).concrete(), Some(&Nullness::NotNull));
    }
}
