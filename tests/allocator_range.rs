//! Range promotion under register pressure: a 6-operand invoke among 20
//! interfering registers must go to range form, land on a contiguous base,
//! and leave the parameters at the tail of the frame.

use dexopt::analysis::{ControlFlowGraph, LivenessFixpointIterator};
use dexopt::ir::opcode::max_unsigned_value;
use dexopt::ir::{IrCode, IrInstruction, Opcode, Reg};
use dexopt::regalloc::Allocator;

fn const_insn(dest: Reg) -> IrInstruction {
    let mut insn = IrInstruction::new(Opcode::Const16);
    insn.set_dest(dest);
    insn
}

// 20 registers: v18/v19 are parameters, v0..v17 locals; everything is live
// across a 6-operand static invoke.
fn pressured_method() -> IrCode {
    let mut code = IrCode::new(20);
    for param in [18, 19] {
        let mut lp = IrInstruction::new(Opcode::LoadParam);
        lp.set_dest(param);
        code.push_insn(lp);
    }
    for reg in 0..18 {
        code.push_insn(const_insn(reg));
    }
    let mut invoke = IrInstruction::new(Opcode::InvokeStatic);
    invoke.set_srcs(vec![0, 1, 2, 3, 4, 5]);
    code.push_insn(invoke);
    // Keep every register live past the invoke.
    for reg in (0..20).step_by(2) {
        let mut add = IrInstruction::new(Opcode::AddInt);
        add.set_dest(reg);
        add.set_srcs(vec![reg, reg + 1]);
        code.push_insn(add);
    }
    code.push_insn(IrInstruction::new(Opcode::ReturnVoid));
    code
}

fn find_invoke(code: &IrCode) -> (usize, IrInstruction) {
    code.iter_insns()
        .find(|(_, insn)| insn.opcode().is_invoke())
        .map(|(pos, insn)| (pos, insn.clone()))
        .expect("invoke present")
}

#[test]
fn invoke_is_promoted_to_range_with_contiguous_operands() {
    let mut code = pressured_method();
    let mut allocator = Allocator::new();
    allocator.allocate(&mut code);

    let (_, invoke) = find_invoke(&code);
    // (a) promoted to the contiguous-operand form
    assert_eq!(invoke.opcode(), Opcode::InvokeStaticRange);
    // (b) operands are contiguous in source order
    let srcs = invoke.srcs();
    assert_eq!(srcs.len(), 6);
    for window in srcs.windows(2) {
        assert_eq!(window[1], window[0] + 1, "range operands not contiguous");
    }
}

#[test]
fn params_stay_at_the_frame_tail() {
    let mut code = pressured_method();
    let mut allocator = Allocator::new();
    allocator.allocate(&mut code);

    let params: Vec<Reg> = code
        .param_instruction_positions()
        .into_iter()
        .map(|pos| code.insn_at(pos).unwrap().dest().unwrap())
        .collect();
    let size = code.registers_size();
    assert_eq!(params, vec![size - 2, size - 1]);
}

#[test]
fn every_assignment_respects_slot_widths() {
    let mut code = pressured_method();
    let mut allocator = Allocator::new();
    allocator.allocate(&mut code);

    for (_, insn) in code.iter_insns() {
        if let Some(dest) = insn.dest() {
            assert!(
                dest <= max_unsigned_value(insn.opcode().dest_bit_width()),
                "dest v{dest} overflows its slot in {:?}",
                insn.opcode()
            );
        }
        if insn.opcode().has_range() {
            continue;
        }
        for i in 0..insn.srcs_size() {
            assert!(
                insn.src(i) <= max_unsigned_value(insn.opcode().src_bit_width(i)),
                "src v{} overflows its slot in {:?}",
                insn.src(i),
                insn.opcode()
            );
        }
    }
}

#[test]
fn range_operands_do_not_collide_with_other_live_registers() {
    let mut code = pressured_method();
    let mut allocator = Allocator::new();
    allocator.allocate(&mut code);

    let cfg = ControlFlowGraph::build(&code);
    let mut liveness = LivenessFixpointIterator::new(code.registers_size());
    liveness.run(&code, &cfg);

    let (invoke_pos, invoke) = find_invoke(&code);
    let block = cfg
        .blocks()
        .iter()
        .find(|b| b.start <= invoke_pos && invoke_pos < b.end)
        .expect("invoke block");

    // Replay liveness to the point just after the invoke; anything live
    // there that is not an operand must sit outside the operand span.
    let mut live = liveness.live_out_at(block.id).clone();
    let insns: Vec<(usize, IrInstruction)> = cfg
        .block_insns(&code, block.id)
        .map(|(pos, insn)| (pos, insn.clone()))
        .collect();
    for (pos, insn) in insns.into_iter().rev() {
        if pos == invoke_pos {
            break;
        }
        liveness.analyze_instruction(&insn, &mut live);
    }
    let base = invoke.src(0);
    let span = base..base + invoke.srcs_size() as Reg;
    for reg in live.elements() {
        if invoke.srcs().contains(&reg) || reg >= code.registers_size() {
            continue;
        }
        assert!(
            !span.contains(&reg),
            "live v{reg} collides with the range span {span:?}"
        );
    }
}

#[test]
fn moves_loading_range_spills_precede_the_invoke() {
    let mut code = pressured_method();
    let mut allocator = Allocator::new();
    allocator.allocate(&mut code);

    let (invoke_pos, invoke) = find_invoke(&code);
    // Any move directly in front of the invoke feeds one of its operands.
    let mut pos = invoke_pos;
    while pos > 0 {
        pos -= 1;
        let Some(insn) = code.insn_at(pos) else { break };
        if !insn.opcode().is_move() {
            break;
        }
        let dest = insn.dest().expect("moves have a dest");
        assert!(
            invoke.srcs().contains(&dest),
            "move before invoke writes v{dest}, which is not an operand"
        );
    }
}
