//! Microbenchmarks for the hot substrate pieces: Patricia-set merges with
//! and without shared structure, and the liveness fixpoint over a chain of
//! blocks.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use dexopt::analysis::{ControlFlowGraph, LivenessFixpointIterator};
use dexopt::collections::PatriciaTreeSet;
use dexopt::ir::{IrCode, IrInstruction, MethodItemEntry, Opcode};

fn patricia_union(c: &mut Criterion) {
    let base: PatriciaTreeSet<u32> = (0..1024u32).collect();
    let mut shifted = base.clone();
    for k in 1024..1100u32 {
        shifted.insert(k);
    }
    let disjoint: PatriciaTreeSet<u32> = (10_000..11_024u32).collect();

    c.bench_function("patricia_union_shared", |b| {
        b.iter(|| {
            let mut s = base.clone();
            s.union_with(black_box(&shifted));
            black_box(s.len())
        });
    });
    c.bench_function("patricia_union_disjoint", |b| {
        b.iter(|| {
            let mut s = base.clone();
            s.union_with(black_box(&disjoint));
            black_box(s.len())
        });
    });
}

fn chain_method(blocks: usize) -> IrCode {
    let mut code = IrCode::new(16);
    for i in 0..blocks {
        let mut def = IrInstruction::new(Opcode::Const16);
        def.set_dest((i % 16) as u32);
        code.push_insn(def);
        let mut use_it = IrInstruction::new(Opcode::AddInt);
        use_it.set_dest(((i + 1) % 16) as u32);
        use_it.set_srcs(vec![(i % 16) as u32, ((i + 3) % 16) as u32]);
        code.push_insn(use_it);
        let goto = code.push_insn(IrInstruction::new(Opcode::Goto));
        code.push(MethodItemEntry::Target { branch: goto });
    }
    code.push_insn(IrInstruction::new(Opcode::ReturnVoid));
    code
}

fn liveness_fixpoint(c: &mut Criterion) {
    let code = chain_method(200);
    let cfg = ControlFlowGraph::build(&code);
    c.bench_function("liveness_fixpoint_chain", |b| {
        b.iter(|| {
            let mut liveness = LivenessFixpointIterator::new(code.registers_size());
            liveness.run(black_box(&code), black_box(&cfg));
            black_box(liveness.live_in_at(cfg.entry()).len())
        });
    });
}

criterion_group!(benches, patricia_union, liveness_fixpoint);
criterion_main!(benches);
