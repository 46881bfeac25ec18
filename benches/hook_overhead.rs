//! Hook overhead benchmark
//!
//! The entry and exit hooks run on every system call of the measured
//! workload, so their cost is added to every call we report. This measures:
//!
//! 1. `sys_enter` alone (slot store)
//! 2. an enter/exit pair (slot store, counter credit, slot clear)
//! 3. an early discard (out-of-scope caller)
//! 4. a full snapshot + merge, as done at each checkpoint
//!
//! # Run Instructions
//!
//! ```bash
//! cargo bench --bench hook_overhead
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use scbench::engine::{Engine, PidTgid, ProbeConfig, SysEnter, SysExit};

const ROOT: u32 = 4242;
const GETPID: i64 = 39;

fn engine(num_cpus: usize) -> Engine {
    Engine::attach(ProbeConfig::new(1, num_cpus).with_target(ROOT)).expect("attach")
}

fn enter_event(cpu: u32, tgid: u32, ktime_ns: u64) -> SysEnter {
    SysEnter {
        cpu,
        caller: PidTgid::new(tgid, tgid),
        ktime_ns,
        id: GETPID,
    }
}

fn exit_event(cpu: u32, tgid: u32, ktime_ns: u64) -> SysExit {
    SysExit {
        cpu,
        caller: PidTgid::new(tgid, tgid),
        ktime_ns,
        id: GETPID,
        ret: tgid as i64,
    }
}

fn bench_sys_enter(c: &mut Criterion) {
    let engine = engine(4);
    let mut t = 0u64;
    c.bench_function("sys_enter", |b| {
        b.iter(|| {
            t += 1;
            black_box(engine.sys_enter(black_box(&enter_event(0, ROOT, t))))
        })
    });
}

fn bench_enter_exit_pair(c: &mut Criterion) {
    let engine = engine(4);
    let mut t = 0u64;
    c.bench_function("enter_exit_pair", |b| {
        b.iter(|| {
            t += 2;
            engine.sys_enter(black_box(&enter_event(1, ROOT, t)));
            black_box(engine.sys_exit(black_box(&exit_event(1, ROOT, t + 1))))
        })
    });
}

fn bench_out_of_scope(c: &mut Criterion) {
    let engine = engine(4);
    c.bench_function("sys_enter_out_of_scope", |b| {
        b.iter(|| black_box(engine.sys_enter(black_box(&enter_event(2, ROOT + 1, 0)))))
    });
}

fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot_merge");
    for num_cpus in [1usize, 8, 64] {
        let engine = engine(num_cpus);
        for cpu in 0..num_cpus as u32 {
            engine.sys_enter(&enter_event(cpu, ROOT, 0));
            engine.sys_exit(&exit_event(cpu, ROOT, 10));
        }
        group.bench_with_input(BenchmarkId::from_parameter(num_cpus), &engine, |b, engine| {
            b.iter(|| black_box(engine.counters().snapshot().merge()))
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_sys_enter,
    bench_enter_exit_pair,
    bench_out_of_scope,
    bench_snapshot
);
criterion_main!(benches);
