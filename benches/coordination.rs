//! Hot-path benchmarks: execution window toggling, queue drains, and the
//! uncontended exclusive section.

use criterion::{criterion_group, criterion_main, Criterion};
use ember_cpus::{CpuRegistry, Vcpu};

fn bench_exec_window(c: &mut Criterion) {
    let registry = CpuRegistry::new();
    let cpu = Vcpu::new(|| {});
    registry.add(&cpu);

    c.bench_function("exec_window", |b| {
        b.iter(|| {
            registry.exec_start(&cpu);
            registry.exec_end(&cpu);
        })
    });
}

fn bench_enqueue_drain(c: &mut Criterion) {
    let registry = CpuRegistry::new();
    let cpu = Vcpu::new(|| {});
    registry.add(&cpu);

    c.bench_function("enqueue_drain_64", |b| {
        b.iter(|| {
            for _ in 0..64 {
                registry.async_run_on_cpu_no_bql(&cpu, |_| {});
            }
            registry.drain_work(&cpu);
        })
    });
}

fn bench_exclusive_section(c: &mut Criterion) {
    let registry = CpuRegistry::new();

    c.bench_function("exclusive_section", |b| {
        b.iter(|| {
            registry.start_exclusive();
            registry.end_exclusive();
        })
    });
}

criterion_group!(
    benches,
    bench_exec_window,
    bench_enqueue_drain,
    bench_exclusive_section
);
criterion_main!(benches);
