//! Dispatch benchmarks: implementation-list walk with and without a tuned
//! plan, and full registry snapshots of growing size.

use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use primkit::primkit_kernels::jit_template;
use primkit::primkit_planner::{signature, PlanRegistryEntry};
use primkit::{DataType, HwDescriptor, OpKind, PlanRegistry, PrimitiveEngine, Problem, SimEngine, TensorMeta};

fn hw() -> HwDescriptor {
    HwDescriptor::preset("xe_hpc").unwrap()
}

fn matmul(m: usize, n: usize, k: usize) -> Problem {
    let md = |s: &[usize]| TensorMeta::plain(s, DataType::F32).unwrap();
    Problem::builder(OpKind::Matmul, hw())
        .src(md(&[m, k]))
        .wei(md(&[k, n]))
        .dst(md(&[m, n]))
        .build()
        .unwrap()
}

fn entry_for(p: &Problem, score_ns: f64) -> PlanRegistryEntry {
    PlanRegistryEntry {
        sig: signature(p),
        op: p.op(),
        desc: jit_template(p.op(), p.hw()).unwrap(),
        hw: p.hw().fingerprint(),
        score_ns,
        gflops: 1.0,
        seed: 0,
        timestamp: 0,
    }
}

fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");
    let device = Arc::new(SimEngine::new(hw()));

    for &(m, n, k) in &[(64, 64, 64), (512, 512, 512), (4096, 4096, 1024)] {
        let p = matmul(m, n, k);
        let untuned = PrimitiveEngine::untuned(device.clone());
        let mut reg = PlanRegistry::in_memory();
        reg.upsert(entry_for(&p, 100.0));
        let tuned = PrimitiveEngine::new(device.clone(), &reg);

        let label = format!("{m}x{n}x{k}");
        group.bench_with_input(BenchmarkId::new("heuristic", &label), &p, |b, p| {
            b.iter(|| untuned.create_primitive(black_box(p)).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("registry", &label), &p, |b, p| {
            b.iter(|| tuned.create_primitive(black_box(p)).unwrap());
        });
    }
    group.finish();
}

fn bench_fallback(c: &mut Criterion) {
    // f32 src with s8 weights: every entry declines.
    let md = |s: &[usize], dt| TensorMeta::plain(s, dt).unwrap();
    let p = Problem::builder(OpKind::Matmul, hw())
        .src(md(&[64, 64], DataType::F32))
        .wei(md(&[64, 64], DataType::S8))
        .dst(md(&[64, 64], DataType::F32))
        .build()
        .unwrap();
    let engine = PrimitiveEngine::untuned(Arc::new(SimEngine::new(hw())));
    c.bench_function("dispatch_miss", |b| {
        b.iter(|| engine.create_primitive(black_box(&p)).unwrap_err());
    });
}

fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_snapshot");
    let p = matmul(64, 64, 64);

    for &count in &[16usize, 256, 4096] {
        let mut reg = PlanRegistry::in_memory();
        for i in 0..count {
            let mut e = entry_for(&p, 1.0 + i as f64);
            e.sig = format!("{i:032x}");
            reg.upsert(e);
        }
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &reg, |b, reg| {
            b.iter(|| black_box(reg.snapshot()));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_dispatch, bench_fallback, bench_snapshot);
criterion_main!(benches);
