//! Scale precompute benchmarks: scalar broadcast and per-channel fusion
//! across the serial/parallel threshold.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use primkit::primkit_kernels::precompute::book_precomputed_scales;
use primkit::primkit_kernels::{precompute_scales, Grantor, Registrar, ScaleData, ScaleParams};
use primkit::primkit_layout::{ArgKey, ScaleEntry, Scales};

fn scales(wei_mask: u32) -> Scales {
    let mut s = Scales::default();
    s.set(ArgKey::SRC, ScaleEntry::common());
    s.set(ArgKey::WEIGHTS, ScaleEntry::per_axis(wei_mask));
    s
}

/// Deterministic weight scales in (0, 2).
fn gen_scales(n: usize) -> Vec<f32> {
    (0..n)
        .map(|i| {
            let v = (i as u32).wrapping_mul(2654435761) >> 16;
            (v % 199 + 1) as f32 / 100.0
        })
        .collect()
}

fn bench_scalar(c: &mut Criterion) {
    let s = scales(0);
    let mut r = Registrar::new();
    book_precomputed_scales(&mut r, &s, 1, 1.0, false).unwrap();
    let reg = r.freeze();
    let mut g = Grantor::new(&reg, None).unwrap();
    let wei = [0.5f32];
    c.bench_function("precompute_scalar", |b| {
        b.iter(|| {
            let out = precompute_scales(
                &mut g,
                Some(&[2.0]),
                Some(ScaleData::F32(black_box(&wei))),
                &s,
                &ScaleParams::default(),
            )
            .unwrap();
            black_box(out[0]);
        });
    });
}

fn bench_per_oc(c: &mut Criterion) {
    let mut group = c.benchmark_group("precompute_per_oc");
    let s = scales(1);

    for &oc in &[64usize, 1024, 4096, 65536] {
        let wei = gen_scales(oc);
        let mut r = Registrar::new();
        book_precomputed_scales(&mut r, &s, oc, 1.0, false).unwrap();
        let reg = r.freeze();
        let mut g = Grantor::new(&reg, None).unwrap();
        let params = ScaleParams {
            oc,
            per_oc: true,
            ..Default::default()
        };
        group.throughput(Throughput::Elements(oc as u64));
        group.bench_with_input(BenchmarkId::from_parameter(oc), &wei, |b, wei| {
            b.iter(|| {
                let out = precompute_scales(&mut g, Some(&[2.0]), Some(ScaleData::F32(wei)), &s, &params)
                    .unwrap();
                black_box(out.len());
            });
        });
    }
    group.finish();
}

fn bench_transpose(c: &mut Criterion) {
    let mut group = c.benchmark_group("precompute_ic_oc_transpose");
    let s = scales(0b11);

    for &(ic, oc) in &[(32usize, 32usize), (256, 256)] {
        let wei = gen_scales(ic * oc);
        let mut r = Registrar::new();
        book_precomputed_scales(&mut r, &s, ic * oc, 1.0, true).unwrap();
        let reg = r.freeze();
        let mut g = Grantor::new(&reg, None).unwrap();
        let params = ScaleParams {
            ic,
            oc,
            per_ic: true,
            per_oc: true,
            transpose: true,
            ..Default::default()
        };
        group.throughput(Throughput::Elements((ic * oc) as u64));
        group.bench_with_input(BenchmarkId::new("f32", format!("{ic}x{oc}")), &wei, |b, wei| {
            b.iter(|| {
                let out = precompute_scales(&mut g, Some(&[1.0]), Some(ScaleData::F32(wei)), &s, &params)
                    .unwrap();
                black_box(out.len());
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_scalar, bench_per_oc, bench_transpose);
criterion_main!(benches);
