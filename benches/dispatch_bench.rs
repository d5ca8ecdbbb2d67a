//! Expert dispatch benchmarks
//!
//! Compares sorted (contiguous per-expert runs) against unsorted (row-by-row)
//! dispatch across batch sizes that straddle the sort threshold.
//!
//! Run with: cargo bench --bench dispatch_bench
//! With parallel runs: cargo bench --bench dispatch_bench --features parallel

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use switchboard::{Activation, ExpertIndices, SwitchGlu, Tensor3};

fn create_inputs(b: usize, t: usize, k: usize, d: usize, num_experts: usize) -> (Tensor3, ExpertIndices) {
    // Deterministic values for reproducibility
    let x = Tensor3::from_shape_fn((b, t, d), |(bi, ti, j)| {
        ((bi * 131 + ti * 29 + j * 17) % 997) as f32 / 997.0 - 0.5
    });
    let indices = ExpertIndices::from_shape_fn((b, t, k), |(bi, ti, s)| {
        (bi * 7 + ti * 5 + s * 3) % num_experts
    });
    (x, indices)
}

fn bench_dispatch_paths(c: &mut Criterion) {
    let mut group = c.benchmark_group("glu_forward");

    // Token counts representative of prefill batches; K = 2 experts per token.
    for &tokens in &[32usize, 128, 512] {
        let (x, indices) = create_inputs(1, tokens, 2, 64, 8);
        let pairs = tokens * 2;
        group.throughput(Throughput::Elements(pairs as u64));

        let sorted = SwitchGlu::new(64, 256, 8, Activation::Silu, false).with_sort_threshold(1);
        group.bench_with_input(BenchmarkId::new("sorted", tokens), &tokens, |bench, _| {
            bench.iter(|| sorted.forward(black_box(&x), black_box(&indices)).unwrap())
        });

        let unsorted =
            SwitchGlu::new(64, 256, 8, Activation::Silu, false).with_sort_threshold(usize::MAX);
        group.bench_with_input(BenchmarkId::new("unsorted", tokens), &tokens, |bench, _| {
            bench.iter(|| unsorted.forward(black_box(&x), black_box(&indices)).unwrap())
        });
    }

    group.finish();
}

fn bench_quantized_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("glu_forward_quantized");

    let (x, indices) = create_inputs(1, 128, 2, 64, 8);
    let plain = SwitchGlu::new(64, 256, 8, Activation::Silu, false).with_sort_threshold(1);
    let quantized = plain.to_quantized(64, 4).unwrap();

    group.bench_function("f32", |bench| {
        bench.iter(|| plain.forward(black_box(&x), black_box(&indices)).unwrap())
    });
    group.bench_function("q4_g64", |bench| {
        bench.iter(|| quantized.forward(black_box(&x), black_box(&indices)).unwrap())
    });

    group.finish();
}

criterion_group!(benches, bench_dispatch_paths, bench_quantized_dispatch);
criterion_main!(benches);
