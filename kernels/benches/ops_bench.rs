use criterion::{criterion_group, criterion_main, Criterion};
use meshccl_kernels::{cpu_accumulate, cpu_concat, cpu_reduce_dim, cpu_split, ReduceOp};
use std::hint::black_box;

fn benchmark_split_concat(c: &mut Criterion) {
    let mut group = c.benchmark_group("split_concat");
    let widths = [1280, 4096, 8192];

    for &width in &widths {
        let shape = [1, 1, 32, width];
        let data = vec![1.0f32; 32 * width];

        group.bench_function(format!("split8_{}", width), |b| {
            b.iter(|| cpu_split(black_box(&data), black_box(&shape), 3, 8).unwrap())
        });

        let parts = cpu_split(&data, &shape, 3, 8).unwrap();
        let views: Vec<&[f32]> = parts.iter().map(Vec::as_slice).collect();
        let part_shape = [1, 1, 32, width / 8];
        group.bench_function(format!("concat8_{}", width), |b| {
            b.iter(|| cpu_concat(black_box(&views), black_box(&part_shape), 3).unwrap())
        });
    }
    group.finish();
}

fn benchmark_reduce(c: &mut Criterion) {
    let mut group = c.benchmark_group("reduce");
    let copies = [2, 4, 8];

    for &k in &copies {
        let shape = [k, 1, 32, 1280];
        let data = vec![1.0f32; k * 32 * 1280];
        group.bench_function(format!("reduce_dim0_{}", k), |b| {
            b.iter(|| cpu_reduce_dim(black_box(&data), black_box(&shape), 0, ReduceOp::Sum).unwrap())
        });
    }

    let src = vec![1.0f32; 32 * 1280];
    group.bench_function("accumulate_32x1280", |b| {
        let mut acc = vec![0.0f32; 32 * 1280];
        b.iter(|| cpu_accumulate(black_box(&mut acc), black_box(&src), ReduceOp::Sum).unwrap())
    });
    group.finish();
}

criterion_group!(benches, benchmark_split_concat, benchmark_reduce);
criterion_main!(benches);
