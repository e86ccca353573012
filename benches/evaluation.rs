//! Evaluation Benchmarks
//!
//! Compares compiled functions with hand-written Rust implementations of the same bodies,
//! and measures the one-time cost of building an artifact.
//!
//! ## Groups
//!
//! - **Evaluation**: primal, Jacobian and Hessian of precompiled functions against the
//!   plain `f64` body. Compilation is excluded; functions are made during setup.
//! - **Parallel Evaluation**: `eval_parallel` over batches of inputs.
//! - **Compilation Time**: forced rebuilds (trace, differentiate, lower, link) and cache
//!   hits (lookup and load) for the same blueprint.
//!
//! Run with: `cargo bench --bench evaluation`

use std::hint::black_box;

use autodiff_jit::prelude::*;
use autodiff_jit::testing::random_inputs;
use autodiff_jit::FactoryConfig;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

/// Rosenbrock valley summed over consecutive pairs
struct Rosenbrock;

impl Body for Rosenbrock {
    fn eval<S: Scalar>(&self, x: &[S]) -> Vec<S> {
        let terms: Vec<S> = x
            .windows(2)
            .map(|w| {
                let a = S::one() - w[0].clone();
                let b = w[1].clone() - w[0].powi(2);
                a.powi(2) + b.powi(2) * 100.0
            })
            .collect();
        vec![sum(&terms)]
    }
}

/// Spring forces of a chain of unit masses, parameterised by the stiffness
struct Chain;

impl Body for Chain {
    fn eval<S: Scalar>(&self, input: &[S]) -> Vec<S> {
        let n = input.len() - 1;
        let (x, k) = decompose(input, n);
        (0..n)
            .map(|i| {
                let left = if i == 0 { x[i].clone() } else { x[i].clone() - x[i - 1].clone() };
                let right = if i + 1 == n {
                    S::zero()
                } else {
                    x[i + 1].clone() - x[i].clone()
                };
                (right - left) * k[0].clone() + x[i].sin() * 0.1
            })
            .collect()
    }
}

fn factory(dir: &tempfile::TempDir) -> FunctionFactory {
    FunctionFactory::new(FactoryConfig::default().with_cache_dir(dir.path()))
}

fn benchmark_evaluation(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let factory = factory(&dir);
    let mut group = c.benchmark_group("Evaluation");

    for n in [4, 16, 64] {
        let blueprint =
            Blueprint::new(Rosenbrock, n, 0, "rosenbrock", EnabledDerivatives::HESSIAN).unwrap();
        let function = factory.make(&blueprint, false).unwrap();
        let input = random_inputs(n, 1, 0).remove(0);

        group.bench_with_input(BenchmarkId::new("Direct", n), &input, |b, x| {
            b.iter(|| Rosenbrock.eval::<f64>(black_box(x)))
        });
        group.bench_with_input(BenchmarkId::new("Compiled", n), &input, |b, x| {
            let mut out = [0.0];
            b.iter(|| function.eval_into(black_box(x), &mut out).unwrap())
        });
        group.bench_with_input(BenchmarkId::new("Jacobian", n), &input, |b, x| {
            let mut out = vec![0.0; n];
            b.iter(|| function.jacobian_into(black_box(x), &mut out).unwrap())
        });
        group.bench_with_input(BenchmarkId::new("Hessian", n), &input, |b, x| {
            let mut out = vec![0.0; n * n];
            b.iter(|| function.hessian_into(black_box(x), &mut out).unwrap())
        });
    }

    group.finish();
}

fn benchmark_parallel(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let factory = factory(&dir);
    let n = 32;
    let blueprint = Blueprint::new(Chain, n, 1, "chain", EnabledDerivatives::NONE).unwrap();
    let function = factory.make(&blueprint, false).unwrap();
    let mut group = c.benchmark_group("Parallel Evaluation");

    for batch in [100, 10_000] {
        let inputs = random_inputs(n + 1, batch, 1);
        group.bench_with_input(BenchmarkId::new("Sequential", batch), &inputs, |b, xs| {
            b.iter(|| {
                xs.iter()
                    .map(|x| function.eval(x).unwrap())
                    .collect::<Vec<_>>()
            })
        });
        group.bench_with_input(BenchmarkId::new("Parallel", batch), &inputs, |b, xs| {
            b.iter(|| function.eval_parallel(black_box(xs)).unwrap())
        });
    }

    group.finish();
}

fn benchmark_compilation_time(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let factory = factory(&dir);
    let mut group = c.benchmark_group("Compilation Time");
    group.sample_size(10);

    for n in [4, 16] {
        let blueprint =
            Blueprint::new(Rosenbrock, n, 0, "rosenbrock", EnabledDerivatives::HESSIAN).unwrap();
        group.bench_with_input(BenchmarkId::new("Rebuild", n), &blueprint, |b, bp| {
            b.iter(|| factory.make(bp, true).unwrap())
        });
        group.bench_with_input(BenchmarkId::new("Cache Hit", n), &blueprint, |b, bp| {
            b.iter(|| factory.make(bp, false).unwrap())
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_evaluation,
    benchmark_parallel,
    benchmark_compilation_time
);
criterion_main!(benches);
