//! Benchmarks for factor operations
//!
//! This benchmark suite measures the performance of the core factor algebra:
//! - Factor product (natural join over the union scope)
//! - Sum-out (marginalizing variables away)
//! - Division (conditional tables)
//! - Restriction (masking by evidence)

use cliquetree_inference::{Cardinalities, Evidence, Factor};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::sync::Arc;

/// Create a factor over `vars` with deterministic positive values.
fn create_factor(vars: Vec<usize>, card: &Cardinalities) -> Factor {
    let size: usize = vars.iter().map(|&v| card[v]).product();
    let values: Vec<f64> = (0..size).map(|i| (i as f64 + 1.0) / size as f64).collect();
    Factor::new(vars, card.clone(), values).unwrap()
}

fn uniform_card(num_vars: usize, card: usize) -> Cardinalities {
    Arc::from(vec![card; num_vars])
}

/// Benchmark factor product operations
fn bench_factor_product(c: &mut Criterion) {
    let mut group = c.benchmark_group("factor_product");

    // Disjoint scopes: (X) x (Y)
    let card = uniform_card(3, 2);
    let f1 = create_factor(vec![0], &card);
    let f2 = create_factor(vec![1], &card);
    group.throughput(Throughput::Elements(4));
    group.bench_function("binary_disjoint", |b| {
        b.iter(|| black_box(f1.product(&f2).unwrap()));
    });

    // Overlapping scopes: (X,Y) x (Y,Z)
    let f3 = create_factor(vec![0, 1], &card);
    let f4 = create_factor(vec![1, 2], &card);
    group.throughput(Throughput::Elements(8));
    group.bench_function("binary_overlapping", |b| {
        b.iter(|| black_box(f3.product(&f4).unwrap()));
    });

    for k in [5, 10, 20] {
        let card = uniform_card(3, k);
        let left = create_factor(vec![0, 1], &card);
        let right = create_factor(vec![1, 2], &card);

        group.throughput(Throughput::Elements((k * k * k) as u64));
        group.bench_with_input(
            BenchmarkId::new("large_card", k),
            &(left, right),
            |b, (l, r)| {
                b.iter(|| black_box(l.product(r).unwrap()));
            },
        );
    }

    group.finish();
}

/// Benchmark sum-out and marginalization
fn bench_sum_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("sum_out");

    for num_vars in [4, 8, 12] {
        let card = uniform_card(num_vars, 2);
        let factor = create_factor((0..num_vars).collect(), &card);

        group.throughput(Throughput::Elements(1 << num_vars));
        group.bench_with_input(BenchmarkId::new("first_var", num_vars), &factor, |b, f| {
            b.iter(|| black_box(f.sum_out(0)));
        });
        group.bench_with_input(BenchmarkId::new("last_var", num_vars), &factor, |b, f| {
            b.iter(|| black_box(f.sum_out(num_vars - 1)));
        });
        group.bench_with_input(BenchmarkId::new("keep_half", num_vars), &factor, |b, f| {
            let keep: Vec<usize> = (0..num_vars / 2).collect();
            b.iter(|| black_box(f.marginalize(&keep)));
        });
    }

    group.finish();
}

/// Benchmark division into conditional tables
fn bench_conditional(c: &mut Criterion) {
    let mut group = c.benchmark_group("conditional");

    for k in [2, 5, 10] {
        let card = uniform_card(3, k);
        let joint = create_factor(vec![0, 1, 2], &card);

        group.throughput(Throughput::Elements((k * k * k) as u64));
        group.bench_with_input(BenchmarkId::new("given_two", k), &joint, |b, f| {
            b.iter(|| black_box(f.conditional_on(&[0, 1]).unwrap()));
        });
    }

    group.finish();
}

/// Benchmark restriction by evidence
fn bench_restrict(c: &mut Criterion) {
    let mut group = c.benchmark_group("restrict");

    for num_vars in [4, 8, 12] {
        let card = uniform_card(num_vars, 2);
        let factor = create_factor((0..num_vars).collect(), &card);
        let mut evidence = Evidence::unobserved(num_vars);
        for var in (0..num_vars).step_by(2) {
            evidence.observe(var, 1);
        }

        group.throughput(Throughput::Elements(1 << num_vars));
        group.bench_with_input(
            BenchmarkId::new("half_observed", num_vars),
            &(factor, evidence),
            |b, (f, e)| {
                b.iter(|| black_box(f.restrict(e)));
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_factor_product,
    bench_sum_out,
    bench_conditional,
    bench_restrict,
);
criterion_main!(benches);
