//! Benchmarks for the post-hoc reconstruction solve
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use posthoc_ema_rs::{sigma_rel_to_gamma, solve_weights};

// Checkpoint metadata as a training run with two tracked widths and a
// fixed checkpoint cadence would produce it.
fn checkpoint_grid(snapshots: usize) -> (Vec<f64>, Vec<f64>) {
    let gammas = [
        sigma_rel_to_gamma(0.05).unwrap(),
        sigma_rel_to_gamma(0.28).unwrap(),
    ];
    let mut t_i = Vec::new();
    let mut gamma_i = Vec::new();
    for &gamma in &gammas {
        for snapshot in 1..=snapshots {
            t_i.push((snapshot * 1000) as f64);
            gamma_i.push(gamma);
        }
    }
    (t_i, gamma_i)
}

fn bench_width_transform(c: &mut Criterion) {
    c.bench_function("sigma_rel_to_gamma", |b| {
        b.iter(|| black_box(sigma_rel_to_gamma(black_box(0.15)).unwrap()));
    });
}

fn bench_solve_weights_short_run(c: &mut Criterion) {
    let (t_i, gamma_i) = checkpoint_grid(3);
    let target_gamma = sigma_rel_to_gamma(0.15).unwrap();

    c.bench_function("solve_weights_6_checkpoints", |b| {
        b.iter(|| black_box(solve_weights(&t_i, &gamma_i, 3000.0, target_gamma).unwrap()));
    });
}

fn bench_solve_weights_long_run(c: &mut Criterion) {
    // A full retained history: 100 snapshots per profile.
    let (t_i, gamma_i) = checkpoint_grid(100);
    let target_gamma = sigma_rel_to_gamma(0.15).unwrap();

    c.bench_function("solve_weights_200_checkpoints", |b| {
        b.iter(|| black_box(solve_weights(&t_i, &gamma_i, 100_000.0, target_gamma).unwrap()));
    });
}

criterion_group!(
    benches,
    bench_width_transform,
    bench_solve_weights_short_run,
    bench_solve_weights_long_run,
);
criterion_main!(benches);
