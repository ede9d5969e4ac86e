use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use bvsim::conditional::ConditionalModel;
use bvsim::kernel::{self, RallyState};
use bvsim::rally;
use bvsim::{ServeSchedule, SimOptions, TeamId, TeamStats, simulate};

fn bench_kernel_transition(c: &mut Criterion) {
    let stats = TeamStats::default();
    let model = ConditionalModel::default();

    c.bench_function("kernel_serve_transition", |b| {
        b.iter(|| {
            let dist = kernel::transition(
                black_box(RallyState::ServeAttempt),
                TeamId::A,
                TeamId::A,
                0.0,
                &stats,
                &stats,
                &model,
            )
            .unwrap();
            black_box(dist.len());
        })
    });
}

fn bench_single_rally(c: &mut Criterion) {
    let stats = TeamStats::default().normalized();
    let model = ConditionalModel::default();

    c.bench_function("single_rally", |b| {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        b.iter(|| {
            let outcome = rally::simulate_rally(
                &stats,
                &stats,
                TeamId::A,
                &model,
                &mut rng,
                rally::DEFAULT_FUEL,
                false,
                0.0,
            )
            .unwrap();
            black_box(outcome.winner);
        })
    });
}

fn bench_batch_10k(c: &mut Criterion) {
    let stats = TeamStats::default();
    let opts = SimOptions::default();

    c.bench_function("simulate_10k_rallies", |b| {
        b.iter(|| {
            let result = simulate(
                &stats,
                &stats,
                10_000,
                black_box(42),
                ServeSchedule::FixedServer(TeamId::A),
                &opts,
            )
            .unwrap();
            black_box(result.wins_a);
        })
    });
}

criterion_group!(
    benches,
    bench_kernel_transition,
    bench_single_rally,
    bench_batch_10k
);
criterion_main!(benches);
