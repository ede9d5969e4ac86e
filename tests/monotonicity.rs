use bvsim::{
    AttributionConfig, ModelKind, ServeSchedule, SimOptions, TeamId, TeamStats, attribute,
    simulate,
};

const N: u64 = 20_000;
/// 3 x the standard error of a difference of two independent proportions at
/// N = 20000: improving an input may not *decrease* the win probability by
/// more than noise.
const TOLERANCE: f64 = 0.015;

fn p_win(team_a: &TeamStats, schedule: ServeSchedule, seed: u64) -> f64 {
    simulate(
        team_a,
        &TeamStats::default(),
        N,
        seed,
        schedule,
        &SimOptions::default(),
    )
    .unwrap()
    .p_a_win
}

fn assert_non_decreasing(base: f64, improved: f64, label: &str) {
    assert!(
        improved >= base - TOLERANCE,
        "{label}: improving the input dropped p_a_win from {base} to {improved}"
    );
}

#[test]
fn more_aces_never_hurt() {
    let schedule = ServeSchedule::FixedServer(TeamId::A);
    let base = p_win(&TeamStats::default(), schedule, 42);
    let better = TeamStats {
        ace: 0.15,
        ..TeamStats::default()
    };
    assert_non_decreasing(base, p_win(&better, schedule, 43), "ace");
}

#[test]
fn more_kills_never_hurt() {
    let schedule = ServeSchedule::FixedServer(TeamId::A);
    let base = p_win(&TeamStats::default(), schedule, 42);
    let better = TeamStats {
        kill: 0.50,
        ..TeamStats::default()
    };
    assert_non_decreasing(base, p_win(&better, schedule, 43), "kill");
}

#[test]
fn better_digging_never_hurts() {
    let schedule = ServeSchedule::FixedServer(TeamId::A);
    let base = p_win(&TeamStats::default(), schedule, 42);
    let better = TeamStats {
        dig: 0.65,
        ..TeamStats::default()
    };
    assert_non_decreasing(base, p_win(&better, schedule, 43), "dig");
}

#[test]
fn better_blocking_never_hurts() {
    let schedule = ServeSchedule::FixedServer(TeamId::A);
    let base = p_win(&TeamStats::default(), schedule, 42);
    let better = TeamStats {
        block_kill: 0.20,
        ..TeamStats::default()
    };
    assert_non_decreasing(base, p_win(&better, schedule, 43), "block_kill");
}

#[test]
fn better_reception_never_hurts() {
    // Reception is read on the receiving side, so alternate serves.
    let schedule = ServeSchedule::LoserServes { first: TeamId::A };
    let base = p_win(&TeamStats::default(), schedule, 42);
    // Perfect receptions up, row renormalized to stay a distribution.
    let better = TeamStats {
        perfect: 0.40 / 1.10,
        good: 0.50 / 1.10,
        poor: 0.15 / 1.10,
        reception_error: 0.05 / 1.10,
        ..TeamStats::default()
    };
    assert_non_decreasing(base, p_win(&better, schedule, 43), "perfect");
}

#[test]
fn marginal_impact_sign_matches_direct_simulation() {
    // The reported per-unit impact of the strongest serve feature must agree
    // in sign with two large independent runs at the shifted baselines.
    let base = TeamStats::default();
    let report = attribute(
        &base,
        &base,
        &AttributionConfig {
            r_design_points: 200,
            m_rallies_per_point: 40,
            master_seed: 9,
            model: ModelKind::Logistic,
            ..AttributionConfig::default()
        },
    )
    .unwrap();

    let a_ace = report
        .importances
        .iter()
        .find(|f| f.feature == "a_ace")
        .expect("a_ace is a tracked feature");

    let shifted = TeamStats {
        ace: base.ace + 0.05,
        ..base
    };
    let schedule = ServeSchedule::FixedServer(TeamId::A);
    let opts = SimOptions::default();
    let p_base = simulate(&base, &base, 50_000, 1001, schedule, &opts)
        .unwrap()
        .p_a_win;
    let p_shifted = simulate(&shifted, &base, 50_000, 1002, schedule, &opts)
        .unwrap()
        .p_a_win;

    let simulated_direction = p_shifted - p_base;
    assert!(simulated_direction > 0.0);
    assert!(
        f64::from(a_ace.marginal_impact_per_unit) * simulated_direction > 0.0,
        "marginal impact {} disagrees with simulated shift {}",
        a_ace.marginal_impact_per_unit,
        simulated_direction
    );
}
