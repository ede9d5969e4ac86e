use std::time::Instant;

use anyhow::{Context, Result, bail};

use bvsim::{ServeSchedule, SimOptions, TeamId, TeamStats, simulate, single_rally};

struct Args {
    rallies: u64,
    seed: u64,
    alternate: bool,
    trace: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        rallies: 100_000,
        seed: 42,
        alternate: false,
        trace: false,
    };

    let raw: Vec<String> = std::env::args().skip(1).collect();
    let mut i = 0;
    while i < raw.len() {
        match raw[i].as_str() {
            "--rallies" => {
                i += 1;
                let value = raw.get(i).context("--rallies needs a value")?;
                args.rallies = value.parse().with_context(|| format!("bad --rallies {value}"))?;
            }
            "--seed" => {
                i += 1;
                let value = raw.get(i).context("--seed needs a value")?;
                args.seed = value.parse().with_context(|| format!("bad --seed {value}"))?;
            }
            "--alternate" => args.alternate = true,
            "--trace" => args.trace = true,
            "--help" | "-h" => {
                println!("Usage: simulate [--rallies N] [--seed S] [--alternate] [--trace]");
                println!();
                println!("Options:");
                println!("  --rallies N   Number of rallies to simulate (default: 100000)");
                println!("  --seed S      Master RNG seed (default: 42)");
                println!("  --alternate   Loser of each rally serves the next one");
                println!("  --trace       Print one full rally trajectory first");
                std::process::exit(0);
            }
            other => bail!("unknown argument: {other}"),
        }
        i += 1;
    }
    Ok(args)
}

fn main() -> Result<()> {
    let args = parse_args()?;
    let team_a = TeamStats::default();
    let team_b = TeamStats::default();

    if args.trace {
        let outcome = single_rally(&team_a, &team_b, TeamId::A, args.seed)?;
        println!("Sample rally ({} contacts, {:?} win):", outcome.contacts, outcome.winner);
        for state in outcome.trajectory.as_deref().unwrap_or_default() {
            println!("  {state:?}");
        }
        println!();
    }

    let schedule = if args.alternate {
        ServeSchedule::LoserServes { first: TeamId::A }
    } else {
        ServeSchedule::FixedServer(TeamId::A)
    };

    println!("Simulating {} rallies (seed {})...", args.rallies, args.seed);
    let start = Instant::now();
    let result = simulate(
        &team_a,
        &team_b,
        args.rallies,
        args.seed,
        schedule,
        &SimOptions::default(),
    )?;
    let total = start.elapsed();

    let per_rally_us = result.elapsed.as_secs_f64() * 1e6 / result.n as f64;
    let throughput = result.n as f64 / result.elapsed.as_secs_f64();

    println!("  Elapsed:     {:.1} ms", result.elapsed.as_secs_f64() * 1000.0);
    println!("  Per rally:   {per_rally_us:.2} \u{00b5}s");
    println!("  Throughput:  {throughput:.0} rallies/sec");
    println!();
    println!("Results:");
    println!("  Team A wins: {} ({:.3})", result.wins_a, result.p_a_win);
    println!("  Team B wins: {} ({:.3})", result.wins_b, 1.0 - result.p_a_win);
    println!("  95% CI:      [{:.4}, {:.4}]", result.ci_low, result.ci_high);
    println!("  Total time:  {:.1} ms", total.as_secs_f64() * 1000.0);

    Ok(())
}
