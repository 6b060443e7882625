use anyhow::{Result, bail};
use flotilla_core::{Engine, EngineConfig, MatcherStrategy};
use tracing::info;

mod referee;

use referee::{MatchSetup, Referee};

fn main() -> Result<()> {
    init_tracing();
    let setup = parse_args()?;
    info!(
        side = setup.side,
        turns = setup.max_turns,
        seed = setup.seed,
        "starting demo match"
    );
    run_match(setup)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn parse_args() -> Result<MatchSetup> {
    let mut setup = MatchSetup::default();
    let mut args = std::env::args().skip(1);
    while let Some(flag) = args.next() {
        let Some(value) = args.next() else {
            bail!("missing value for {flag}");
        };
        match flag.as_str() {
            "--side" => setup.side = value.parse()?,
            "--turns" => setup.max_turns = value.parse()?,
            "--seed" => setup.seed = value.parse()?,
            other => bail!("unknown flag {other} (expected --side, --turns or --seed)"),
        }
    }
    if setup.side < 8 {
        bail!("--side must be at least 8");
    }
    Ok(setup)
}

/// Pit the two matcher strategies against each other under the local
/// referee and report the final banks.
fn run_match(setup: MatchSetup) -> Result<()> {
    let mut referee = Referee::generate(setup);
    let mut scanner = Engine::new(EngineConfig::default())?;
    let mut descender = Engine::new(EngineConfig {
        matcher: MatcherStrategy::AggregateDescent,
        ..EngineConfig::default()
    })?;

    while !referee.is_over() {
        let plan_a = scanner.plan_turn(&referee.snapshot_for(0))?;
        let plan_b = descender.plan_turn(&referee.snapshot_for(1))?;
        referee.step([&plan_a, &plan_b]);

        if referee.turn() % 50 == 0 {
            info!(
                turn = referee.turn(),
                bank_scan = referee.bank(0),
                bank_descent = referee.bank(1),
                fleet_scan = referee.fleet(0),
                fleet_descent = referee.fleet(1),
                "match progress"
            );
        }
    }

    let (scan, descent) = (referee.bank(0), referee.bank(1));
    let winner = match scan.cmp(&descent) {
        std::cmp::Ordering::Greater => "ranked scan",
        std::cmp::Ordering::Less => "aggregate descent",
        std::cmp::Ordering::Equal => "nobody, a draw",
    };
    info!(scan, descent, winner, "match finished");
    Ok(())
}
