use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use flotilla_core::{
    Engine, EngineConfig, MatcherStrategy, PlayerId, Position, ShipId, ShipObservation, Structure,
    StructureKind, TurnSnapshot,
};
use std::time::Duration;

/// Deterministic mid-game snapshot: lumpy terrain, the fleet packed into
/// the top rows, an enemy fleet mirrored onto the bottom half.
fn synthetic_snapshot(side: u32, fleet: u32) -> TurnSnapshot {
    let area = (side as usize) * (side as usize);
    let resources = (0..area as u32)
        .map(|idx| {
            let background = idx.wrapping_mul(37) % 211;
            if idx % 13 == 0 {
                background + 600
            } else {
                background
            }
        })
        .collect();

    let mut ships = Vec::with_capacity(fleet as usize * 2);
    for seed in 0..fleet {
        ships.push(ShipObservation {
            id: ShipId(seed),
            owner: PlayerId(0),
            position: Position::new((seed % side) as i32, (seed / side) as i32),
            cargo: seed * 53 % 1_000,
        });
        ships.push(ShipObservation {
            id: ShipId(fleet + seed),
            owner: PlayerId(1),
            position: Position::new(
                (seed % side) as i32,
                (seed / side + side / 2) as i32 % side as i32,
            ),
            cargo: seed * 31 % 1_000,
        });
    }

    TurnSnapshot {
        turn: 120,
        max_turns: 400,
        me: PlayerId(0),
        bank: 5_000,
        width: side,
        height: side,
        resources,
        ships,
        structures: vec![
            Structure {
                owner: PlayerId(0),
                position: Position::new((side / 4) as i32, (side / 2) as i32),
                kind: StructureKind::Shipyard,
            },
            Structure {
                owner: PlayerId(1),
                position: Position::new((3 * side / 4) as i32, (side / 2) as i32),
                kind: StructureKind::Shipyard,
            },
        ],
    }
}

fn bench_plan_turn(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan_turn");
    group.sample_size(30);
    group.warm_up_time(Duration::from_secs(2));
    group.measurement_time(Duration::from_secs(5));

    for &(side, fleet) in &[(32u32, 16u32), (48, 48), (64, 128)] {
        for (label, matcher) in [
            ("scan", MatcherStrategy::RankedScan),
            ("descent", MatcherStrategy::AggregateDescent),
        ] {
            group.bench_function(format!("side{side}_fleet{fleet}_{label}"), |b| {
                b.iter_batched(
                    || {
                        let config = EngineConfig {
                            matcher,
                            ..EngineConfig::default()
                        };
                        let engine = Engine::new(config).expect("engine");
                        (engine, synthetic_snapshot(side, fleet))
                    },
                    |(mut engine, snapshot)| engine.plan_turn(&snapshot).expect("plan"),
                    BatchSize::LargeInput,
                );
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_plan_turn);
criterion_main!(benches);
