use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use gridhunt_core::{CellPos, Faction, FactionParams, GridHuntConfig, WorldState};
use std::time::Duration;

fn build_world(agents: usize) -> WorldState {
    let config = GridHuntConfig {
        world_width: 512,
        world_depth: 512,
        rng_seed: Some(0xBEEF),
        pursuer: FactionParams {
            starting_health: 100.0,
            attack_damage: 10.0,
            turn_delay: 1,
        },
        prey: FactionParams {
            starting_health: 100.0,
            attack_damage: 5.0,
            turn_delay: 0,
        },
        vision_distance: 10,
        hearing_distance: 16,
        audible_decay_ticks: 20,
        history_capacity: 1,
        persistence_interval: 0,
        ..GridHuntConfig::default()
    };
    let mut world = WorldState::new(config).expect("world");

    // Scatter a block pattern of obstacles.
    let mut obstacles = Vec::new();
    for bx in (32..480).step_by(64) {
        for bz in (32..480).step_by(64) {
            for dx in 0..4 {
                for dz in 0..4 {
                    obstacles.push(CellPos::new(bx + dx, bz + dz));
                }
            }
        }
    }
    let blocked: std::collections::HashSet<CellPos> = obstacles.iter().copied().collect();
    world.set_obstacles(obstacles);

    // Deterministic scatter on distinct free cells; one pursuer per three prey.
    let mut placed = 0usize;
    let mut seed = 0i32;
    while placed < agents {
        let x = (seed * 7) % 512;
        let z = (seed * 13 + seed / 512) % 512;
        seed += 1;
        let cell = CellPos::new(x, z);
        if blocked.contains(&cell) {
            continue;
        }
        let faction = if placed % 4 == 0 {
            Faction::Pursuer
        } else {
            Faction::Prey
        };
        world.spawn_agent(faction, cell);
        placed += 1;
    }
    world
}

fn bench_world_steps(c: &mut Criterion) {
    let mut group = c.benchmark_group("world_step");
    group.sample_size(20);
    group.warm_up_time(Duration::from_secs(2));
    group.measurement_time(Duration::from_secs(8));

    let steps = 16;
    for &agents in &[2_000_usize, 10_000] {
        group.bench_function(format!("steps{steps}_agents{agents}"), |b| {
            b.iter_batched(
                || build_world(agents),
                |mut world| {
                    for _ in 0..steps {
                        world.step();
                    }
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_world_steps);
criterion_main!(benches);
