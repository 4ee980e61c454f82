use anyhow::{Context, Result};
use gridhunt_core::{CellPos, Faction, GridHuntConfig, WorldState};
use rand::Rng;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{info, warn};

fn main() -> Result<()> {
    init_tracing();
    let ticks = env_u64("GRIDHUNT_TICKS", 2_000)?;
    let mut world = bootstrap_world()?;
    info!(
        pursuers = world.faction_count(Faction::Pursuer),
        prey = world.faction_count(Faction::Prey),
        obstacles = world.obstacles().len(),
        "Starting gridhunt simulation shell"
    );
    run(&mut world, ticks);
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn env_u64(key: &str, default: u64) -> Result<u64> {
    match std::env::var(key) {
        Ok(value) => value
            .parse::<u64>()
            .with_context(|| format!("{key} must be an unsigned integer, got {value:?}")),
        Err(_) => Ok(default),
    }
}

fn bootstrap_world() -> Result<WorldState> {
    let seed = env_u64("GRIDHUNT_SEED", 0xFACA_DE42)?;
    let config = GridHuntConfig {
        rng_seed: Some(seed),
        persistence_interval: 60,
        history_capacity: 600,
        ..GridHuntConfig::default()
    };
    let mut world = WorldState::new(config)?;

    seed_streets(&mut world);
    seed_agents(&mut world);
    Ok(world)
}

/// Lay a simple block grid of obstacles, standing in for the external map
/// generator: square buildings separated by two-cell streets.
fn seed_streets(world: &mut WorldState) {
    let width = world.config().world_width as i32;
    let depth = world.config().world_depth as i32;
    let mut obstacles = Vec::new();
    let block = 6;
    let pitch = block + 2;
    let mut bx = 2;
    while bx + block <= width - 2 {
        let mut bz = 2;
        while bz + block <= depth - 2 {
            for dx in 0..block {
                for dz in 0..block {
                    obstacles.push(CellPos::new(bx + dx, bz + dz));
                }
            }
            bz += pitch;
        }
        bx += pitch;
    }
    world.set_obstacles(obstacles);
}

/// Place the configured populations on distinct free cells, drawing
/// placements from the world's seeded RNG so runs stay reproducible.
fn seed_agents(world: &mut WorldState) {
    let width = world.config().world_width as i32;
    let depth = world.config().world_depth as i32;
    let pursuers = world.config().pursuer_count;
    let prey = world.config().prey_count;
    let blocked: HashSet<CellPos> = world.obstacles().iter().copied().collect();
    let mut taken: HashSet<CellPos> = HashSet::new();

    let mut place = |world: &mut WorldState, faction: Faction, count: u32| {
        let mut remaining = count;
        let mut attempts = 0u32;
        while remaining > 0 {
            attempts += 1;
            if attempts > count.saturating_mul(1_000) {
                warn!(?faction, remaining, "Gave up placing agents on free cells");
                return;
            }
            let x = world.rng().random_range(0..width);
            let z = world.rng().random_range(0..depth);
            let cell = CellPos::new(x, z);
            if blocked.contains(&cell) || !taken.insert(cell) {
                continue;
            }
            world.spawn_agent(faction, cell);
            remaining -= 1;
        }
    };
    place(&mut *world, Faction::Pursuer, pursuers);
    place(&mut *world, Faction::Prey, prey);
}

fn run(world: &mut WorldState, ticks: u64) {
    let cadence = Duration::from_secs_f32(world.config().tick_seconds.max(0.0));
    for _ in 0..ticks {
        let started = Instant::now();
        let events = world.step();

        if events.deaths > 0 || events.conversions > 0 {
            info!(
                tick = events.tick.0,
                deaths = events.deaths,
                conversions = events.conversions,
                "Lifecycle activity"
            );
        }
        if let Some(summary) = world.history().last() {
            if summary.tick == events.tick {
                info!(
                    tick = summary.tick.0,
                    pursuers = summary.pursuer_count,
                    prey = summary.prey_count,
                    committed = summary.moves_committed,
                    frozen = summary.moves_frozen,
                    avg_health = summary.average_health,
                    alarms = summary.audible_events,
                    "Tick summary"
                );
            }
        }

        if world.faction_count(Faction::Prey) == 0 {
            info!(tick = events.tick.0, "All prey converted; stopping");
            return;
        }

        let elapsed = started.elapsed();
        if cadence > elapsed {
            std::thread::sleep(cadence - elapsed);
        }
    }
    info!(ticks, "Configured tick count reached; stopping");
}
