use gridhunt_core::{
    AgentId, CellPos, Faction, FactionParams, GridHuntConfig, MoveStance, PersistenceBatch, Tick,
    TickSummary, WorldPersistence, WorldState,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

fn scenario_config(width: u32, depth: u32) -> GridHuntConfig {
    GridHuntConfig {
        world_width: width,
        world_depth: depth,
        rng_seed: Some(0xDEAD_BEEF),
        pursuer: FactionParams {
            starting_health: 100.0,
            attack_damage: 0.0,
            turn_delay: 0,
        },
        prey: FactionParams {
            starting_health: 100.0,
            attack_damage: 0.0,
            turn_delay: 0,
        },
        vision_distance: 6,
        hearing_distance: 8,
        audible_decay_ticks: 6,
        ..GridHuntConfig::default()
    }
}

fn distance_between(world: &WorldState, a: AgentId, b: AgentId) -> u32 {
    let cell_a = world.snapshot_agent(a).expect("agent a").data.cell;
    let cell_b = world.snapshot_agent(b).expect("agent b").data.cell;
    cell_a.chebyshev_distance(cell_b)
}

#[test]
fn pursuer_closes_on_boundary_pinned_prey() {
    // The prey sits against the far edge, so its flight is blocked and the
    // pursuer's distance must strictly shrink on every active tick until the
    // two are adjacent.
    let mut config = scenario_config(16, 9);
    config.vision_distance = 4;
    config.pursuer.turn_delay = 1;
    config.prey.turn_delay = 1;
    let mut world = WorldState::new(config).expect("world");
    let pursuer = world.spawn_agent(Faction::Pursuer, CellPos::new(5, 5));
    let prey = world.spawn_agent(Faction::Prey, CellPos::new(5, 8));
    assert_eq!(distance_between(&world, pursuer, prey), 3);

    world.step();
    assert_eq!(distance_between(&world, pursuer, prey), 2, "tick 1 is active");
    world.step();
    assert_eq!(distance_between(&world, pursuer, prey), 2, "tick 2 waits out the delay");
    world.step();
    assert_eq!(distance_between(&world, pursuer, prey), 1, "tick 3 closes to adjacency");

    world.step();
    world.step();
    assert_eq!(distance_between(&world, pursuer, prey), 1);
    let runtime = world.agent_runtime(pursuer).expect("runtime");
    assert_eq!(
        runtime.stance,
        MoveStance::Attacking,
        "adjacent target flips the pursuer into attack stance"
    );
}

#[test]
fn blocked_sight_falls_back_to_audible_events() {
    // A wall splits the grid. The near pursuer can never see the prey, but a
    // second pursuer with clear line of sight raises an alarm, and the near
    // one picks up the alarm's target on the following tick.
    let mut world = WorldState::new(scenario_config(12, 12)).expect("world");
    let wall: Vec<CellPos> = (0..12).map(|z| CellPos::new(4, z)).collect();
    world.set_obstacles(wall);
    let deaf_side = world.spawn_agent(Faction::Pursuer, CellPos::new(2, 2));
    let _witness = world.spawn_agent(Faction::Pursuer, CellPos::new(6, 5));
    let _prey = world.spawn_agent(Faction::Prey, CellPos::new(6, 2));

    world.step();
    assert_eq!(world.audible_events().len(), 1, "the witness raises one alarm");
    assert_eq!(world.audible_events()[0].origin, CellPos::new(6, 5));
    assert_eq!(world.audible_events()[0].target, CellPos::new(6, 2));

    world.step();
    let runtime = world.agent_runtime(deaf_side).expect("runtime");
    assert_eq!(runtime.perception.sighted, None, "the wall blocks sight");
    assert_eq!(
        runtime.perception.heard,
        Some(CellPos::new(6, 2)),
        "the alarm's target, not its origin, becomes the pursuit target"
    );
    assert_eq!(runtime.stance, MoveStance::Advancing);
}

#[test]
fn surrounded_prey_converts_on_the_same_tick() {
    let mut config = scenario_config(12, 12);
    config.pursuer.attack_damage = 10.0;
    config.prey.attack_damage = 5.0;
    config.prey.starting_health = 30.0;
    let mut world = WorldState::new(config).expect("world");
    for cell in [
        CellPos::new(4, 5),
        CellPos::new(6, 5),
        CellPos::new(5, 4),
        CellPos::new(5, 6),
    ] {
        world.spawn_agent(Faction::Pursuer, cell);
    }
    let prey = world.spawn_agent(Faction::Prey, CellPos::new(5, 5));

    let events = world.step();

    assert_eq!(events.deaths, 1);
    assert_eq!(events.conversions, 1);
    assert!(!world.agents().contains(prey));
    assert_eq!(world.faction_count(Faction::Prey), 0);
    assert_eq!(world.faction_count(Faction::Pursuer), 5);
    assert_eq!(world.agent_count(), 5, "the dead prey is never double-counted");

    let columns = world.agents().columns();
    assert!(
        columns.cells().contains(&CellPos::new(5, 5)),
        "a pursuer stands on the vacated cell"
    );
    // The four original pursuers each took the prey's counter-damage.
    let wounded = columns
        .health()
        .iter()
        .filter(|&&health| (health - 95.0).abs() < f32::EPSILON)
        .count();
    assert_eq!(wounded, 4);
}

#[test]
fn seeded_runs_replay_identically() {
    let build = || {
        let mut config = scenario_config(32, 32);
        config.pursuer.attack_damage = 10.0;
        config.prey.attack_damage = 5.0;
        config.pursuer.turn_delay = 2;
        config.prey.turn_delay = 1;
        let mut world = WorldState::new(config).expect("world");
        world.set_obstacles(vec![
            CellPos::new(15, 15),
            CellPos::new(15, 16),
            CellPos::new(16, 15),
            CellPos::new(8, 24),
        ]);
        for i in 0..8 {
            world.spawn_agent(Faction::Pursuer, CellPos::new(2 + i * 3, 2));
            world.spawn_agent(Faction::Prey, CellPos::new(2 + i * 3, 28));
            world.spawn_agent(Faction::Prey, CellPos::new(2 + i * 3, 29));
        }
        world
    };

    let mut world_a = build();
    let mut world_b = build();
    for tick in 0..100 {
        let events_a = world_a.step();
        let events_b = world_b.step();
        assert_eq!(events_a, events_b, "tick {tick} events diverged");
    }

    assert_eq!(world_a.tick(), Tick(100));
    assert_eq!(
        world_a.agents().columns().cells(),
        world_b.agents().columns().cells()
    );
    assert_eq!(
        world_a.agents().columns().health(),
        world_b.agents().columns().health()
    );
    assert_eq!(
        world_a.agents().columns().serials(),
        world_b.agents().columns().serials()
    );
    assert_eq!(world_a.audible_events(), world_b.audible_events());
}

#[test]
fn occupancy_stays_exclusive_over_a_long_run() {
    let mut config = scenario_config(32, 32);
    config.pursuer.attack_damage = 10.0;
    config.prey.attack_damage = 5.0;
    let mut world = WorldState::new(config).expect("world");
    let mut obstacles = Vec::new();
    for x in 12..15 {
        for z in 12..15 {
            obstacles.push(CellPos::new(x, z));
        }
    }
    world.set_obstacles(obstacles);
    let obstacle_set: HashSet<CellPos> = world.obstacles().iter().copied().collect();
    for i in 0..10 {
        world.spawn_agent(Faction::Pursuer, CellPos::new(2 + i * 3, 2));
    }
    for i in 0..20 {
        world.spawn_agent(Faction::Prey, CellPos::new(1 + i, 28));
    }

    for _ in 0..150 {
        world.step();
        let cells = world.agents().columns().cells();
        let unique: HashSet<CellPos> = cells.iter().copied().collect();
        assert_eq!(unique.len(), cells.len(), "two agents share a cell");
        for cell in cells {
            assert!(world.config().in_bounds(*cell), "agent left the grid");
            assert!(!obstacle_set.contains(cell), "agent stands inside a wall");
        }
        for &health in world.agents().columns().health() {
            assert!(health.is_finite() && health >= 0.0, "health invariant broken");
        }
    }
}

#[test]
fn alarms_beyond_hearing_range_are_ignored() {
    let mut world = WorldState::new(scenario_config(40, 12)).expect("world");
    let distant = world.spawn_agent(Faction::Pursuer, CellPos::new(30, 5));
    let _witness = world.spawn_agent(Faction::Pursuer, CellPos::new(2, 5));
    let _prey = world.spawn_agent(Faction::Prey, CellPos::new(5, 5));

    world.step();
    assert_eq!(world.audible_events().len(), 1);

    world.step();
    let runtime = world.agent_runtime(distant).expect("runtime");
    assert_eq!(runtime.perception.sighted, None);
    assert_eq!(
        runtime.perception.heard, None,
        "an alarm 28 cells away is outside hearing range 8"
    );
    assert_eq!(runtime.stance, MoveStance::Wandering);
}

#[test]
fn render_position_converges_and_turn_fade_rises_between_activations() {
    let mut config = scenario_config(16, 16);
    config.prey.turn_delay = 5;
    let mut world = WorldState::new(config).expect("world");
    let id = world.spawn_agent(Faction::Prey, CellPos::new(8, 8));

    let offset_from_center = |world: &WorldState| {
        let snapshot = world.snapshot_agent(id).expect("agent");
        let center = world.config().cell_center(snapshot.data.cell);
        let dx = snapshot.data.render_position.x - center.x;
        let dz = snapshot.data.render_position.z - center.z;
        (dx * dx + dz * dz).sqrt()
    };

    // First tick: the lone prey wanders one cell, leaving its render
    // position trailing behind the new cell center.
    world.step();
    let first = offset_from_center(&world);
    assert!(first > 0.0);
    let fade_first = world.render_view()[0].turn_fade;

    // While the countdown runs, the render position keeps converging and the
    // fade signal rises toward the next activation.
    world.step();
    let second = offset_from_center(&world);
    assert!(second < first);
    let fade_second = world.render_view()[0].turn_fade;
    assert!(fade_second > fade_first);

    world.step();
    assert!(offset_from_center(&world) < second);
}

#[test]
fn conversion_wave_preserves_total_population() {
    let mut config = scenario_config(30, 5);
    config.pursuer.attack_damage = 50.0;
    let mut world = WorldState::new(config).expect("world");
    for x in [2, 3, 4] {
        world.spawn_agent(Faction::Pursuer, CellPos::new(x, 2));
    }
    for x in [10, 12, 14, 16] {
        world.spawn_agent(Faction::Prey, CellPos::new(x, 2));
    }

    let mut prey_before = world.faction_count(Faction::Prey);
    for _ in 0..150 {
        world.step();
        let prey_now = world.faction_count(Faction::Prey);
        assert!(prey_now <= prey_before, "prey population can only shrink");
        prey_before = prey_now;
        assert_eq!(
            world.agent_count(),
            7,
            "every prey death converts, so the total never changes"
        );
        let cells = world.agents().columns().cells();
        let unique: HashSet<CellPos> = cells.iter().copied().collect();
        assert_eq!(unique.len(), cells.len());
    }
}

struct CapturingSink {
    summaries: Arc<Mutex<Vec<TickSummary>>>,
}

impl WorldPersistence for CapturingSink {
    fn on_tick(&mut self, payload: &PersistenceBatch) {
        self.summaries
            .lock()
            .expect("sink lock")
            .push(payload.summary.clone());
    }
}

#[test]
fn persistence_sink_receives_flushes_on_the_interval() {
    let summaries = Arc::new(Mutex::new(Vec::new()));
    let sink = CapturingSink {
        summaries: Arc::clone(&summaries),
    };
    let mut config = scenario_config(16, 16);
    config.persistence_interval = 2;
    config.history_capacity = 4;
    let mut world = WorldState::with_persistence(config, Box::new(sink)).expect("world");
    world.spawn_agent(Faction::Pursuer, CellPos::new(2, 2));
    world.spawn_agent(Faction::Prey, CellPos::new(12, 12));

    for _ in 0..6 {
        world.step();
    }

    let captured = summaries.lock().expect("sink lock");
    let ticks: Vec<u64> = captured.iter().map(|summary| summary.tick.0).collect();
    assert_eq!(ticks, vec![2, 4, 6]);
    for summary in captured.iter() {
        assert_eq!(summary.pursuer_count, 1);
        assert_eq!(summary.prey_count, 1);
        assert!(summary.average_health > 0.0);
    }
    assert_eq!(world.history().count(), 3);
}
