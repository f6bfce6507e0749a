//! The public facade (`spec.md` §6): a single [`SimWorld`] a host binary or
//! renderer owns, drives with [`SimWorld::tick`], feeds input through
//! [`SimWorld::inject`], and reads with [`SimWorld::snapshot`]. Every other
//! module in this crate is an implementation detail reachable only through
//! this type once a binary is wired up -- the modules stay `pub` so tests and
//! benches can reach in directly, the way the teacher engine keeps its own
//! subsystems individually testable while still shipping one top-level
//! driver.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use vf_ecs::EntityId;

use crate::combat::CombatSystem;
use crate::components::{CombatEntityKind, Combat, Explosion, Heat, Kinetic, Lightning, Position, Protection, Shield, Sigil, Splash};
use crate::composite::CompositeSystem;
use crate::config::SimConfig;
use crate::effects::EffectsSystem;
use crate::events::{DeleteMotionKind, SimEvent, TargetSpec};
use crate::genetic::GeneticSystem;
use crate::navigation::NavigationSystem;
use crate::scheduler::Scheduler;
use crate::species::{BuffSystem, DrainSystem, LootSystem, PylonSystem, QuasarSystem, SnakeSystem, StormSystem, SwarmSystem};
use crate::spatial::SpatialIndex;
use crate::telemetry::TelemetryRegistry;
use crate::world::World;

/// A single tick is clamped to this many milliseconds so a stalled host
/// (a paused terminal, a slow frame) can never hand the sim a delta large
/// enough to tunnel a fast projectile through a wall in one step (`spec.md`
/// §4.3 "delta clamp").
const MAX_TICK_MS: i64 = 100;

/// External input, renderer-agnostic (`spec.md` §6 "Input contract"). A host
/// binary translates its own key/mouse events into these before calling
/// [`SimWorld::inject`]; this crate never reads a keyboard or terminal
/// directly.
#[derive(Debug, Clone, PartialEq)]
pub enum InputEvent {
    CursorMoved { x: i32, y: i32 },
    InsertChar { rune: char },
    DeleteMotion { kind: DeleteMotionKind },
    ModeChange { mode: u8 },
    BuffFireRequest,
    BuffFireMainRequest,
    FireSpecialRequest,
    SetSystemEnabled { name: String, enabled: bool },
    DebugRequest,
    HelpRequest,
    StatusMessageRequest { message: String },
    TargetGroupUpdate { group: u32, target: TargetSpec },
    Reset,
}

impl InputEvent {
    fn into_sim_event(self) -> SimEvent {
        match self {
            InputEvent::CursorMoved { x, y } => SimEvent::CursorMoved { x, y },
            InputEvent::InsertChar { rune } => SimEvent::InsertChar { rune },
            InputEvent::DeleteMotion { kind } => SimEvent::DeleteMotion { kind },
            InputEvent::ModeChange { mode } => SimEvent::ModeChange { mode },
            InputEvent::BuffFireRequest => SimEvent::BuffFireRequest,
            InputEvent::BuffFireMainRequest => SimEvent::BuffFireMainRequest,
            InputEvent::FireSpecialRequest => SimEvent::FireSpecialRequest,
            InputEvent::SetSystemEnabled { name, enabled } => SimEvent::MetaSystemCommand { name, enabled },
            InputEvent::DebugRequest => SimEvent::MetaDebugRequest,
            InputEvent::HelpRequest => SimEvent::MetaHelpRequest,
            InputEvent::StatusMessageRequest { message } => SimEvent::MetaStatusMessageRequest { message },
            InputEvent::TargetGroupUpdate { group, target } => SimEvent::TargetGroupUpdate { group, target },
            InputEvent::Reset => SimEvent::GameReset,
        }
    }
}

/// Read-only render data pulled out of the ECS for one frame (`spec.md` §6
/// "Rendering contract"). Owned, not borrowed, so a renderer can hold it past
/// the next `tick` call without fighting the borrow checker.
#[derive(Debug, Clone, Default)]
pub struct RenderSnapshot {
    pub frame: u64,
    pub sigils: Vec<(Position, Sigil)>,
    pub shields: Vec<(Position, Shield)>,
    pub lightning_bolts: Vec<Lightning>,
    pub splashes: Vec<(Position, Splash)>,
    pub explosions: Vec<Explosion>,
    pub telemetry: HashMap<String, i64>,
}

/// Owns the whole simulation: ECS storage, the tick scheduler, the event
/// bus, the spatial index, and the one piece of state that survives a
/// `GameReset` untouched -- the genetic optimizer (`spec.md` §4.12 "a reset
/// wipes gameplay state, not the GA's learned populations").
pub struct SimWorld {
    world: World,
    scheduler: Scheduler,
    events: crate::events::EventBus,
    spatial: SpatialIndex,
    telemetry: TelemetryRegistry,
    genetic: GeneticSystem,
    pending_input: Vec<SimEvent>,
    cursor: EntityId,
}

impl SimWorld {
    /// Build a fresh simulation: registers every system at its declared
    /// priority and spawns the cursor entity every other system expects to
    /// already exist (`spec.md` §4.2 "the cursor is always present").
    pub fn new(config: SimConfig) -> Self {
        let seed = config.seed;
        let (width, height) = (config.map_width, config.map_height);
        let mut world = World::new(config);
        let mut spatial = SpatialIndex::new(width, height);
        let mut events = crate::events::EventBus::new();

        let mut scheduler = Scheduler::new();
        scheduler.register(Box::new(NavigationSystem::new()));
        scheduler.register(Box::new(DrainSystem::new()));
        scheduler.register(Box::new(SnakeSystem::new()));
        scheduler.register(Box::new(PylonSystem::new()));
        scheduler.register(Box::new(QuasarSystem::new()));
        scheduler.register(Box::new(SwarmSystem::new()));
        scheduler.register(Box::new(StormSystem::new()));
        scheduler.register(Box::new(BuffSystem::new()));
        scheduler.register(Box::new(LootSystem::new()));
        scheduler.register(Box::new(CombatSystem::new()));
        scheduler.register(Box::new(CompositeSystem::new()));
        scheduler.register(Box::new(EffectsSystem::new()));

        let cursor = spawn_cursor(&mut world, &mut spatial, &mut events);

        Self {
            world,
            scheduler,
            events,
            spatial,
            telemetry: TelemetryRegistry::new(),
            genetic: GeneticSystem::new(seed),
            pending_input: Vec::new(),
            cursor,
        }
    }

    /// Advance the simulation by `delta`, clamped to [`MAX_TICK_MS`]
    /// (`spec.md` §4.3 "delta clamp"). Drains every event queued since the
    /// last call through [`Self::inject`] first, so this tick's systems see
    /// them alongside the simulation's own internal events.
    pub fn tick(&mut self, delta: Duration) {
        let dt_ms = (delta.as_millis() as i64).clamp(0, MAX_TICK_MS);

        for event in self.pending_input.drain(..) {
            self.events.publish(event);
        }

        let tick_start = std::time::Instant::now();
        let reset_happened = self.scheduler.run_tick(&mut self.world, &mut self.events, &mut self.spatial, dt_ms);

        let telemetry = &self.telemetry;
        let world = &mut self.world;
        let events = &mut self.events;
        let spatial = &mut self.spatial;
        let genetic = &mut self.genetic;
        crate::telemetry::time_ms(telemetry, "perf.system.genetic_ms", || {
            let mut ctx = crate::scheduler::SimContext { world, events, spatial };
            genetic.run(&mut ctx, dt_ms);
        });

        if reset_happened {
            tracing::info!("rebuilding cursor after reset");
            self.cursor = spawn_cursor(&mut self.world, &mut self.spatial, &mut self.events);
        }

        for (name, duration) in self.scheduler.last_diagnostics().system_times.clone() {
            self.telemetry.set(&format!("perf.system.{name}_ms"), duration.as_millis() as i64);
        }
        self.telemetry.set("perf.tick_ms", tick_start.elapsed().as_millis() as i64);
    }

    /// Queue one piece of external input for the next [`Self::tick`]
    /// (`spec.md` §6 "Input contract"). A `Reset` request is just another
    /// queued event: the scheduler recognizes a published `GameReset` the
    /// same way it recognizes `MetaSystemCommand`, one tick after it was
    /// injected, same latency as any other event a system reads.
    pub fn inject(&mut self, event: InputEvent) {
        self.pending_input.push(event.into_sim_event());
    }

    /// Pull a read-only render snapshot out of the ECS. Never holds a borrow
    /// of `self` past the call -- every field is cloned or copied out.
    pub fn snapshot(&self) -> RenderSnapshot {
        let sigils = self
            .world
            .all::<Sigil>()
            .into_iter()
            .filter_map(|e| Some((*self.world.get::<Position>(e)?, *self.world.get::<Sigil>(e)?)))
            .collect();

        let shields = self
            .world
            .all::<Shield>()
            .into_iter()
            .filter_map(|e| Some((*self.world.get::<Position>(e)?, *self.world.get::<Shield>(e)?)))
            .collect();

        let lightning_bolts = self
            .world
            .all::<Lightning>()
            .into_iter()
            .filter_map(|e| self.world.get::<Lightning>(e).copied())
            .collect();

        let splashes = self
            .world
            .all::<Splash>()
            .into_iter()
            .filter_map(|e| Some((*self.world.get::<Position>(e)?, *self.world.get::<Splash>(e)?)))
            .collect();

        let explosions = self
            .world
            .all::<Explosion>()
            .into_iter()
            .filter_map(|e| self.world.get::<Explosion>(e).copied())
            .collect();

        RenderSnapshot {
            frame: self.world.frame,
            sigils,
            shields,
            lightning_bolts,
            splashes,
            explosions,
            telemetry: self.telemetry.snapshot(),
        }
    }

    /// Serialize the genetic optimizer's learned populations to `path`
    /// (`spec.md` §6 "Persisted state").
    pub fn save_ga(&self, path: &Path) -> io::Result<()> {
        let blob = self
            .genetic
            .export_blob()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(path, blob)
    }

    /// Load a previously saved blob, replacing the current populations. A
    /// missing file is not an error -- callers booting for the first time
    /// should just skip the call; a corrupt or version-mismatched blob is
    /// logged and otherwise ignored by [`crate::genetic::GeneticOptimizer::import_blob`]
    /// rather than aborting startup.
    pub fn load_ga(&mut self, path: &Path) -> io::Result<()> {
        let blob = fs::read(path)?;
        self.genetic
            .import_blob(&blob)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn cursor(&self) -> EntityId {
        self.cursor
    }

    pub fn frame(&self) -> u64 {
        self.world.frame
    }
}

/// Spawn the always-present cursor entity at the map center (`spec.md` §4.2,
/// §4.12 "reset recreates the cursor"). Combat-bearing so area attacks can
/// target it, protected against the damage kinds that would make sense of a
/// cursor dying outright.
fn spawn_cursor(world: &mut World, spatial: &mut SpatialIndex, events: &mut crate::events::EventBus) -> EntityId {
    let (cx, cy) = (world.config.map_width / 2, world.config.map_height / 2);
    let cursor = world.create();
    world.set(cursor, Kinetic::at_cell(cx, cy));
    world.set(cursor, Sigil { rune: '@', color: crate::components::Color(255, 255, 0) });
    world.set(cursor, Combat::new(CombatEntityKind::Cursor, 100));
    world.set(cursor, Protection::default().with(Protection::FROM_DEATH));
    world.set(cursor, Heat::default());
    spatial.set_position(world, cursor, cx, cy);
    events.publish(SimEvent::CursorMoved { x: cx, y: cy });
    cursor
}
