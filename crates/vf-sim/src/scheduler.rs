//! System registry and fixed-order tick scheduler (`spec.md` §4.5), modeled
//! on the teacher engine's `TickLoop`: systems run in a fixed order with
//! per-system timing, and no system mutates shared state outside its own
//! turn. Where the teacher routes every mutation through a `CommandBuffer`
//! for manifest traceability, this scheduler only defers *meta* commands --
//! whole-world operations like [`MetaSystemCommand::GameReset`] that must
//! happen strictly after every system has finished its turn (`spec.md`
//! §4.12).

use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::events::EventBus;
use crate::spatial::SpatialIndex;
use crate::world::World;

/// The mutable state a system's turn gets access to.
pub struct SimContext<'a> {
    pub world: &'a mut World,
    pub events: &'a mut EventBus,
    pub spatial: &'a mut SpatialIndex,
}

/// A whole-world operation that must be deferred until every system has had
/// its turn this tick, rather than applied immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaSystemCommand {
    /// Wipe every entity, component, spatial bucket and buffered event and
    /// start the next tick from tick 0 (`spec.md` §4.12 "Reset protocol").
    GameReset,
}

/// A unit of per-tick behavior. Implementors own no state that outlives
/// registration; all persistent state lives in components on entities.
pub trait System {
    fn name(&self) -> &'static str;

    /// Systems run in ascending priority order; registration order breaks
    /// ties. Lower numbers run earlier.
    fn priority(&self) -> i32 {
        0
    }

    fn run(&mut self, ctx: &mut SimContext, dt_ms: i64) -> Vec<MetaSystemCommand>;
}

/// Per-system wall-clock timing for the last tick (`spec.md` §6 "logging &
/// diagnostics"), surfaced through telemetry as `perf.system.<name>_ms`.
#[derive(Debug, Clone, Default)]
pub struct TickDiagnostics {
    pub system_times: Vec<(&'static str, Duration)>,
    pub total_time: Duration,
}

pub struct Scheduler {
    systems: Vec<Box<dyn System>>,
    last_diagnostics: TickDiagnostics,
    /// Systems named here sit out `run_tick` entirely. Toggled by
    /// `SimEvent::MetaSystemCommand` through `SimWorld::tick` (`spec.md` §4.5
    /// "named systems can be disabled at runtime").
    disabled: HashSet<String>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            systems: Vec::new(),
            last_diagnostics: TickDiagnostics::default(),
            disabled: HashSet::new(),
        }
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) {
        if enabled {
            self.disabled.remove(name);
        } else {
            self.disabled.insert(name.to_string());
        }
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        !self.disabled.contains(name)
    }

    /// Register a system. Re-sorts by priority using a stable sort, so
    /// systems registered with equal priority keep their relative
    /// registration order.
    pub fn register(&mut self, system: Box<dyn System>) {
        self.systems.push(system);
        self.systems.sort_by_key(|s| s.priority());
    }

    pub fn system_names(&self) -> Vec<&'static str> {
        self.systems.iter().map(|s| s.name()).collect()
    }

    pub fn system_count(&self) -> usize {
        self.systems.len()
    }

    /// Run one simulation tick: every system's turn, in priority order, then
    /// the event bus swap, then any deferred meta commands. Returns whether a
    /// [`MetaSystemCommand::GameReset`] was applied this tick, so callers
    /// that own renderer-visible state outside the `World` (e.g. the cursor
    /// entity handle in [`crate::api::SimWorld`]) know to rebuild it.
    pub fn run_tick(
        &mut self,
        world: &mut World,
        events: &mut EventBus,
        spatial: &mut SpatialIndex,
        dt_ms: i64,
    ) -> bool {
        let tick_start = Instant::now();
        let mut system_times = Vec::with_capacity(self.systems.len());
        let mut pending_meta = Vec::new();

        for system in self.systems.iter_mut() {
            if self.disabled.contains(system.name()) {
                continue;
            }
            let sys_start = Instant::now();
            let mut ctx = SimContext {
                world,
                events,
                spatial,
            };
            pending_meta.extend(system.run(&mut ctx, dt_ms));
            system_times.push((system.name(), sys_start.elapsed()));
        }

        for event in events.events_of_kind(crate::events::EventKind::MetaSystemCommand) {
            if let crate::events::SimEvent::MetaSystemCommand { name, enabled } = event {
                self.set_enabled(name, *enabled);
            }
        }

        // A bare `GameReset` input event (`spec.md` §6 "Input contract") is
        // its own meta command; no system needs to own translating it, same
        // as `MetaSystemCommand` just above.
        for event in events.events_of_kind(crate::events::EventKind::GameReset) {
            if matches!(event, crate::events::SimEvent::GameReset) {
                pending_meta.push(MetaSystemCommand::GameReset);
            }
        }

        // Events published this tick become readable only after every
        // system has had a chance to publish (spec.md §4.4).
        events.advance_tick();

        let mut reset_applied = false;
        for cmd in pending_meta {
            match cmd {
                MetaSystemCommand::GameReset => {
                    world.clear_all();
                    spatial.clear();
                    events.clear();
                    reset_applied = true;
                    tracing::info!("game reset applied");
                }
            }
        }

        // A reset tick starts the next tick from 0 (spec.md §4.12); any other
        // tick advances normally.
        if !reset_applied {
            world.frame += 1;
        }
        self.last_diagnostics = TickDiagnostics {
            system_times,
            total_time: tick_start.elapsed(),
        };
        reset_applied
    }

    pub fn last_diagnostics(&self) -> &TickDiagnostics {
        &self.last_diagnostics
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;

    struct Recorder {
        name: &'static str,
        priority: i32,
        log: std::rc::Rc<std::cell::RefCell<Vec<&'static str>>>,
    }

    impl System for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }
        fn priority(&self) -> i32 {
            self.priority
        }
        fn run(&mut self, _ctx: &mut SimContext, _dt_ms: i64) -> Vec<MetaSystemCommand> {
            self.log.borrow_mut().push(self.name);
            Vec::new()
        }
    }

    struct Resetter;
    impl System for Resetter {
        fn name(&self) -> &'static str {
            "resetter"
        }
        fn run(&mut self, _ctx: &mut SimContext, _dt_ms: i64) -> Vec<MetaSystemCommand> {
            vec![MetaSystemCommand::GameReset]
        }
    }

    #[test]
    fn systems_run_in_priority_order_with_stable_ties() {
        let log = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let mut scheduler = Scheduler::new();
        scheduler.register(Box::new(Recorder {
            name: "b",
            priority: 0,
            log: log.clone(),
        }));
        scheduler.register(Box::new(Recorder {
            name: "a",
            priority: -1,
            log: log.clone(),
        }));
        scheduler.register(Box::new(Recorder {
            name: "c",
            priority: 0,
            log: log.clone(),
        }));

        let mut world = World::new(SimConfig::default());
        let mut events = EventBus::new();
        let mut spatial = SpatialIndex::new(10, 10);
        scheduler.run_tick(&mut world, &mut events, &mut spatial, 50);

        assert_eq!(*log.borrow(), vec!["a", "b", "c"]);
    }

    #[test]
    fn game_reset_clears_world_after_all_systems_ran() {
        let mut scheduler = Scheduler::new();
        scheduler.register(Box::new(Resetter));

        let mut world = World::new(SimConfig::default());
        world.create();
        world.create();
        let mut events = EventBus::new();
        let mut spatial = SpatialIndex::new(10, 10);

        scheduler.run_tick(&mut world, &mut events, &mut spatial, 50);
        assert_eq!(world.alive_count(), 0);
        assert_eq!(world.frame, 0);
    }

    #[test]
    fn tick_advances_frame_counter() {
        let mut scheduler = Scheduler::new();
        let mut world = World::new(SimConfig::default());
        let mut events = EventBus::new();
        let mut spatial = SpatialIndex::new(10, 10);
        scheduler.run_tick(&mut world, &mut events, &mut spatial, 50);
        scheduler.run_tick(&mut world, &mut events, &mut spatial, 50);
        assert_eq!(world.frame, 2);
    }

    #[test]
    fn diagnostics_record_one_entry_per_system() {
        let log = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let mut scheduler = Scheduler::new();
        scheduler.register(Box::new(Recorder {
            name: "only",
            priority: 0,
            log,
        }));
        let mut world = World::new(SimConfig::default());
        let mut events = EventBus::new();
        let mut spatial = SpatialIndex::new(10, 10);
        scheduler.run_tick(&mut world, &mut events, &mut spatial, 50);
        assert_eq!(scheduler.last_diagnostics().system_times.len(), 1);
    }
}
