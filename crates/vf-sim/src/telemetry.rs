//! Read-only-from-outside status registry (`spec.md` §2.1): the one piece of
//! simulation state an external thread (a render loop, a debug HUD) may read
//! concurrently with the sim thread's tick. Everything else in this crate
//! assumes single-threaded, exclusive `World` ownership; this registry is the
//! deliberate exception, so it is built on atomics rather than on the
//! `&mut World` access pattern the rest of the crate uses.
//!
//! Keys are dotted names (`perf.tick_ms`, `perf.system.combat_ms`,
//! `ga.pylon.generation`) so unrelated subsystems can't collide by accident.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

/// Cheap to clone; every clone shares the same underlying counters.
#[derive(Debug, Clone, Default)]
pub struct TelemetryRegistry {
    values: Arc<RwLock<HashMap<String, Arc<AtomicI64>>>>,
}

impl TelemetryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Arc<AtomicI64> {
        if let Some(existing) = self.values.read().expect("telemetry lock poisoned").get(key) {
            return existing.clone();
        }
        let mut write = self.values.write().expect("telemetry lock poisoned");
        write.entry(key.to_string()).or_insert_with(|| Arc::new(AtomicI64::new(0))).clone()
    }

    /// Overwrite a gauge-style reading, e.g. `perf.tick_ms`.
    pub fn set(&self, key: &str, value: i64) {
        self.slot(key).store(value, Ordering::Relaxed);
    }

    /// Add to a counter-style reading, e.g. `combat.hits_landed`.
    pub fn add(&self, key: &str, delta: i64) {
        self.slot(key).fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self, key: &str) -> i64 {
        self.values
            .read()
            .expect("telemetry lock poisoned")
            .get(key)
            .map(|v| v.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Snapshot every currently-registered key. Intended for a debug overlay
    /// or a periodic export, not the hot path.
    pub fn snapshot(&self) -> HashMap<String, i64> {
        self.values
            .read()
            .expect("telemetry lock poisoned")
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect()
    }
}

/// Times a closure and records the elapsed milliseconds under `key`. Used to
/// wrap each system's `run` call from [`crate::api::SimWorld::tick`] so
/// `perf.system.<name>_ms` stays current every tick.
pub fn time_ms<T>(registry: &TelemetryRegistry, key: &str, f: impl FnOnce() -> T) -> T {
    let start = std::time::Instant::now();
    let result = f();
    registry.set(key, start.elapsed().as_millis() as i64);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let registry = TelemetryRegistry::new();
        registry.set("perf.tick_ms", 16);
        assert_eq!(registry.get("perf.tick_ms"), 16);
    }

    #[test]
    fn add_accumulates_into_a_fresh_key() {
        let registry = TelemetryRegistry::new();
        registry.add("combat.hits_landed", 1);
        registry.add("combat.hits_landed", 2);
        assert_eq!(registry.get("combat.hits_landed"), 3);
    }

    #[test]
    fn missing_key_reads_as_zero() {
        let registry = TelemetryRegistry::new();
        assert_eq!(registry.get("never.set"), 0);
    }

    #[test]
    fn clones_share_the_same_underlying_counters() {
        let registry = TelemetryRegistry::new();
        let clone = registry.clone();
        registry.set("shared", 7);
        assert_eq!(clone.get("shared"), 7);
    }

    #[test]
    fn snapshot_includes_every_registered_key() {
        let registry = TelemetryRegistry::new();
        registry.set("a", 1);
        registry.set("b", 2);
        let snap = registry.snapshot();
        assert_eq!(snap.get("a"), Some(&1));
        assert_eq!(snap.get("b"), Some(&2));
    }
}
