//! Entity identifiers and allocation.
//!
//! An [`EntityId`] is a 64-bit handle that packs a *generation* counter in the
//! high 32 bits and an *index* in the low 32 bits. The generation is bumped
//! every time an index is recycled, which allows immediate stale-ID detection.
//!
//! Index `0` is reserved at construction and never handed out, so the raw
//! `u64` value `0` is never a live entity. This gives callers a cheap,
//! always-invalid sentinel ([`EntityId::NONE`]) without any extra tagging.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

// ---------------------------------------------------------------------------
// EntityId
// ---------------------------------------------------------------------------

/// A generational entity identifier.
///
/// Layout: `[generation: u32 | index: u32]`
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId(u64);

impl EntityId {
    /// The sentinel "no entity" value. Never returned by [`EntityAllocator::allocate`].
    pub const NONE: EntityId = EntityId(0);

    /// Construct an `EntityId` from an index and generation.
    #[inline]
    pub fn new(index: u32, generation: u32) -> Self {
        Self((generation as u64) << 32 | index as u64)
    }

    /// The index portion (low 32 bits).
    #[inline]
    pub fn index(self) -> u32 {
        self.0 as u32
    }

    /// The generation portion (high 32 bits).
    #[inline]
    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Raw `u64` representation.
    #[inline]
    pub fn to_raw(self) -> u64 {
        self.0
    }

    /// Reconstruct from a raw `u64`.
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// True for any value other than [`EntityId::NONE`]. Does not check liveness;
    /// use [`EntityAllocator::is_alive`] for that.
    #[inline]
    pub fn is_some(self) -> bool {
        self.0 != 0
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::NONE
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            write!(f, "EntityId(NONE)")
        } else {
            write!(f, "EntityId({}v{})", self.index(), self.generation())
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index(), self.generation())
    }
}

// ---------------------------------------------------------------------------
// EntityAllocator
// ---------------------------------------------------------------------------

/// Allocates and recycles [`EntityId`]s with generational tracking.
///
/// Free indices are kept in a FIFO queue so that generations are spread out
/// over time rather than concentrated on a hot index. Index `0` is reserved
/// and permanently dead so that raw value `0` can serve as a sentinel.
#[derive(Debug)]
pub struct EntityAllocator {
    /// Current generation for each index slot.
    generations: Vec<u32>,
    /// Whether the slot is currently alive.
    alive: Vec<bool>,
    /// Free-list of recyclable indices (FIFO queue).
    free_indices: VecDeque<u32>,
}

impl EntityAllocator {
    /// Create a new, empty allocator. Index 0 is reserved immediately.
    pub fn new() -> Self {
        Self {
            generations: vec![0],
            alive: vec![false],
            free_indices: VecDeque::new(),
        }
    }

    /// Allocate a fresh, nonzero [`EntityId`].
    pub fn allocate(&mut self) -> EntityId {
        if let Some(index) = self.free_indices.pop_front() {
            self.alive[index as usize] = true;
            EntityId::new(index, self.generations[index as usize])
        } else {
            let index = self.generations.len() as u32;
            self.generations.push(0);
            self.alive.push(true);
            EntityId::new(index, 0)
        }
    }

    /// Deallocate (despawn) an entity, incrementing the generation for that
    /// index so that any outstanding handles become stale.
    ///
    /// Returns `true` if the entity was alive and is now despawned, `false`
    /// if it was already dead, never allocated, or `EntityId::NONE`.
    pub fn deallocate(&mut self, id: EntityId) -> bool {
        if id == EntityId::NONE {
            return false;
        }
        let idx = id.index() as usize;
        if idx >= self.generations.len() {
            return false;
        }
        if self.generations[idx] != id.generation() {
            return false;
        }
        if !self.alive[idx] {
            return false;
        }
        self.alive[idx] = false;
        self.generations[idx] = self.generations[idx].wrapping_add(1);
        self.free_indices.push_back(id.index());
        true
    }

    /// Returns `true` if `id` refers to a currently alive entity whose
    /// generation matches the allocator's current generation for that index.
    pub fn is_alive(&self, id: EntityId) -> bool {
        if id == EntityId::NONE {
            return false;
        }
        let idx = id.index() as usize;
        if idx >= self.generations.len() {
            return false;
        }
        self.alive[idx] && self.generations[idx] == id.generation()
    }

    /// Total number of currently alive entities.
    pub fn alive_count(&self) -> usize {
        self.alive.iter().filter(|&&a| a).count()
    }

    /// Reset to the empty state (index 0 reserved again). Used by the reset
    /// protocol (`GameReset`) to guarantee a deterministic restart.
    pub fn clear(&mut self) {
        self.generations.clear();
        self.alive.clear();
        self.free_indices.clear();
        self.generations.push(0);
        self.alive.push(false);
    }
}

impl Default for EntityAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_never_allocated() {
        let mut alloc = EntityAllocator::new();
        let e = alloc.allocate();
        assert_ne!(e.to_raw(), 0);
        assert_eq!(e.index(), 1);
    }

    #[test]
    fn none_is_never_alive() {
        let alloc = EntityAllocator::new();
        assert!(!alloc.is_alive(EntityId::NONE));
    }

    #[test]
    fn allocate_unique_ids() {
        let mut alloc = EntityAllocator::new();
        let ids: Vec<EntityId> = (0..100).map(|_| alloc.allocate()).collect();
        let mut indices: Vec<u32> = ids.iter().map(|id| id.index()).collect();
        indices.sort();
        indices.dedup();
        assert_eq!(indices.len(), 100);
    }

    #[test]
    fn generation_increments_on_recycle() {
        let mut alloc = EntityAllocator::new();
        let e0 = alloc.allocate();
        assert!(alloc.deallocate(e0));
        let e1 = alloc.allocate();
        assert_eq!(e1.index(), e0.index());
        assert_eq!(e1.generation(), e0.generation() + 1);
    }

    #[test]
    fn stale_id_detection() {
        let mut alloc = EntityAllocator::new();
        let e0 = alloc.allocate();
        assert!(alloc.is_alive(e0));
        assert!(alloc.deallocate(e0));
        assert!(!alloc.is_alive(e0));
        let _e1 = alloc.allocate();
        assert!(!alloc.is_alive(e0));
    }

    #[test]
    fn destroy_then_create_never_reuses_live_id() {
        let mut alloc = EntityAllocator::new();
        let e0 = alloc.allocate();
        alloc.deallocate(e0);
        let e1 = alloc.allocate();
        assert_ne!(e0, e1);
    }

    #[test]
    fn double_deallocate_returns_false() {
        let mut alloc = EntityAllocator::new();
        let e = alloc.allocate();
        assert!(alloc.deallocate(e));
        assert!(!alloc.deallocate(e));
    }

    #[test]
    fn clear_resets_to_single_cursor() {
        let mut alloc = EntityAllocator::new();
        for _ in 0..10 {
            alloc.allocate();
        }
        alloc.clear();
        let cursor = alloc.allocate();
        assert_eq!(cursor.index(), 1);
        assert_eq!(alloc.alive_count(), 1);
    }

    #[test]
    fn entity_id_roundtrip() {
        let id = EntityId::new(42, 7);
        assert_eq!(id.index(), 42);
        assert_eq!(id.generation(), 7);
        assert_eq!(EntityId::from_raw(id.to_raw()), id);
    }
}
