//! Entity/component substrate for the simulation core.
//!
//! This crate is deliberately small and game-agnostic: an [`entity::EntityAllocator`]
//! hands out generational [`entity::EntityId`]s, and [`store::ComponentStore`] provides
//! O(1) set/get/remove/has with O(k) iteration over a single component kind
//! via a dense array + sparse map. Game-specific component types and the
//! `World` that aggregates stores for each of them live in `vf-sim`.

#![deny(unsafe_code)]

pub mod entity;
pub mod store;

pub use entity::{EntityAllocator, EntityId};
pub use store::ComponentStore;

/// Errors produced by substrate operations.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// The entity does not exist: stale generation, or never allocated.
    #[error("entity {entity:?} does not exist (stale or never allocated)")]
    StaleEntity { entity: EntityId },
}

/// Convenience re-exports.
pub mod prelude {
    pub use crate::entity::{EntityAllocator, EntityId};
    pub use crate::store::ComponentStore;
    pub use crate::EcsError;
}
