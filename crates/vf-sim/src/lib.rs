//! Simulation core for a grid-based, terminal-rendered action game
//! (`spec.md` §1 "Overview"). This crate owns the whole tick: ECS storage
//! sits in [`vf_ecs`]; everything here is simulation-specific state
//! (components), behavior (systems) and the public facade
//! ([`api::SimWorld`]) that a renderer or host binary drives.
//!
//! Module map mirrors the spec's own section breakdown:
//!
//! - [`fixed`] -- Q32.32 deterministic arithmetic (§4.3 "Fixed-point math").
//! - [`config`] -- boot-time configuration record (§6 "CLI/config").
//! - [`telemetry`] -- read-only-from-outside diagnostics registry (§6).
//! - [`components`] -- plain-data component kinds (§4.1, §4.2).
//! - [`world`] -- entity/component storage (§4.1).
//! - [`events`] -- per-tick double-buffered event bus (§4.4).
//! - [`spatial`] -- grid occupancy index and line-of-sight queries (§4.1, §4.9).
//! - [`scheduler`] -- fixed-order tick scheduler and `System` trait (§4.5).
//! - [`kinematics`] -- integration, bounds, collision resolution (§4.3).
//! - [`navigation`] -- flow-field pathfinding and band routing (§4.6).
//! - [`combat`] -- attack matrix, direct/area/chain resolution (§4.8).
//! - [`composite`] -- header/member lifecycle and integrity checks (§4.7).
//! - [`species`] -- per-species behavior systems (§4.2).
//! - [`effects`] -- transient TTL-driven visual entities (§4.10).
//! - [`genetic`] -- online per-species genetic optimizer (§4.11).
//! - [`api`] -- the public [`api::SimWorld`] facade (§6).

pub mod api;
pub mod combat;
pub mod components;
pub mod composite;
pub mod config;
pub mod effects;
pub mod events;
pub mod fixed;
pub mod genetic;
pub mod kinematics;
pub mod navigation;
pub mod scheduler;
pub mod spatial;
pub mod species;
pub mod telemetry;
pub mod world;

pub use api::{InputEvent, RenderSnapshot, SimWorld};
pub use config::SimConfig;
