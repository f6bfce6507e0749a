//! Typed event bus with per-tick double buffering (`spec.md` §4.4).
//!
//! Systems publish into the bus as they run; nothing is visible to readers
//! until [`EventBus::advance_tick`] swaps the buffers at the end of the tick
//! (`scheduler.rs` calls this once, after every system has run). Readers
//! then see exactly the events published during the tick that just finished,
//! in publish order, and publishing resumes into a fresh buffer for the next
//! tick. There is no "read events from the tick currently running" path --
//! that would make event visibility depend on system registration order.
//!
//! Beyond the simulation's own lifecycle events (death, damage, composite
//! breach, ...), this bus also carries the external input contract from
//! `spec.md` §6: renderer-agnostic cursor motion, ability requests and meta
//! commands are injected as `SimEvent`s by [`crate::api::SimWorld::inject`]
//! and drained by the relevant system on its next turn, exactly like any
//! other event.

use serde::{Deserialize, Serialize};
use vf_ecs::EntityId;

use crate::combat::AttackKind;
use crate::components::{CombatEntityKind, SpeciesKind};
use crate::fixed::Fixed;

/// Cheap discriminant for kind-based subscription, without matching the
/// full payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    EntityDied,
    DamageDealt,
    CompositeIntegrityBreach,
    ExplosionMerged,
    GameReset,
    WeaponFired,
    GenotypeSampleComplete,
    EnemyCreated,
    CursorMoved,
    InsertChar,
    DeleteMotion,
    ModeChange,
    BuffFireRequest,
    BuffFireMainRequest,
    FireSpecialRequest,
    MetaSystemCommand,
    MetaDebugRequest,
    MetaHelpRequest,
    MetaStatusMessageRequest,
    TargetGroupUpdate,
    CombatAttackDirectRequest,
    CombatAttackAreaRequest,
    ShieldDrainTick,
}

/// One `DeleteMotion` variant of the vi-style modal command layer
/// (`spec.md` §6 "Input contract"). The core only forwards this payload; the
/// command layer that interprets it lives outside the core's scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeleteMotionKind {
    Char,
    Word,
    Line,
}

/// Which target a [`SimEvent::TargetGroupUpdate`] points a group at
/// (`spec.md` §4.6 "Target groups").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetSpec {
    Cursor,
    Entity(EntityId),
    Static(i32, i32),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SimEvent {
    EntityDied {
        entity: EntityId,
        kind: CombatEntityKind,
    },
    DamageDealt {
        attacker: EntityId,
        target: EntityId,
        amount: i32,
    },
    /// A header's member count dropped by more than this system's own
    /// expected-death bookkeeping accounts for (`spec.md` §4.7 step 4-5).
    CompositeIntegrityBreach {
        header: EntityId,
        excess_deaths: u32,
        living_remaining: u32,
    },
    ExplosionMerged {
        survivor: EntityId,
        absorbed: EntityId,
    },
    GameReset,
    WeaponFired {
        owner: EntityId,
    },
    GenotypeSampleComplete {
        species: SpeciesKind,
        eval_id: u64,
    },
    /// Published by a species system's materialize/spawn step; observed by
    /// the genetic optimizer to sample and stamp genes immediately
    /// (`spec.md` §4.11 "Integration").
    EnemyCreated {
        entity: EntityId,
        species: SpeciesKind,
    },

    // -- input contract (spec.md §6) ----------------------------------
    CursorMoved {
        x: i32,
        y: i32,
    },
    InsertChar {
        rune: char,
    },
    DeleteMotion {
        kind: DeleteMotionKind,
    },
    ModeChange {
        mode: u8,
    },
    BuffFireRequest,
    BuffFireMainRequest,
    FireSpecialRequest,
    MetaSystemCommand {
        name: String,
        enabled: bool,
    },
    MetaDebugRequest,
    MetaHelpRequest,
    MetaStatusMessageRequest {
        message: String,
    },

    /// Repoints a navigation target group at a fixed position, an entity to
    /// track, or back to the cursor (`spec.md` §4.6).
    TargetGroupUpdate {
        group: u32,
        target: TargetSpec,
    },

    /// A single-target attack request, routed through the combat system on
    /// its next turn (`spec.md` §4.8 "Direct attack resolution").
    CombatAttackDirectRequest {
        attack: AttackKind,
        owner: EntityId,
        origin: EntityId,
        target: EntityId,
        hit: EntityId,
    },
    /// An area attack request against every combat-bearing entity within
    /// range of `origin_xy` (or `origin`'s position if unset) (`spec.md`
    /// §4.8 "Area attack resolution").
    CombatAttackAreaRequest {
        attack: AttackKind,
        owner: EntityId,
        origin: EntityId,
        origin_xy: Option<(Fixed, Fixed)>,
        radius: Fixed,
        target: EntityId,
        /// Every entity actually found within range when the request was
        /// published, so the combat system resolves the same set the
        /// publisher saw rather than re-scanning a (possibly now stale)
        /// spatial index a tick later (`spec.md` §4.8 "Area attack
        /// resolution").
        hits: Vec<EntityId>,
    },
    /// A drain touched a shield's ellipse and drained `amount` energy from
    /// it this tick (`spec.md` §4.9 "shield overlap -> drain energy from
    /// shield, emit a shield-specific area combat event").
    ShieldDrainTick {
        shield: EntityId,
        drain: EntityId,
        amount: i32,
    },
}

impl SimEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SimEvent::EntityDied { .. } => EventKind::EntityDied,
            SimEvent::DamageDealt { .. } => EventKind::DamageDealt,
            SimEvent::CompositeIntegrityBreach { .. } => EventKind::CompositeIntegrityBreach,
            SimEvent::ExplosionMerged { .. } => EventKind::ExplosionMerged,
            SimEvent::GameReset => EventKind::GameReset,
            SimEvent::WeaponFired { .. } => EventKind::WeaponFired,
            SimEvent::GenotypeSampleComplete { .. } => EventKind::GenotypeSampleComplete,
            SimEvent::EnemyCreated { .. } => EventKind::EnemyCreated,
            SimEvent::CursorMoved { .. } => EventKind::CursorMoved,
            SimEvent::InsertChar { .. } => EventKind::InsertChar,
            SimEvent::DeleteMotion { .. } => EventKind::DeleteMotion,
            SimEvent::ModeChange { .. } => EventKind::ModeChange,
            SimEvent::BuffFireRequest => EventKind::BuffFireRequest,
            SimEvent::BuffFireMainRequest => EventKind::BuffFireMainRequest,
            SimEvent::FireSpecialRequest => EventKind::FireSpecialRequest,
            SimEvent::MetaSystemCommand { .. } => EventKind::MetaSystemCommand,
            SimEvent::MetaDebugRequest => EventKind::MetaDebugRequest,
            SimEvent::MetaHelpRequest => EventKind::MetaHelpRequest,
            SimEvent::MetaStatusMessageRequest { .. } => EventKind::MetaStatusMessageRequest,
            SimEvent::TargetGroupUpdate { .. } => EventKind::TargetGroupUpdate,
            SimEvent::CombatAttackDirectRequest { .. } => EventKind::CombatAttackDirectRequest,
            SimEvent::CombatAttackAreaRequest { .. } => EventKind::CombatAttackAreaRequest,
            SimEvent::ShieldDrainTick { .. } => EventKind::ShieldDrainTick,
        }
    }
}

/// Double-buffered event queue. `publish` always writes to the write-side
/// buffer; `events`/`events_of_kind` always read the read-side buffer from
/// the previous `advance_tick`.
#[derive(Debug, Default)]
pub struct EventBus {
    write: Vec<SimEvent>,
    read: Vec<SimEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            write: Vec::new(),
            read: Vec::new(),
        }
    }

    pub fn publish(&mut self, event: SimEvent) {
        self.write.push(event);
    }

    /// Swap buffers: this tick's published events become readable, and the
    /// write side is cleared for the next tick's publishes.
    pub fn advance_tick(&mut self) {
        std::mem::swap(&mut self.read, &mut self.write);
        self.write.clear();
    }

    /// Events published during the tick that just finished, in publish
    /// order.
    pub fn events(&self) -> &[SimEvent] {
        &self.read
    }

    pub fn events_of_kind(&self, kind: EventKind) -> impl Iterator<Item = &SimEvent> {
        self.read.iter().filter(move |e| e.kind() == kind)
    }

    /// Drop all buffered events, read and write. Used by the `GameReset`
    /// protocol so a stale tick's events never leak into the fresh world.
    pub fn clear(&mut self) {
        self.write.clear();
        self.read.clear();
    }
}
