//! Component kinds for the simulation world.
//!
//! Components are plain data; all behavior lives in systems (`combat.rs`,
//! `kinematics.rs`, `navigation.rs`, `composite.rs`, `species/`, `effects.rs`,
//! `genetic.rs`) that read and write them through [`crate::world::World`].

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use vf_ecs::EntityId;

use crate::fixed::Fixed;

// ============================================================================
// SPATIAL
// ============================================================================

/// Authoritative integer grid cell. Used by the spatial index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Sub-cell continuous location plus velocity, both Q32.32. The grid
/// position is always `floor(precise)`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Kinetic {
    pub x: Fixed,
    pub y: Fixed,
    pub vx: Fixed,
    pub vy: Fixed,
}

impl Kinetic {
    pub fn at_cell(x: i32, y: i32) -> Self {
        let (cx, cy) = crate::fixed::cell_center(x, y);
        Self {
            x: cx,
            y: cy,
            vx: 0,
            vy: 0,
        }
    }

    /// Grid cell this precise position currently floors to.
    pub fn grid_position(&self) -> (i32, i32) {
        (crate::fixed::to_int(self.x), crate::fixed::to_int(self.y))
    }
}

// ============================================================================
// RENDERING (data only -- rasterization is out of scope)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Color(pub u8, pub u8, pub u8);

/// Rune + color, consumed read-only by the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sigil {
    pub rune: char,
    pub color: Color,
}

impl Default for Sigil {
    fn default() -> Self {
        Self {
            rune: '?',
            color: Color(255, 255, 255),
        }
    }
}

// ============================================================================
// PROTECTION
// ============================================================================

/// Bitmask of immunities to specific damage sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Protection(pub u8);

impl Protection {
    pub const FROM_DRAIN: u8 = 1 << 0;
    pub const FROM_DECAY: u8 = 1 << 1;
    pub const FROM_DELETE: u8 = 1 << 2;
    pub const FROM_SPECIES: u8 = 1 << 3;
    pub const FROM_DEATH: u8 = 1 << 4;

    pub fn has(self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    pub fn with(mut self, bit: u8) -> Self {
        self.0 |= bit;
        self
    }
}

// ============================================================================
// COMBAT
// ============================================================================

/// Discriminates combat behavior; a flat tagged variant rather than a class
/// hierarchy (`spec.md` §9 "Deep inheritance in source").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CombatEntityKind {
    Cursor,
    Drain,
    Quasar,
    SnakeHead,
    SnakeBody,
    Pylon,
    Swarm,
    Storm,
    Generic,
}

/// Combat state: hit points plus the timers every attack resolution
/// consults and decrements (`spec.md` §4.8 "Per-tick maintenance").
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Combat {
    pub kind: CombatEntityKind,
    pub hp: i32,
    pub max_hp: i32,
    pub damage_immunity_remaining: i64,
    pub kinetic_immunity_remaining: i64,
    pub hit_flash_remaining: i64,
    pub stun_remaining: i64,
    pub enraged: bool,
}

impl Combat {
    pub fn new(kind: CombatEntityKind, hp: i32) -> Self {
        Self {
            kind,
            hp,
            max_hp: hp,
            damage_immunity_remaining: 0,
            kinetic_immunity_remaining: 0,
            hit_flash_remaining: 0,
            stun_remaining: 0,
            enraged: false,
        }
    }

    pub fn is_dead(&self) -> bool {
        self.hp <= 0
    }

    pub fn is_stunned(&self) -> bool {
        self.stun_remaining > 0
    }

    /// Decrement every timer by `dt_ms`, clamping at zero, then check the
    /// enrage transition.
    pub fn tick_timers(&mut self, dt_ms: i64) {
        self.damage_immunity_remaining = (self.damage_immunity_remaining - dt_ms).max(0);
        self.kinetic_immunity_remaining = (self.kinetic_immunity_remaining - dt_ms).max(0);
        self.hit_flash_remaining = (self.hit_flash_remaining - dt_ms).max(0);
        self.stun_remaining = (self.stun_remaining - dt_ms).max(0);
        self.update_enrage();
    }

    /// Enter enrage once HP drops to a third or less of max HP (`spec.md`
    /// §4.9 "Transition states (enrage at an HP threshold, etc.)"). Enrage
    /// is latched: a later heal below the threshold's inverse never clears
    /// it, matching the one-way "enraged" framing in `spec.md` §4.8.
    fn update_enrage(&mut self) {
        if !self.enraged && self.max_hp > 0 && self.hp > 0 && self.hp * 3 <= self.max_hp {
            self.enraged = true;
        }
    }
}

// ============================================================================
// COMPOSITE (header / member)
// ============================================================================

/// A composite's damage/kinematic routing discipline (`spec.md` §3, §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompositeType {
    /// Damage and HP live on the header; members are cosmetic/offset.
    Unit,
    /// Damage lives on individual members; the header only carries them.
    Ablative,
    /// Members are themselves headers (e.g. a snake's root).
    Container,
}

/// The species/behavior a composite's header drives its members through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BehaviorKind {
    Drain,
    SnakeRoot,
    SnakeHead,
    SnakeBody,
    Pylon,
    Quasar,
    Swarm,
    Storm,
    Cursor,
}

/// One entry in a header's member list. Tombstoned by setting `entity` to
/// [`EntityId::NONE`] and the owning header's `dirty` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberEntry {
    pub entity: EntityId,
    pub dx: i32,
    pub dy: i32,
    pub layer: Option<u8>,
}

impl MemberEntry {
    pub fn is_tombstoned(&self) -> bool {
        self.entity == EntityId::NONE
    }
}

/// The composite root. Member entities are referenced by ID, never by Rust
/// reference, resolving the header/member ownership cycle (`spec.md` §9
/// "Cyclic ownership").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub behavior: BehaviorKind,
    pub composite_type: CompositeType,
    pub members: Vec<MemberEntry>,
    pub dirty: bool,
    /// Member positions are maintained by an owning system (e.g. snake
    /// spring physics) rather than by the generic composite sync step.
    pub skip_position_sync: bool,
    /// Deaths this header's own owning system requested (e.g. `MemberTyped`);
    /// used to distinguish expected from external member deaths.
    pub expected_deaths: u32,
}

impl Header {
    pub fn new(behavior: BehaviorKind, composite_type: CompositeType) -> Self {
        Self {
            behavior,
            composite_type,
            members: Vec::new(),
            dirty: false,
            skip_position_sync: false,
            expected_deaths: 0,
        }
    }

    pub fn living_member_count(&self) -> usize {
        self.members.iter().filter(|m| !m.is_tombstoned()).count()
    }

    /// Tombstone the entry for `entity`, if present. Marks `dirty`.
    pub fn tombstone(&mut self, entity: EntityId) {
        for m in self.members.iter_mut() {
            if m.entity == entity {
                m.entity = EntityId::NONE;
                self.dirty = true;
                return;
            }
        }
    }

    /// Swap-remove every tombstoned entry and clear `dirty`.
    pub fn compact(&mut self) {
        self.members.retain(|m| !m.is_tombstoned());
        self.dirty = false;
    }
}

/// Back-pointer from a member entity to its header, by ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub header: EntityId,
}

// ============================================================================
// NAVIGATION
// ============================================================================

/// Footprint plus cached flow-field sample and per-entity tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Navigation {
    pub width: i32,
    pub height: i32,
    pub flow_x: Fixed,
    pub flow_y: Fixed,
    pub has_direct_path: bool,
    pub turn_threshold: Fixed,
    pub brake_intensity: Fixed,
    pub flow_lookahead: i32,
    pub exploration_bias: Fixed,
    pub budget_multiplier: Fixed,
}

impl Default for Navigation {
    fn default() -> Self {
        Self {
            width: 1,
            height: 1,
            flow_x: 0,
            flow_y: 0,
            has_direct_path: false,
            turn_threshold: crate::fixed::SCALE / 4,
            brake_intensity: crate::fixed::SCALE / 2,
            flow_lookahead: 1,
            exploration_bias: 0,
            budget_multiplier: crate::fixed::SCALE,
        }
    }
}

impl Navigation {
    pub fn is_composite(&self) -> bool {
        self.width > 1 || self.height > 1
    }
}

/// Which target group (`spec.md` §4.6) an entity navigates toward. Absent
/// means group 0 (the cursor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Target {
    pub group: u32,
}

// ============================================================================
// GENETIC
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpeciesKind {
    Drain,
    Snake,
    Pylon,
    Quasar,
    Swarm,
    Storm,
}

/// Per-entity GA bookkeeping: which sample this entity is running, and the
/// running metrics fed into fitness at death (`spec.md` §4.11).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Genotype {
    pub species: SpeciesKind,
    pub eval_id: u64,
    pub ticks_alive: u64,
    pub cum_dist_sq: i64,
    pub sample_count: u64,
    pub time_in_shield: u64,
}

impl Genotype {
    pub fn new(species: SpeciesKind, eval_id: u64) -> Self {
        Self {
            species,
            eval_id,
            ticks_alive: 0,
            cum_dist_sq: 0,
            sample_count: 0,
            time_in_shield: 0,
        }
    }
}

// ============================================================================
// SPECIES-SPECIFIC
// ============================================================================

/// Drain-specific tuning sampled from the species' gene vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Drain {
    pub base_speed: Fixed,
    pub overspeed_drag: Fixed,
    pub materialize_remaining: i64,
    /// Interval gate on shield energy-drain ticks while inside a shield's
    /// ellipse (`spec.md` §4.9 "interval-gated" shield interaction); counts
    /// down to zero, at which point one tick fires and it resets.
    pub shield_drain_cooldown: i64,
}

/// Marker + ring buffer of recent grid cells for the snake head, sampled by
/// trailing body segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnakeHead {
    pub trail: VecDeque<(i32, i32)>,
    pub trail_capacity: usize,
}

impl SnakeHead {
    pub fn new(trail_capacity: usize) -> Self {
        Self {
            trail: VecDeque::with_capacity(trail_capacity),
            trail_capacity,
        }
    }

    pub fn push(&mut self, cell: (i32, i32)) {
        if self.trail.len() == self.trail_capacity {
            self.trail.pop_front();
        }
        self.trail.push_back(cell);
    }

    /// The cell `back` entries behind the most recent sample, or `None` if
    /// the trail is not yet that long.
    pub fn sample(&self, back: usize) -> Option<(i32, i32)> {
        let len = self.trail.len();
        if back >= len {
            return None;
        }
        self.trail.get(len - 1 - back).copied()
    }
}

/// A body segment's position in the chain (0 = closest to the head).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnakeBody {
    pub segment_index: u32,
    pub spacing: u32,
    pub connected: bool,
}

/// Per-member spring rest target and lateral offset within a segment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SnakeMember {
    pub rest_x: Fixed,
    pub rest_y: Fixed,
    pub lateral_offset: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Pylon {
    pub beam_cooldown: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Quasar {
    pub shielded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Swarm {
    pub fusion_cooldown: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Storm {
    pub radius: i32,
}

/// A buff orb orbiting the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Orb {
    pub angle: Fixed,
    pub orbit_radius: Fixed,
    pub energy: i32,
}

/// Weapon/cooldown state for a fire-request-driven ability (rod, special).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Weapon {
    pub cooldown_remaining: i64,
    pub fire_rate_ms: i64,
}

/// Player heat resource (drives drain spawn count: `floor(heat / 10)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Heat {
    pub value: i32,
}

/// A generic energy pool (shields, buffs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Energy {
    pub value: i32,
    pub max: i32,
}

/// An elliptical shield volume centered on its entity's `Kinetic`/`Position`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Shield {
    pub radius_x: Fixed,
    pub radius_y: Fixed,
    pub inv_rx_sq: Fixed,
    pub inv_ry_sq: Fixed,
}

impl Shield {
    pub fn new(radius_x: Fixed, radius_y: Fixed) -> Self {
        Self {
            radius_x,
            radius_y,
            inv_rx_sq: crate::fixed::div(crate::fixed::SCALE, crate::fixed::mul(radius_x, radius_x)),
            inv_ry_sq: crate::fixed::div(crate::fixed::SCALE, crate::fixed::mul(radius_y, radius_y)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Loot {
    pub value: i32,
}

/// A transient lightning polyline VFX from `from` to a fixed target point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Lightning {
    pub from: EntityId,
    pub to_x: Fixed,
    pub to_y: Fixed,
    pub ttl_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flash {
    pub ttl_ms: i64,
    pub color: Color,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Decay {
    pub ttl_ms: i64,
    pub rate: Fixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dust {
    pub ttl_ms: i64,
}

/// A blocking wall cell. The spatial index's wall queries derive only from
/// entities carrying this component (`spec.md` §3 invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Wall {
    pub mask: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Splash {
    pub ttl_ms: i64,
    pub radius: Fixed,
}

/// A merge-capable AoE effect center (`spec.md` §4.10, §8 scenario 6).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Explosion {
    pub center_x: Fixed,
    pub center_y: Fixed,
    pub radius: Fixed,
    pub intensity: Fixed,
    pub ttl_ms: i64,
}

/// A decorative overlay glyph with its own lifetime, distinct from the
/// permanent [`Sigil`] on living entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Glyph {
    pub rune: char,
    pub ttl_ms: i64,
}
