//! Data-driven combat resolution (`spec.md` §4.8).
//!
//! Every attack looks up a [`CombatProfile`] from a static
//! `(AttackKind, attacker_kind, target_kind)` matrix rather than branching on
//! a class hierarchy (`spec.md` §9 "Deep inheritance in source") -- adding a
//! new species/attack interaction is adding one table row, never a new
//! `match` arm scattered through the file.

use std::collections::HashMap;
use std::sync::OnceLock;

use rand::SeedableRng;
use rand_pcg::Pcg64;
use serde::{Deserialize, Serialize};
use vf_ecs::EntityId;

use crate::components::{Combat, CombatEntityKind, CompositeType, Header, Kinetic, Lightning, Member, Protection};
use crate::events::{EventBus, EventKind, SimEvent};
use crate::fixed::{self, Fixed};
use crate::kinematics::{self, CollisionProfile};
use crate::scheduler::{MetaSystemCommand, SimContext, System};
use crate::spatial::SpatialIndex;
use crate::world::World;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttackKind {
    Kinetic,
    Stun,
    Drain,
    Explosive,
    Lightning,
}

/// Bits for [`CombatProfile::effect_mask`] -- which side effects beyond raw
/// damage an attack applies (`spec.md` §4.8 "effect_mask").
pub mod effect {
    pub const KINETIC: u8 = 1 << 0;
    pub const STUN: u8 = 1 << 1;
    pub const VAMPIRE_DRAIN: u8 = 1 << 2;
}

/// A `kinetic_immunity_remaining` window long enough for a knocked-back
/// entity to visibly separate before it can be shoved again, and (for snake
/// body members specifically) the same window the spring-physics pass reads
/// to decide a segment is currently displaced rather than at rest
/// (`spec.md` §4.9 "Snake"). Shared by every [`CollisionProfile`] literal
/// below as their `immunity_duration_ms`.
const KINETIC_DISPLACEMENT_MS: i64 = 250;

/// The resolved effect of one `(attack, attacker, target)` combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CombatProfile {
    pub damage: i32,
    pub stun_ms: i64,
    /// HP restored to the attacker on a successful hit (vampire-drain
    /// species such as Drain).
    pub vampire_drain: i32,
    /// Immunity bit this attack respects (see [`Protection`]); if the
    /// target has this bit set, the attack is entirely negated.
    pub immunity_bit: u8,
    /// Which side effects beyond damage/stun/drain this attack applies; see
    /// [`effect`].
    pub effect_mask: u8,
    /// Collision response applied when `effect_mask & effect::KINETIC != 0`
    /// (`spec.md` §4.8 "collision_profile pointer (optional)").
    pub collision_profile: Option<CollisionProfile>,
    /// A re-entrant attack fired at the same target immediately after this
    /// one resolves, originating from the same owner (`spec.md` §4.8
    /// "chain_attack (optional): {attack_kind} re-entrant request").
    pub chain_attack: Option<AttackKind>,
}

impl CombatProfile {
    const fn harmless() -> Self {
        Self {
            damage: 0,
            stun_ms: 0,
            vampire_drain: 0,
            immunity_bit: 0,
            effect_mask: 0,
            collision_profile: None,
            chain_attack: None,
        }
    }
}

type MatrixKey = (AttackKind, CombatEntityKind, CombatEntityKind);

static ATTACK_MATRIX: OnceLock<HashMap<MatrixKey, CombatProfile>> = OnceLock::new();

fn attack_matrix() -> &'static HashMap<MatrixKey, CombatProfile> {
    ATTACK_MATRIX.get_or_init(|| {
        use AttackKind::*;
        use CombatEntityKind::*;
        let mut m = HashMap::new();
        let mut insert = |k: MatrixKey, p: CombatProfile| {
            m.insert(k, p);
        };

        let knockback = CollisionProfile {
            impulse_magnitude: fixed::from_int(2),
            restitution: 0,
            immunity_duration_ms: KINETIC_DISPLACEMENT_MS,
            lateral_jitter: fixed::SCALE / 20,
            rotational_factor: fixed::SCALE / 4,
        };

        insert(
            (Kinetic, Cursor, Drain),
            CombatProfile {
                damage: 1,
                immunity_bit: Protection::FROM_DELETE,
                effect_mask: effect::KINETIC,
                collision_profile: Some(knockback),
                ..CombatProfile::harmless()
            },
        );
        insert(
            (Drain, Drain, Cursor),
            CombatProfile {
                damage: 1,
                vampire_drain: 1,
                immunity_bit: Protection::FROM_DRAIN,
                effect_mask: effect::VAMPIRE_DRAIN,
                ..CombatProfile::harmless()
            },
        );
        insert(
            (Kinetic, Cursor, Quasar),
            CombatProfile {
                damage: 1,
                immunity_bit: Protection::FROM_DELETE,
                effect_mask: effect::KINETIC,
                collision_profile: Some(knockback),
                ..CombatProfile::harmless()
            },
        );
        insert(
            (Stun, Cursor, SnakeHead),
            CombatProfile {
                stun_ms: 600,
                immunity_bit: Protection::FROM_SPECIES,
                effect_mask: effect::STUN,
                ..CombatProfile::harmless()
            },
        );
        insert(
            (Kinetic, Cursor, SnakeBody),
            CombatProfile {
                damage: 1,
                immunity_bit: Protection::FROM_DELETE,
                effect_mask: effect::KINETIC,
                collision_profile: Some(CollisionProfile {
                    impulse_magnitude: fixed::from_int(3),
                    restitution: 0,
                    immunity_duration_ms: KINETIC_DISPLACEMENT_MS,
                    lateral_jitter: fixed::SCALE / 20,
                    rotational_factor: fixed::SCALE / 4,
                }),
                ..CombatProfile::harmless()
            },
        );
        insert(
            (Explosive, Cursor, Pylon),
            CombatProfile {
                damage: 3,
                stun_ms: 200,
                immunity_bit: Protection::FROM_DELETE,
                effect_mask: effect::STUN,
                ..CombatProfile::harmless()
            },
        );
        // A pylon's lightning bolt also procs a stun jolt at the same
        // target; routed as a `chain_attack` re-entrant request rather than
        // folded into this profile's own `stun_ms` so the two effects stay
        // independently immunity-checked (`spec.md` §4.8).
        insert(
            (Lightning, Pylon, Generic),
            CombatProfile {
                damage: 2,
                immunity_bit: Protection::FROM_SPECIES,
                chain_attack: Some(Stun),
                ..CombatProfile::harmless()
            },
        );
        insert(
            (Stun, Pylon, Generic),
            CombatProfile {
                stun_ms: 400,
                immunity_bit: Protection::FROM_SPECIES,
                effect_mask: effect::STUN,
                ..CombatProfile::harmless()
            },
        );
        insert(
            (Kinetic, Cursor, Swarm),
            CombatProfile {
                damage: 1,
                immunity_bit: Protection::FROM_DELETE,
                effect_mask: effect::KINETIC,
                collision_profile: Some(knockback),
                ..CombatProfile::harmless()
            },
        );
        insert(
            (Explosive, Cursor, Storm),
            CombatProfile {
                damage: 2,
                stun_ms: 100,
                immunity_bit: Protection::FROM_DELETE,
                effect_mask: effect::STUN,
                ..CombatProfile::harmless()
            },
        );
        m
    })
}

/// `(attack, attacker_kind, target_kind) -> profile`, falling back to a
/// harmless no-op profile for combinations with no table entry rather than
/// panicking -- an unlisted interaction is "nothing happens", not a bug.
pub fn lookup_profile(attack: AttackKind, attacker_kind: CombatEntityKind, target_kind: CombatEntityKind) -> CombatProfile {
    attack_matrix()
        .get(&(attack, attacker_kind, target_kind))
        .copied()
        .unwrap_or_else(CombatProfile::harmless)
}

/// Resolve composite-aware damage routing for a hit against `entity`
/// (`spec.md` §4.8 "Damage routing by composite type"):
///
/// - `Unit`: the whole composite is one creature: damage always routes to
///   the header, regardless of which member was actually struck.
/// - `Ablative`: each member absorbs its own hits independently; the struck
///   member takes the damage and the header is untouched.
/// - `Container`: a pure grouping with no combat identity of its own;
///   attacks against it (or routed to it) have no target and are rejected.
///
/// Returns `None` if the attack should have no effect at all.
fn routed_target(world: &World, entity: EntityId) -> Option<EntityId> {
    if let Some(header) = world.get::<Header>(entity) {
        if header.composite_type == CompositeType::Container {
            return None;
        }
    }
    if let Some(member) = world.get::<Member>(entity) {
        if let Some(header) = world.get::<Header>(member.header) {
            match header.composite_type {
                CompositeType::Unit => return Some(member.header),
                CompositeType::Container => return None,
                CompositeType::Ablative => return Some(entity),
            }
        }
    }
    Some(entity)
}

/// Average grid offset, in Q32.32, of whichever of `members` the header
/// actually lists -- the centroid an off-center area hit imparts its angular
/// kick around (`spec.md` §4.8 "for composites, compute the centroid of the
/// hit members' offsets"). `None` if `header_entity` isn't a composite, or
/// none of `members` belong to it.
fn composite_offset(world: &World, header_entity: EntityId, members: &[EntityId]) -> Option<(Fixed, Fixed)> {
    let header = world.get::<Header>(header_entity)?;
    let (mut sum_x, mut sum_y, mut n) = (0i64, 0i64, 0i64);
    for &m in members {
        if let Some(entry) = header.members.iter().find(|e| e.entity == m) {
            sum_x += entry.dx as i64;
            sum_y += entry.dy as i64;
            n += 1;
        }
    }
    if n == 0 {
        return None;
    }
    Some((fixed::from_int((sum_x / n) as i32), fixed::from_int((sum_y / n) as i32)))
}

/// Push the entity actually struck by a kinetic attack (`spec.md` §4.8
/// "apply effects: Kinetic"). The radial direction is `hit's position -
/// (origin_x, origin_y)`; a composite member shoves its header instead of
/// itself, offset by its own grid position within the composite via
/// [`kinematics::apply_offset_collision`], so the header visibly rotates
/// around the point it was actually struck. No-ops if the routed target is
/// enraged or still inside its own displacement window.
#[allow(clippy::too_many_arguments)]
fn apply_kinetic_effect(
    world: &mut World,
    spatial: &mut SpatialIndex,
    profile: &CombatProfile,
    hit: EntityId,
    routed: EntityId,
    origin_x: Fixed,
    origin_y: Fixed,
    rng: &mut Pcg64,
) {
    let Some(collision) = profile.collision_profile else {
        return;
    };
    let blocked = world
        .get::<Combat>(routed)
        .map(|c| c.enraged || c.kinetic_immunity_remaining > 0)
        .unwrap_or(true);
    if blocked {
        return;
    }

    let composite_header = world.get::<Member>(hit).map(|m| m.header).filter(|h| world.has::<Header>(*h));

    let moved = if let Some(header_entity) = composite_header {
        let offset = composite_offset(world, header_entity, std::slice::from_ref(&hit));
        match (world.get::<Kinetic>(header_entity).copied(), offset) {
            (Some(mut header_k), Some((ox, oy))) => {
                let radial_x = header_k.x - origin_x;
                let radial_y = header_k.y - origin_y;
                kinematics::apply_offset_collision(&mut header_k, radial_x, radial_y, ox, oy, &collision, rng);
                world.set(header_entity, header_k);
                let (hx, hy) = header_k.grid_position();
                spatial.set_position(world, header_entity, hx, hy);
                true
            }
            _ => false,
        }
    } else {
        match world.get::<Kinetic>(hit).copied() {
            Some(mut hit_kinetic) => {
                let radial_x = hit_kinetic.x - origin_x;
                let radial_y = hit_kinetic.y - origin_y;
                kinematics::apply_collision(&mut hit_kinetic, radial_x, radial_y, &collision, rng);
                world.set(hit, hit_kinetic);
                let (mx, my) = hit_kinetic.grid_position();
                spatial.set_position(world, hit, mx, my);
                true
            }
            None => false,
        }
    };

    if moved {
        if let Some(combat) = world.get_mut::<Combat>(routed) {
            combat.kinetic_immunity_remaining = combat.kinetic_immunity_remaining.max(collision.immunity_duration_ms);
        }
    }
}

/// As [`apply_kinetic_effect`], but for an area attack that may have struck
/// several members of the same composite at once: the radial direction is
/// taken from `routed`'s own position (the header, for a composite), offset
/// by the centroid of every member in `members` that belongs to it.
fn apply_area_kinetic_effect(
    world: &mut World,
    spatial: &mut SpatialIndex,
    profile: &CombatProfile,
    routed: EntityId,
    members: &[EntityId],
    origin_x: Fixed,
    origin_y: Fixed,
    rng: &mut Pcg64,
) {
    let Some(collision) = profile.collision_profile else {
        return;
    };
    let blocked = world
        .get::<Combat>(routed)
        .map(|c| c.enraged || c.kinetic_immunity_remaining > 0)
        .unwrap_or(true);
    if blocked {
        return;
    }
    let Some(mut k) = world.get::<Kinetic>(routed).copied() else {
        return;
    };

    let radial_x = k.x - origin_x;
    let radial_y = k.y - origin_y;

    match composite_offset(world, routed, members) {
        Some((ox, oy)) => kinematics::apply_offset_collision(&mut k, radial_x, radial_y, ox, oy, &collision, rng),
        None => kinematics::apply_collision(&mut k, radial_x, radial_y, &collision, rng),
    }

    world.set(routed, k);
    let (gx, gy) = k.grid_position();
    spatial.set_position(world, routed, gx, gy);

    if let Some(combat) = world.get_mut::<Combat>(routed) {
        combat.kinetic_immunity_remaining = combat.kinetic_immunity_remaining.max(collision.immunity_duration_ms);
    }
}

/// Resolve one attack fired by `owner` (the entity that requested it, e.g.
/// the cursor) from `origin` (the entity whose `Combat.kind` decides the
/// attacker kind, falling back to `owner`'s) against `target`, where `hit`
/// is the specific entity actually struck -- `target` itself, or one of its
/// composite members (`spec.md` §4.8 steps 1-2). Applies composite routing,
/// protection/immunity checks, damage, stun, vampire drain and kinetic
/// knockback, and publishes `DamageDealt`/`EntityDied` events. Returns `true`
/// if the attack had any effect.
#[allow(clippy::too_many_arguments)]
pub fn resolve_direct_attack(
    world: &mut World,
    events: &mut EventBus,
    spatial: &mut SpatialIndex,
    attack: AttackKind,
    owner: EntityId,
    origin: EntityId,
    target: EntityId,
    hit: EntityId,
    rng: &mut Pcg64,
) -> bool {
    // Step 2: `hit` must be `target` itself or one of its composite members;
    // a `Container` target has no combat identity to strike at all.
    if let Some(header) = world.get::<Header>(target) {
        if header.composite_type == CompositeType::Container {
            return false;
        }
    }
    let hit_is_valid = hit == target || world.get::<Member>(hit).map(|m| m.header == target).unwrap_or(false);
    if !hit_is_valid {
        return false;
    }

    let Some(routed) = routed_target(world, hit) else {
        return false;
    };

    // Step 1: attacker kind resolves from `origin`'s `Combat`, falling back
    // to `owner`'s.
    let attacker_kind = world
        .get::<Combat>(origin)
        .or_else(|| world.get::<Combat>(owner))
        .map(|c| c.kind)
        .unwrap_or(CombatEntityKind::Generic);

    let Some(target_combat) = world.get::<Combat>(routed) else {
        return false;
    };
    let target_kind = target_combat.kind;

    if target_combat.damage_immunity_remaining > 0 {
        return false;
    }

    let profile = lookup_profile(attack, attacker_kind, target_kind);
    if let Some(protection) = world.get::<Protection>(routed) {
        if profile.immunity_bit != 0 && protection.has(profile.immunity_bit) {
            return false;
        }
    }

    if profile.damage == 0 && profile.stun_ms == 0 && profile.vampire_drain == 0 && profile.effect_mask == 0 {
        return false;
    }

    let died = {
        let combat = world.get_mut::<Combat>(routed).expect("checked above");
        combat.hp -= profile.damage;
        combat.stun_remaining = combat.stun_remaining.max(profile.stun_ms);
        if profile.damage > 0 {
            combat.hit_flash_remaining = combat.hit_flash_remaining.max(150);
        }
        combat.is_dead()
    };

    if profile.damage > 0 {
        events.publish(SimEvent::DamageDealt {
            attacker: owner,
            target: routed,
            amount: profile.damage,
        });
    }

    if profile.vampire_drain > 0 {
        if let Some(attacker_combat) = world.get_mut::<Combat>(owner) {
            attacker_combat.hp = (attacker_combat.hp + profile.vampire_drain).min(attacker_combat.max_hp);
        }
        if profile.effect_mask & effect::VAMPIRE_DRAIN != 0 {
            if let Some(hit_kinetic) = world.get::<Kinetic>(hit).copied() {
                let bolt = world.create();
                world.set(
                    bolt,
                    Lightning {
                        from: owner,
                        to_x: hit_kinetic.x,
                        to_y: hit_kinetic.y,
                        ttl_ms: 150,
                    },
                );
            }
        }
    }

    if profile.effect_mask & effect::KINETIC != 0 {
        let (origin_x, origin_y) = world
            .get::<Kinetic>(origin)
            .or_else(|| world.get::<Kinetic>(owner))
            .map(|k| (k.x, k.y))
            .unwrap_or((0, 0));
        apply_kinetic_effect(world, spatial, &profile, hit, routed, origin_x, origin_y, rng);
    }

    if died {
        events.publish(SimEvent::EntityDied {
            entity: routed,
            kind: target_kind,
        });
    }

    if !died {
        if let Some(chain) = profile.chain_attack {
            // Step 5: the chained request originates from `owner`, same as
            // the original attack's own owner (`spec.md` §4.8 "Emit chain
            // attack ... with origin = owner").
            resolve_direct_attack(world, events, spatial, chain, owner, owner, target, hit, rng);
        }
    }

    true
}

/// Every combat-bearing entity within `radius` (Q32.32) of `(center_x,
/// center_y)`, found via [`SpatialIndex`] by scanning the bounding box of
/// candidate cells, excluding `owner`/`origin` themselves. Sorted and
/// deduplicated so repeated cells never double-count an entity.
fn area_candidates(world: &World, spatial: &SpatialIndex, center_x: Fixed, center_y: Fixed, radius: Fixed, owner: EntityId, origin: EntityId) -> Vec<EntityId> {
    let cell_radius = fixed::to_int(radius) + 1;
    let cx = fixed::to_int(center_x);
    let cy = fixed::to_int(center_y);
    let radius_sq = (radius as i128) * (radius as i128);

    let mut candidates = Vec::new();
    for dy in -cell_radius..=cell_radius {
        for dx in -cell_radius..=cell_radius {
            for &e in spatial.get_all_at(cx + dx, cy + dy) {
                if !world.has::<Combat>(e) || e == owner || e == origin {
                    continue;
                }
                if let Some(kinetic) = world.get::<Kinetic>(e) {
                    if fixed::dist_sq_raw(center_x, center_y, kinetic.x, kinetic.y) <= radius_sq {
                        candidates.push(e);
                    }
                }
            }
        }
    }
    candidates.sort_by_key(|e| e.to_raw());
    candidates.dedup();
    candidates
}

/// Resolve one area-attack request against every entity in `hits` (already
/// resolved by the caller -- typically [`area_candidates`] run against the
/// request's own radius), falling back to `target` alone when `hits` is
/// empty (`spec.md` §4.8 "Area attack resolution"):
///
/// 1. every hit is grouped by its routed composite header (step 1-2);
///    anything that routes into a `Container` has no combat identity and is
///    dropped;
/// 2. an `Ablative` group resolves each of its hits independently through
///    [`resolve_direct_attack`], so each member is capped by its own
///    `damage_immunity_remaining` (step 3);
/// 3. everything else (`Unit`, or a lone non-composite entity) takes the
///    attack's damage once, scaled by how many of its members this request
///    actually struck (step 4), then applies kinetic/stun/vampire-drain/
///    chain effects exactly once against the routed entity (steps 5-7),
///    offset by the centroid of the struck members when it's a composite.
///
/// Returns every entity the attack had an effect on.
#[allow(clippy::too_many_arguments)]
pub fn resolve_area_attack(
    world: &mut World,
    spatial: &mut SpatialIndex,
    events: &mut EventBus,
    attack: AttackKind,
    owner: EntityId,
    origin: EntityId,
    origin_xy: Option<(Fixed, Fixed)>,
    target: EntityId,
    hits: &[EntityId],
    rng: &mut Pcg64,
) -> Vec<EntityId> {
    let fallback = [target];
    let hits: &[EntityId] = if hits.is_empty() { &fallback } else { hits };

    let attacker_kind = world
        .get::<Combat>(origin)
        .or_else(|| world.get::<Combat>(owner))
        .map(|c| c.kind)
        .unwrap_or(CombatEntityKind::Generic);

    let (origin_x, origin_y) = origin_xy
        .or_else(|| world.get::<Kinetic>(origin).map(|k| (k.x, k.y)))
        .unwrap_or((0, 0));

    let mut groups: Vec<(EntityId, Vec<EntityId>)> = Vec::new();
    for &hit in hits {
        let Some(routed) = routed_target(world, hit) else { continue };
        match groups.iter_mut().find(|(r, _)| *r == routed) {
            Some((_, members)) => members.push(hit),
            None => groups.push((routed, vec![hit])),
        }
    }

    let mut applied = Vec::new();
    for (routed, members) in groups {
        let is_ablative = world.get::<Member>(members[0]).is_some()
            && world
                .get::<Header>(routed)
                .map(|h| h.composite_type == CompositeType::Ablative)
                .unwrap_or(false);

        if is_ablative {
            for &hit in &members {
                if resolve_direct_attack(world, events, spatial, attack, owner, origin, routed, hit, rng) {
                    applied.push(hit);
                }
            }
            continue;
        }

        let Some(target_combat) = world.get::<Combat>(routed) else { continue };
        let target_kind = target_combat.kind;
        if target_combat.damage_immunity_remaining > 0 {
            continue;
        }
        let profile = lookup_profile(attack, attacker_kind, target_kind);
        if let Some(protection) = world.get::<Protection>(routed) {
            if profile.immunity_bit != 0 && protection.has(profile.immunity_bit) {
                continue;
            }
        }
        if profile.damage == 0 && profile.stun_ms == 0 && profile.vampire_drain == 0 && profile.effect_mask == 0 {
            continue;
        }

        let count = members.len() as i32;
        let died = {
            let combat = world.get_mut::<Combat>(routed).expect("checked above");
            combat.hp -= profile.damage * count;
            combat.stun_remaining = combat.stun_remaining.max(profile.stun_ms);
            if profile.damage > 0 {
                combat.hit_flash_remaining = combat.hit_flash_remaining.max(150);
            }
            combat.is_dead()
        };

        if profile.damage > 0 {
            events.publish(SimEvent::DamageDealt {
                attacker: owner,
                target: routed,
                amount: profile.damage * count,
            });
        }

        if profile.vampire_drain > 0 {
            if let Some(attacker_combat) = world.get_mut::<Combat>(owner) {
                attacker_combat.hp = (attacker_combat.hp + profile.vampire_drain * count).min(attacker_combat.max_hp);
            }
        }

        if profile.effect_mask & effect::KINETIC != 0 {
            apply_area_kinetic_effect(world, spatial, &profile, routed, &members, origin_x, origin_y, rng);
        }

        if died {
            events.publish(SimEvent::EntityDied { entity: routed, kind: target_kind });
        }

        applied.extend(members.iter().copied());

        if !died {
            if let Some(chain) = profile.chain_attack {
                // Step 7: the chain fans out, one re-entrant request per
                // member this request actually struck.
                for &hit in &members {
                    resolve_direct_attack(world, events, spatial, chain, owner, owner, routed, hit, rng);
                }
            }
        }
    }

    applied
}

/// Hop an attack from `start_target` to up to `chain_count` additional
/// nearby, not-yet-hit targets within `chain_radius`, each hop originating
/// from the previous target (`spec.md` §4.10 "lightning chains"). Returns
/// every entity that was actually hit, in hop order.
#[allow(clippy::too_many_arguments)]
pub fn resolve_chain_attack(
    world: &mut World,
    spatial: &mut SpatialIndex,
    events: &mut EventBus,
    attacker: EntityId,
    start_target: EntityId,
    chain_count: u32,
    chain_radius: Fixed,
    attack: AttackKind,
    rng: &mut Pcg64,
) -> Vec<EntityId> {
    let mut hit = Vec::new();
    let mut already_hit = std::collections::HashSet::new();
    let mut current = start_target;

    if resolve_direct_attack(world, events, spatial, attack, attacker, attacker, current, current, rng) {
        hit.push(current);
    }
    already_hit.insert(current);

    for _ in 0..chain_count {
        let Some(current_kinetic) = world.get::<Kinetic>(current).copied() else {
            break;
        };
        let radius_sq = (chain_radius as i128) * (chain_radius as i128);
        let cell_radius = fixed::to_int(chain_radius) + 1;
        let (cx, cy) = current_kinetic.grid_position();

        let mut best: Option<(EntityId, i128)> = None;
        for dy in -cell_radius..=cell_radius {
            for dx in -cell_radius..=cell_radius {
                for &e in spatial.get_all_at(cx + dx, cy + dy) {
                    if already_hit.contains(&e) || !world.has::<Combat>(e) || e == attacker {
                        continue;
                    }
                    if let Some(kinetic) = world.get::<Kinetic>(e) {
                        let d = fixed::dist_sq_raw(current_kinetic.x, current_kinetic.y, kinetic.x, kinetic.y);
                        if d <= radius_sq {
                            match best {
                                Some((_, best_d)) if best_d <= d && (best_d != d || best.unwrap().0.to_raw() <= e.to_raw()) => {}
                                _ => best = Some((e, d)),
                            }
                        }
                    }
                }
            }
        }

        let Some((next, _)) = best else { break };
        already_hit.insert(next);
        if resolve_direct_attack(world, events, spatial, attack, attacker, attacker, next, next, rng) {
            hit.push(next);
        }
        current = next;
    }

    hit
}

/// Decrement every `Combat`'s timers by `dt_ms`. Runs once per tick, before
/// any attack resolution (`spec.md` §4.8 "per-tick maintenance").
pub fn tick_combat_timers(world: &mut World, dt_ms: i64) {
    for e in world.all::<Combat>() {
        if let Some(combat) = world.get_mut::<Combat>(e) {
            combat.tick_timers(dt_ms);
        }
    }
}

/// A seed fixed at build time rather than sampled from wall-clock entropy,
/// so a whole run -- collision jitter included -- stays reproducible given
/// the same input event sequence (`spec.md` §9 "Determinism").
const COMBAT_RNG_SEED: u64 = 0xC0A7_5EED;

/// Drains queued attack requests each tick and resolves them, running after
/// every system that might publish one and before anything that reads
/// `DamageDealt`/`EntityDied` (`spec.md` §4.8, §4.5 scheduling order).
#[derive(Debug)]
pub struct CombatSystem {
    rng: Pcg64,
}

impl CombatSystem {
    pub fn new() -> Self {
        Self {
            rng: Pcg64::seed_from_u64(COMBAT_RNG_SEED),
        }
    }
}

impl Default for CombatSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl System for CombatSystem {
    fn name(&self) -> &'static str {
        "combat"
    }

    fn priority(&self) -> i32 {
        100
    }

    fn run(&mut self, ctx: &mut SimContext, dt_ms: i64) -> Vec<MetaSystemCommand> {
        tick_combat_timers(ctx.world, dt_ms);

        let direct: Vec<_> = ctx
            .events
            .events_of_kind(EventKind::CombatAttackDirectRequest)
            .cloned()
            .collect();
        for event in direct {
            if let SimEvent::CombatAttackDirectRequest {
                attack,
                owner,
                origin,
                target,
                hit,
            } = event
            {
                resolve_direct_attack(ctx.world, ctx.events, ctx.spatial, attack, owner, origin, target, hit, &mut self.rng);
            }
        }

        let area: Vec<_> = ctx
            .events
            .events_of_kind(EventKind::CombatAttackAreaRequest)
            .cloned()
            .collect();
        for event in area {
            if let SimEvent::CombatAttackAreaRequest {
                attack,
                owner,
                origin,
                origin_xy,
                radius,
                target,
                hits,
            } = event
            {
                let (cx, cy) = match origin_xy {
                    Some(xy) => xy,
                    None => match ctx.world.get::<Kinetic>(origin) {
                        Some(k) => (k.x, k.y),
                        None => continue,
                    },
                };
                let resolved_hits = if hits.is_empty() {
                    area_candidates(ctx.world, ctx.spatial, cx, cy, radius, owner, origin)
                } else {
                    hits
                };
                resolve_area_attack(
                    ctx.world,
                    ctx.spatial,
                    ctx.events,
                    attack,
                    owner,
                    origin,
                    Some((cx, cy)),
                    target,
                    &resolved_hits,
                    &mut self.rng,
                );
            }
        }

        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::{BehaviorKind, Kinetic, MemberEntry};
    use crate::config::SimConfig;

    fn setup() -> (World, SpatialIndex, EventBus) {
        (
            World::new(SimConfig::default()),
            SpatialIndex::new(20, 20),
            EventBus::new(),
        )
    }

    fn test_rng() -> Pcg64 {
        Pcg64::seed_from_u64(7)
    }

    #[test]
    fn unlisted_combination_is_harmless() {
        let (mut world, mut spatial, mut events) = setup();
        let mut rng = test_rng();
        let attacker = world.create();
        let target = world.create();
        world.set(target, Combat::new(CombatEntityKind::Generic, 5));
        let applied = resolve_direct_attack(
            &mut world,
            &mut events,
            &mut spatial,
            AttackKind::Kinetic,
            attacker,
            attacker,
            target,
            target,
            &mut rng,
        );
        assert!(!applied);
        assert_eq!(world.get::<Combat>(target).unwrap().hp, 5);
    }

    #[test]
    fn immunity_negates_attack() {
        let (mut world, mut spatial, mut events) = setup();
        let mut rng = test_rng();
        let attacker = world.create();
        world.set(attacker, Combat::new(CombatEntityKind::Cursor, 10));
        let target = world.create();
        world.set(target, Combat::new(CombatEntityKind::Drain, 1));
        world.set(target, Protection::default().with(Protection::FROM_DELETE));

        let applied = resolve_direct_attack(
            &mut world,
            &mut events,
            &mut spatial,
            AttackKind::Kinetic,
            attacker,
            attacker,
            target,
            target,
            &mut rng,
        );
        assert!(!applied);
        assert_eq!(world.get::<Combat>(target).unwrap().hp, 1);
    }

    #[test]
    fn damage_kills_and_emits_death_event() {
        let (mut world, mut spatial, mut events) = setup();
        let mut rng = test_rng();
        let attacker = world.create();
        world.set(attacker, Combat::new(CombatEntityKind::Cursor, 10));
        let target = world.create();
        world.set(target, Combat::new(CombatEntityKind::Drain, 1));

        resolve_direct_attack(
            &mut world,
            &mut events,
            &mut spatial,
            AttackKind::Kinetic,
            attacker,
            attacker,
            target,
            target,
            &mut rng,
        );
        events.advance_tick();
        assert!(world.get::<Combat>(target).unwrap().is_dead());
        assert_eq!(events.events_of_kind(crate::events::EventKind::EntityDied).count(), 1);
    }

    #[test]
    fn vampire_drain_heals_attacker() {
        let (mut world, mut spatial, mut events) = setup();
        let mut rng = test_rng();
        let attacker = world.create();
        world.set(attacker, Combat::new(CombatEntityKind::Drain, 5));
        world.get_mut::<Combat>(attacker).unwrap().hp = 3;
        let target = world.create();
        world.set(target, Combat::new(CombatEntityKind::Cursor, 5));

        resolve_direct_attack(
            &mut world,
            &mut events,
            &mut spatial,
            AttackKind::Drain,
            attacker,
            attacker,
            target,
            target,
            &mut rng,
        );
        assert_eq!(world.get::<Combat>(attacker).unwrap().hp, 4);
    }

    #[test]
    fn vampire_drain_spawns_a_lightning_bolt_to_the_hit_entity() {
        let (mut world, mut spatial, mut events) = setup();
        let mut rng = test_rng();
        let attacker = world.create();
        world.set(attacker, Combat::new(CombatEntityKind::Drain, 5));
        let target = world.create();
        world.set(target, Combat::new(CombatEntityKind::Cursor, 5));
        world.set(target, Kinetic::at_cell(3, 3));

        resolve_direct_attack(
            &mut world,
            &mut events,
            &mut spatial,
            AttackKind::Drain,
            attacker,
            attacker,
            target,
            target,
            &mut rng,
        );
        assert_eq!(world.all::<Lightning>().len(), 1);
    }

    #[test]
    fn unit_composite_damage_routes_to_header() {
        let (mut world, mut spatial, mut events) = setup();
        let mut rng = test_rng();
        let attacker = world.create();
        world.set(attacker, Combat::new(CombatEntityKind::Cursor, 10));

        let header_entity = world.create();
        world.set(header_entity, Combat::new(CombatEntityKind::Pylon, 5));
        let member_entity = world.create();
        world.set(member_entity, Member { header: header_entity });
        world.set(header_entity, Header::new(BehaviorKind::Pylon, CompositeType::Unit));

        resolve_direct_attack(
            &mut world,
            &mut events,
            &mut spatial,
            AttackKind::Explosive,
            attacker,
            attacker,
            header_entity,
            member_entity,
            &mut rng,
        );
        assert!(world.get::<Combat>(header_entity).unwrap().hp < 5);
    }

    #[test]
    fn container_composite_rejects_damage() {
        let (mut world, mut spatial, mut events) = setup();
        let mut rng = test_rng();
        let attacker = world.create();
        world.set(attacker, Combat::new(CombatEntityKind::Cursor, 10));

        let header_entity = world.create();
        world.set(header_entity, Combat::new(CombatEntityKind::Swarm, 5));
        let member_entity = world.create();
        world.set(member_entity, Member { header: header_entity });
        world.set(header_entity, Header::new(BehaviorKind::Swarm, CompositeType::Container));

        let applied = resolve_direct_attack(
            &mut world,
            &mut events,
            &mut spatial,
            AttackKind::Kinetic,
            attacker,
            attacker,
            header_entity,
            member_entity,
            &mut rng,
        );
        assert!(!applied);
        assert_eq!(world.get::<Combat>(header_entity).unwrap().hp, 5);
    }

    #[test]
    fn hit_outside_the_targets_composite_is_rejected() {
        let (mut world, mut spatial, mut events) = setup();
        let mut rng = test_rng();
        let attacker = world.create();
        world.set(attacker, Combat::new(CombatEntityKind::Cursor, 10));

        let header_entity = world.create();
        world.set(header_entity, Combat::new(CombatEntityKind::Pylon, 5));
        world.set(header_entity, Header::new(BehaviorKind::Pylon, CompositeType::Unit));

        let stranger = world.create();
        world.set(stranger, Combat::new(CombatEntityKind::Generic, 5));

        let applied = resolve_direct_attack(
            &mut world,
            &mut events,
            &mut spatial,
            AttackKind::Explosive,
            attacker,
            attacker,
            header_entity,
            stranger,
            &mut rng,
        );
        assert!(!applied);
    }

    #[test]
    fn ablative_member_absorbs_its_own_hit() {
        let (mut world, mut spatial, mut events) = setup();
        let mut rng = test_rng();
        let attacker = world.create();
        world.set(attacker, Combat::new(CombatEntityKind::Cursor, 10));

        let header_entity = world.create();
        world.set(header_entity, Combat::new(CombatEntityKind::Storm, 5));
        let member_entity = world.create();
        world.set(member_entity, Combat::new(CombatEntityKind::Storm, 5));
        world.set(member_entity, Member { header: header_entity });
        world.set(header_entity, Header::new(BehaviorKind::Storm, CompositeType::Ablative));

        resolve_direct_attack(
            &mut world,
            &mut events,
            &mut spatial,
            AttackKind::Explosive,
            attacker,
            attacker,
            header_entity,
            member_entity,
            &mut rng,
        );
        assert!(world.get::<Combat>(member_entity).unwrap().hp < 5);
        assert_eq!(world.get::<Combat>(header_entity).unwrap().hp, 5);
    }

    #[test]
    fn chain_attack_fires_a_re_entrant_hit_at_the_same_target() {
        let (mut world, mut spatial, mut events) = setup();
        let mut rng = test_rng();
        let attacker = world.create();
        world.set(attacker, Combat::new(CombatEntityKind::Pylon, 10));
        let target = world.create();
        world.set(target, Combat::new(CombatEntityKind::Generic, 10));

        resolve_direct_attack(
            &mut world,
            &mut events,
            &mut spatial,
            AttackKind::Lightning,
            attacker,
            attacker,
            target,
            target,
            &mut rng,
        );
        // Lightning's own damage (2) plus the chained stun's damage (0) land
        // on the same target in one call.
        assert_eq!(world.get::<Combat>(target).unwrap().hp, 8);
        assert!(world.get::<Combat>(target).unwrap().stun_remaining > 0);
    }

    #[test]
    fn kinetic_hit_pushes_the_target_and_starts_its_displacement_window() {
        let (mut world, mut spatial, mut events) = setup();
        let mut rng = test_rng();
        let attacker = world.create();
        world.set(attacker, Combat::new(CombatEntityKind::Cursor, 10));

        let target = world.create();
        world.set(target, Combat::new(CombatEntityKind::Drain, 5));
        world.set(target, Kinetic::at_cell(5, 5));
        spatial.set_position(&mut world, target, 5, 5);

        resolve_direct_attack(
            &mut world,
            &mut events,
            &mut spatial,
            AttackKind::Kinetic,
            attacker,
            attacker,
            target,
            target,
            &mut rng,
        );

        assert!(world.get::<Combat>(target).unwrap().kinetic_immunity_remaining > 0);
    }

    #[test]
    fn enraged_target_resists_kinetic_knockback() {
        let (mut world, mut spatial, mut events) = setup();
        let mut rng = test_rng();
        let attacker = world.create();
        world.set(attacker, Combat::new(CombatEntityKind::Cursor, 10));

        let target = world.create();
        let mut combat = Combat::new(CombatEntityKind::Drain, 5);
        combat.enraged = true;
        world.set(target, combat);
        world.set(target, Kinetic::at_cell(5, 5));

        resolve_direct_attack(
            &mut world,
            &mut events,
            &mut spatial,
            AttackKind::Kinetic,
            attacker,
            attacker,
            target,
            target,
            &mut rng,
        );

        assert_eq!(world.get::<Combat>(target).unwrap().kinetic_immunity_remaining, 0);
    }

    #[test]
    fn area_attack_hits_only_entities_within_radius() {
        let (mut world, mut spatial, mut events) = setup();
        let mut rng = test_rng();
        let attacker = world.create();
        world.set(attacker, Combat::new(CombatEntityKind::Cursor, 10));

        let near = world.create();
        spatial.set_position(&mut world, near, 5, 5);
        world.set(near, Kinetic::at_cell(5, 5));
        world.set(near, Combat::new(CombatEntityKind::Storm, 5));

        let far = world.create();
        spatial.set_position(&mut world, far, 15, 15);
        world.set(far, Kinetic::at_cell(15, 15));
        world.set(far, Combat::new(CombatEntityKind::Storm, 5));

        let center = fixed::cell_center(5, 5);
        let candidates = area_candidates(&world, &spatial, center.0, center.1, fixed::from_int(2), attacker, attacker);
        assert_eq!(candidates, vec![near], "the far entity falls outside the radius scan");

        let hit = resolve_area_attack(
            &mut world,
            &mut spatial,
            &mut events,
            AttackKind::Explosive,
            attacker,
            attacker,
            Some(center),
            near,
            &candidates,
            &mut rng,
        );
        assert_eq!(hit, vec![near]);
    }

    #[test]
    fn area_attack_on_an_ablative_composite_damages_only_the_struck_members() {
        let (mut world, mut spatial, mut events) = setup();
        let mut rng = test_rng();
        let attacker = world.create();
        world.set(attacker, Combat::new(CombatEntityKind::Cursor, 10));

        let header = world.create();
        world.set(header, Header::new(BehaviorKind::Storm, CompositeType::Ablative));
        world.set(header, Combat::new(CombatEntityKind::Storm, 99));

        let hit_member = world.create();
        world.set(hit_member, Combat::new(CombatEntityKind::Storm, 5));
        world.set(hit_member, Member { header });
        let spared_member = world.create();
        world.set(spared_member, Combat::new(CombatEntityKind::Storm, 5));
        world.set(spared_member, Member { header });
        if let Some(h) = world.get_mut::<Header>(header) {
            h.members = vec![
                MemberEntry { entity: hit_member, dx: 0, dy: 0, layer: None },
                MemberEntry { entity: spared_member, dx: 1, dy: 0, layer: None },
            ];
        }

        let applied = resolve_area_attack(
            &mut world,
            &mut spatial,
            &mut events,
            AttackKind::Explosive,
            attacker,
            attacker,
            None,
            header,
            &[hit_member],
            &mut rng,
        );

        assert_eq!(applied, vec![hit_member]);
        assert!(world.get::<Combat>(hit_member).unwrap().hp < 5);
        assert_eq!(world.get::<Combat>(spared_member).unwrap().hp, 5, "members outside `hits` are untouched");
        assert_eq!(world.get::<Combat>(header).unwrap().hp, 99, "ablative damage never reaches the header");
    }

    #[test]
    fn area_attack_on_a_unit_composite_scales_damage_by_struck_member_count() {
        let (mut world, mut spatial, mut events) = setup();
        let mut rng = test_rng();
        let attacker = world.create();
        world.set(attacker, Combat::new(CombatEntityKind::Cursor, 10));

        let header = world.create();
        world.set(header, Header::new(BehaviorKind::Pylon, CompositeType::Unit));
        world.set(header, Combat::new(CombatEntityKind::Pylon, 10));

        let member_a = world.create();
        world.set(member_a, Member { header });
        let member_b = world.create();
        world.set(member_b, Member { header });
        if let Some(h) = world.get_mut::<Header>(header) {
            h.members = vec![
                MemberEntry { entity: member_a, dx: 0, dy: 0, layer: None },
                MemberEntry { entity: member_b, dx: 1, dy: 0, layer: None },
            ];
        }

        resolve_area_attack(
            &mut world,
            &mut spatial,
            &mut events,
            AttackKind::Explosive,
            attacker,
            attacker,
            None,
            header,
            &[member_a, member_b],
            &mut rng,
        );

        assert_eq!(world.get::<Combat>(header).unwrap().hp, 4, "two struck members at damage 3 each routes 6 total to the header");
    }

    #[test]
    fn tick_combat_timers_decrements_every_entity() {
        let (mut world, _spatial, _events) = setup();
        let e = world.create();
        let mut combat = Combat::new(CombatEntityKind::Generic, 5);
        combat.stun_remaining = 100;
        world.set(e, combat);
        tick_combat_timers(&mut world, 40);
        assert_eq!(world.get::<Combat>(e).unwrap().stun_remaining, 60);
    }
}
