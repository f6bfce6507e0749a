//! Per-species behavior systems (`spec.md` §4.9).
//!
//! Each system only touches the component kinds its species owns, reading
//! `Navigation`'s already-sampled flow direction rather than doing its own
//! pathfinding -- `navigation.rs` computes direction once per entity per
//! tick regardless of how many species-specific systems want to steer by it.
//! Attacks are not resolved inline: a species system publishes a
//! `CombatAttackDirectRequest`/`CombatAttackAreaRequest` and `combat.rs`'s
//! `CombatSystem` resolves it on its next turn, same as every other queued
//! request (`spec.md` §4.4).

use vf_ecs::EntityId;

use crate::combat::AttackKind;
use crate::components::{
    Color, Combat, CombatEntityKind, CompositeType, Drain, Energy, Flash, Header, Heat, Kinetic, Loot, Member, Navigation, Orb,
    Protection, Pylon, Quasar, Shield, SnakeBody, SnakeHead, SpeciesKind, Storm, Swarm, Weapon,
};
use crate::events::{EventKind, SimEvent};
use crate::fixed::{self, Fixed};
use crate::kinematics::{self, HomingProfile};
use crate::scheduler::{MetaSystemCommand, SimContext, System};

/// Acceleration/drag a `Drain` steers with toward its flow-field sample
/// (`spec.md` §4.9 "Drain").
const DRAIN_HOMING: HomingProfile = HomingProfile {
    acceleration: fixed::SCALE * 3,
    drag: fixed::SCALE / 2,
};

/// Heat spent by the cursor each time a drain reaches it (`spec.md` §8
/// scenario 1 "reduce heat, die").
const DRAIN_CURSOR_HEAT_COST: i32 = 2;

/// Energy drained from a touched shield per gated tick (`spec.md` §4.9
/// "drain energy from shield").
const SHIELD_DRAIN_AMOUNT: i32 = 5;

/// Interval between a single drain's shield-drain ticks while it stays
/// inside the same ellipse (`spec.md` §4.9 "interval-gated").
const SHIELD_DRAIN_INTERVAL_MS: i64 = 500;

/// Wall mask a drain's spawn point must be clear of.
const DRAIN_WALL_MASK: u32 = 1;
/// Stagger between two missing drains' initial scheduled spawn ticks
/// (`spec.md` §4.9 "staggered scheduled ticks").
const DRAIN_SPAWN_STAGGER_MS: i64 = 300;
/// Initial/backoff growth on a materialize attempt that found no free cell
/// nearby (`spec.md` §4.9 "exponential backoff on repeated failures").
const DRAIN_SPAWN_BACKOFF_MS: i64 = 200;
const DRAIN_SPAWN_BACKOFF_MAX_MS: i64 = 3200;
/// Time a freshly materialized drain spends animating in before it moves or
/// can be hit (`spec.md` §4.9 "each materialize request ... produces a drain
/// entity after an animation delay").
const DRAIN_MATERIALIZE_MS: i64 = 400;
/// Hard cap on how many drains may exist/be queued at once, regardless of
/// heat (`spec.md` §4.9 "count target ... capped").
const DRAIN_MAX_COUNT: i32 = 12;
/// Radius drains spawn at around the cursor, spread evenly by spawn order.
const DRAIN_SPAWN_RADIUS: Fixed = fixed::SCALE * 6;

/// One outstanding drain spawn request, not yet materialized into an entity.
/// Drains with `scheduled_tick_ms` already past are attempted each tick;
/// a failed attempt (no free cell nearby the cursor) reschedules itself
/// further out with a doubled `backoff_ms` (`spec.md` §4.9 "Drain").
#[derive(Debug, Clone, Copy)]
struct PendingDrainSpawn {
    scheduled_tick_ms: i64,
    backoff_ms: i64,
}

/// Drains home in on their navigation target, slowing while `overspeed_drag`
/// bleeds off any burst of speed picked up from a collision, and sit still
/// while `materialize_remaining` counts down after spawning (`spec.md` §4.9
/// "Drain"). Also owns the spawn-queue deciding how many drains should exist
/// at all: `count target = floor(heat / 10)`, capped, with missing drains
/// enqueued on staggered scheduled ticks rather than all spawning the
/// instant heat crosses a threshold.
#[derive(Debug, Default)]
pub struct DrainSystem {
    elapsed_ms: i64,
    pending: Vec<PendingDrainSpawn>,
    spawn_index: u64,
}

impl DrainSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Top up the pending-spawn queue to match the desired drain count, then
    /// materialize whatever's due this tick.
    fn run_spawn_queue(&mut self, ctx: &mut SimContext, cursor: Option<EntityId>, dt_ms: i64) {
        self.elapsed_ms += dt_ms;

        let Some(cursor_entity) = cursor else { return };
        let desired = ctx
            .world
            .get::<Heat>(cursor_entity)
            .map(|h| (h.value / 10).clamp(0, DRAIN_MAX_COUNT))
            .unwrap_or(0);
        let living = ctx.world.all::<Drain>().len() as i32;

        let allowed_pending = (desired - living).max(0);
        if self.pending.len() as i32 > allowed_pending {
            self.pending.truncate(allowed_pending as usize);
        }
        let missing = allowed_pending - self.pending.len() as i32;
        for i in 0..missing.max(0) {
            self.pending.push(PendingDrainSpawn {
                scheduled_tick_ms: self.elapsed_ms + DRAIN_SPAWN_STAGGER_MS * (i as i64 + 1),
                backoff_ms: DRAIN_SPAWN_BACKOFF_MS,
            });
        }

        let Some(cursor_kinetic) = ctx.world.get::<Kinetic>(cursor_entity).copied() else {
            return;
        };

        let mut still_pending = Vec::with_capacity(self.pending.len());
        for mut pending in self.pending.drain(..) {
            if self.elapsed_ms < pending.scheduled_tick_ms {
                still_pending.push(pending);
                continue;
            }

            let angle = (self.spawn_index as i64 * (fixed::SCALE / 8)).rem_euclid(fixed::SCALE);
            self.spawn_index += 1;
            let want_x = cursor_kinetic.x + fixed::mul(DRAIN_SPAWN_RADIUS, fixed::cos(angle));
            let want_y = cursor_kinetic.y + fixed::mul(DRAIN_SPAWN_RADIUS, fixed::sin(angle));
            let (wx, wy) = (fixed::to_int(want_x), fixed::to_int(want_y));

            match ctx.spatial.find_free_area_spiral(ctx.world, wx, wy, 1, 1, 0, 0, DRAIN_WALL_MASK, 0) {
                Some((sx, sy)) => {
                    let entity = ctx.world.create();
                    ctx.spatial.set_position(ctx.world, entity, sx, sy);
                    ctx.world.set(entity, Kinetic::at_cell(sx, sy));
                    ctx.world.set(entity, Navigation::default());
                    ctx.world.set(entity, Combat::new(CombatEntityKind::Drain, 1));
                    ctx.world.set(
                        entity,
                        Drain {
                            base_speed: fixed::from_int(5),
                            overspeed_drag: fixed::from_int(1),
                            materialize_remaining: DRAIN_MATERIALIZE_MS,
                            shield_drain_cooldown: 0,
                        },
                    );
                    ctx.events.publish(SimEvent::EnemyCreated {
                        entity,
                        species: SpeciesKind::Drain,
                    });
                }
                None => {
                    pending.scheduled_tick_ms = self.elapsed_ms + pending.backoff_ms;
                    pending.backoff_ms = (pending.backoff_ms * 2).min(DRAIN_SPAWN_BACKOFF_MAX_MS);
                    still_pending.push(pending);
                }
            }
        }
        self.pending = still_pending;
    }
}

impl System for DrainSystem {
    fn name(&self) -> &'static str {
        "drain"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn run(&mut self, ctx: &mut SimContext, dt_ms: i64) -> Vec<MetaSystemCommand> {
        let cursor = find_cursor(ctx);

        for entity in ctx.world.all::<Drain>() {
            let Some(mut drain) = ctx.world.get::<Drain>(entity).copied() else {
                continue;
            };
            if drain.materialize_remaining > 0 {
                drain.materialize_remaining = (drain.materialize_remaining - dt_ms).max(0);
                ctx.world.set(entity, drain);
                continue;
            }

            let Some(nav) = ctx.world.get::<Navigation>(entity).copied() else {
                continue;
            };
            let Some(mut kinetic) = ctx.world.get::<Kinetic>(entity).copied() else {
                continue;
            };

            let target_x = kinetic.x + fixed::mul(nav.flow_x, fixed::from_int(1));
            let target_y = kinetic.y + fixed::mul(nav.flow_y, fixed::from_int(1));
            kinematics::apply_homing_scaled(&mut kinetic, target_x, target_y, &DRAIN_HOMING, fixed::SCALE / 2, dt_ms, nav.has_direct_path);
            kinematics::cap_speed(&mut kinetic, drain.base_speed);
            kinematics::integrate(&mut kinetic, dt_ms);

            let speed = fixed::magnitude(kinetic.vx, kinetic.vy);
            if speed > drain.base_speed {
                let drag = fixed::mul(drain.overspeed_drag, fixed::from_int(dt_ms as i32) / 1000);
                kinematics::cap_speed(&mut kinetic, (speed - drag).max(drain.base_speed));
            }

            ctx.world.set(entity, kinetic);
            let cell = kinetic.grid_position();
            ctx.spatial.set_position(ctx.world, entity, cell.0, cell.1);

            // Cursor contact: reduce heat, die (`spec.md` §4.9 "Drain",
            // §8 scenario 1).
            if let Some(cursor_entity) = cursor {
                let cursor_at = ctx.world.get::<Kinetic>(cursor_entity).map(|k| k.grid_position());
                if cursor_at == Some(cell) {
                    if let Some(heat) = ctx.world.get_mut::<Heat>(cursor_entity) {
                        heat.value = (heat.value - DRAIN_CURSOR_HEAT_COST).max(0);
                    }
                    ctx.world.destroy(entity);
                    ctx.spatial.forget(entity);
                    continue;
                }
            }

            // Shield overlap: drain energy from the first shield ellipse
            // this drain sits inside, gated to one tick per interval
            // (`spec.md` §4.9 "interval-gated" shield interaction).
            drain.shield_drain_cooldown = (drain.shield_drain_cooldown - dt_ms).max(0);
            for shield_entity in ctx.world.all::<Shield>() {
                if shield_entity == entity {
                    continue;
                }
                let Some(shield) = ctx.world.get::<Shield>(shield_entity).copied() else {
                    continue;
                };
                let Some(shield_kinetic) = ctx.world.get::<Kinetic>(shield_entity).copied() else {
                    continue;
                };
                let inside = fixed::ellipse_contains_point(
                    kinetic.x,
                    kinetic.y,
                    shield_kinetic.x,
                    shield_kinetic.y,
                    shield.inv_rx_sq,
                    shield.inv_ry_sq,
                );
                if !inside || drain.shield_drain_cooldown > 0 {
                    continue;
                }
                if let Some(energy) = ctx.world.get_mut::<Energy>(shield_entity) {
                    energy.value = (energy.value - SHIELD_DRAIN_AMOUNT).max(0);
                }
                ctx.events.publish(SimEvent::ShieldDrainTick {
                    shield: shield_entity,
                    drain: entity,
                    amount: SHIELD_DRAIN_AMOUNT,
                });
                drain.shield_drain_cooldown = SHIELD_DRAIN_INTERVAL_MS;
                break;
            }
            ctx.world.set(entity, drain);
        }

        // Two drains sharing a cell: both die.
        let mut by_cell: std::collections::HashMap<(i32, i32), Vec<EntityId>> = std::collections::HashMap::new();
        for entity in ctx.world.all::<Drain>() {
            if let Some(kinetic) = ctx.world.get::<Kinetic>(entity) {
                by_cell.entry(kinetic.grid_position()).or_default().push(entity);
            }
        }
        for entities in by_cell.into_values() {
            if entities.len() > 1 {
                for e in entities {
                    ctx.world.destroy(e);
                    ctx.spatial.forget(e);
                }
            }
        }

        self.run_spawn_queue(ctx, cursor, dt_ms);

        Vec::new()
    }
}

/// Acceleration/drag a snake head steers with toward its navigation target
/// (`spec.md` §4.9 "Snake").
const SNAKE_HEAD_HOMING: HomingProfile = HomingProfile {
    acceleration: fixed::SCALE * 8,
    drag: fixed::SCALE / 4,
};

/// Spring constants for a displaced body member's pull back to its rest
/// position (`spec.md` §4.9 "apply a spring (stiffness x displacement to
/// rest, clamped; damp velocity; integrate)").
const SNAKE_SPRING_STIFFNESS: Fixed = fixed::SCALE * 6;
const SNAKE_SPRING_DAMPING: Fixed = fixed::SCALE * 7 / 10;
const SNAKE_SPRING_MAX_ACCEL: Fixed = fixed::SCALE * 50;
const SNAKE_SPRING_MAX_SPEED: Fixed = fixed::SCALE * 20;

/// Snake heads home toward their navigation target and record every grid
/// cell they pass through; body segments sample that trail `spacing` cells
/// back per segment, so the whole chain follows the head's exact path
/// instead of independently homing and bunching up on turns (`spec.md` §4.9
/// "Snake").
#[derive(Debug, Default)]
pub struct SnakeSystem;

impl SnakeSystem {
    pub fn new() -> Self {
        Self
    }
}

impl System for SnakeSystem {
    fn name(&self) -> &'static str {
        "snake"
    }

    fn priority(&self) -> i32 {
        15
    }

    fn run(&mut self, ctx: &mut SimContext, dt_ms: i64) -> Vec<MetaSystemCommand> {
        let (min_x, max_x) = (0, fixed::from_int(ctx.world.config.map_width));
        let (min_y, max_y) = (0, fixed::from_int(ctx.world.config.map_height));

        for head_entity in ctx.world.all::<SnakeHead>() {
            let Some(nav) = ctx.world.get::<Navigation>(head_entity).copied() else {
                continue;
            };
            let Some(mut kinetic) = ctx.world.get::<Kinetic>(head_entity).copied() else {
                continue;
            };

            let target_x = kinetic.x + fixed::mul(nav.flow_x, fixed::from_int(4));
            let target_y = kinetic.y + fixed::mul(nav.flow_y, fixed::from_int(4));
            kinematics::apply_homing_scaled(&mut kinetic, target_x, target_y, &SNAKE_HEAD_HOMING, fixed::SCALE / 2, dt_ms, nav.has_direct_path);
            kinematics::integrate(&mut kinetic, dt_ms);
            kinematics::reflect_bounds_x(&mut kinetic, min_x, max_x);
            kinematics::reflect_bounds_y(&mut kinetic, min_y, max_y);

            ctx.world.set(head_entity, kinetic);
            let cell = kinetic.grid_position();
            ctx.spatial.set_position(ctx.world, head_entity, cell.0, cell.1);

            if let Some(head) = ctx.world.get_mut::<SnakeHead>(head_entity) {
                if head.sample(0) != Some(cell) {
                    head.push(cell);
                }
            }

            let Some(head) = ctx.world.get::<SnakeHead>(head_entity).cloned() else {
                continue;
            };

            // Closest-to-head segment first, so cascade-kill below walks the
            // chain in order.
            let mut members: Vec<EntityId> = ctx
                .world
                .all::<SnakeBody>()
                .into_iter()
                .filter(|&e| ctx.world.get::<Member>(e).map(|m| m.header == head_entity).unwrap_or(false))
                .collect();
            members.sort_by_key(|&e| ctx.world.get::<SnakeBody>(e).map(|b| b.segment_index).unwrap_or(0));

            let mut chain_broken = false;
            let mut any_connected = false;

            for member_entity in members {
                let Some(mut body) = ctx.world.get::<SnakeBody>(member_entity).copied() else {
                    continue;
                };

                let dead = ctx.world.get::<Combat>(member_entity).map(|c| c.is_dead()).unwrap_or(false);
                if chain_broken || dead || !body.connected {
                    chain_broken = true;
                    body.connected = false;
                    ctx.world.set(member_entity, body);
                    continue;
                }

                let back = (body.segment_index + 1) as usize * (body.spacing.max(1) as usize);
                let Some((rx, ry)) = head.sample(back) else {
                    any_connected = true;
                    ctx.world.set(member_entity, body);
                    continue;
                };
                let (rest_x, rest_y) = fixed::cell_center(rx, ry);

                let Some(mut member_kinetic) = ctx.world.get::<Kinetic>(member_entity).copied() else {
                    continue;
                };
                let displaced = ctx
                    .world
                    .get::<Combat>(member_entity)
                    .map(|c| c.kinetic_immunity_remaining > 0)
                    .unwrap_or(false);

                if displaced {
                    let dx = rest_x - member_kinetic.x;
                    let dy = rest_y - member_kinetic.y;
                    let mut accel_x = fixed::mul(dx, SNAKE_SPRING_STIFFNESS);
                    let mut accel_y = fixed::mul(dy, SNAKE_SPRING_STIFFNESS);
                    let accel_mag = fixed::magnitude(accel_x, accel_y);
                    if accel_mag > SNAKE_SPRING_MAX_ACCEL && accel_mag != 0 {
                        let scale = fixed::div(SNAKE_SPRING_MAX_ACCEL, accel_mag);
                        accel_x = fixed::mul(accel_x, scale);
                        accel_y = fixed::mul(accel_y, scale);
                    }
                    let dt = fixed::from_int(dt_ms as i32) / 1000;
                    member_kinetic.vx = fixed::mul(member_kinetic.vx + fixed::mul(accel_x, dt), SNAKE_SPRING_DAMPING);
                    member_kinetic.vy = fixed::mul(member_kinetic.vy + fixed::mul(accel_y, dt), SNAKE_SPRING_DAMPING);
                    kinematics::cap_speed(&mut member_kinetic, SNAKE_SPRING_MAX_SPEED);
                    kinematics::integrate(&mut member_kinetic, dt_ms);
                } else {
                    member_kinetic.x = rest_x;
                    member_kinetic.y = rest_y;
                    member_kinetic.vx = 0;
                    member_kinetic.vy = 0;
                }

                ctx.world.set(member_entity, member_kinetic);
                let (mx, my) = member_kinetic.grid_position();
                ctx.spatial.set_position(ctx.world, member_entity, mx, my);
                any_connected = true;
                ctx.world.set(member_entity, body);
            }

            // The snake is shielded iff any body segment is connected and
            // alive (`spec.md` §4.9 "Snake").
            let bit = Protection::FROM_SPECIES;
            match ctx.world.get::<Protection>(head_entity).copied() {
                Some(protection) => {
                    let updated = if any_connected { protection.with(bit) } else { Protection(protection.0 & !bit) };
                    ctx.world.set(head_entity, updated);
                }
                None if any_connected => {
                    ctx.world.set(head_entity, Protection::default().with(bit));
                }
                None => {}
            }
        }
        Vec::new()
    }
}

/// A stationary pylon periodically fires a direct lightning bolt at the
/// cursor once its beam is off cooldown (`spec.md` §4.9 "Pylon").
#[derive(Debug, Default)]
pub struct PylonSystem;

impl PylonSystem {
    pub fn new() -> Self {
        Self
    }
}

impl System for PylonSystem {
    fn name(&self) -> &'static str {
        "pylon"
    }

    fn priority(&self) -> i32 {
        20
    }

    fn run(&mut self, ctx: &mut SimContext, dt_ms: i64) -> Vec<MetaSystemCommand> {
        let cursor = find_cursor(ctx);
        for entity in ctx.world.all::<Pylon>() {
            let Some(mut pylon) = ctx.world.get::<Pylon>(entity).copied() else {
                continue;
            };
            pylon.beam_cooldown = (pylon.beam_cooldown - dt_ms).max(0);
            if pylon.beam_cooldown == 0 {
                if let Some(cursor_entity) = cursor {
                    ctx.events.publish(SimEvent::CombatAttackDirectRequest {
                        attack: AttackKind::Lightning,
                        owner: entity,
                        origin: entity,
                        target: cursor_entity,
                        hit: cursor_entity,
                    });
                    pylon.beam_cooldown = 1500;
                }
            }
            ctx.world.set(entity, pylon);
        }
        Vec::new()
    }
}

/// A shielded quasar recharges its `Energy` pool; once full it drops its
/// shield and fires a explosive burst at the cursor, then starts recharging
/// again (`spec.md` §4.9 "Quasar").
#[derive(Debug, Default)]
pub struct QuasarSystem;

impl QuasarSystem {
    pub fn new() -> Self {
        Self
    }
}

impl System for QuasarSystem {
    fn name(&self) -> &'static str {
        "quasar"
    }

    fn priority(&self) -> i32 {
        25
    }

    fn run(&mut self, ctx: &mut SimContext, dt_ms: i64) -> Vec<MetaSystemCommand> {
        let cursor = find_cursor(ctx);
        for entity in ctx.world.all::<Quasar>() {
            let Some(mut quasar) = ctx.world.get::<Quasar>(entity).copied() else {
                continue;
            };
            let Some(mut energy) = ctx.world.get::<Energy>(entity).copied() else {
                continue;
            };

            if quasar.shielded {
                energy.value = (energy.value + dt_ms as i32 / 10).min(energy.max);
                if energy.value >= energy.max {
                    quasar.shielded = false;
                    ctx.world.remove::<Shield>(entity);
                    if let (Some(cursor_entity), Some(kinetic)) = (cursor, ctx.world.get::<Kinetic>(entity).copied()) {
                        ctx.events.publish(SimEvent::CombatAttackAreaRequest {
                            attack: AttackKind::Kinetic,
                            owner: entity,
                            origin: entity,
                            origin_xy: Some((kinetic.x, kinetic.y)),
                            radius: fixed::from_int(3),
                            target: cursor_entity,
                            hits: Vec::new(),
                        });
                    }
                }
            } else {
                energy.value = 0;
                quasar.shielded = true;
                ctx.world.set(entity, Shield::new(fixed::from_int(2), fixed::from_int(2)));
            }

            ctx.world.set(entity, quasar);
            ctx.world.set(entity, energy);
        }
        Vec::new()
    }
}

/// Acceleration/drag a swarm member steers with toward its nearest sibling
/// (`spec.md` §4.9 "Swarm").
const SWARM_HOMING: HomingProfile = HomingProfile {
    acceleration: fixed::SCALE * 5,
    drag: fixed::SCALE / 2,
};

/// Swarm members drift toward their nearest sibling; once close enough they
/// fuse (the smaller of the pair is absorbed), strengthening the survivor
/// (`spec.md` §4.9 "Swarm", §8 scenario 6's explosion-merge sibling rule).
#[derive(Debug, Default)]
pub struct SwarmSystem;

impl SwarmSystem {
    pub fn new() -> Self {
        Self
    }
}

const FUSION_RADIUS_SQ: i128 = (3i128 * (1i64 << 32) as i128) * (3i128 * (1i64 << 32) as i128);

impl System for SwarmSystem {
    fn name(&self) -> &'static str {
        "swarm"
    }

    fn priority(&self) -> i32 {
        30
    }

    fn run(&mut self, ctx: &mut SimContext, dt_ms: i64) -> Vec<MetaSystemCommand> {
        let members = ctx.world.all::<Swarm>();
        let positions: Vec<(EntityId, Kinetic)> = members
            .iter()
            .filter_map(|&e| ctx.world.get::<Kinetic>(e).map(|k| (e, *k)))
            .collect();

        let mut fused = std::collections::HashSet::new();

        for &(entity, kinetic) in &positions {
            if fused.contains(&entity) {
                continue;
            }
            let Some(mut swarm) = ctx.world.get::<Swarm>(entity).copied() else {
                continue;
            };
            swarm.fusion_cooldown = (swarm.fusion_cooldown - dt_ms).max(0);

            let nearest = positions
                .iter()
                .filter(|(e, _)| *e != entity && !fused.contains(e))
                .map(|&(e, k)| (e, fixed::dist_sq_raw(kinetic.x, kinetic.y, k.x, k.y)))
                .min_by_key(|(_, d)| *d);

            if let Some((other, dist_sq)) = nearest {
                if dist_sq <= FUSION_RADIUS_SQ && swarm.fusion_cooldown == 0 {
                    // deterministic pick: the lower raw entity ID survives.
                    let (survivor, absorbed) = if entity.to_raw() <= other.to_raw() {
                        (entity, other)
                    } else {
                        (other, entity)
                    };
                    if let Some(absorbed_combat) = ctx.world.get::<Combat>(absorbed).copied() {
                        if let Some(survivor_combat) = ctx.world.get_mut::<Combat>(survivor) {
                            survivor_combat.max_hp += absorbed_combat.max_hp / 2;
                            survivor_combat.hp = (survivor_combat.hp + absorbed_combat.hp / 2).min(survivor_combat.max_hp);
                        }
                    }
                    ctx.events.publish(SimEvent::ExplosionMerged { survivor, absorbed });
                    ctx.world.destroy(absorbed);
                    ctx.spatial.forget(absorbed);
                    fused.insert(absorbed);
                    fused.insert(survivor);
                } else if let Some(mut k) = ctx.world.get::<Kinetic>(entity).copied() {
                    let other_kinetic = positions.iter().find(|(e, _)| *e == other).map(|(_, k)| *k);
                    if let Some(ok) = other_kinetic {
                        kinematics::apply_homing_scaled(&mut k, ok.x, ok.y, &SWARM_HOMING, fixed::SCALE / 2, dt_ms, false);
                        kinematics::integrate(&mut k, dt_ms);
                        ctx.world.set(entity, k);
                        let (cx, cy) = k.grid_position();
                        ctx.spatial.set_position(ctx.world, entity, cx, cy);
                    }
                }
            }

            if ctx.world.is_alive(entity) {
                ctx.world.set(entity, swarm);
            }
        }
        Vec::new()
    }
}

/// A storm periodically pulses an area attack at its own radius, centered on
/// itself (`spec.md` §4.9 "Storm").
#[derive(Debug, Default)]
pub struct StormSystem {
    pulse_cooldown_ms: i64,
}

impl StormSystem {
    pub fn new() -> Self {
        Self { pulse_cooldown_ms: 0 }
    }
}

impl System for StormSystem {
    fn name(&self) -> &'static str {
        "storm"
    }

    fn priority(&self) -> i32 {
        35
    }

    fn run(&mut self, ctx: &mut SimContext, dt_ms: i64) -> Vec<MetaSystemCommand> {
        self.pulse_cooldown_ms = (self.pulse_cooldown_ms - dt_ms).max(0);
        let should_pulse = self.pulse_cooldown_ms == 0;
        if should_pulse {
            self.pulse_cooldown_ms = 2000;
        }
        if !should_pulse {
            return Vec::new();
        }

        let cursor = find_cursor(ctx);
        for entity in ctx.world.all::<Storm>() {
            let Some(storm) = ctx.world.get::<Storm>(entity).copied() else {
                continue;
            };
            let Some(kinetic) = ctx.world.get::<Kinetic>(entity).copied() else {
                continue;
            };
            let Some(cursor_entity) = cursor else { continue };
            ctx.events.publish(SimEvent::CombatAttackAreaRequest {
                attack: AttackKind::Explosive,
                owner: entity,
                origin: entity,
                origin_xy: Some((kinetic.x, kinetic.y)),
                radius: fixed::from_int(storm.radius),
                target: cursor_entity,
                hits: Vec::new(),
            });
        }
        Vec::new()
    }
}

/// Orbit angular speed, in full turns per second (Q32.32) -- orbs stay
/// evenly spread at `SCALE / n` apart while this rotates the whole ring
/// (`spec.md` §4.10 "orbit the cursor at evenly-redistributed angles").
const BUFF_ORBIT_ANGULAR_RATE: Fixed = fixed::SCALE / 2;
const BUFF_FLASH_TTL_MS: i64 = 150;
const BUFF_ENERGY_PER_SHOT: i32 = 10;

/// Buff orbs ring the cursor, evenly spaced and slowly rotating; on a fire
/// request each orb off cooldown spends `floor(heat / 10)` shots, routed by
/// [`fire_shots`], and loses energy, despawning once it crosses zero
/// (`spec.md` §4.10 "Buffs manage orbs ...").
#[derive(Debug, Default)]
pub struct BuffSystem {
    rotation: Fixed,
}

impl BuffSystem {
    pub fn new() -> Self {
        Self { rotation: 0 }
    }
}

impl System for BuffSystem {
    fn name(&self) -> &'static str {
        "buff"
    }

    fn priority(&self) -> i32 {
        40
    }

    fn run(&mut self, ctx: &mut SimContext, dt_ms: i64) -> Vec<MetaSystemCommand> {
        let Some(cursor_entity) = find_cursor(ctx) else {
            return Vec::new();
        };
        let Some(cursor_kinetic) = ctx.world.get::<Kinetic>(cursor_entity).copied() else {
            return Vec::new();
        };

        self.rotation = (self.rotation + fixed::mul(BUFF_ORBIT_ANGULAR_RATE, fixed::from_int(dt_ms as i32) / 1000)) % fixed::SCALE;

        let mut orbs = ctx.world.all::<Orb>();
        orbs.sort_by_key(|e| e.to_raw());
        let slot_angle = if orbs.is_empty() { 0 } else { fixed::SCALE / orbs.len() as i64 };

        for (i, &orb_entity) in orbs.iter().enumerate() {
            let Some(mut orb) = ctx.world.get::<Orb>(orb_entity).copied() else {
                continue;
            };
            orb.angle = (self.rotation + slot_angle * i as i64).rem_euclid(fixed::SCALE);

            let ox = cursor_kinetic.x + fixed::mul(orb.orbit_radius, fixed::cos(orb.angle));
            let oy = cursor_kinetic.y + fixed::mul(orb.orbit_radius, fixed::sin(orb.angle));
            match ctx.world.get_mut::<Kinetic>(orb_entity) {
                Some(orb_kinetic) => {
                    orb_kinetic.x = ox;
                    orb_kinetic.y = oy;
                }
                None => ctx.world.set(orb_entity, Kinetic { x: ox, y: oy, vx: 0, vy: 0 }),
            }
            ctx.world.set(orb_entity, orb);
            ctx.spatial.set_position(ctx.world, orb_entity, fixed::to_int(ox), fixed::to_int(oy));

            if let Some(weapon) = ctx.world.get_mut::<Weapon>(orb_entity) {
                weapon.cooldown_remaining = (weapon.cooldown_remaining - dt_ms).max(0);
            }
        }

        let fire_requested = ctx.events.events_of_kind(EventKind::BuffFireRequest).count() > 0
            || ctx.events.events_of_kind(EventKind::BuffFireMainRequest).count() > 0;
        if !fire_requested {
            return Vec::new();
        }

        let shot_count = (ctx.world.get::<Heat>(cursor_entity).map(|h| h.value).unwrap_or(0) / 10).max(0) as u32;
        if shot_count == 0 {
            return Vec::new();
        }

        for &orb_entity in &orbs {
            let Some(mut orb) = ctx.world.get::<Orb>(orb_entity).copied() else {
                continue;
            };
            let off_cooldown = ctx.world.get::<Weapon>(orb_entity).map(|w| w.cooldown_remaining == 0).unwrap_or(true);
            if !off_cooldown {
                continue;
            }

            fire_shots(ctx, cursor_entity, cursor_entity, cursor_kinetic.x, cursor_kinetic.y, shot_count);

            ctx.world.set(orb_entity, Flash { ttl_ms: BUFF_FLASH_TTL_MS, color: Color(255, 220, 80) });
            if let Some(w) = ctx.world.get_mut::<Weapon>(orb_entity) {
                w.cooldown_remaining = w.fire_rate_ms.max(1);
            }
            orb.energy -= BUFF_ENERGY_PER_SHOT;
            if orb.energy <= 0 {
                ctx.world.destroy(orb_entity);
                ctx.spatial.forget(orb_entity);
            } else {
                ctx.world.set(orb_entity, orb);
            }
        }

        Vec::new()
    }
}

/// Route `shot_count` `Lightning` direct-attack requests from `(from_x,
/// from_y)`: composite headers (any non-`Container` composite with a living
/// member) go first, nearest first, hitting each header's closest member;
/// remaining shots cycle through the nearest non-composite combat entities
/// (`spec.md` §8 scenario 2 "Lightning strike prefers composites").
fn fire_shots(ctx: &mut SimContext, owner: EntityId, origin: EntityId, from_x: Fixed, from_y: Fixed, shot_count: u32) {
    if shot_count == 0 {
        return;
    }

    let mut headers: Vec<(EntityId, EntityId, i128)> = Vec::new();
    for header_entity in ctx.world.all::<Header>() {
        let Some(header) = ctx.world.get::<Header>(header_entity).cloned() else {
            continue;
        };
        if header.composite_type == CompositeType::Container {
            continue;
        }
        let mut best: Option<(EntityId, i128)> = None;
        for member in &header.members {
            if member.is_tombstoned() || !ctx.world.is_alive(member.entity) {
                continue;
            }
            let Some(member_kinetic) = ctx.world.get::<Kinetic>(member.entity) else {
                continue;
            };
            let d = fixed::dist_sq_raw(from_x, from_y, member_kinetic.x, member_kinetic.y);
            match best {
                Some((_, best_d)) if best_d <= d => {}
                _ => best = Some((member.entity, d)),
            }
        }
        if let Some((closest_member, dist_sq)) = best {
            headers.push((header_entity, closest_member, dist_sq));
        }
    }
    headers.sort_by(|a, b| a.2.cmp(&b.2).then(a.0.to_raw().cmp(&b.0.to_raw())));

    let mut plain: Vec<(EntityId, i128)> = ctx
        .world
        .all::<Combat>()
        .into_iter()
        .filter(|&e| e != owner && !ctx.world.has::<Member>(e) && !ctx.world.has::<Header>(e))
        .filter_map(|e| ctx.world.get::<Kinetic>(e).map(|k| (e, fixed::dist_sq_raw(from_x, from_y, k.x, k.y))))
        .collect();
    plain.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.to_raw().cmp(&b.0.to_raw())));

    let mut remaining = shot_count;
    for (header_entity, hit_entity, _) in headers {
        if remaining == 0 {
            break;
        }
        ctx.events.publish(SimEvent::CombatAttackDirectRequest {
            attack: AttackKind::Lightning,
            owner,
            origin,
            target: header_entity,
            hit: hit_entity,
        });
        remaining -= 1;
    }

    if remaining == 0 || plain.is_empty() {
        return;
    }
    let mut i = 0usize;
    while remaining > 0 {
        let (target_entity, _) = plain[i % plain.len()];
        ctx.events.publish(SimEvent::CombatAttackDirectRequest {
            attack: AttackKind::Lightning,
            owner,
            origin,
            target: target_entity,
            hit: target_entity,
        });
        remaining -= 1;
        i += 1;
    }
}

const LOOT_WALL_MASK: u32 = 1;
/// Acceleration/drag loot steers with toward the cursor while it has line of
/// sight (`spec.md` §4.10 "Loot").
const LOOT_HOMING: HomingProfile = HomingProfile {
    acceleration: fixed::SCALE * 10,
    drag: fixed::SCALE / 5,
};
const LOOT_HOMING_SPEED: Fixed = fixed::SCALE * 6;
const LOOT_BLEED_DAMPING: Fixed = fixed::SCALE * 9 / 10;

/// Loot homes toward the cursor while it has line of sight, reverting to a
/// damped velocity-bleed while LOS is blocked; reaching the cursor's cell
/// credits its `value` to the cursor's [`Heat`] and despawns it (`spec.md`
/// §4.10 "Loot runs homing toward the cursor, reverting to velocity-bleed
/// when out of LOS").
#[derive(Debug, Default)]
pub struct LootSystem;

impl LootSystem {
    pub fn new() -> Self {
        Self
    }
}

impl System for LootSystem {
    fn name(&self) -> &'static str {
        "loot"
    }

    fn priority(&self) -> i32 {
        45
    }

    fn run(&mut self, ctx: &mut SimContext, dt_ms: i64) -> Vec<MetaSystemCommand> {
        let Some(cursor_entity) = find_cursor(ctx) else {
            return Vec::new();
        };
        let Some(cursor_kinetic) = ctx.world.get::<Kinetic>(cursor_entity).copied() else {
            return Vec::new();
        };
        let (cx, cy) = cursor_kinetic.grid_position();

        for entity in ctx.world.all::<Loot>() {
            let Some(mut kinetic) = ctx.world.get::<Kinetic>(entity).copied() else {
                continue;
            };
            let (lx, ly) = kinetic.grid_position();

            if ctx.spatial.has_line_of_sight(ctx.world, lx, ly, cx, cy, LOOT_WALL_MASK) {
                kinematics::apply_homing(&mut kinetic, cursor_kinetic.x, cursor_kinetic.y, &LOOT_HOMING, dt_ms);
                kinematics::cap_speed(&mut kinetic, LOOT_HOMING_SPEED);
            } else {
                kinetic.vx = fixed::mul(kinetic.vx, LOOT_BLEED_DAMPING);
                kinetic.vy = fixed::mul(kinetic.vy, LOOT_BLEED_DAMPING);
            }
            kinematics::integrate(&mut kinetic, dt_ms);

            ctx.world.set(entity, kinetic);
            let cell = kinetic.grid_position();
            ctx.spatial.set_position(ctx.world, entity, cell.0, cell.1);

            if cell == (cx, cy) {
                if let Some(value) = ctx.world.get::<Loot>(entity).map(|l| l.value) {
                    if let Some(heat) = ctx.world.get_mut::<Heat>(cursor_entity) {
                        heat.value += value;
                    }
                }
                ctx.world.destroy(entity);
                ctx.spatial.forget(entity);
            }
        }
        Vec::new()
    }
}

/// Finds the entity carrying the player's cursor behavior. There is at most
/// one in a well-formed world, so the first hit is authoritative.
fn find_cursor(ctx: &SimContext) -> Option<EntityId> {
    ctx.world
        .all::<Combat>()
        .into_iter()
        .find(|&e| ctx.world.get::<Combat>(e).map(|c| c.kind == CombatEntityKind::Cursor).unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;
    use crate::events::EventBus;
    use crate::spatial::SpatialIndex;
    use crate::world::World;

    fn setup() -> (World, EventBus, SpatialIndex) {
        (
            World::new(SimConfig::default()),
            EventBus::new(),
            SpatialIndex::new(20, 20),
        )
    }

    #[test]
    fn materializing_drain_does_not_move() {
        let (mut world, mut events, mut spatial) = setup();
        let e = world.create();
        spatial.set_position(&mut world, e, 5, 5);
        world.set(e, Kinetic::at_cell(5, 5));
        world.set(e, Navigation::default());
        world.set(
            e,
            Drain {
                base_speed: fixed::from_int(5),
                overspeed_drag: fixed::from_int(1),
                materialize_remaining: 500,
                shield_drain_cooldown: 0,
            },
        );

        let mut system = DrainSystem::new();
        let mut ctx = SimContext {
            world: &mut world,
            events: &mut events,
            spatial: &mut spatial,
        };
        system.run(&mut ctx, 100);

        assert_eq!(world.get::<Kinetic>(e).unwrap().x, fixed::cell_center(5, 5).0);
        assert_eq!(world.get::<Drain>(e).unwrap().materialize_remaining, 400);
    }

    #[test]
    fn snake_body_segment_follows_the_heads_trail() {
        let (mut world, mut events, mut spatial) = setup();
        let head = world.create();
        spatial.set_position(&mut world, head, 0, 0);
        world.set(head, Kinetic::at_cell(0, 0));
        world.set(head, Navigation { flow_x: fixed::SCALE, flow_y: 0, ..Navigation::default() });
        world.set(head, SnakeHead::new(16));

        let body = world.create();
        world.set(body, Member { header: head });
        world.set(body, SnakeBody { segment_index: 0, spacing: 1, connected: true });
        world.set(body, Kinetic::at_cell(0, 0));

        let mut system = SnakeSystem::new();
        let mut ctx = SimContext {
            world: &mut world,
            events: &mut events,
            spatial: &mut spatial,
        };
        for _ in 0..5 {
            system.run(&mut ctx, 100);
        }

        assert!(world.get::<SnakeHead>(head).unwrap().trail.len() >= 2);
    }

    #[test]
    fn pylon_fires_at_cursor_once_off_cooldown() {
        let (mut world, mut events, mut spatial) = setup();
        let cursor = world.create();
        world.set(cursor, Combat::new(CombatEntityKind::Cursor, 10));
        let pylon_entity = world.create();
        world.set(pylon_entity, Pylon { beam_cooldown: 0 });

        let mut system = PylonSystem::new();
        let mut ctx = SimContext {
            world: &mut world,
            events: &mut events,
            spatial: &mut spatial,
        };
        system.run(&mut ctx, 50);
        events.advance_tick();

        assert_eq!(
            events
                .events_of_kind(crate::events::EventKind::CombatAttackDirectRequest)
                .count(),
            1
        );
        assert_eq!(world.get::<Pylon>(pylon_entity).unwrap().beam_cooldown, 1500);
    }

    #[test]
    fn nearby_swarm_members_fuse_and_strengthen_survivor() {
        let (mut world, mut events, mut spatial) = setup();
        let a = world.create();
        spatial.set_position(&mut world, a, 5, 5);
        world.set(a, Kinetic::at_cell(5, 5));
        world.set(a, Swarm { fusion_cooldown: 0 });
        world.set(a, Combat::new(CombatEntityKind::Swarm, 4));

        let b = world.create();
        spatial.set_position(&mut world, b, 6, 5);
        world.set(b, Kinetic::at_cell(6, 5));
        world.set(b, Swarm { fusion_cooldown: 0 });
        world.set(b, Combat::new(CombatEntityKind::Swarm, 4));

        let mut system = SwarmSystem::new();
        let mut ctx = SimContext {
            world: &mut world,
            events: &mut events,
            spatial: &mut spatial,
        };
        system.run(&mut ctx, 50);

        assert!(world.is_alive(a));
        assert!(!world.is_alive(b));
        assert_eq!(world.get::<Combat>(a).unwrap().max_hp, 6);
    }

    #[test]
    fn drain_spawn_queue_tops_up_to_heat_driven_count_on_staggered_ticks() {
        let (mut world, mut events, mut spatial) = setup();
        let cursor = world.create();
        world.set(cursor, Combat::new(CombatEntityKind::Cursor, 100));
        world.set(cursor, Heat { value: 25 }); // floor(25/10) = 2 drains
        spatial.set_position(&mut world, cursor, 10, 10);
        world.set(cursor, Kinetic::at_cell(10, 10));

        let mut system = DrainSystem::new();
        let mut ctx = SimContext {
            world: &mut world,
            events: &mut events,
            spatial: &mut spatial,
        };

        // Nothing materializes before its staggered tick arrives.
        system.run(&mut ctx, 100);
        assert_eq!(world.count::<Drain>(), 0, "the first pending spawn isn't due yet");

        for _ in 0..10 {
            system.run(&mut ctx, 100);
        }
        assert_eq!(world.count::<Drain>(), 2, "both missing drains eventually materialize, capped by heat");
    }

    #[test]
    fn drain_spawn_queue_never_exceeds_the_hard_cap() {
        let (mut world, mut events, mut spatial) = setup();
        let cursor = world.create();
        world.set(cursor, Combat::new(CombatEntityKind::Cursor, 100));
        world.set(cursor, Heat { value: 999 }); // floor(999/10) would be 99 without the cap
        spatial.set_position(&mut world, cursor, 10, 10);
        world.set(cursor, Kinetic::at_cell(10, 10));

        let mut system = DrainSystem::new();
        let mut ctx = SimContext {
            world: &mut world,
            events: &mut events,
            spatial: &mut spatial,
        };
        for _ in 0..200 {
            system.run(&mut ctx, 100);
        }

        assert!(world.count::<Drain>() as i32 <= DRAIN_MAX_COUNT);
    }
}
