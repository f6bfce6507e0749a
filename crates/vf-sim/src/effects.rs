//! Transient visual/lifecycle effects (`spec.md` §4.10): short-lived
//! entities that exist purely to count down a TTL and, in the explosion
//! case, occasionally merge with a nearby sibling before they expire.
//! None of these carry `Combat` -- they are set dressing or area-attack
//! triggers, not targets.

use vf_ecs::EntityId;

use crate::components::{Decay, Dust, Explosion, Flash, Glyph, Lightning, Splash};
use crate::scheduler::{MetaSystemCommand, SimContext, System};

/// Decrements every transient effect's TTL and despawns whichever hit zero.
/// Runs last so every other system's TTL-setting writes this tick are seen
/// (`spec.md` §4.10 "per-tick maintenance").
#[derive(Debug, Default)]
pub struct EffectsSystem;

impl EffectsSystem {
    pub fn new() -> Self {
        Self
    }
}

/// `ExplosionMerged`'s distance threshold: two explosions within this many
/// cells of each other combine into one rather than overlapping
/// (`spec.md` §8 scenario 6 "explosion merge").
const MERGE_RADIUS_SQ: i128 = (2i128 * (1i64 << 32) as i128) * (2i128 * (1i64 << 32) as i128);

impl System for EffectsSystem {
    fn name(&self) -> &'static str {
        "effects"
    }

    fn priority(&self) -> i32 {
        300
    }

    fn run(&mut self, ctx: &mut SimContext, dt_ms: i64) -> Vec<MetaSystemCommand> {
        merge_nearby_explosions(ctx);

        tick_ttl::<Flash>(ctx, dt_ms, |c| &mut c.ttl_ms);
        tick_ttl::<Decay>(ctx, dt_ms, |c| &mut c.ttl_ms);
        tick_ttl::<Dust>(ctx, dt_ms, |c| &mut c.ttl_ms);
        tick_ttl::<Splash>(ctx, dt_ms, |c| &mut c.ttl_ms);
        tick_ttl::<Glyph>(ctx, dt_ms, |c| &mut c.ttl_ms);
        tick_ttl::<Lightning>(ctx, dt_ms, |c| &mut c.ttl_ms);
        tick_ttl::<Explosion>(ctx, dt_ms, |c| &mut c.ttl_ms);

        Vec::new()
    }
}

/// Decrement `component.ttl_ms` (accessed through `ttl_field`) for every
/// entity carrying `T`, destroying it once the TTL reaches zero.
fn tick_ttl<T: crate::world::Component>(ctx: &mut SimContext, dt_ms: i64, ttl_field: impl Fn(&mut T) -> &mut i64) {
    let mut expired = Vec::new();
    for entity in ctx.world.all::<T>() {
        if let Some(component) = ctx.world.get_mut::<T>(entity) {
            let ttl = ttl_field(component);
            *ttl = (*ttl - dt_ms).max(0);
            if *ttl == 0 {
                expired.push(entity);
            }
        }
    }
    for entity in expired {
        ctx.world.destroy(entity);
        ctx.spatial.forget(entity);
    }
}

/// Combine any two explosions within [`MERGE_RADIUS_SQ`] of each other into
/// one, keeping the larger-radius survivor and publishing `ExplosionMerged`
/// so the renderer can cross-fade rather than pop (`spec.md` §8 scenario 6).
fn merge_nearby_explosions(ctx: &mut SimContext) {
    let explosions: Vec<(EntityId, Explosion)> = ctx
        .world
        .all::<Explosion>()
        .into_iter()
        .filter_map(|e| ctx.world.get::<Explosion>(e).map(|x| (e, *x)))
        .collect();

    let mut absorbed = std::collections::HashSet::new();
    for i in 0..explosions.len() {
        let (a_id, a) = explosions[i];
        if absorbed.contains(&a_id) {
            continue;
        }
        for j in (i + 1)..explosions.len() {
            let (b_id, b) = explosions[j];
            if absorbed.contains(&b_id) {
                continue;
            }
            let d = crate::fixed::dist_sq_raw(a.center_x, a.center_y, b.center_x, b.center_y);
            if d <= MERGE_RADIUS_SQ {
                let (survivor, dead) = if a.radius >= b.radius { (a_id, b_id) } else { (b_id, a_id) };
                if let Some(survivor_explosion) = ctx.world.get_mut::<Explosion>(survivor) {
                    survivor_explosion.intensity += b.intensity.min(a.intensity);
                    survivor_explosion.ttl_ms = survivor_explosion.ttl_ms.max(b.ttl_ms.max(a.ttl_ms));
                }
                ctx.events.publish(crate::events::SimEvent::ExplosionMerged {
                    survivor,
                    absorbed: dead,
                });
                ctx.world.destroy(dead);
                ctx.spatial.forget(dead);
                absorbed.insert(dead);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;
    use crate::events::EventBus;
    use crate::fixed;
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
    fn expired_dust_is_destroyed() {
        let (mut world, mut events, mut spatial) = setup();
        let e = world.create();
        world.set(e, Dust { ttl_ms: 40 });

        let mut system = EffectsSystem::new();
        let mut ctx = SimContext {
            world: &mut world,
            events: &mut events,
            spatial: &mut spatial,
        };
        system.run(&mut ctx, 50);

        assert!(!world.is_alive(e));
    }

    #[test]
    fn unexpired_splash_survives_and_decrements() {
        let (mut world, mut events, mut spatial) = setup();
        let e = world.create();
        world.set(e, Splash { ttl_ms: 500, radius: fixed::from_int(2) });

        let mut system = EffectsSystem::new();
        let mut ctx = SimContext {
            world: &mut world,
            events: &mut events,
            spatial: &mut spatial,
        };
        system.run(&mut ctx, 100);

        assert!(world.is_alive(e));
        assert_eq!(world.get::<Splash>(e).unwrap().ttl_ms, 400);
    }

    #[test]
    fn nearby_explosions_merge_into_the_larger_one() {
        let (mut world, mut events, mut spatial) = setup();
        let (x0, y0) = fixed::cell_center(5, 5);
        let (x1, y1) = fixed::cell_center(6, 5);
        let big = world.create();
        world.set(
            big,
            Explosion {
                center_x: x0,
                center_y: y0,
                radius: fixed::from_int(4),
                intensity: fixed::from_int(2),
                ttl_ms: 300,
            },
        );
        let small = world.create();
        world.set(
            small,
            Explosion {
                center_x: x1,
                center_y: y1,
                radius: fixed::from_int(2),
                intensity: fixed::from_int(1),
                ttl_ms: 300,
            },
        );

        let mut system = EffectsSystem::new();
        let mut ctx = SimContext {
            world: &mut world,
            events: &mut events,
            spatial: &mut spatial,
        };
        system.run(&mut ctx, 50);
        events.advance_tick();

        assert!(world.is_alive(big));
        assert!(!world.is_alive(small));
        assert_eq!(events.events_of_kind(crate::events::EventKind::ExplosionMerged).count(), 1);
    }
}
