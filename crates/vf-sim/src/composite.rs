//! Composite header/member lifecycle (`spec.md` §4.7).
//!
//! A composite is a header entity (`Header`) plus zero or more member
//! entities, each carrying a `Member` back-pointer to the header by ID --
//! never a Rust reference, since header and members form a cycle
//! (`spec.md` §9 "Cyclic ownership"). This system is also where every dead
//! entity actually leaves the world: `EntityDied` only marks an entity dead
//! in combat bookkeeping, so something has to turn that into `World::destroy`
//! plus the composite tombstone/compaction/breach sequence.

use vf_ecs::EntityId;

use crate::components::{Header, Kinetic, Member};
use crate::events::{EventKind, SimEvent};
use crate::scheduler::{MetaSystemCommand, SimContext, System};

/// Position-sync, death bookkeeping and integrity-breach detection for every
/// composite, run once per tick after combat has had its turn.
#[derive(Debug, Default)]
pub struct CompositeSystem;

impl CompositeSystem {
    pub fn new() -> Self {
        Self
    }
}

impl System for CompositeSystem {
    fn name(&self) -> &'static str {
        "composite"
    }

    fn priority(&self) -> i32 {
        200
    }

    fn run(&mut self, ctx: &mut SimContext, _dt_ms: i64) -> Vec<MetaSystemCommand> {
        let died: Vec<EntityId> = ctx
            .events
            .events_of_kind(EventKind::EntityDied)
            .filter_map(|e| match e {
                SimEvent::EntityDied { entity, .. } => Some(*entity),
                _ => None,
            })
            .collect();

        for entity in died {
            if let Some(member) = ctx.world.get::<Member>(entity).copied() {
                if let Some(header) = ctx.world.get_mut::<Header>(member.header) {
                    header.tombstone(entity);
                }
            }
            ctx.world.destroy(entity);
            ctx.spatial.forget(entity);
        }

        // Position sync (`spec.md` §4.7 step 1): a header that moves under
        // its own Kinetic drags every non-tombstoned member to header + offset,
        // unless an owning system (e.g. snake spring physics) opted out via
        // `skip_position_sync`. A member whose underlying entity no longer
        // exists, or whose synced cell falls outside the map, is tombstoned
        // here rather than left to drift.
        let headers_with_kinetic = ctx.world.all::<Header>();
        for header_entity in headers_with_kinetic {
            let Some(kinetic) = ctx.world.get::<Kinetic>(header_entity).copied() else {
                continue;
            };
            let Some(header) = ctx.world.get::<Header>(header_entity) else {
                continue;
            };
            if header.skip_position_sync {
                continue;
            }
            let (hx, hy) = kinetic.grid_position();
            let entries: Vec<_> = header.members.iter().copied().filter(|m| !m.is_tombstoned()).collect();

            let mut newly_dead = Vec::new();
            for entry in entries {
                if !ctx.world.is_alive(entry.entity) {
                    newly_dead.push(entry.entity);
                    continue;
                }
                let (mx, my) = (hx + entry.dx, hy + entry.dy);
                if mx < 0 || my < 0 || mx >= ctx.world.config.map_width || my >= ctx.world.config.map_height {
                    newly_dead.push(entry.entity);
                    continue;
                }
                ctx.spatial.set_position(ctx.world, entry.entity, mx, my);
            }

            if !newly_dead.is_empty() {
                if let Some(header_mut) = ctx.world.get_mut::<Header>(header_entity) {
                    for dead in newly_dead {
                        header_mut.tombstone(dead);
                    }
                }
            }
        }

        let headers = ctx.world.all::<Header>();
        for header_entity in headers {
            let Some(header) = ctx.world.get::<Header>(header_entity) else {
                continue;
            };
            if !header.dirty {
                continue;
            }

            let tombstoned = header.members.iter().filter(|m| m.is_tombstoned()).count() as u32;
            let living_remaining = header.living_member_count() as u32;
            let expected = header.expected_deaths;

            if tombstoned > expected {
                ctx.events.publish(SimEvent::CompositeIntegrityBreach {
                    header: header_entity,
                    excess_deaths: tombstoned - expected,
                    living_remaining,
                });
            }

            let header_mut = ctx.world.get_mut::<Header>(header_entity).expect("checked above");
            header_mut.compact();
            header_mut.expected_deaths = header_mut.expected_deaths.saturating_sub(tombstoned);

            if ctx.world.get::<Header>(header_entity).map(|h| h.living_member_count()).unwrap_or(0) == 0 {
                ctx.world.destroy(header_entity);
                ctx.spatial.forget(header_entity);
            }
        }

        Vec::new()
    }
}
