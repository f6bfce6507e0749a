//! The [`World`]: entity allocator plus one [`ComponentStore`] per component
//! kind (`spec.md` §4.1 "Design: a dense array + sparse map per component
//! kind"). A small [`Component`] trait maps a Rust type to its store field so
//! callers can write `world.get::<Position>(e)` generically while storage
//! stays a plain struct field -- no type-erasure, no `unsafe`.

use vf_ecs::{ComponentStore, EntityAllocator, EntityId};

use crate::components::*;
use crate::config::SimConfig;

/// Implemented once per component kind by the `impl_component!` macro below.
pub trait Component: Sized + 'static {
    fn store(world: &World) -> &ComponentStore<Self>;
    fn store_mut(world: &mut World) -> &mut ComponentStore<Self>;
}

macro_rules! world_components {
    ($($field:ident : $ty:ty),* $(,)?) => {
        /// All entities and components in the simulation.
        pub struct World {
            entities: EntityAllocator,
            /// Monotonic tick counter, reset to 0 by `GameReset`.
            pub frame: u64,
            pub config: SimConfig,
            $(pub(crate) $field: ComponentStore<$ty>,)*
        }

        impl World {
            pub fn new(config: SimConfig) -> Self {
                Self {
                    entities: EntityAllocator::new(),
                    frame: 0,
                    config,
                    $($field: ComponentStore::new(),)*
                }
            }

            /// Clear every component store and the entity allocator. Used by
            /// the `GameReset` protocol (`spec.md` §4.12).
            pub fn clear_all(&mut self) {
                self.entities.clear();
                self.frame = 0;
                $(self.$field.clear();)*
            }

            /// Remove every component belonging to `entity`, across every
            /// store. Idempotent.
            fn clear_components(&mut self, entity: EntityId) {
                $(self.$field.remove(entity);)*
            }
        }

        $(
            impl Component for $ty {
                fn store(world: &World) -> &ComponentStore<Self> {
                    &world.$field
                }
                fn store_mut(world: &mut World) -> &mut ComponentStore<Self> {
                    &mut world.$field
                }
            }
        )*
    };
}

world_components! {
    position: Position,
    kinetic: Kinetic,
    sigil: Sigil,
    protection: Protection,
    combat: Combat,
    header: Header,
    member: Member,
    navigation: Navigation,
    target: Target,
    genotype: Genotype,
    drain: Drain,
    snake_head: SnakeHead,
    snake_body: SnakeBody,
    snake_member: SnakeMember,
    pylon: Pylon,
    quasar: Quasar,
    swarm: Swarm,
    storm: Storm,
    orb: Orb,
    weapon: Weapon,
    heat: Heat,
    energy: Energy,
    shield: Shield,
    loot: Loot,
    lightning: Lightning,
    flash: Flash,
    decay: Decay,
    dust: Dust,
    wall: Wall,
    splash: Splash,
    explosion: Explosion,
    glyph: Glyph,
}

impl World {
    /// Allocate a fresh entity with no components.
    pub fn create(&mut self) -> EntityId {
        self.entities.allocate()
    }

    /// Remove every component from `entity` and release its ID. Idempotent:
    /// destroying an already-dead or stale entity is a no-op.
    pub fn destroy(&mut self, entity: EntityId) {
        if !self.entities.is_alive(entity) {
            return;
        }
        self.clear_components(entity);
        self.entities.deallocate(entity);
    }

    pub fn is_alive(&self, entity: EntityId) -> bool {
        self.entities.is_alive(entity)
    }

    pub fn alive_count(&self) -> usize {
        self.entities.alive_count()
    }

    // -- generic component access, delegating to the component's store -----

    pub fn get<T: Component>(&self, entity: EntityId) -> Option<&T> {
        T::store(self).get(entity)
    }

    pub fn get_mut<T: Component>(&mut self, entity: EntityId) -> Option<&mut T> {
        T::store_mut(self).get_mut(entity)
    }

    pub fn set<T: Component>(&mut self, entity: EntityId, value: T) {
        T::store_mut(self).set(entity, value)
    }

    pub fn remove<T: Component>(&mut self, entity: EntityId) -> Option<T> {
        T::store_mut(self).remove(entity)
    }

    pub fn has<T: Component>(&self, entity: EntityId) -> bool {
        T::store(self).has(entity)
    }

    pub fn all<T: Component>(&self) -> Vec<EntityId> {
        T::store(self).all()
    }

    pub fn count<T: Component>(&self) -> usize {
        T::store(self).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_world() -> World {
        World::new(SimConfig::default())
    }

    #[test]
    fn create_destroy_roundtrip() {
        let mut world = test_world();
        let e = world.create();
        world.set(e, Position::new(1, 2));
        assert!(world.is_alive(e));
        assert_eq!(world.get::<Position>(e), Some(&Position::new(1, 2)));

        world.destroy(e);
        assert!(!world.is_alive(e));
        assert_eq!(world.get::<Position>(e), None);
    }

    #[test]
    fn destroy_is_idempotent() {
        let mut world = test_world();
        let e = world.create();
        world.destroy(e);
        world.destroy(e); // must not panic
        assert!(!world.is_alive(e));
    }

    #[test]
    fn set_same_value_twice_is_noop_effectwise() {
        let mut world = test_world();
        let e = world.create();
        world.set(e, Position::new(5, 5));
        world.set(e, Position::new(5, 5));
        assert_eq!(world.count::<Position>(), 1);
        assert_eq!(world.get::<Position>(e), Some(&Position::new(5, 5)));
    }

    #[test]
    fn clear_all_resets_to_zero_entities() {
        let mut world = test_world();
        for i in 0..10 {
            let e = world.create();
            world.set(e, Position::new(i, i));
        }
        world.clear_all();
        assert_eq!(world.alive_count(), 0);
        assert_eq!(world.count::<Position>(), 0);
        assert_eq!(world.frame, 0);
    }

    #[test]
    fn destroy_then_create_does_not_reuse_live_id() {
        let mut world = test_world();
        let e0 = world.create();
        world.destroy(e0);
        let e1 = world.create();
        assert_ne!(e0, e1);
    }
}
