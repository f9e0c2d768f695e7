//! Corvid ECS -- archetype-based entity-component storage.
//!
//! Entities sharing the same component-type set live together in an
//! archetype, stored in a Structure-of-Arrays layout: one type-erased column
//! per component type, row-aligned with the archetype's entity list.
//! Adding or removing a component migrates the entity along a lazily-built
//! graph of single-component transitions between archetypes; removal inside
//! an archetype is always swap-remove, with the entity index fixed up for
//! whichever entity took over the vacated row. Queries resolve to every
//! archetype whose set contains the requested types and iterate rows in
//! place.
//!
//! # Quick Start
//!
//! ```
//! use corvid_ecs::prelude::*;
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Position { x: f32, y: f32 }
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Velocity { dx: f32, dy: f32 }
//!
//! let mut world = World::new();
//! world.register_component::<Position>("position");
//! world.register_component::<Velocity>("velocity");
//!
//! let mut bundle = ComponentBundle::new();
//! bundle.add(world.registry(), Position { x: 0.0, y: 0.0 });
//! bundle.add(world.registry(), Velocity { dx: 1.0, dy: 0.0 });
//! let entity = world.spawn_bundle(bundle);
//!
//! world.each::<(&mut Position, &Velocity)>(|_entity, (pos, vel)| {
//!     pos.x += vel.dx;
//!     pos.y += vel.dy;
//! });
//!
//! assert_eq!(world.get_component::<Position>(entity), Some(&Position { x: 1.0, y: 0.0 }));
//! ```

#![deny(unsafe_code)]

#[allow(unsafe_code)]
pub mod archetype;
pub mod component;
pub mod entity;
pub mod graph;
#[allow(unsafe_code)]
pub mod query;
#[allow(unsafe_code)]
pub mod world;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by world operations.
///
/// Only conditions a live program can legitimately hit are errors: a dead
/// entity handle or an unregistered component type. Internal contract
/// violations (type mismatch against a column, unknown archetype handle)
/// panic instead -- type-erased storage has no safety net to limp along on.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// The entity does not exist (stale generation or never spawned).
    #[error("entity {0:?} does not exist (stale or never spawned)")]
    StaleEntity(entity::Entity),

    /// A component type was used before being registered.
    #[error("component type '{0}' not registered")]
    UnknownComponent(String),
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::archetype::{Archetype, ArchetypeEdge, ArchetypeHash, ArchetypeId};
    pub use crate::component::{Component, ComponentInfo, ComponentRegistry, ComponentTypeId};
    pub use crate::entity::Entity;
    pub use crate::graph::ArchetypeGraph;
    pub use crate::query::{Query, QueryItem, QueryIter, QueryIterMut};
    pub use crate::world::{ComponentBundle, World};
    pub use crate::EcsError;
}

// ---------------------------------------------------------------------------
// Integration tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::prelude::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Velocity {
        dx: f32,
        dy: f32,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Health(u32);

    struct Frozen; // tag

    fn setup_world() -> World {
        let mut world = World::new();
        world.register_component::<Position>("position");
        world.register_component::<Velocity>("velocity");
        world.register_component::<Health>("health");
        world.register_component::<Frozen>("frozen");
        world
    }

    // -- the canonical two-entity scenario -----------------------------------

    #[test]
    fn position_velocity_scenario() {
        let mut world = setup_world();

        // E1 with {Position}, E2 with {Position, Velocity}.
        let e1 = world.spawn_with(Position { x: 1.0, y: 0.0 });
        let mut b = ComponentBundle::new();
        b.add(world.registry(), Position { x: 2.0, y: 0.0 });
        b.add(world.registry(), Velocity { dx: 1.0, dy: 1.0 });
        let e2 = world.spawn_bundle(b);

        // Two archetypes exist.
        assert_eq!(world.archetype_count(), 2);

        // A Position query fires for both; a Velocity query only for E2.
        assert_eq!(world.query::<(&Position,)>().count(), 2);
        let vel_hits: Vec<Entity> = world.query::<(&Velocity,)>().map(|(e, _)| e).collect();
        assert_eq!(vel_hits, vec![e2]);

        // Add Velocity to E1: both entities now share {Position, Velocity};
        // the emptied {Position} archetype is retained, not destroyed.
        world
            .insert_component(e1, Velocity { dx: -1.0, dy: 0.0 })
            .unwrap();
        assert_eq!(world.archetype_count(), 2);
        assert_eq!(world.query::<(&Position, &Velocity)>().count(), 2);
    }

    // -- transition completeness ---------------------------------------------

    #[test]
    fn add_keeps_everything_and_leaves_old_archetype() {
        let mut world = setup_world();
        let mut b = ComponentBundle::new();
        b.add(world.registry(), Position { x: 1.0, y: 2.0 });
        b.add(world.registry(), Health(50));
        let e = world.spawn_bundle(b);

        world
            .insert_component(e, Velocity { dx: 3.0, dy: 4.0 })
            .unwrap();

        // Everything it had, plus the new component.
        assert_eq!(
            world.get_component::<Position>(e),
            Some(&Position { x: 1.0, y: 2.0 })
        );
        assert_eq!(world.get_component::<Health>(e), Some(&Health(50)));
        assert_eq!(
            world.get_component::<Velocity>(e),
            Some(&Velocity { dx: 3.0, dy: 4.0 })
        );

        // And it is gone from its prior archetype: only one entity matches
        // a {Position, Health} query, in the superset archetype.
        assert_eq!(world.query::<(&Position, &Health)>().count(), 1);
    }

    #[test]
    fn remove_keeps_everything_else() {
        let mut world = setup_world();
        let mut b = ComponentBundle::new();
        b.add(world.registry(), Position { x: 1.0, y: 2.0 });
        b.add(world.registry(), Velocity { dx: 3.0, dy: 4.0 });
        b.add(world.registry(), Health(75));
        let e = world.spawn_bundle(b);

        world.remove_component::<Velocity>(e).unwrap();

        assert!(!world.has_component::<Velocity>(e));
        assert_eq!(
            world.get_component::<Position>(e),
            Some(&Position { x: 1.0, y: 2.0 })
        );
        assert_eq!(world.get_component::<Health>(e), Some(&Health(75)));
        assert_eq!(world.query::<(&Velocity,)>().count(), 0);
    }

    // -- query behaviour -----------------------------------------------------

    #[test]
    fn query_references_are_live_storage() {
        let mut world = setup_world();
        let e = world.spawn_with(Health(10));

        for (_entity, (health,)) in world.query_mut::<(&mut Health,)>() {
            health.0 = 42;
        }
        assert_eq!(world.get_component::<Health>(e), Some(&Health(42)));
    }

    #[test]
    fn query_fires_once_per_entity_regardless_of_extras() {
        let mut world = setup_world();
        world.spawn_with(Position { x: 0.0, y: 0.0 });

        let mut b = ComponentBundle::new();
        b.add(world.registry(), Position { x: 1.0, y: 0.0 });
        b.add(world.registry(), Velocity { dx: 0.0, dy: 0.0 });
        world.spawn_bundle(b);

        let mut b = ComponentBundle::new();
        b.add(world.registry(), Position { x: 2.0, y: 0.0 });
        b.add(world.registry(), Velocity { dx: 0.0, dy: 0.0 });
        b.add(world.registry(), Health(1));
        world.spawn_bundle(b);

        let mut visits = 0;
        world.each::<(&Position,)>(|_, _| visits += 1);
        assert_eq!(visits, 3);
    }

    #[test]
    fn tag_queries_match_presence() {
        let mut world = setup_world();
        let frozen = world.spawn_with(Position { x: 0.0, y: 0.0 });
        world.insert_component(frozen, Frozen).unwrap();
        let _warm = world.spawn_with(Position { x: 1.0, y: 1.0 });

        let hits: Vec<Entity> = world
            .query::<(&Position, &Frozen)>()
            .map(|(e, _)| e)
            .collect();
        assert_eq!(hits, vec![frozen]);
    }

    // -- scale ---------------------------------------------------------------

    #[test]
    fn scale_10k_entities() {
        let mut world = setup_world();

        let mut entities = Vec::with_capacity(10_000);
        for i in 0..10_000u32 {
            let mut b = ComponentBundle::new();
            b.add(
                world.registry(),
                Position {
                    x: i as f32,
                    y: i as f32 * 2.0,
                },
            );
            b.add(world.registry(), Velocity { dx: 1.0, dy: -1.0 });
            entities.push(world.spawn_bundle(b));
        }

        assert_eq!(world.query::<(&Position, &Velocity)>().count(), 10_000);

        world.each::<(&mut Velocity,)>(|_entity, (vel,)| {
            vel.dx *= 2.0;
            vel.dy *= 2.0;
        });
        let vel = world.get_component::<Velocity>(entities[0]).unwrap();
        assert_eq!(vel.dx, 2.0);
        assert_eq!(vel.dy, -2.0);

        for e in entities.iter().take(5_000) {
            world.despawn(*e).unwrap();
        }
        assert_eq!(world.query::<(&Position, &Velocity)>().count(), 5_000);
        assert_eq!(world.entity_count(), 5_000);
    }

    // -- churn through the transition graph ----------------------------------

    #[test]
    fn repeated_transitions_do_not_grow_the_graph() {
        let mut world = setup_world();
        let e = world.spawn_with(Position { x: 0.0, y: 0.0 });

        world
            .insert_component(e, Velocity { dx: 0.0, dy: 0.0 })
            .unwrap();
        let stable = world.archetype_count();

        // Bouncing between the same two sets reuses the same archetypes.
        for i in 0..10 {
            world.remove_component::<Velocity>(e).unwrap();
            world
                .insert_component(
                    e,
                    Velocity {
                        dx: i as f32,
                        dy: 0.0,
                    },
                )
                .unwrap();
        }
        assert_eq!(world.archetype_count(), stable);
        assert_eq!(
            world.get_component::<Velocity>(e),
            Some(&Velocity { dx: 9.0, dy: 0.0 })
        );
    }

    #[test]
    fn strip_to_empty_and_rebuild() {
        let mut world = setup_world();
        let mut b = ComponentBundle::new();
        b.add(world.registry(), Position { x: 1.0, y: 1.0 });
        b.add(world.registry(), Velocity { dx: 2.0, dy: 2.0 });
        let e = world.spawn_bundle(b);

        world.remove_component::<Position>(e).unwrap();
        world.remove_component::<Velocity>(e).unwrap();
        assert!(world.is_alive(e));
        assert!(!world.has_component::<Position>(e));
        assert!(!world.has_component::<Velocity>(e));

        world.insert_component(e, Health(5)).unwrap();
        assert_eq!(world.get_component::<Health>(e), Some(&Health(5)));
    }
}
