//! Query execution: run code over every entity whose component set contains
//! the requested types.
//!
//! A query names a tuple of component accesses -- `(&Pos, &Vel)`,
//! `(&mut Pos, &Vel)` -- and resolves to every archetype whose component set
//! is a superset of the requested types. Each matching archetype's rows are
//! visited in order, archetypes in creation order; the resulting entity order
//! is deterministic for a given storage state but otherwise unspecified.
//!
//! ## Soundness
//!
//! Read-only queries (`&T` only) run through [`World::query`], which takes
//! `&self`. Queries containing `&mut T` must run through
//! [`World::query_mut`] or [`World::each`], which take `&mut self`: the
//! exclusive borrow is what makes handing out `&mut T` sound, and it is also
//! what makes structural mutation during iteration a compile error rather
//! than a storage hazard -- the world is borrowed by the iterator for as
//! long as it lives.

use crate::archetype::ArchetypeId;
use crate::component::ComponentTypeId;
use crate::entity::Entity;
use crate::world::World;

// ---------------------------------------------------------------------------
// QueryItem -- one element of a query tuple
// ---------------------------------------------------------------------------

/// A single element of a query fetch: `&T` (read) or `&mut T` (write).
pub trait QueryItem {
    /// The output type yielded per row.
    type Item<'w>;
    /// Whether this item borrows mutably.
    const MUTABLE: bool;
    /// The registered component type this item accesses.
    fn component_type_id(world: &World) -> Option<ComponentTypeId>;
    /// Fetch one item from an archetype row.
    ///
    /// # Safety
    ///
    /// For `&T` items this is safe with `&World`. For `&mut T` items the
    /// caller must guarantee exclusive access, which `World::query_mut`'s
    /// `&mut self` receiver does.
    fn fetch(world: &World, archetype: ArchetypeId, row: usize) -> Self::Item<'_>;
}

impl<T: 'static> QueryItem for &T {
    type Item<'w> = &'w T;
    const MUTABLE: bool = false;

    fn component_type_id(world: &World) -> Option<ComponentTypeId> {
        world.component_type_id::<T>()
    }

    fn fetch(world: &World, archetype: ArchetypeId, row: usize) -> Self::Item<'_> {
        let type_id = world.component_type_id::<T>().unwrap();
        #[allow(unsafe_code)]
        unsafe {
            world
                .graph
                .get(archetype)
                .get_component::<T>(row, type_id)
                .unwrap()
        }
    }
}

// Safety: only reachable through `World::query_mut`/`World::each`, whose
// `&mut self` receivers guarantee no other reference into the world exists,
// so the const-to-mut cast cannot alias.
impl<T: 'static> QueryItem for &mut T {
    type Item<'w> = &'w mut T;
    const MUTABLE: bool = true;

    fn component_type_id(world: &World) -> Option<ComponentTypeId> {
        world.component_type_id::<T>()
    }

    fn fetch(world: &World, archetype: ArchetypeId, row: usize) -> Self::Item<'_> {
        let type_id = world.component_type_id::<T>().unwrap();
        #[allow(unsafe_code)]
        unsafe {
            let world_ptr = world as *const World as *mut World;
            (*world_ptr)
                .graph
                .get_mut(archetype)
                .get_component_mut::<T>(row, type_id)
                .unwrap()
        }
    }
}

// ---------------------------------------------------------------------------
// Query -- a tuple of QueryItems
// ---------------------------------------------------------------------------

/// A tuple of query items: `(&A,)`, `(&A, &B)`, `(&mut A, &B)`, ...
pub trait Query {
    /// The per-row output type.
    type Item<'w>;
    /// Whether any item borrows mutably.
    const HAS_MUTABLE: bool;
    /// The requested component types, or `None` if any is unregistered.
    fn type_ids(world: &World) -> Option<Vec<ComponentTypeId>>;
    /// Panic if the tuple requests conflicting access to one component type
    /// (`&mut T` twice, or `&mut T` alongside `&T`).
    fn validate_access(world: &World);
    /// Fetch one row.
    fn fetch_row(world: &World, archetype: ArchetypeId, row: usize) -> Self::Item<'_>;
}

/// Shared conflict check over `(is_mutable, type_id)` pairs.
fn validate_no_access_conflicts(items: &[(bool, Option<ComponentTypeId>)]) {
    let mut mutable: Vec<ComponentTypeId> = Vec::new();
    let mut read: Vec<ComponentTypeId> = Vec::new();
    for &(is_mutable, type_id) in items {
        let Some(id) = type_id else { continue };
        if is_mutable {
            if mutable.contains(&id) {
                panic!("query contains duplicate mutable access to the same component type");
            }
            if read.contains(&id) {
                panic!(
                    "query contains overlapping read and mutable access to the same component type"
                );
            }
            mutable.push(id);
        } else {
            if mutable.contains(&id) {
                panic!(
                    "query contains overlapping read and mutable access to the same component type"
                );
            }
            read.push(id);
        }
    }
}

macro_rules! impl_query_for_tuple {
    ($($name:ident),+) => {
        impl<$($name: QueryItem),+> Query for ($($name,)+) {
            type Item<'w> = ($($name::Item<'w>,)+);
            const HAS_MUTABLE: bool = false $(|| $name::MUTABLE)+;

            fn type_ids(world: &World) -> Option<Vec<ComponentTypeId>> {
                Some(vec![$($name::component_type_id(world)?),+])
            }

            fn validate_access(world: &World) {
                let items = [$(($name::MUTABLE, $name::component_type_id(world))),+];
                validate_no_access_conflicts(&items);
            }

            fn fetch_row(world: &World, archetype: ArchetypeId, row: usize) -> Self::Item<'_> {
                ($($name::fetch(world, archetype, row),)+)
            }
        }
    };
}

impl_query_for_tuple!(A);
impl_query_for_tuple!(A, B);
impl_query_for_tuple!(A, B, C);
impl_query_for_tuple!(A, B, C, D);

// ---------------------------------------------------------------------------
// Iterators
// ---------------------------------------------------------------------------

/// Iterator yielding `(Entity, Q::Item)` for every matching row.
/// Read-only flavour, produced by [`World::query`].
pub struct QueryIter<'w, Q: Query> {
    world: &'w World,
    /// Matching archetypes, in creation order.
    archetypes: Vec<ArchetypeId>,
    arch_cursor: usize,
    row_cursor: usize,
    _marker: std::marker::PhantomData<Q>,
}

impl<'w, Q: Query> QueryIter<'w, Q> {
    pub(crate) fn new(world: &'w World, archetypes: Vec<ArchetypeId>) -> Self {
        Self {
            world,
            archetypes,
            arch_cursor: 0,
            row_cursor: 0,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<'w, Q: Query> Iterator for QueryIter<'w, Q> {
    type Item = (Entity, Q::Item<'w>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let arch_id = *self.archetypes.get(self.arch_cursor)?;
            let archetype = self.world.graph.get(arch_id);
            if self.row_cursor < archetype.len() {
                let entity = archetype.entities()[self.row_cursor];
                let item = Q::fetch_row(self.world, arch_id, self.row_cursor);
                self.row_cursor += 1;
                return Some((entity, item));
            }
            self.arch_cursor += 1;
            self.row_cursor = 0;
        }
    }
}

/// Iterator yielding `(Entity, Q::Item)` for every matching row.
/// Mutable flavour, produced by [`World::query_mut`].
///
/// Holds the world reference derived from a `&mut World` borrow, so the
/// exclusive access lasts as long as the iterator does.
pub struct QueryIterMut<'w, Q: Query> {
    world: &'w World,
    archetypes: Vec<ArchetypeId>,
    arch_cursor: usize,
    row_cursor: usize,
    _marker: std::marker::PhantomData<Q>,
}

impl<'w, Q: Query> QueryIterMut<'w, Q> {
    /// Build a mutable query iterator.
    ///
    /// The `world` reference must be derived from a `&mut World` borrow;
    /// `World::query_mut` is the only constructor call site.
    pub(crate) fn new(world: &'w World, archetypes: Vec<ArchetypeId>) -> Self {
        Self {
            world,
            archetypes,
            arch_cursor: 0,
            row_cursor: 0,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<'w, Q: Query> Iterator for QueryIterMut<'w, Q> {
    type Item = (Entity, Q::Item<'w>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let arch_id = *self.archetypes.get(self.arch_cursor)?;
            let archetype = self.world.graph.get(arch_id);
            if self.row_cursor < archetype.len() {
                let entity = archetype.entities()[self.row_cursor];
                let item = Q::fetch_row(self.world, arch_id, self.row_cursor);
                self.row_cursor += 1;
                return Some((entity, item));
            }
            self.arch_cursor += 1;
            self.row_cursor = 0;
        }
    }
}

// ---------------------------------------------------------------------------
// World query methods
// ---------------------------------------------------------------------------

impl World {
    /// Run a read-only query over all matching entities.
    ///
    /// # Panics
    ///
    /// Panics if `Q` contains `&mut T` items; use
    /// [`query_mut`](Self::query_mut) for those.
    ///
    /// ```ignore
    /// for (entity, (pos, vel)) in world.query::<(&Pos, &Vel)>() {
    ///     println!("{entity}: {pos:?} {vel:?}");
    /// }
    /// ```
    pub fn query<Q: Query>(&self) -> QueryIter<'_, Q> {
        assert!(
            !Q::HAS_MUTABLE,
            "World::query() cannot be used with mutable query items (&mut T). \
             Use World::query_mut() instead, which requires &mut self."
        );
        // An unregistered component type can match nothing.
        let matching = match Q::type_ids(self) {
            Some(type_ids) => self.matching_archetypes(&type_ids),
            None => Vec::new(),
        };
        QueryIter::new(self, matching)
    }

    /// Run a query that may contain `&mut T` items. The `&mut self` receiver
    /// guarantees exclusive world access for the iterator's lifetime.
    ///
    /// # Panics
    ///
    /// Panics if the tuple requests conflicting access to one component type.
    ///
    /// ```ignore
    /// for (_entity, (pos, vel)) in world.query_mut::<(&mut Pos, &Vel)>() {
    ///     pos.x += vel.dx;
    ///     pos.y += vel.dy;
    /// }
    /// ```
    pub fn query_mut<Q: Query>(&mut self) -> QueryIterMut<'_, Q> {
        Q::validate_access(self);
        let matching = match Q::type_ids(self) {
            Some(type_ids) => self.matching_archetypes(&type_ids),
            None => Vec::new(),
        };
        QueryIterMut::new(self, matching)
    }

    /// Invoke `f` once per entity whose component set contains every type in
    /// `Q`, passing one reference per requested type. Mutations through
    /// `&mut T` items are applied directly to storage.
    ///
    /// ```ignore
    /// world.each::<(&mut Pos, &Vel)>(|_entity, (pos, vel)| {
    ///     pos.x += vel.dx;
    ///     pos.y += vel.dy;
    /// });
    /// ```
    pub fn each<'w, Q: Query>(&'w mut self, mut f: impl FnMut(Entity, Q::Item<'w>)) {
        for (entity, item) in self.query_mut::<Q>() {
            f(entity, item);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::world::{ComponentBundle, World};

    #[derive(Debug, Clone, PartialEq)]
    struct Pos {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Vel {
        dx: f32,
        dy: f32,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Health(u32);

    fn setup_world() -> World {
        let mut world = World::new();
        world.register_component::<Pos>("position");
        world.register_component::<Vel>("velocity");
        world.register_component::<Health>("health");
        world
    }

    #[test]
    fn query_matches_required_set_only() {
        let mut world = setup_world();

        let mut b1 = ComponentBundle::new();
        b1.add(world.registry(), Pos { x: 1.0, y: 2.0 });
        b1.add(world.registry(), Vel { dx: 3.0, dy: 4.0 });
        let e1 = world.spawn_bundle(b1);

        let _e2 = world.spawn_with(Pos { x: 10.0, y: 20.0 });

        let results: Vec<_> = world.query::<(&Pos, &Vel)>().collect();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, e1);
        assert_eq!(results[0].1 .0, &Pos { x: 1.0, y: 2.0 });
        assert_eq!(results[0].1 .1, &Vel { dx: 3.0, dy: 4.0 });
    }

    #[test]
    fn query_spans_every_superset_archetype() {
        let mut world = setup_world();

        world.spawn_with(Pos { x: 1.0, y: 0.0 });

        let mut b = ComponentBundle::new();
        b.add(world.registry(), Pos { x: 2.0, y: 0.0 });
        b.add(world.registry(), Vel { dx: 0.0, dy: 0.0 });
        world.spawn_bundle(b);

        let mut b = ComponentBundle::new();
        b.add(world.registry(), Pos { x: 3.0, y: 0.0 });
        b.add(world.registry(), Vel { dx: 0.0, dy: 0.0 });
        b.add(world.registry(), Health(10));
        world.spawn_bundle(b);

        // {Pos}, {Pos,Vel}, {Pos,Vel,Health} all match a Pos query.
        assert_eq!(world.query::<(&Pos,)>().count(), 3);
        // Only the latter two match Pos+Vel.
        assert_eq!(world.query::<(&Pos, &Vel)>().count(), 2);
        // Only the last matches all three.
        assert_eq!(world.query::<(&Pos, &Vel, &Health)>().count(), 1);
    }

    #[test]
    fn query_skips_entities_missing_required() {
        let mut world = setup_world();
        for i in 0..5 {
            world.spawn_with(Pos {
                x: i as f32,
                y: 0.0,
            });
        }
        assert_eq!(world.query::<(&Pos, &Vel)>().count(), 0);
    }

    #[test]
    fn mutable_query_writes_to_storage() {
        let mut world = setup_world();

        let mut b = ComponentBundle::new();
        b.add(world.registry(), Pos { x: 0.0, y: 0.0 });
        b.add(world.registry(), Vel { dx: 1.0, dy: 2.0 });
        let e = world.spawn_bundle(b);

        for (_entity, (pos, vel)) in world.query_mut::<(&mut Pos, &Vel)>() {
            pos.x += vel.dx;
            pos.y += vel.dy;
        }

        assert_eq!(world.get_component::<Pos>(e), Some(&Pos { x: 1.0, y: 2.0 }));
    }

    #[test]
    fn each_visits_every_matching_entity_once() {
        let mut world = setup_world();
        world.spawn_with(Pos { x: 1.0, y: 0.0 });
        let mut b = ComponentBundle::new();
        b.add(world.registry(), Pos { x: 2.0, y: 0.0 });
        b.add(world.registry(), Vel { dx: 0.0, dy: 0.0 });
        world.spawn_bundle(b);

        let mut seen = Vec::new();
        world.each::<(&Pos,)>(|entity, (pos,)| {
            seen.push((entity, pos.x));
        });
        seen.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].1, 1.0);
        assert_eq!(seen[1].1, 2.0);
    }

    #[test]
    fn each_mutations_are_live() {
        let mut world = setup_world();
        let e = world.spawn_with(Health(10));
        world.each::<(&mut Health,)>(|_entity, (health,)| {
            health.0 += 5;
        });
        assert_eq!(world.get_component::<Health>(e), Some(&Health(15)));
    }

    #[test]
    fn single_component_query() {
        let mut world = setup_world();
        world.spawn_with(Pos { x: 1.0, y: 2.0 });
        world.spawn_with(Pos { x: 3.0, y: 4.0 });
        assert_eq!(world.query::<(&Pos,)>().count(), 2);
    }

    #[test]
    fn unregistered_type_matches_nothing() {
        let mut world = World::new();
        world.register_component::<Pos>("position");
        world.spawn_with(Pos { x: 0.0, y: 0.0 });
        // Vel was never registered; the query resolves to no requirement
        // match and yields nothing.
        assert_eq!(world.query::<(&Vel,)>().count(), 0);
    }

    #[test]
    #[should_panic(expected = "cannot be used with mutable query items")]
    fn query_rejects_mutable_items() {
        let mut world = setup_world();
        world.spawn_with(Pos { x: 0.0, y: 0.0 });
        let _results: Vec<_> = world.query::<(&mut Pos,)>().collect();
    }

    #[test]
    #[should_panic(expected = "duplicate mutable access")]
    fn query_mut_rejects_aliasing_muts() {
        let mut world = setup_world();
        world.spawn_with(Pos { x: 0.0, y: 0.0 });
        let _results: Vec<_> = world.query_mut::<(&mut Pos, &mut Pos)>().collect();
    }

    #[test]
    #[should_panic(expected = "overlapping read and mutable access")]
    fn query_mut_rejects_read_write_overlap() {
        let mut world = setup_world();
        world.spawn_with(Pos { x: 0.0, y: 0.0 });
        let _results: Vec<_> = world.query_mut::<(&mut Pos, &Pos)>().collect();
    }
}
