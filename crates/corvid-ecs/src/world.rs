//! The [`World`] ties the storage engine together: entity allocation,
//! component registration, the archetype graph, and the entity index. It is
//! an explicit context object passed by reference to every operation; there
//! is no global state anywhere in the crate.

use std::cell::RefCell;
use std::collections::HashMap;

use crate::archetype::{ArchetypeId, ComponentVtable, VtableRegistry};
use crate::component::{Component, ComponentRegistry, ComponentTypeId};
use crate::entity::{Entity, EntityAllocator};
use crate::graph::ArchetypeGraph;
use crate::EcsError;

// ---------------------------------------------------------------------------
// EntityIndex -- where does each entity's data live right now
// ---------------------------------------------------------------------------

/// Where an entity lives: which archetype and which row within it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EntityLocation {
    pub archetype_id: ArchetypeId,
    pub row: usize,
}

/// The single source of truth mapping entities to their storage location.
///
/// Every structural operation (spawn, despawn, migration, swap-remove
/// relocation) updates this map in the same call that moves the data, so a
/// lookup between operations always reflects reality.
#[derive(Debug, Default)]
pub(crate) struct EntityIndex {
    locations: HashMap<Entity, EntityLocation>,
}

impl EntityIndex {
    #[inline]
    pub(crate) fn get(&self, entity: Entity) -> Option<EntityLocation> {
        self.locations.get(&entity).copied()
    }

    #[inline]
    pub(crate) fn insert(&mut self, entity: Entity, location: EntityLocation) {
        self.locations.insert(entity, location);
    }

    #[inline]
    pub(crate) fn remove(&mut self, entity: Entity) -> Option<EntityLocation> {
        self.locations.remove(&entity)
    }

    /// Re-point an entity at a new row after a swap-remove relocated it
    /// within its archetype.
    pub(crate) fn set_row(&mut self, entity: Entity, row: usize) {
        let loc = self
            .locations
            .get_mut(&entity)
            .expect("relocated entity missing from index");
        loc.row = row;
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.locations.len()
    }
}

// ---------------------------------------------------------------------------
// RawComponentBuf -- properly aligned staging for one component value
// ---------------------------------------------------------------------------

/// A heap buffer holding a single component value at the correct alignment,
/// used to stage values between a typed caller and type-erased column
/// storage.
///
/// Dropping the buffer releases only the allocation, never the value: by the
/// time the buffer drops, ownership of the value has either moved into a
/// column or been dropped explicitly via [`drop_value`](Self::drop_value).
pub(crate) struct RawComponentBuf {
    /// Heap allocation (null for zero-sized values).
    ptr: *mut u8,
    layout: std::alloc::Layout,
}

impl RawComponentBuf {
    /// Move `value` into a fresh buffer.
    pub(crate) fn from_value<T>(value: T) -> Self {
        let size = std::mem::size_of::<T>();
        let align = std::mem::align_of::<T>();
        let layout = std::alloc::Layout::from_size_align(size, align).expect("invalid layout");

        let ptr = if size > 0 {
            #[allow(unsafe_code)]
            unsafe {
                let ptr = std::alloc::alloc(layout);
                assert!(!ptr.is_null(), "allocation failed");
                std::ptr::copy_nonoverlapping(&value as *const T as *const u8, ptr, size);
                ptr
            }
        } else {
            std::ptr::null_mut()
        };
        std::mem::forget(value);
        Self { ptr, layout }
    }

    /// Pointer to the staged value (dangling but aligned for ZSTs).
    pub(crate) fn as_ptr(&self) -> *const u8 {
        if self.layout.size() > 0 {
            self.ptr
        } else {
            self.layout.align() as *const u8
        }
    }

    /// Drop the staged value in place via its vtable. Only valid while the
    /// buffer still owns the value (i.e. it has not been pushed into a
    /// column).
    #[allow(unsafe_code)]
    pub(crate) unsafe fn drop_value(&mut self, vtable: &ComponentVtable) {
        if vtable.size > 0 && !self.ptr.is_null() {
            (vtable.drop_fn)(self.ptr);
        }
    }
}

impl Drop for RawComponentBuf {
    fn drop(&mut self) {
        // Releases the allocation only; the value was moved out or dropped
        // through drop_value before this runs.
        if self.layout.size() > 0 && !self.ptr.is_null() {
            #[allow(unsafe_code)]
            unsafe {
                std::alloc::dealloc(self.ptr, self.layout);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ComponentBundle
// ---------------------------------------------------------------------------

/// A set of staged component values to spawn an entity with.
///
/// ```ignore
/// let mut bundle = ComponentBundle::new();
/// bundle.add(world.registry(), Position { x: 0.0, y: 0.0 });
/// bundle.add(world.registry(), Velocity { dx: 1.0, dy: 0.0 });
/// let entity = world.spawn_bundle(bundle);
/// ```
#[derive(Default)]
pub struct ComponentBundle {
    entries: Vec<(ComponentTypeId, RawComponentBuf, ComponentVtable)>,
}

impl ComponentBundle {
    /// Create an empty bundle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a component value. The type must already be registered.
    ///
    /// # Panics
    ///
    /// Panics if the type is not registered, or if the bundle already holds
    /// a value of the same type.
    pub fn add<T: Component>(&mut self, registry: &ComponentRegistry, value: T) {
        let type_id = registry
            .lookup::<T>()
            .expect("component type not registered -- call world.register_component::<T>() first");
        if self.entries.iter().any(|(id, _, _)| *id == type_id) {
            panic!("duplicate component type {type_id:?} in ComponentBundle");
        }
        self.entries
            .push((type_id, RawComponentBuf::from_value(value), ComponentVtable::new::<T>()));
    }

    /// The sorted component-type set of this bundle.
    pub(crate) fn type_ids(&self) -> Vec<ComponentTypeId> {
        let mut ids: Vec<_> = self.entries.iter().map(|(id, _, _)| *id).collect();
        ids.sort();
        ids
    }

    /// Consume the bundle, yielding its staged buffers. The caller takes
    /// over ownership of every value.
    pub(crate) fn into_raw_parts(mut self) -> Vec<(ComponentTypeId, RawComponentBuf)> {
        self.entries
            .drain(..)
            .map(|(id, buf, _vtable)| (id, buf))
            .collect()
    }
}

impl Drop for ComponentBundle {
    fn drop(&mut self) {
        // A bundle that was never spawned still owns its values.
        for (_, mut buf, vtable) in self.entries.drain(..) {
            #[allow(unsafe_code)]
            unsafe {
                buf.drop_value(&vtable);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

/// A cached query-match result, valid while the graph generation is
/// unchanged.
#[derive(Debug, Clone)]
struct CachedMatch {
    generation: u64,
    archetypes: Vec<ArchetypeId>,
}

/// The top-level storage-engine container.
///
/// Owns the entity allocator, the component registry, the archetype graph,
/// and the entity index, and exposes the entity/component API the rest of
/// the engine consumes.
pub struct World {
    allocator: EntityAllocator,
    registry: ComponentRegistry,
    vtables: VtableRegistry,
    pub(crate) graph: ArchetypeGraph,
    index: EntityIndex,
    /// Requested-type-set -> matching archetypes, stamped with the graph
    /// generation at computation time.
    query_cache: RefCell<HashMap<Vec<ComponentTypeId>, CachedMatch>>,
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("entity_count", &self.index.len())
            .field("archetype_count", &self.graph.len())
            .finish()
    }
}

impl World {
    /// Create a new, empty world.
    pub fn new() -> Self {
        Self {
            allocator: EntityAllocator::new(),
            registry: ComponentRegistry::new(),
            vtables: VtableRegistry::default(),
            graph: ArchetypeGraph::new(),
            index: EntityIndex::default(),
            query_cache: RefCell::new(HashMap::new()),
        }
    }

    /// Read-only access to the component registry.
    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    /// Register a component type, making it usable in bundles, inserts and
    /// queries. Re-registering a type returns its existing id.
    pub fn register_component<T: Component>(&mut self, name: &str) -> ComponentTypeId {
        let id = self.registry.register::<T>(name);
        self.vtables.register::<T>(id);
        id
    }

    // -- entity lifecycle ---------------------------------------------------

    /// Spawn an entity with no components. It lives in the empty-set
    /// archetype until components are inserted.
    pub fn spawn_empty(&mut self) -> Entity {
        self.spawn_bundle(ComponentBundle::new())
    }

    /// Spawn an entity from a [`ComponentBundle`].
    pub fn spawn_bundle(&mut self, bundle: ComponentBundle) -> Entity {
        let entity = self.allocator.allocate();
        let type_ids = bundle.type_ids();
        let archetype_id = self.graph.get_or_create(&type_ids, &self.registry, &self.vtables);
        let parts = bundle.into_raw_parts();

        let mut components: Vec<(ComponentTypeId, *const u8)> = parts
            .iter()
            .map(|(id, buf)| (*id, buf.as_ptr()))
            .collect();
        components.sort_by_key(|(id, _)| *id);

        #[allow(unsafe_code)]
        let row = unsafe { self.graph.get_mut(archetype_id).add_entity(entity, &components) };

        // add_entity copied the bytes into the columns; dropping the staging
        // buffers releases only their allocations.
        drop(parts);

        self.index.insert(entity, EntityLocation { archetype_id, row });
        entity
    }

    /// Spawn an entity with a single component.
    pub fn spawn_with<T: Component>(&mut self, component: T) -> Entity {
        let mut bundle = ComponentBundle::new();
        bundle.add(&self.registry, component);
        self.spawn_bundle(bundle)
    }

    /// Despawn an entity: drop its row everywhere and recycle the handle.
    ///
    /// # Errors
    ///
    /// [`EcsError::StaleEntity`] if the handle is dead or was never spawned.
    pub fn despawn(&mut self, entity: Entity) -> Result<(), EcsError> {
        if !self.allocator.is_alive(entity) {
            return Err(EcsError::StaleEntity(entity));
        }
        let loc = self
            .index
            .remove(entity)
            .ok_or(EcsError::StaleEntity(entity))?;
        let relocated = self.graph.get_mut(loc.archetype_id).remove_entity(loc.row);
        if let Some(moved) = relocated {
            self.index.set_row(moved, loc.row);
        }
        self.allocator.release(entity);
        Ok(())
    }

    // -- component access ---------------------------------------------------

    /// Immutable reference to a component on an entity.
    pub fn get_component<T: 'static>(&self, entity: Entity) -> Option<&T> {
        let loc = self.index.get(entity)?;
        let type_id = self.registry.lookup::<T>()?;
        #[allow(unsafe_code)]
        unsafe {
            self.graph.get(loc.archetype_id).get_component::<T>(loc.row, type_id)
        }
    }

    /// Mutable reference to a component on an entity.
    pub fn get_component_mut<T: 'static>(&mut self, entity: Entity) -> Option<&mut T> {
        let loc = self.index.get(entity)?;
        let type_id = self.registry.lookup::<T>()?;
        #[allow(unsafe_code)]
        unsafe {
            self.graph
                .get_mut(loc.archetype_id)
                .get_component_mut::<T>(loc.row, type_id)
        }
    }

    /// Whether an entity currently has a component of type `T`.
    pub fn has_component<T: 'static>(&self, entity: Entity) -> bool {
        let Some(loc) = self.index.get(entity) else {
            return false;
        };
        let Some(type_id) = self.registry.lookup::<T>() else {
            return false;
        };
        self.graph.get(loc.archetype_id).has_component(type_id)
    }

    // -- structural transitions ---------------------------------------------

    /// Insert a component on an entity. If the entity already has the type,
    /// the value is overwritten in place; otherwise the entity migrates to
    /// the archetype holding its current set plus `T`.
    ///
    /// # Errors
    ///
    /// [`EcsError::UnknownComponent`] if `T` was never registered,
    /// [`EcsError::StaleEntity`] if the entity is dead.
    pub fn insert_component<T: Component>(&mut self, entity: Entity, value: T) -> Result<(), EcsError> {
        let type_id = self
            .registry
            .lookup::<T>()
            .ok_or_else(|| EcsError::UnknownComponent(std::any::type_name::<T>().to_owned()))?;
        let loc = self
            .index
            .get(entity)
            .ok_or(EcsError::StaleEntity(entity))?;

        if self.graph.get(loc.archetype_id).has_component(type_id) {
            // Overwrite in place; assignment drops the old value.
            #[allow(unsafe_code)]
            let slot = unsafe {
                self.graph
                    .get_mut(loc.archetype_id)
                    .get_component_mut::<T>(loc.row, type_id)
            };
            if let Some(slot) = slot {
                *slot = value;
            }
            return Ok(());
        }

        let dst_id = self
            .graph
            .archetype_with(loc.archetype_id, type_id, &self.registry, &self.vtables);
        let value_buf = RawComponentBuf::from_value(value);

        let (src, dst) = self.graph.get_mut2(loc.archetype_id, dst_id);
        #[allow(unsafe_code)]
        let (new_row, relocated) =
            unsafe { dst.insert_from_subset(src, loc.row, type_id, value_buf.as_ptr()) };
        drop(value_buf);

        tracing::trace!(
            entity = %entity,
            from = loc.archetype_id.0,
            to = dst_id.0,
            "entity migrated (component added)"
        );

        self.index.insert(
            entity,
            EntityLocation {
                archetype_id: dst_id,
                row: new_row,
            },
        );
        if let Some(moved) = relocated {
            self.index.set_row(moved, loc.row);
        }
        Ok(())
    }

    /// Remove a component type from an entity, migrating it to the archetype
    /// holding its current set minus `T`. Removing a type the entity does
    /// not have is a no-op.
    ///
    /// # Errors
    ///
    /// [`EcsError::UnknownComponent`] if `T` was never registered,
    /// [`EcsError::StaleEntity`] if the entity is dead.
    pub fn remove_component<T: Component>(&mut self, entity: Entity) -> Result<(), EcsError> {
        let type_id = self
            .registry
            .lookup::<T>()
            .ok_or_else(|| EcsError::UnknownComponent(std::any::type_name::<T>().to_owned()))?;
        let loc = self
            .index
            .get(entity)
            .ok_or(EcsError::StaleEntity(entity))?;

        if !self.graph.get(loc.archetype_id).has_component(type_id) {
            return Ok(());
        }

        let dst_id =
            self.graph
                .archetype_without(loc.archetype_id, type_id, &self.registry, &self.vtables);

        let (src, dst) = self.graph.get_mut2(loc.archetype_id, dst_id);
        #[allow(unsafe_code)]
        let (new_row, relocated) = unsafe { dst.insert_from_superset(src, loc.row, type_id) };

        tracing::trace!(
            entity = %entity,
            from = loc.archetype_id.0,
            to = dst_id.0,
            "entity migrated (component removed)"
        );

        self.index.insert(
            entity,
            EntityLocation {
                archetype_id: dst_id,
                row: new_row,
            },
        );
        if let Some(moved) = relocated {
            self.index.set_row(moved, loc.row);
        }
        Ok(())
    }

    // -- bookkeeping --------------------------------------------------------

    /// Number of live entities.
    pub fn entity_count(&self) -> usize {
        self.index.len()
    }

    /// Number of archetypes ever created.
    pub fn archetype_count(&self) -> usize {
        self.graph.len()
    }

    /// Whether `entity` is a live handle.
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.allocator.is_alive(entity)
    }

    // -- query support (used by query.rs) -----------------------------------

    /// Every archetype whose component set is a superset of `required`, in
    /// creation order. Memoized per requested set; the cache entry is
    /// recomputed whenever an archetype has been created since it was
    /// stamped.
    pub(crate) fn matching_archetypes(&self, required: &[ComponentTypeId]) -> Vec<ArchetypeId> {
        let generation = self.graph.generation();
        if let Some(hit) = self.query_cache.borrow().get(required) {
            if hit.generation == generation {
                return hit.archetypes.clone();
            }
        }
        let archetypes: Vec<ArchetypeId> = self
            .graph
            .iter()
            .filter(|arch| required.iter().all(|req| arch.has_component(*req)))
            .map(|arch| arch.id())
            .collect();
        self.query_cache.borrow_mut().insert(
            required.to_vec(),
            CachedMatch {
                generation,
                archetypes: archetypes.clone(),
            },
        );
        archetypes
    }

    /// The registered id for a Rust component type, if any.
    pub(crate) fn component_type_id<T: 'static>(&self) -> Option<ComponentTypeId> {
        self.registry.lookup::<T>()
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
