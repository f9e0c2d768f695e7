//! Archetype storage: type-erased columns plus the row-aligned entity list.
//!
//! An [`Archetype`] stores every entity that has exactly the same set of
//! component types. Within an archetype, components live in a
//! Structure-of-Arrays layout: one [`Column`] per component type, plus a
//! parallel `Vec<Entity>` mapping row index to entity. Row `i` of every
//! column belongs to `entities()[i]`; that alignment is the load-bearing
//! invariant of the whole storage engine and every operation here preserves
//! it.
//!
//! Each archetype also carries its transition edges: for a component type,
//! which archetype results from adding it, and which from removing it. Edges
//! start undiscovered and are filled in by the
//! [`ArchetypeGraph`](crate::graph::ArchetypeGraph) the first time a
//! transition actually happens.
//!
//! # Safety
//!
//! Component data is stored as type-erased byte buffers, so this module
//! contains `unsafe` code. The safety contract is that every column access
//! uses the [`ComponentInfo`]/[`ComponentVtable`] registered for the
//! column's concrete type; the higher-level [`World`](crate::world::World)
//! code upholds that by routing all typed access through the component
//! registry.

use crate::component::{ComponentInfo, ComponentTypeId};
use crate::entity::Entity;

use std::alloc::{self, Layout};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::ptr;

// ---------------------------------------------------------------------------
// ArchetypeId / ArchetypeHash
// ---------------------------------------------------------------------------

/// Handle identifying an archetype within its owning
/// [`ArchetypeGraph`](crate::graph::ArchetypeGraph) arena.
///
/// A handle, not a pointer: it stays valid across arena growth and is what
/// transition edges store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArchetypeId(pub(crate) u32);

/// Structural identity of an archetype: a hash over its sorted component-type
/// set. Two archetypes with the same component set always hash identically,
/// which is what the graph's deduplication relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArchetypeHash(pub u64);

impl ArchetypeHash {
    /// Hash a sorted component-type set.
    pub fn of(types: &[ComponentTypeId]) -> Self {
        debug_assert!(
            types.windows(2).all(|w| w[0] < w[1]),
            "component type set must be sorted and duplicate-free"
        );
        let mut hasher = DefaultHasher::new();
        for ty in types {
            ty.hash(&mut hasher);
        }
        Self(hasher.finish())
    }
}

// ---------------------------------------------------------------------------
// ComponentVtable -- type-erased operations for a component type
// ---------------------------------------------------------------------------

/// Type-erased drop plus layout for one component type.
///
/// Created via [`ComponentVtable::new::<T>()`] and stored alongside each
/// column so the column can destroy its contents without knowing the concrete
/// type at compile time.
#[derive(Clone)]
pub struct ComponentVtable {
    /// Drop a single value in place.
    pub(crate) drop_fn: unsafe fn(*mut u8),
    /// Size of the component type (0 for tags).
    pub(crate) size: usize,
    /// Alignment of the component type.
    pub(crate) align: usize,
}

impl std::fmt::Debug for ComponentVtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentVtable")
            .field("size", &self.size)
            .field("align", &self.align)
            .finish()
    }
}

impl ComponentVtable {
    /// Create a vtable for a concrete component type `T`.
    pub fn new<T>() -> Self {
        unsafe fn drop_fn_impl<T>(ptr: *mut u8) {
            ptr::drop_in_place(ptr as *mut T);
        }

        Self {
            drop_fn: drop_fn_impl::<T>,
            size: std::mem::size_of::<T>(),
            align: std::mem::align_of::<T>(),
        }
    }
}

/// Vtables for all registered component types, indexed by
/// [`ComponentTypeId`].
#[derive(Debug, Default)]
pub(crate) struct VtableRegistry {
    vtables: Vec<ComponentVtable>,
}

impl VtableRegistry {
    pub(crate) fn register<T: 'static>(&mut self, id: ComponentTypeId) {
        let idx = id.0 as usize;
        if idx >= self.vtables.len() {
            self.vtables.resize(idx + 1, ComponentVtable::new::<()>());
        }
        self.vtables[idx] = ComponentVtable::new::<T>();
    }

    pub(crate) fn get(&self, id: ComponentTypeId) -> &ComponentVtable {
        &self.vtables[id.0 as usize]
    }
}

// ---------------------------------------------------------------------------
// Column -- type-erased component storage
// ---------------------------------------------------------------------------

/// A densely packed, type-erased array of component values of a single type.
///
/// Internally a manually managed byte buffer whose layout matches the stored
/// component type. Zero-sized (tag) components never allocate; the column
/// still tracks a logical row count so the row-alignment invariant holds
/// uniformly for tag and data columns alike.
pub struct Column {
    /// Heap allocation (null while capacity == 0 and for tag columns).
    data: *mut u8,
    /// Number of live rows.
    len: usize,
    /// Rows that fit in the current allocation.
    capacity: usize,
    /// Size of one element (0 for tags).
    item_size: usize,
    item_align: usize,
}

// Column holds raw bytes only; the registry bounds guarantee the concrete
// component type is Send + Sync.
unsafe impl Send for Column {}
unsafe impl Sync for Column {}

impl Column {
    /// Create a new, empty column for the component described by `info`.
    pub fn new(info: &ComponentInfo) -> Self {
        Self {
            data: ptr::null_mut(),
            len: 0,
            capacity: 0,
            item_size: info.size,
            item_align: info.align,
        }
    }

    /// Number of stored rows.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the column has no rows.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    // -- internal helpers ---------------------------------------------------

    fn layout_for(&self, cap: usize) -> Layout {
        Layout::from_size_align(self.item_size * cap, self.item_align)
            .expect("column layout overflow")
    }

    fn grow_if_full(&mut self) {
        if self.len < self.capacity {
            return;
        }
        let new_cap = if self.capacity == 0 {
            4
        } else {
            self.capacity * 2
        };
        if self.item_size == 0 {
            // Tag column: no backing storage, only the logical count grows.
            self.capacity = new_cap;
            return;
        }
        let new_layout = self.layout_for(new_cap);
        unsafe {
            let new_data = if self.capacity == 0 {
                alloc::alloc(new_layout)
            } else {
                alloc::realloc(self.data, self.layout_for(self.capacity), new_layout.size())
            };
            assert!(!new_data.is_null(), "column allocation failed");
            self.data = new_data;
        }
        self.capacity = new_cap;
    }

    #[inline]
    fn ptr_at(&self, row: usize) -> *mut u8 {
        debug_assert!(row < self.len);
        if self.item_size == 0 {
            // Tag: dangling but well-aligned.
            return self.item_align as *mut u8;
        }
        unsafe { self.data.add(row * self.item_size) }
    }

    // -- row operations -----------------------------------------------------

    /// Append one value to the end of the column.
    ///
    /// # Safety
    ///
    /// `value_ptr` must point to a valid, initialised instance of the
    /// column's component type. Ownership of the value moves into the column;
    /// the caller must not drop the source.
    pub unsafe fn push_raw(&mut self, value_ptr: *const u8) {
        self.grow_if_full();
        if self.item_size > 0 {
            let dst = self.data.add(self.len * self.item_size);
            ptr::copy_nonoverlapping(value_ptr, dst, self.item_size);
        }
        self.len += 1;
    }

    /// Raw pointer to the value at `row`.
    ///
    /// # Safety
    ///
    /// `row` must be less than `self.len()`.
    #[inline]
    pub unsafe fn get_raw(&self, row: usize) -> *const u8 {
        self.ptr_at(row)
    }

    /// Mutable raw pointer to the value at `row`.
    ///
    /// # Safety
    ///
    /// `row` must be less than `self.len()`.
    #[inline]
    pub unsafe fn get_raw_mut(&mut self, row: usize) -> *mut u8 {
        self.ptr_at(row)
    }

    /// Swap-remove the value at `row`: drop it via `vtable`, then move the
    /// last row's bytes into the gap and shrink by one. The caller must
    /// re-index whichever entity occupied the last row.
    ///
    /// # Safety
    ///
    /// `row` must be less than `self.len()`, and `vtable` must describe the
    /// column's actual component type.
    pub unsafe fn swap_remove(&mut self, row: usize, vtable: &ComponentVtable) {
        debug_assert!(row < self.len);
        let last = self.len - 1;
        if self.item_size > 0 {
            (vtable.drop_fn)(self.ptr_at(row));
            if row != last {
                let src = self.ptr_at(last);
                let dst = self.data.add(row * self.item_size);
                ptr::copy_nonoverlapping(src, dst, self.item_size);
            }
        }
        self.len -= 1;
    }

    /// Swap-remove the value at `row` *without* dropping it. Used to commit
    /// a row transfer after the bytes have been copied into another
    /// archetype's column: the value now lives there, so only the gap is
    /// filled and the length shrinks.
    ///
    /// # Safety
    ///
    /// `row` must be less than `self.len()`, and the value at `row` must
    /// have been moved out (its bytes must not be dropped through this
    /// column again).
    pub unsafe fn swap_remove_forget(&mut self, row: usize) {
        debug_assert!(row < self.len);
        let last = self.len - 1;
        if self.item_size > 0 && row != last {
            let src = self.ptr_at(last);
            let dst = self.data.add(row * self.item_size);
            ptr::copy_nonoverlapping(src, dst, self.item_size);
        }
        self.len -= 1;
    }

    /// Drop every remaining value via `vtable`, then release the allocation.
    ///
    /// # Safety
    ///
    /// `vtable` must describe the column's actual component type.
    pub unsafe fn drop_all(&mut self, vtable: &ComponentVtable) {
        if self.item_size > 0 {
            for row in 0..self.len {
                (vtable.drop_fn)(self.ptr_at(row));
            }
            if self.capacity > 0 {
                alloc::dealloc(self.data, self.layout_for(self.capacity));
            }
        }
        self.data = ptr::null_mut();
        self.len = 0;
        self.capacity = 0;
    }
}

impl std::fmt::Debug for Column {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Column")
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .field("item_size", &self.item_size)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ArchetypeEdge
// ---------------------------------------------------------------------------

/// Cached transition targets for one component type.
///
/// `add` is the archetype holding this archetype's component set plus that
/// type; `remove` is the set minus it. `None` means the neighbour has not
/// been discovered yet. Discovery is monotonic: once set, an edge never
/// reverts.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArchetypeEdge {
    /// Archetype reached by adding the component type.
    pub add: Option<ArchetypeId>,
    /// Archetype reached by removing the component type.
    pub remove: Option<ArchetypeId>,
}

// ---------------------------------------------------------------------------
// Archetype
// ---------------------------------------------------------------------------

/// Column plus the vtable needed to destroy its contents.
#[derive(Debug)]
struct ColumnEntry {
    column: Column,
    vtable: ComponentVtable,
}

/// Storage for every entity sharing one exact component-type set.
///
/// Columns are kept in a `Vec` sorted by [`ComponentTypeId`] so lookups are
/// binary searches and two archetypes over the same set always agree on
/// column order.
#[derive(Debug)]
pub struct Archetype {
    id: ArchetypeId,
    hash: ArchetypeHash,
    /// Sorted component-type set defining this archetype.
    component_types: Vec<ComponentTypeId>,
    /// One column per component type; `columns[i].0 == component_types[i]`.
    columns: Vec<(ComponentTypeId, ColumnEntry)>,
    /// Row-aligned entity list: `entities[i]` owns row `i` of every column.
    entities: Vec<Entity>,
    /// Lazily discovered transition edges, keyed by component type.
    edges: HashMap<ComponentTypeId, ArchetypeEdge>,
}

impl Archetype {
    /// Create a new, empty archetype.
    ///
    /// `component_types` must be sorted and duplicate-free; `infos` and
    /// `vtables` correspond 1:1 with it.
    pub(crate) fn new(
        id: ArchetypeId,
        component_types: Vec<ComponentTypeId>,
        infos: &[ComponentInfo],
        vtables: Vec<ComponentVtable>,
    ) -> Self {
        debug_assert_eq!(component_types.len(), infos.len());
        debug_assert_eq!(component_types.len(), vtables.len());
        let hash = ArchetypeHash::of(&component_types);
        let columns: Vec<(ComponentTypeId, ColumnEntry)> = infos
            .iter()
            .zip(vtables)
            .map(|(info, vtable)| {
                (
                    info.id,
                    ColumnEntry {
                        column: Column::new(info),
                        vtable,
                    },
                )
            })
            .collect();

        Self {
            id,
            hash,
            component_types,
            columns,
            entities: Vec::new(),
            edges: HashMap::new(),
        }
    }

    /// Binary search for a column by component type.
    #[inline]
    fn column_index(&self, type_id: ComponentTypeId) -> Option<usize> {
        self.columns
            .binary_search_by_key(&type_id, |(id, _)| *id)
            .ok()
    }

    /// This archetype's handle.
    #[inline]
    pub fn id(&self) -> ArchetypeId {
        self.id
    }

    /// Structural hash of the component-type set.
    #[inline]
    pub fn hash(&self) -> ArchetypeHash {
        self.hash
    }

    /// The sorted component-type set defining this archetype.
    #[inline]
    pub fn component_types(&self) -> &[ComponentTypeId] {
        &self.component_types
    }

    /// Whether the archetype stores the given component type.
    #[inline]
    pub fn has_component(&self, type_id: ComponentTypeId) -> bool {
        self.column_index(type_id).is_some()
    }

    /// Number of entities stored.
    #[inline]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether no entities are stored.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// The row-aligned entity list.
    #[inline]
    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    /// Linear scan for an entity's row. The O(1) path goes through the
    /// world's entity index; this exists for assertions and tests.
    pub fn row_of(&self, entity: Entity) -> Option<usize> {
        self.entities.iter().position(|&e| e == entity)
    }

    // -- edges --------------------------------------------------------------

    /// The cached transition edge for a component type, if any lookup has
    /// touched it yet.
    #[inline]
    pub fn edge(&self, type_id: ComponentTypeId) -> Option<ArchetypeEdge> {
        self.edges.get(&type_id).copied()
    }

    /// The transition edge for a component type, created empty (both
    /// neighbours undiscovered) on first access.
    #[inline]
    pub(crate) fn edge_mut(&mut self, type_id: ComponentTypeId) -> &mut ArchetypeEdge {
        self.edges.entry(type_id).or_default()
    }

    // -- row operations -----------------------------------------------------

    /// Append an entity with one value per column. Returns the new row.
    ///
    /// # Safety
    ///
    /// `components` must hold exactly one `(type, pointer)` pair per column
    /// of this archetype, each pointing at a valid value of the column's
    /// type. Ownership of every value moves into the archetype.
    pub(crate) unsafe fn add_entity(
        &mut self,
        entity: Entity,
        components: &[(ComponentTypeId, *const u8)],
    ) -> usize {
        debug_assert_eq!(components.len(), self.columns.len());
        let row = self.entities.len();
        self.entities.push(entity);
        for &(type_id, value_ptr) in components {
            let idx = self
                .column_index(type_id)
                .expect("component type not in archetype");
            self.columns[idx].1.column.push_raw(value_ptr);
        }
        row
    }

    /// Remove the row at `row`, dropping every component value, using
    /// swap-remove to keep storage dense.
    ///
    /// Returns the entity that was relocated into `row` (the previous last
    /// row), or `None` if the removed row was the last. The caller must
    /// update the entity index for the relocated entity.
    pub(crate) fn remove_entity(&mut self, row: usize) -> Option<Entity> {
        let last = self.entities.len() - 1;
        self.entities.swap_remove(row);
        for (_, entry) in &mut self.columns {
            unsafe {
                entry.column.swap_remove(row, &entry.vtable);
            }
        }
        if row < last {
            Some(self.entities[row])
        } else {
            None
        }
    }

    /// Move a row in from `src`, which holds this archetype's component set
    /// minus `added`, appending `value_ptr` as the value for `added`.
    ///
    /// The destination row is staged completely (every shared column copied,
    /// then the new value appended) before the source row is swap-removed,
    /// so a panic mid-copy cannot leave the source half-dismantled.
    ///
    /// Returns `(new_row, relocated)` where `relocated` is the entity that
    /// took over the vacated source row, if any.
    ///
    /// # Safety
    ///
    /// `row` must be a valid row of `src`; `src`'s component set must be
    /// exactly this archetype's set minus `added`; `value_ptr` must point at
    /// a valid value of `added`'s type, whose ownership moves in here.
    pub(crate) unsafe fn insert_from_subset(
        &mut self,
        src: &mut Archetype,
        row: usize,
        added: ComponentTypeId,
        value_ptr: *const u8,
    ) -> (usize, Option<Entity>) {
        debug_assert!(self.has_component(added) && !src.has_component(added));

        let entity = src.entities[row];
        let new_row = self.entities.len();
        self.entities.push(entity);

        // Stage: copy every shared column's bytes, then the new value.
        for (type_id, entry) in &src.columns {
            let idx = self
                .column_index(*type_id)
                .expect("subset column missing from superset archetype");
            self.columns[idx].1.column.push_raw(entry.column.get_raw(row));
        }
        let idx = self
            .column_index(added)
            .expect("added component not in destination archetype");
        self.columns[idx].1.column.push_raw(value_ptr);

        // Commit: the moved values now live here; forget them in the source.
        let last = src.entities.len() - 1;
        src.entities.swap_remove(row);
        for (_, entry) in &mut src.columns {
            entry.column.swap_remove_forget(row);
        }
        let relocated = if row < last {
            Some(src.entities[row])
        } else {
            None
        };
        (new_row, relocated)
    }

    /// Move a row in from `src`, which holds this archetype's component set
    /// plus `removed`. Every column except `removed` is copied over; the
    /// `removed` value is dropped when the source row is swap-removed.
    ///
    /// Returns `(new_row, relocated)` as in
    /// [`insert_from_subset`](Self::insert_from_subset).
    ///
    /// # Safety
    ///
    /// `row` must be a valid row of `src`, and `src`'s component set must be
    /// exactly this archetype's set plus `removed`.
    pub(crate) unsafe fn insert_from_superset(
        &mut self,
        src: &mut Archetype,
        row: usize,
        removed: ComponentTypeId,
    ) -> (usize, Option<Entity>) {
        debug_assert!(!self.has_component(removed) && src.has_component(removed));

        let entity = src.entities[row];
        let new_row = self.entities.len();
        self.entities.push(entity);

        // Stage: copy everything the destination keeps.
        for (type_id, entry) in &src.columns {
            if *type_id == removed {
                continue;
            }
            let idx = self
                .column_index(*type_id)
                .expect("superset column missing from subset archetype");
            self.columns[idx].1.column.push_raw(entry.column.get_raw(row));
        }

        // Commit: drop only the removed value, forget the moved ones.
        let last = src.entities.len() - 1;
        src.entities.swap_remove(row);
        for (type_id, entry) in &mut src.columns {
            if *type_id == removed {
                entry.column.swap_remove(row, &entry.vtable);
            } else {
                entry.column.swap_remove_forget(row);
            }
        }
        let relocated = if row < last {
            Some(src.entities[row])
        } else {
            None
        };
        (new_row, relocated)
    }

    // -- typed access -------------------------------------------------------

    /// Reference to a component value.
    ///
    /// # Safety
    ///
    /// `T` must be the type actually stored in the column for `type_id`.
    pub(crate) unsafe fn get_component<T: 'static>(
        &self,
        row: usize,
        type_id: ComponentTypeId,
    ) -> Option<&T> {
        let idx = self.column_index(type_id)?;
        let column = &self.columns[idx].1.column;
        if row >= column.len() {
            return None;
        }
        Some(&*(column.get_raw(row) as *const T))
    }

    /// Mutable reference to a component value.
    ///
    /// # Safety
    ///
    /// `T` must be the type actually stored in the column for `type_id`.
    pub(crate) unsafe fn get_component_mut<T: 'static>(
        &mut self,
        row: usize,
        type_id: ComponentTypeId,
    ) -> Option<&mut T> {
        let idx = self.column_index(type_id)?;
        let column = &mut self.columns[idx].1.column;
        if row >= column.len() {
            return None;
        }
        Some(&mut *(column.get_raw_mut(row) as *mut T))
    }

    /// Debug-only check of the row-alignment invariant.
    #[cfg(test)]
    pub(crate) fn assert_aligned(&self) {
        for (type_id, entry) in &self.columns {
            assert_eq!(
                entry.column.len(),
                self.entities.len(),
                "column {type_id:?} out of alignment"
            );
        }
    }
}

impl Drop for Archetype {
    fn drop(&mut self) {
        for (_, entry) in &mut self.columns {
            unsafe {
                entry.column.drop_all(&entry.vtable);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
