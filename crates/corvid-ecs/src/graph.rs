//! The archetype graph: arena of all archetypes plus transition resolution.
//!
//! [`ArchetypeGraph`] owns every [`Archetype`] in a stable arena keyed by
//! [`ArchetypeId`] handles and deduplicates archetypes structurally: one
//! archetype per distinct component-type set, ever. Transitions ("which
//! archetype results from adding/removing component type T") are resolved
//! through the per-archetype edge cache; the first resolution of a given
//! transition walks the slow path (sort the new set, deduplicate, possibly
//! create) and then backfills the edge in both directions so every later
//! transition is a single map lookup.
//!
//! Archetypes are never destroyed once created, even when they empty out: a
//! set that existed once tends to come back, and retention keeps every
//! handle valid for the life of the world.

use std::collections::HashMap;

use crate::archetype::{Archetype, ArchetypeId, VtableRegistry};
use crate::component::{ComponentRegistry, ComponentTypeId};

/// Arena and structural index of every archetype in a world.
#[derive(Debug, Default)]
pub struct ArchetypeGraph {
    /// All archetypes, indexed by `ArchetypeId.0`. Never shrinks.
    archetypes: Vec<Archetype>,
    /// Sorted component-type set -> archetype, for structural dedup.
    by_signature: HashMap<Vec<ComponentTypeId>, ArchetypeId>,
    /// Bumped on every archetype creation. Query caches stamp themselves
    /// with this to notice when the archetype set has grown.
    generation: u64,
}

impl ArchetypeGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of archetypes ever created.
    #[inline]
    pub fn len(&self) -> usize {
        self.archetypes.len()
    }

    /// Whether no archetype exists yet.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.archetypes.is_empty()
    }

    /// The structural-mutation stamp; changes whenever an archetype is
    /// created.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Borrow an archetype by handle.
    ///
    /// # Panics
    ///
    /// Panics on a handle that this graph never issued (programmer error).
    #[inline]
    pub fn get(&self, id: ArchetypeId) -> &Archetype {
        &self.archetypes[id.0 as usize]
    }

    /// Mutably borrow an archetype by handle.
    #[inline]
    pub(crate) fn get_mut(&mut self, id: ArchetypeId) -> &mut Archetype {
        &mut self.archetypes[id.0 as usize]
    }

    /// Mutably borrow two distinct archetypes at once, for row transfers.
    ///
    /// # Panics
    ///
    /// Panics if `a == b`.
    pub(crate) fn get_mut2(
        &mut self,
        a: ArchetypeId,
        b: ArchetypeId,
    ) -> (&mut Archetype, &mut Archetype) {
        assert_ne!(a, b, "cannot split-borrow one archetype twice");
        if a.0 < b.0 {
            let (left, right) = self.archetypes.split_at_mut(b.0 as usize);
            (&mut left[a.0 as usize], &mut right[0])
        } else {
            let (left, right) = self.archetypes.split_at_mut(a.0 as usize);
            (&mut right[0], &mut left[b.0 as usize])
        }
    }

    /// Iterate all archetypes in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &Archetype> {
        self.archetypes.iter()
    }

    /// Find the archetype for a sorted component-type set, creating it if
    /// this exact set has never been seen. Two calls with the same set
    /// always return the same handle.
    pub(crate) fn get_or_create(
        &mut self,
        type_ids: &[ComponentTypeId],
        registry: &ComponentRegistry,
        vtables: &VtableRegistry,
    ) -> ArchetypeId {
        if let Some(&id) = self.by_signature.get(type_ids) {
            return id;
        }
        let id = ArchetypeId(self.archetypes.len() as u32);
        let infos: Vec<_> = type_ids
            .iter()
            .map(|tid| {
                registry
                    .get_info(*tid)
                    .expect("component type not registered")
                    .clone()
            })
            .collect();
        let column_vtables: Vec<_> = type_ids.iter().map(|tid| vtables.get(*tid).clone()).collect();
        let archetype = Archetype::new(id, type_ids.to_vec(), &infos, column_vtables);
        tracing::debug!(
            archetype = id.0,
            hash = archetype.hash().0,
            types = ?type_ids,
            "created archetype"
        );
        self.archetypes.push(archetype);
        self.by_signature.insert(type_ids.to_vec(), id);
        self.generation += 1;
        id
    }

    /// Resolve the archetype reached from `src` by adding component `added`.
    ///
    /// Fast path: the cached `add` edge. Slow path: build the set-plus-one
    /// signature, deduplicate/create, and backfill the edge in both
    /// directions (`src --add--> dst` and `dst --remove--> src`).
    ///
    /// # Panics
    ///
    /// Panics if `src` already contains `added` (transitions are strictly
    /// single-component; the caller handles the overwrite-in-place case).
    pub(crate) fn archetype_with(
        &mut self,
        src: ArchetypeId,
        added: ComponentTypeId,
        registry: &ComponentRegistry,
        vtables: &VtableRegistry,
    ) -> ArchetypeId {
        let source = self.get(src);
        assert!(
            !source.has_component(added),
            "archetype already contains {added:?}"
        );
        if let Some(edge) = source.edge(added) {
            if let Some(dst) = edge.add {
                return dst;
            }
        }

        let mut types = source.component_types().to_vec();
        types.push(added);
        types.sort();
        let dst = self.get_or_create(&types, registry, vtables);

        self.get_mut(src).edge_mut(added).add = Some(dst);
        self.get_mut(dst).edge_mut(added).remove = Some(src);
        dst
    }

    /// Resolve the archetype reached from `src` by removing component
    /// `removed`. Mirror of [`archetype_with`](Self::archetype_with).
    ///
    /// # Panics
    ///
    /// Panics if `src` does not contain `removed`.
    pub(crate) fn archetype_without(
        &mut self,
        src: ArchetypeId,
        removed: ComponentTypeId,
        registry: &ComponentRegistry,
        vtables: &VtableRegistry,
    ) -> ArchetypeId {
        let source = self.get(src);
        assert!(
            source.has_component(removed),
            "archetype does not contain {removed:?}"
        );
        if let Some(edge) = source.edge(removed) {
            if let Some(dst) = edge.remove {
                return dst;
            }
        }

        let types: Vec<_> = source
            .component_types()
            .iter()
            .copied()
            .filter(|t| *t != removed)
            .collect();
        let dst = self.get_or_create(&types, registry, vtables);

        self.get_mut(src).edge_mut(removed).remove = Some(dst);
        self.get_mut(dst).edge_mut(removed).add = Some(src);
        dst
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
