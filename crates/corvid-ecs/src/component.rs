//! Component type registration and metadata.
//!
//! Every component type used by the storage engine is registered once in a
//! [`ComponentRegistry`], which assigns it a process-stable
//! [`ComponentTypeId`]. That id is the key for archetype column lookups,
//! transition edges, and query matching.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;

/// Marker trait for types that can be stored as components.
///
/// Blanket-implemented; a component only needs to be owned data that can
/// cross system boundaries. Zero-sized types are valid components and act as
/// tags (presence markers without per-entity storage).
pub trait Component: Send + Sync + 'static {}

impl<T: Send + Sync + 'static> Component for T {}

// ---------------------------------------------------------------------------
// ComponentTypeId
// ---------------------------------------------------------------------------

/// Opaque, lightweight identifier for a registered component type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentTypeId(pub(crate) u32);

impl fmt::Debug for ComponentTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentTypeId({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// ComponentInfo
// ---------------------------------------------------------------------------

/// Metadata about a registered component type.
///
/// Only safe metadata lives here; the type-erased drop function lives in the
/// archetype module's [`ComponentVtable`](crate::archetype::ComponentVtable).
#[derive(Debug, Clone)]
pub struct ComponentInfo {
    /// Unique id assigned at registration time.
    pub id: ComponentTypeId,
    /// Human-readable name (supplied by the caller).
    pub name: String,
    /// `std::mem::size_of::<T>()`; 0 for tag components.
    pub size: usize,
    /// `std::mem::align_of::<T>()`
    pub align: usize,
    /// Rust `TypeId`, used to dedup registration.
    pub type_id: TypeId,
}

impl ComponentInfo {
    /// Whether this component is a zero-sized tag type.
    #[inline]
    pub fn is_tag(&self) -> bool {
        self.size == 0
    }
}

// ---------------------------------------------------------------------------
// ComponentRegistry
// ---------------------------------------------------------------------------

/// Registry mapping Rust types to [`ComponentTypeId`]s and their metadata.
///
/// A type registers at most once; registering the same Rust type again
/// returns the id it already holds, ignoring the new name.
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    /// TypeId -> ComponentTypeId, for dedup.
    by_type: HashMap<TypeId, ComponentTypeId>,
    /// Name -> ComponentTypeId, for diagnostics and name lookup.
    by_name: HashMap<String, ComponentTypeId>,
    /// Indexed by `ComponentTypeId.0`.
    infos: Vec<ComponentInfo>,
}

impl ComponentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component type under the given `name`.
    ///
    /// Returns the existing [`ComponentTypeId`] if the type was already
    /// registered.
    ///
    /// # Panics
    ///
    /// Panics if `name` is already registered for a different type.
    pub fn register<T: Component>(&mut self, name: &str) -> ComponentTypeId {
        let rust_type_id = TypeId::of::<T>();
        if let Some(&existing) = self.by_type.get(&rust_type_id) {
            return existing;
        }

        let id = ComponentTypeId(self.infos.len() as u32);
        if self.by_name.contains_key(name) {
            panic!("component name '{name}' is already registered for a different type");
        }

        self.infos.push(ComponentInfo {
            id,
            name: name.to_owned(),
            size: std::mem::size_of::<T>(),
            align: std::mem::align_of::<T>(),
            type_id: rust_type_id,
        });
        self.by_type.insert(rust_type_id, id);
        self.by_name.insert(name.to_owned(), id);
        id
    }

    /// Look up a component type by its Rust type.
    pub fn lookup<T: 'static>(&self) -> Option<ComponentTypeId> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    /// Look up a component type by its registered name.
    pub fn lookup_by_name(&self, name: &str) -> Option<ComponentTypeId> {
        self.by_name.get(name).copied()
    }

    /// Get the [`ComponentInfo`] for a registered component type id.
    pub fn get_info(&self, id: ComponentTypeId) -> Option<&ComponentInfo> {
        self.infos.get(id.0 as usize)
    }

    /// Total number of registered component types.
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    /// Whether any component types have been registered.
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct Pos {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone)]
    struct Vel {
        dx: f32,
        dy: f32,
    }

    struct Frozen; // tag

    #[test]
    fn register_and_lookup() {
        let mut reg = ComponentRegistry::new();
        let id = reg.register::<Pos>("position");
        assert_eq!(reg.lookup::<Pos>(), Some(id));
        assert_eq!(reg.lookup_by_name("position"), Some(id));
    }

    #[test]
    fn same_type_same_id() {
        let mut reg = ComponentRegistry::new();
        let id1 = reg.register::<Pos>("position");
        let id2 = reg.register::<Pos>("position_again");
        assert_eq!(id1, id2);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn different_types_different_ids() {
        let mut reg = ComponentRegistry::new();
        let p = reg.register::<Pos>("position");
        let v = reg.register::<Vel>("velocity");
        assert_ne!(p, v);
    }

    #[test]
    fn info_matches_type() {
        let mut reg = ComponentRegistry::new();
        let id = reg.register::<Pos>("position");
        let info = reg.get_info(id).unwrap();
        assert_eq!(info.name, "position");
        assert_eq!(info.size, std::mem::size_of::<Pos>());
        assert_eq!(info.align, std::mem::align_of::<Pos>());
        assert_eq!(info.type_id, TypeId::of::<Pos>());
        assert!(!info.is_tag());
    }

    #[test]
    fn zero_sized_type_is_tag() {
        let mut reg = ComponentRegistry::new();
        let id = reg.register::<Frozen>("frozen");
        assert!(reg.get_info(id).unwrap().is_tag());
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn name_collision_panics() {
        let mut reg = ComponentRegistry::new();
        reg.register::<Pos>("position");
        reg.register::<Vel>("position");
    }
}
