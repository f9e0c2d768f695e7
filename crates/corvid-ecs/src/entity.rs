//! Entity handles and allocation.
//!
//! An [`Entity`] is a 64-bit handle packing a *generation* counter in the high
//! 32 bits and a slot *index* in the low 32 bits. Slots are recycled through a
//! FIFO free list, and the generation is bumped on every release, so a handle
//! held across a despawn is detected as stale immediately. Entities carry no
//! data of their own; they are keys into the world's entity index.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// A generational entity handle.
///
/// Layout: `[generation: u32 | index: u32]`
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Entity(u64);

impl Entity {
    /// Build a handle from a slot index and generation.
    #[inline]
    pub fn new(index: u32, generation: u32) -> Self {
        Self((generation as u64) << 32 | index as u64)
    }

    /// The slot index (low 32 bits).
    #[inline]
    pub fn index(self) -> u32 {
        self.0 as u32
    }

    /// The generation (high 32 bits).
    #[inline]
    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Raw `u64` form, for storage or logging.
    #[inline]
    pub fn to_raw(self) -> u64 {
        self.0
    }

    /// Rebuild a handle from its raw `u64` form.
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({}v{})", self.index(), self.generation())
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index(), self.generation())
    }
}

// ---------------------------------------------------------------------------
// EntityAllocator
// ---------------------------------------------------------------------------

/// Per-index allocator slot.
#[derive(Debug, Clone, Copy)]
struct Slot {
    generation: u32,
    alive: bool,
}

/// Hands out unique [`Entity`] handles and recycles released ones.
///
/// Released indices queue up in FIFO order so generations spread across slots
/// instead of piling onto whichever index was freed last.
#[derive(Debug, Default)]
pub struct EntityAllocator {
    slots: Vec<Slot>,
    free: VecDeque<u32>,
}

impl EntityAllocator {
    /// Create an empty allocator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh entity handle.
    ///
    /// Recycled indices are reused with the generation that was bumped when
    /// they were released; otherwise a brand-new index is created at
    /// generation 0.
    pub fn allocate(&mut self) -> Entity {
        match self.free.pop_front() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.alive = true;
                Entity::new(index, slot.generation)
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    alive: true,
                });
                Entity::new(index, 0)
            }
        }
    }

    /// Release an entity handle, bumping the slot generation so outstanding
    /// copies of the handle become stale.
    ///
    /// Returns `false` if the handle was already stale or never allocated.
    pub fn release(&mut self, entity: Entity) -> bool {
        let Some(slot) = self.slots.get_mut(entity.index() as usize) else {
            return false;
        };
        if !slot.alive || slot.generation != entity.generation() {
            return false;
        }
        slot.alive = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push_back(entity.index());
        true
    }

    /// Whether `entity` is a live handle (right slot, right generation).
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.slots
            .get(entity.index() as usize)
            .is_some_and(|slot| slot.alive && slot.generation == entity.generation())
    }

    /// Number of currently live entities.
    pub fn alive_count(&self) -> usize {
        self.slots.iter().filter(|s| s.alive).count()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
