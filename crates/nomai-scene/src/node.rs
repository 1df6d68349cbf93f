//! Node identifiers and allocation.
//!
//! A [`NodeId`] packs a *generation* counter in the high 32 bits and a slot
//! *index* in the low 32 bits. Removing a node bumps the generation of its
//! slot, so a handle held across a removal is detected as stale instead of
//! silently addressing whichever node reuses the slot.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

// ---------------------------------------------------------------------------
// NodeId
// ---------------------------------------------------------------------------

/// A generational scene node identifier.
///
/// Layout: `[generation: u32 | index: u32]`
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u64);

impl NodeId {
    /// Construct a `NodeId` from an index and generation.
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

    /// Raw `u64` representation.
    #[inline]
    pub fn to_raw(self) -> u64 {
        self.0
    }

    /// Reconstruct from a raw `u64`.
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}v{})", self.index(), self.generation())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index(), self.generation())
    }
}

// ---------------------------------------------------------------------------
// NodeAllocator
// ---------------------------------------------------------------------------

/// Allocates and recycles [`NodeId`]s with generational tracking.
///
/// Free slots are reused in FIFO order so generations spread across slots
/// instead of piling up on one.
#[derive(Debug, Default)]
pub struct NodeAllocator {
    generations: Vec<u32>,
    alive: Vec<bool>,
    free_indices: VecDeque<u32>,
}

impl NodeAllocator {
    /// Create a new, empty allocator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh [`NodeId`], reusing a freed slot when one exists.
    pub fn allocate(&mut self) -> NodeId {
        if let Some(index) = self.free_indices.pop_front() {
            // Generation was already bumped when the slot was freed.
            self.alive[index as usize] = true;
            NodeId::new(index, self.generations[index as usize])
        } else {
            let index = self.generations.len() as u32;
            self.generations.push(0);
            self.alive.push(true);
            NodeId::new(index, 0)
        }
    }

    /// Free a node's slot, invalidating every outstanding handle to it.
    ///
    /// Returns `false` if the id was already freed or is stale.
    pub fn deallocate(&mut self, id: NodeId) -> bool {
        if !self.is_alive(id) {
            return false;
        }
        let idx = id.index() as usize;
        self.alive[idx] = false;
        self.generations[idx] = self.generations[idx].wrapping_add(1);
        self.free_indices.push_back(id.index());
        true
    }

    /// Returns `true` if `id` refers to a live node of the current generation.
    pub fn is_alive(&self, id: NodeId) -> bool {
        let idx = id.index() as usize;
        idx < self.generations.len()
            && self.alive[idx]
            && self.generations[idx] == id.generation()
    }

    /// Number of live nodes.
    pub fn alive_count(&self) -> usize {
        self.alive.iter().filter(|&&a| a).count()
    }

    /// Number of slots ever allocated (live or free).
    pub fn capacity(&self) -> usize {
        self.generations.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_unique_ids() {
        let mut alloc = NodeAllocator::new();
        let ids: Vec<NodeId> = (0..64).map(|_| alloc.allocate()).collect();
        let mut indices: Vec<u32> = ids.iter().map(|id| id.index()).collect();
        indices.sort();
        indices.dedup();
        assert_eq!(indices.len(), 64);
    }

    #[test]
    fn recycled_slot_gets_new_generation() {
        let mut alloc = NodeAllocator::new();
        let first = alloc.allocate();
        assert!(alloc.deallocate(first));
        let second = alloc.allocate();
        assert_eq!(second.index(), first.index());
        assert_eq!(second.generation(), 1);
        assert!(!alloc.is_alive(first), "old handle must be stale");
        assert!(alloc.is_alive(second));
    }

    #[test]
    fn double_deallocate_returns_false() {
        let mut alloc = NodeAllocator::new();
        let id = alloc.allocate();
        assert!(alloc.deallocate(id));
        assert!(!alloc.deallocate(id));
    }

    #[test]
    fn unknown_index_is_not_alive() {
        let alloc = NodeAllocator::new();
        assert!(!alloc.is_alive(NodeId::new(7, 0)));
    }

    #[test]
    fn raw_roundtrip_and_display() {
        let id = NodeId::new(3, 9);
        assert_eq!(NodeId::from_raw(id.to_raw()), id);
        assert_eq!(id.to_string(), "3v9");
        assert_eq!(format!("{id:?}"), "NodeId(3v9)");
    }
}
