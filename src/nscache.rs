//! Bounded LRU cache of open namespace contexts, keyed by node id.
//!
//! Represented as an arena (`Vec<Slot>`) plus a `HashMap<NamespaceId, usize>`
//! and explicit `prev`/`next` index links, rather than the more natural
//! `Rc<RefCell<Node>>` doubly linked list, since the latter needs interior
//! mutability for a structure this crate otherwise keeps free of it.

use std::collections::HashMap;

use crate::error::Result;
use crate::kernel::{NamespaceContext, NamespaceDir, NamespaceId};

const MIN_CAPACITY: usize = 100;
/// Rough per-entry overhead (two open file descriptors plus the netlink
/// socket's receive buffer) used to size the cache from a memory budget.
const ENTRY_OVERHEAD_BYTES: usize = 1 << 16;

struct Slot {
    id: NamespaceId,
    context: NamespaceContext,
    prev: Option<usize>,
    next: Option<usize>,
}

/// An LRU cache of [`NamespaceContext`]s. Not `Send`/`Sync`: it is confined
/// to the single worker process that owns it.
pub struct NamespaceCache {
    dir: NamespaceDir,
    slots: Vec<Option<Slot>>,
    index: HashMap<NamespaceId, usize>,
    free_list: Vec<usize>,
    head: Option<usize>, // oldest
    tail: Option<usize>, // newest
    capacity: usize,
}

impl NamespaceCache {
    /// Derive capacity from `soft_mem_cap_bytes` (floor [`MIN_CAPACITY`]) and
    /// open the shared `/var/run/netns` directory with `prefix`.
    pub fn new(prefix: impl Into<String>, soft_mem_cap_bytes: usize) -> Result<Self> {
        let capacity = (soft_mem_cap_bytes / ENTRY_OVERHEAD_BYTES).max(MIN_CAPACITY);
        Ok(Self {
            dir: NamespaceDir::init(prefix)?,
            slots: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
            free_list: Vec::new(),
            head: None,
            tail: None,
            capacity,
        })
    }

    /// Open (creating if necessary) the namespace for `id`, switch the
    /// calling process into it, and return a reference to its context. Moves
    /// `id` to the newest end of the LRU order, evicting the oldest entry if
    /// the cache is at capacity and `id` isn't already resident.
    pub fn open(&mut self, id: NamespaceId, create: bool, excl: bool) -> Result<&mut NamespaceContext> {
        if let Some(&slot_idx) = self.index.get(&id) {
            self.touch(slot_idx);
            let slot = self.slots[slot_idx]
                .as_mut()
                .expect("indexed slot must be occupied");
            slot.context.switch_into()?;
            return Ok(&mut slot.context);
        }

        if self.index.len() >= self.capacity {
            self.evict_oldest()?;
        }

        let context = self.dir.open(id, create, excl)?;
        let slot_idx = match self.free_list.pop() {
            Some(idx) => idx,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        self.slots[slot_idx] = Some(Slot {
            id,
            context,
            prev: None,
            next: None,
        });
        self.index.insert(id, slot_idx);
        self.link_newest(slot_idx);
        Ok(&mut self.slots[slot_idx]
            .as_mut()
            .expect("just inserted")
            .context)
    }

    fn evict_oldest(&mut self) -> Result<()> {
        let Some(oldest) = self.head else { return Ok(()) };
        self.unlink(oldest);
        let slot = self.slots[oldest].take().expect("head must be occupied");
        self.index.remove(&slot.id);
        self.free_list.push(oldest);
        // `slot.context` drops here, closing its file descriptors and
        // releasing its netlink socket.
        Ok(())
    }

    fn touch(&mut self, slot_idx: usize) {
        if self.tail == Some(slot_idx) {
            return;
        }
        self.unlink(slot_idx);
        self.link_newest(slot_idx);
    }

    fn unlink(&mut self, slot_idx: usize) {
        let (prev, next) = {
            let slot = self.slots[slot_idx].as_ref().expect("slot occupied");
            (slot.prev, slot.next)
        };
        match prev {
            Some(p) => self.slots[p].as_mut().expect("linked").next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].as_mut().expect("linked").prev = prev,
            None => self.tail = prev,
        }
        let slot = self.slots[slot_idx].as_mut().expect("slot occupied");
        slot.prev = None;
        slot.next = None;
    }

    fn link_newest(&mut self, slot_idx: usize) {
        let old_tail = self.tail;
        if let Some(t) = old_tail {
            self.slots[t].as_mut().expect("tail occupied").next = Some(slot_idx);
        }
        let slot = self.slots[slot_idx].as_mut().expect("slot occupied");
        slot.prev = old_tail;
        slot.next = None;
        self.tail = Some(slot_idx);
        if self.head.is_none() {
            self.head = Some(slot_idx);
        }
    }

    /// Evict and delete every resident entry, invalidating their contexts
    /// and unlinking their on-disk namespace files. Used by the destroy
    /// pass (`DestroyHosts`).
    pub fn clear(&mut self) -> Result<()> {
        let ids: Vec<NamespaceId> = self.index.keys().copied().collect();
        while self.head.is_some() {
            self.evict_oldest()?;
        }
        for id in ids {
            self.dir.delete(id)?;
        }
        Ok(())
    }

    /// Number of entries currently resident.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_floors_at_minimum() {
        let capacity = (0usize / ENTRY_OVERHEAD_BYTES).max(MIN_CAPACITY);
        assert_eq!(capacity, MIN_CAPACITY);
    }

    #[test]
    fn capacity_scales_with_budget() {
        let budget = ENTRY_OVERHEAD_BYTES * 500;
        let capacity = (budget / ENTRY_OVERHEAD_BYTES).max(MIN_CAPACITY);
        assert_eq!(capacity, 500);
    }
}
