use std::collections::HashMap;

use crate::types::PeerId;

/// Bookkeeping for a subscriber's fixed pool of transceiver slots.
///
/// Every tracked peer is either bound to exactly one slot or waiting in
/// `pending` (arrival order). `owner_to_slot` and `slot_to_owner` are
/// always inverse maps.
#[derive(Debug)]
pub struct SlotTable {
    capacity: usize,
    owner_to_slot: HashMap<PeerId, usize>,
    slot_to_owner: HashMap<usize, PeerId>,
    pending: Vec<PeerId>,
}

impl SlotTable {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            owner_to_slot: HashMap::with_capacity(capacity),
            slot_to_owner: HashMap::with_capacity(capacity),
            pending: Vec::new(),
        }
    }

    /// Start tracking a peer as pending.
    ///
    /// Returns false if the peer is already bound or pending.
    pub fn track(&mut self, peer_id: &PeerId) -> bool {
        if self.contains(peer_id) {
            return false;
        }
        self.pending.push(peer_id.clone());
        true
    }

    /// Move a pending peer into the lowest free slot
    pub fn assign(&mut self, peer_id: &PeerId) -> Option<usize> {
        let position = self.pending.iter().position(|p| p == peer_id)?;
        let slot = (0..self.capacity).find(|slot| !self.slot_to_owner.contains_key(slot))?;

        self.pending.remove(position);
        self.owner_to_slot.insert(peer_id.clone(), slot);
        self.slot_to_owner.insert(slot, peer_id.clone());
        Some(slot)
    }

    /// Stop tracking a peer. Returns the slot it held, if any.
    pub fn release(&mut self, peer_id: &PeerId) -> Option<usize> {
        self.pending.retain(|p| p != peer_id);
        let slot = self.owner_to_slot.remove(peer_id)?;
        self.slot_to_owner.remove(&slot);
        Some(slot)
    }

    #[must_use]
    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.owner_to_slot.contains_key(peer_id) || self.is_pending(peer_id)
    }

    #[must_use]
    pub fn is_pending(&self, peer_id: &PeerId) -> bool {
        self.pending.contains(peer_id)
    }

    #[must_use]
    pub fn slot_of(&self, peer_id: &PeerId) -> Option<usize> {
        self.owner_to_slot.get(peer_id).copied()
    }

    #[must_use]
    pub fn pending(&self) -> &[PeerId] {
        &self.pending
    }

    #[must_use]
    pub fn has_free_slot(&self) -> bool {
        self.slot_to_owner.len() < self.capacity
    }

    #[must_use]
    pub fn bound_count(&self) -> usize {
        self.owner_to_slot.len()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bound peers sorted by slot index
    #[must_use]
    pub fn assignments(&self) -> Vec<(usize, PeerId)> {
        let mut bound: Vec<_> = self
            .slot_to_owner
            .iter()
            .map(|(slot, owner)| (*slot, owner.clone()))
            .collect();
        bound.sort_by_key(|(slot, _)| *slot);
        bound
    }

    /// Whether the two maps are exact inverses within capacity
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.owner_to_slot.len() == self.slot_to_owner.len()
            && self.owner_to_slot.len() <= self.capacity
            && self
                .owner_to_slot
                .iter()
                .all(|(owner, slot)| *slot < self.capacity && self.slot_to_owner.get(slot) == Some(owner))
            && self
                .pending
                .iter()
                .all(|p| !self.owner_to_slot.contains_key(p))
    }
}
