//! Receiver tag handles.
//!
//! A receiver tag is the precomputed subscriber fan-out set for a channel:
//! which uids live on which node. The tag manager owns tag contents; the
//! channel only holds the key of its current tag through a shared slot that
//! the init and check-tag workers can swap without touching shard state.

use std::sync::Mutex;

use crate::core::{NodeId, Uid};

/// Opaque handle naming one generation of a channel's receiver tag.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TagKey(String);

impl TagKey {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Subscribers of one node within a tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeUsers {
    pub node_id: NodeId,
    pub uids: Vec<Uid>,
}

/// A channel's subscriber fan-out set, grouped by owning node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceiverTag {
    pub key: TagKey,
    pub nodes: Vec<NodeUsers>,
}

/// Shared cell holding the channel's current tag key.
///
/// Swapped whole: readers either see the previous generation or the new one,
/// never a partial update.
#[derive(Debug, Default)]
pub struct TagSlot {
    key: Mutex<Option<TagKey>>,
}

impl TagSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self) -> Option<TagKey> {
        self.key.lock().expect("tag slot lock poisoned").clone()
    }

    pub fn store(&self, key: TagKey) {
        *self.key.lock().expect("tag slot lock poisoned") = Some(key);
    }

    pub fn clear(&self) {
        *self.key.lock().expect("tag slot lock poisoned") = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_swaps_whole_generations() {
        let slot = TagSlot::new();
        assert_eq!(slot.load(), None);
        slot.store(TagKey::new("gen-1"));
        assert_eq!(slot.load(), Some(TagKey::new("gen-1")));
        slot.store(TagKey::new("gen-2"));
        assert_eq!(slot.load(), Some(TagKey::new("gen-2")));
        slot.clear();
        assert_eq!(slot.load(), None);
    }
}
