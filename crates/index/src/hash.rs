//! Hash index

use crate::Table;
use dashmap::DashMap;
use margay_core::Sid;
use margay_storage::VHandle;
use std::sync::Arc;

/// Fixed key width; shorter keys are zero-padded.
const KEY_WIDTH: usize = 16;

type FixedKey = [u8; KEY_WIDTH];

/// A sharded hash index over 16-byte fixed keys.
///
/// Point-access tables use this: lookups are lock-free reads and
/// `search_or_create` only contends on the target shard.
pub struct HashTable {
    table: DashMap<FixedKey, Arc<VHandle>>,
}

fn fixed(key: &[u8]) -> FixedKey {
    assert!(key.len() <= KEY_WIDTH, "hash index keys are at most 16 bytes");
    let mut k = [0u8; KEY_WIDTH];
    k[..key.len()].copy_from_slice(key);
    k
}

impl HashTable {
    /// Create an empty table.
    pub fn new() -> HashTable {
        HashTable {
            table: DashMap::new(),
        }
    }

    /// Number of keys present.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// True when no keys are present.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl Default for HashTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Table for HashTable {
    fn search(&self, key: &[u8]) -> Option<Arc<VHandle>> {
        self.table.get(&fixed(key)).map(|r| Arc::clone(r.value()))
    }

    fn search_or_create(&self, key: &[u8], affinity: u32) -> Arc<VHandle> {
        Arc::clone(
            self.table
                .entry(fixed(key))
                .or_insert_with(|| Arc::new(VHandle::new(affinity, 0)))
                .value(),
        )
    }

    fn priority_insert(&self, key: &[u8], sid: Sid, affinity: u32) -> Option<Arc<VHandle>> {
        let row = self.search_or_create(key, affinity);
        if row.try_append_new_version(sid) {
            Some(row)
        } else {
            None
        }
    }
}
