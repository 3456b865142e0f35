//! Ordered index

use crate::Table;
use margay_core::Sid;
use margay_storage::VHandle;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// An ordered index supporting forward range scans.
///
/// Scan-heavy tables use this. The tree is guarded by a read-write lock;
/// scans materialize their key range up front so the cursor never holds
/// the lock while the caller blocks on a pending version.
pub struct OrderedTable {
    table: RwLock<BTreeMap<Vec<u8>, Arc<VHandle>>>,
}

impl OrderedTable {
    /// Create an empty table.
    pub fn new() -> OrderedTable {
        OrderedTable {
            table: RwLock::new(BTreeMap::new()),
        }
    }

    /// Forward cursor over keys in `lo..hi`, visible at `sid`.
    ///
    /// Rows whose first version is not yet visible at `sid` are skipped,
    /// exactly as a scan body would skip them row by row.
    pub fn range(&self, lo: &[u8], hi: &[u8], sid: Sid) -> RangeCursor {
        let rows: Vec<(Vec<u8>, Arc<VHandle>)> = self
            .table
            .read()
            .range(lo.to_vec()..hi.to_vec())
            .filter(|(_, row)| !row.should_scan_skip(sid))
            .map(|(k, row)| (k.clone(), Arc::clone(row)))
            .collect();
        RangeCursor { rows, pos: 0 }
    }
}

impl Default for OrderedTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Table for OrderedTable {
    fn search(&self, key: &[u8]) -> Option<Arc<VHandle>> {
        self.table.read().get(key).map(Arc::clone)
    }

    fn search_or_create(&self, key: &[u8], affinity: u32) -> Arc<VHandle> {
        if let Some(row) = self.table.read().get(key) {
            return Arc::clone(row);
        }
        Arc::clone(
            self.table
                .write()
                .entry(key.to_vec())
                .or_insert_with(|| Arc::new(VHandle::new(affinity, 0))),
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

/// A forward cursor produced by [`OrderedTable::range`].
pub struct RangeCursor {
    rows: Vec<(Vec<u8>, Arc<VHandle>)>,
    pos: usize,
}

impl RangeCursor {
    /// Whether the cursor points at a row.
    pub fn is_valid(&self) -> bool {
        self.pos < self.rows.len()
    }

    /// Advance to the next row.
    pub fn advance(&mut self) {
        self.pos += 1;
    }

    /// The current row.
    pub fn row(&self) -> &Arc<VHandle> {
        &self.rows[self.pos].1
    }

    /// The current key.
    pub fn key(&self) -> &[u8] {
        &self.rows[self.pos].0
    }
}

impl Iterator for RangeCursor {
    type Item = (Vec<u8>, Arc<VHandle>);

    fn next(&mut self) -> Option<Self::Item> {
        if !self.is_valid() {
            return None;
        }
        let item = self.rows[self.pos].clone();
        self.pos += 1;
        Some(item)
    }
}
