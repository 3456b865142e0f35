//! Index structures for Margay
//!
//! The execution core consumes indexes only through the [`Table`]
//! contract: point lookup, lookup-or-create, priority insert, and (for
//! the ordered variant) a forward range cursor. Two implementations are
//! provided: a sharded hash table for point-access tables and an ordered
//! table for scan-heavy ones.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod hash;
mod ordered;

pub use hash::HashTable;
pub use ordered::{OrderedTable, RangeCursor};

use margay_core::Sid;
use margay_storage::VHandle;
use std::sync::Arc;

/// The index contract the execution core consumes.
pub trait Table: Send + Sync {
    /// Point lookup.
    fn search(&self, key: &[u8]) -> Option<Arc<VHandle>>;

    /// Point lookup, creating an empty row on miss.
    ///
    /// `affinity` attributes the new row's storage to the creating core.
    fn search_or_create(&self, key: &[u8], affinity: u32) -> Arc<VHandle>;

    /// Insert a key on behalf of a priority transaction, appending a
    /// pending version at `sid`. Returns `None` when the append loses to
    /// an already-committed later version.
    fn priority_insert(&self, key: &[u8], sid: Sid, affinity: u32) -> Option<Arc<VHandle>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use margay_sync::SpinnerService;

    fn exercise_table(table: &dyn Table) {
        let svc = SpinnerService::new(1);
        let sid = Sid::new(1, 6, 0);

        assert!(table.search(b"k1").is_none());
        let row = table.search_or_create(b"k1", 0);
        assert!(Arc::ptr_eq(&row, &table.search(b"k1").unwrap()));
        assert!(Arc::ptr_eq(&row, &table.search_or_create(b"k1", 0)));

        let inserted = table.priority_insert(b"k2", sid, 0).unwrap();
        assert_eq!(inserted.versions(), vec![sid]);

        // A committed later version blocks a priority insert below it.
        let row3 = table.search_or_create(b"k3", 0);
        row3.append_new_version(Sid::new(1, 10, 0));
        row3.write_with_version(Sid::new(1, 10, 0), Some(b"v"), &svc);
        assert!(table.priority_insert(b"k3", Sid::new(1, 4, 0), 0).is_none());
    }

    #[test]
    fn test_hash_table_contract() {
        exercise_table(&HashTable::new());
    }

    #[test]
    fn test_ordered_table_contract() {
        exercise_table(&OrderedTable::new());
    }
}
