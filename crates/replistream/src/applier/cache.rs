//! Bounded table-description cache
//!
//! Private to one applier instance. Bounded by a hard cap: insertions beyond
//! the cap are rejected with a warning instead of evicting, since a stale but
//! tracked description is safer than silently losing cache accounting. The
//! cache is invalidated wholesale on STATEMENT and DUMP, either of which may
//! have altered arbitrary tables.

use crate::common::dialect::TableDescription;
use crate::common::record::TableRef;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

pub const DEFAULT_CAPACITY: usize = 5000;

pub struct DescriptionCache {
    entries: Mutex<HashMap<TableRef, TableDescription>>,
    capacity: usize,
}

impl DescriptionCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    pub fn get(&self, table: &TableRef) -> Option<TableDescription> {
        self.entries.lock().expect("cache mutex").get(table).cloned()
    }

    /// Insert a description. Rejected with a warning once the cap is
    /// reached; replacing an existing entry is always allowed.
    pub fn insert(&self, description: TableDescription) {
        let mut entries = self.entries.lock().expect("cache mutex");
        let key = description.table.clone();
        if !entries.contains_key(&key) && entries.len() >= self.capacity {
            warn!(
                table = %key,
                capacity = self.capacity,
                "description cache full, entry not cached"
            );
            return;
        }
        entries.insert(key, description);
    }

    /// Drop the entry for one table (after CREATE recreated it).
    pub fn invalidate(&self, table: &TableRef) {
        self.entries.lock().expect("cache mutex").remove(table);
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let mut entries = self.entries.lock().expect("cache mutex");
        debug!(dropped = entries.len(), "description cache cleared");
        entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache mutex").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DescriptionCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::dialect::ColumnDescription;

    fn desc(name: &str) -> TableDescription {
        TableDescription::new(
            TableRef::new("db", "s", name),
            vec![ColumnDescription::new("id", "BIGINT").primary()],
        )
    }

    #[test]
    fn test_get_insert_invalidate() {
        let cache = DescriptionCache::new(10);
        let t = TableRef::new("db", "s", "a");
        assert!(cache.get(&t).is_none());

        cache.insert(desc("a"));
        assert!(cache.get(&t).is_some());

        cache.invalidate(&t);
        assert!(cache.get(&t).is_none());
    }

    #[test]
    fn test_cap_rejects_instead_of_evicting() {
        let cache = DescriptionCache::new(2);
        cache.insert(desc("a"));
        cache.insert(desc("b"));
        cache.insert(desc("c"));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&TableRef::new("db", "s", "a")).is_some());
        assert!(cache.get(&TableRef::new("db", "s", "c")).is_none());
    }

    #[test]
    fn test_replacing_existing_entry_allowed_at_cap() {
        let cache = DescriptionCache::new(1);
        cache.insert(desc("a"));
        let mut updated = desc("a");
        updated.columns.push(ColumnDescription::new("note", "VARCHAR"));
        cache.insert(updated);

        let got = cache.get(&TableRef::new("db", "s", "a")).unwrap();
        assert_eq!(got.columns.len(), 2);
    }

    #[test]
    fn test_clear() {
        let cache = DescriptionCache::new(10);
        cache.insert(desc("a"));
        cache.insert(desc("b"));
        cache.clear();
        assert!(cache.is_empty());
    }
}
