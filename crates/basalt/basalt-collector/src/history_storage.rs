use basalt_matrix::mapper::is_mapped_key;
use basalt_matrix::{Mapper, MatrixError};
use lithos_events::RecordCursor;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Time-ordered records per (key, rid) for the history contract.
///
/// A record replaces an earlier one with the same time. Records below the
/// item's total subscription time are trimmed as new ones arrive. Entries
/// exist only while the total subscription holds the pair, and every entry
/// with a mapped key holds one reference on that key.
#[derive(Debug)]
pub struct HistoryStorage {
    mapper: Arc<Mapper>,
    items: RwLock<HashMap<(i32, i32), BTreeMap<i64, RecordCursor>>>,
}

impl HistoryStorage {
    pub fn new(mapper: Arc<Mapper>, record_count: usize) -> Result<Self, MatrixError> {
        mapper.inc_max_counter(record_count)?;
        Ok(Self {
            mapper,
            items: RwLock::new(HashMap::new()),
        })
    }

    /// Stores `cursor` under its time and forgets records older than `time_total`.
    pub fn put(&self, key: i32, rid: i32, cursor: &RecordCursor, time_total: i64) -> Result<(), MatrixError> {
        let mut items = self.items.write();
        if is_mapped_key(key) && !items.contains_key(&(key, rid)) {
            self.mapper.inc_counter(key)?;
        }
        let records = items.entry((key, rid)).or_default();
        let mut stored = cursor.clone();
        stored.set_attachment(None);
        stored.set_remove(false);
        records.insert(cursor.time(), stored);
        if records.first_key_value().is_some_and(|(&t, _)| t < time_total) {
            *records = records.split_off(&time_total);
        }
        Ok(())
    }

    pub fn remove(&self, key: i32, rid: i32) -> Result<bool, MatrixError> {
        if self.items.write().remove(&(key, rid)).is_none() {
            return Ok(false);
        }
        if is_mapped_key(key) {
            self.mapper.dec_counter(key)?;
        }
        Ok(true)
    }

    /// Stored records with `from <= time < until`, oldest first.
    pub fn range(&self, key: i32, rid: i32, from: i64, until: i64) -> Vec<RecordCursor> {
        if from >= until {
            return Vec::new();
        }
        self.items
            .read()
            .get(&(key, rid))
            .map(|records| records.range(from..until).map(|(_, c)| c.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of records stored for the pair.
    pub fn len_of(&self, key: i32, rid: i32) -> usize {
        self.items.read().get(&(key, rid)).map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    pub fn keys(&self) -> Vec<(i32, i32)> {
        self.items.read().keys().copied().collect()
    }
}
