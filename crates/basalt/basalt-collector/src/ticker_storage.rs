use basalt_matrix::mapper::is_mapped_key;
use basalt_matrix::{Mapper, MatrixError};
use lithos_events::{RecordCursor, RecordSink};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Last known value per (key, rid) for the ticker contract.
///
/// Entries exist only while the total subscription holds the pair. Every
/// entry with a mapped key holds one reference on that key.
#[derive(Debug)]
pub struct TickerStorage {
    mapper: Arc<Mapper>,
    records: RwLock<HashMap<(i32, i32), RecordCursor>>,
}

impl TickerStorage {
    pub fn new(mapper: Arc<Mapper>, record_count: usize) -> Result<Self, MatrixError> {
        mapper.inc_max_counter(record_count)?;
        Ok(Self {
            mapper,
            records: RwLock::new(HashMap::new()),
        })
    }

    /// Stores `cursor` and reports whether the stored value changed.
    pub fn put(&self, key: i32, rid: i32, cursor: &RecordCursor) -> Result<bool, MatrixError> {
        let mut records = self.records.write();
        if let Some(stored) = records.get_mut(&(key, rid)) {
            if stored.same_data(cursor) {
                return Ok(false);
            }
            stored.copy_data_from(cursor);
            return Ok(true);
        }
        if is_mapped_key(key) {
            self.mapper.inc_counter(key)?;
        }
        let mut stored = cursor.clone();
        stored.set_attachment(None);
        stored.set_remove(false);
        records.insert((key, rid), stored);
        Ok(true)
    }

    pub fn remove(&self, key: i32, rid: i32) -> Result<bool, MatrixError> {
        if self.records.write().remove(&(key, rid)).is_none() {
            return Ok(false);
        }
        if is_mapped_key(key) {
            self.mapper.dec_counter(key)?;
        }
        Ok(true)
    }

    pub fn contains(&self, key: i32, rid: i32) -> bool {
        self.records.read().contains_key(&(key, rid))
    }

    pub fn get(&self, key: i32, rid: i32) -> Option<RecordCursor> {
        self.records.read().get(&(key, rid)).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn keys(&self) -> Vec<(i32, i32)> {
        self.records.read().keys().copied().collect()
    }

    /// Appends every stored value; returns true when the sink ran out of capacity first.
    pub fn examine<S: RecordSink + ?Sized>(&self, sink: &mut S) -> bool {
        for cursor in self.records.read().values() {
            if !sink.has_capacity() {
                return true;
            }
            sink.append(cursor);
        }
        false
    }
}
