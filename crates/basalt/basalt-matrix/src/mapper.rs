use crate::debug_log::DebugLog;
use crate::mapping::{Mapping, VALID_KEY};
use crate::MatrixError;
use lithos_events::VALID_CIPHER;
use parking_lot::RwLock;
use std::sync::Arc;

/// Shared owner of the current [`Mapping`].
///
/// Lookups take the read lock. Mutations are only issued by code holding
/// the collector's global lock, so the write lock is never contended by
/// another writer.
#[derive(Debug)]
pub struct Mapper {
    mapping: RwLock<Mapping>,
}

/// True for keys produced by a [`Mapping`] (as opposed to ciphers).
pub fn is_mapped_key(key: i32) -> bool {
    key & VALID_CIPHER == 0 && key & VALID_KEY != 0
}

impl Mapper {
    pub fn new() -> Result<Self, MatrixError> {
        Ok(Self {
            mapping: RwLock::new(Mapping::new(0, 0)?),
        })
    }

    pub fn get_key(&self, symbol: &str) -> i32 {
        self.mapping.read().get_key(symbol)
    }

    pub fn get_symbol(&self, key: i32) -> Option<Arc<str>> {
        self.mapping.read().get_symbol(key).cloned()
    }

    pub fn add_key(&self, symbol: &str) -> Result<i32, MatrixError> {
        let mut mapping = self.mapping.write();
        let key = mapping.get_key(symbol);
        if key != 0 {
            return Ok(key);
        }
        if mapping.need_rehash() {
            let rehashed = mapping.rehash(1)?;
            tracing::debug!(
                payload = rehashed.payload_size(),
                "rehashed symbol mapping before key assignment"
            );
            *mapping = rehashed;
        }
        mapping.add_key(symbol)
    }

    pub fn inc_counter(&self, key: i32) -> Result<(), MatrixError> {
        self.mapping.write().inc_counter(key)
    }

    pub fn dec_counter(&self, key: i32) -> Result<(), MatrixError> {
        self.mapping.write().dec_counter(key)
    }

    pub fn inc_max_counter(&self, delta: usize) -> Result<(), MatrixError> {
        self.mapping.write().inc_max_counter(delta)
    }

    pub fn dec_max_counter(&self, delta: usize) -> Result<(), MatrixError> {
        self.mapping.write().dec_max_counter(delta)
    }

    pub fn rehash_if_needed(&self) -> Result<(), MatrixError> {
        let mut mapping = self.mapping.write();
        if mapping.need_rehash() {
            *mapping = mapping.rehash(0)?;
        }
        Ok(())
    }

    pub fn payload_size(&self) -> usize {
        self.mapping.read().payload_size()
    }

    pub fn overall_size(&self) -> usize {
        self.mapping.read().overall_size()
    }

    pub fn counter(&self, key: i32) -> i32 {
        self.mapping.read().get_counter(key)
    }

    pub fn verify(&self, log: &dyn DebugLog, expected: &Mapper) {
        let mapping = self.mapping.read();
        let mut expected = expected.mapping.write();
        mapping.verify(log, &mut expected);
    }
}
