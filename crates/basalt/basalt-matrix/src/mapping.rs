//! Interning table for symbols that do not fit a cipher.
//!
//! Each symbol gets a synthetic key in `FIRST_KEY..=LAST_KEY`. Two hash
//! tables share the slot arrays: `keys`/`counters`/`symbols` are probed by
//! key, and `indices` maps a symbol hash position to the slot holding it.
//! Slot 0 and position 0 are never used.
//!
//! Entries are reference counted by the matrices and storages that hold
//! their key. Entries whose counter drops to zero stay until the next
//! rehash.

use crate::debug_log::DebugLog;
use crate::{MatrixError, hashing, try_alloc};
use std::sync::Arc;

/// Marks a key as produced by the mapping rather than the codec.
pub const VALID_KEY: i32 = 0x2000_0000;
pub const FIRST_KEY: i32 = 0x2000_0002;
pub const LAST_KEY: i32 = 0x3FFF_FFFF;

/// Limit for reference counters and their sum.
const MAX_COUNTER_LIMIT: i64 = i32::MAX as i64;

pub fn symbol_hash(symbol: &str) -> i32 {
    symbol
        .encode_utf16()
        .fold(0i32, |h, c| h.wrapping_mul(31).wrapping_add(c as i32))
}

#[derive(Debug)]
pub struct Mapping {
    magic: i32,
    shift: u32,
    keys: Vec<i32>,
    counters: Vec<i32>,
    symbols: Vec<Option<Arc<str>>>,
    indices: Vec<u32>,
    overall_size: usize,
    payload_size: usize,
    last_assigned_key: i32,
    max_counter: i64,
}

impl Mapping {
    pub fn new(capacity: usize, prev_magic: i32) -> Result<Self, MatrixError> {
        let magic = hashing::next_magic_for(prev_magic, capacity);
        let shift = hashing::get_shift(capacity)?;
        let length = 1usize << (32 - shift);
        Ok(Self {
            magic,
            shift,
            keys: try_alloc(length, 0)?,
            counters: try_alloc(length, 0)?,
            symbols: try_alloc(length, None)?,
            indices: try_alloc(length, 0)?,
            overall_size: 0,
            payload_size: 0,
            last_assigned_key: LAST_KEY,
            max_counter: 0,
        })
    }

    fn key_slot(&self, key: i32, miss_mask: usize) -> usize {
        let mut index = (key.wrapping_mul(self.magic) as u32 >> self.shift) as usize;
        loop {
            let test_key = self.keys[index];
            if test_key == key {
                return index;
            }
            if test_key == 0 {
                if index > 0 {
                    return index & miss_mask;
                }
                index = self.keys.len();
            }
            index -= 1;
        }
    }

    fn position(&self, symbol: &str, miss_mask: usize) -> usize {
        let mut position =
            (symbol_hash(symbol).wrapping_mul(self.magic) as u32 >> self.shift) as usize;
        loop {
            let test_index = self.indices[position] as usize;
            if test_index == 0 && position != 0 {
                return position & miss_mask;
            }
            if self.symbols[test_index].as_deref() == Some(symbol) {
                return position;
            }
            if position == 0 {
                position = self.indices.len();
            }
            position -= 1;
        }
    }

    /// Key for `symbol`, or `0` when it was never added.
    pub fn get_key(&self, symbol: &str) -> i32 {
        self.keys[self.indices[self.position(symbol, 0)] as usize]
    }

    pub fn get_symbol(&self, key: i32) -> Option<&Arc<str>> {
        self.symbols[self.key_slot(key, 0)].as_ref()
    }

    pub fn get_counter(&self, key: i32) -> i32 {
        self.counters[self.key_slot(key, 0)]
    }

    pub fn overall_size(&self) -> usize {
        self.overall_size
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    pub fn max_counter(&self) -> i64 {
        self.max_counter
    }

    /// Returns the key for `symbol`, assigning the next free key if needed.
    /// The caller grows the table beforehand (see [`Mapping::need_rehash`]).
    pub fn add_key(&mut self, symbol: &str) -> Result<i32, MatrixError> {
        let position = self.position(symbol, usize::MAX);
        let key = self.keys[self.indices[position] as usize];
        if key != 0 {
            return Ok(key);
        }
        if self.overall_size + 1 >= self.keys.len() {
            return Err(MatrixError::KeySpaceExhausted);
        }
        let mut key = self.last_assigned_key;
        let index = loop {
            key = if key >= LAST_KEY { FIRST_KEY } else { key + 1 };
            let index = self.key_slot(key, usize::MAX);
            if self.keys[index] == 0 {
                break index;
            }
        };
        if self.counters[index] != 0 {
            return Err(MatrixError::DirtyCounter { key });
        }
        self.keys[index] = key;
        self.symbols[index] = Some(Arc::from(symbol));
        self.indices[position] = index as u32;
        self.overall_size += 1;
        self.last_assigned_key = key;
        Ok(key)
    }

    pub fn inc_max_counter(&mut self, delta: usize) -> Result<(), MatrixError> {
        let next = self.max_counter + delta as i64;
        if next > MAX_COUNTER_LIMIT {
            return Err(MatrixError::MaxCounterOverflow);
        }
        self.max_counter = next;
        Ok(())
    }

    pub fn dec_max_counter(&mut self, delta: usize) -> Result<(), MatrixError> {
        let next = self.max_counter - delta as i64;
        if next < 0 {
            return Err(MatrixError::MaxCounterUnderflow);
        }
        self.max_counter = next;
        if next == 0 && self.payload_size != 0 {
            return Err(MatrixError::ExcessPayload {
                payload: self.payload_size,
            });
        }
        Ok(())
    }

    pub fn inc_counter(&mut self, key: i32) -> Result<(), MatrixError> {
        let index = self.key_slot(key, 0);
        if index == 0 {
            return Err(MatrixError::UnknownKey { key });
        }
        let old = self.counters[index];
        if old as i64 >= self.max_counter {
            return Err(MatrixError::CounterOverflow { key });
        }
        self.counters[index] = old + 1;
        if old == 0 {
            self.payload_size += 1;
            if self.payload_size > self.overall_size {
                return Err(MatrixError::PayloadOverflow);
            }
        }
        Ok(())
    }

    pub fn dec_counter(&mut self, key: i32) -> Result<(), MatrixError> {
        let index = self.key_slot(key, 0);
        if index == 0 {
            return Err(MatrixError::UnknownKey { key });
        }
        let new = self.counters[index] - 1;
        if new < 0 {
            return Err(MatrixError::CounterUnderflow { key });
        }
        self.counters[index] = new;
        if new == 0 {
            self.payload_size = self
                .payload_size
                .checked_sub(1)
                .ok_or(MatrixError::PayloadUnderflow)?;
        }
        Ok(())
    }

    pub fn need_rehash(&self) -> bool {
        hashing::need_rehash(
            self.shift,
            self.overall_size,
            self.payload_size,
            hashing::MAX_SHIFT,
        )
    }

    /// Copy of this mapping without unreferenced entries, sized for `extra` more keys.
    pub fn rehash(&self, extra: usize) -> Result<Mapping, MatrixError> {
        let mut dest = Mapping::new(self.payload_size + extra, self.magic)?;
        let mut copied = 0;
        for index in (1..self.keys.len()).rev() {
            let counter = self.counters[index];
            if counter == 0 {
                continue;
            }
            let key = self.keys[index];
            let Some(symbol) = self.symbols[index].clone() else {
                return Err(MatrixError::UnknownKey { key });
            };
            let dest_index = dest.key_slot(key, usize::MAX);
            let dest_position = dest.position(&symbol, usize::MAX);
            if dest.keys[dest_index] != 0 || dest.indices[dest_position] != 0 {
                return Err(MatrixError::RepeatedKey { key, rid: 0 });
            }
            dest.keys[dest_index] = key;
            dest.counters[dest_index] = counter;
            dest.symbols[dest_index] = Some(symbol);
            dest.indices[dest_position] = dest_index as u32;
            copied += 1;
        }
        if copied != self.payload_size {
            return Err(MatrixError::PayloadCorrupted {
                expected: self.payload_size,
                copied,
            });
        }
        dest.overall_size = copied;
        dest.payload_size = copied;
        dest.last_assigned_key = self.last_assigned_key;
        dest.max_counter = self.max_counter;
        Ok(dest)
    }

    /// Compares counters with a mapping rebuilt from the actual references.
    /// Counters of `expected` are consumed.
    pub fn verify(&self, log: &dyn DebugLog, expected: &mut Mapping) {
        log.info("Verifying mapping...");
        let mut total_keys = 0;
        for index in 0..self.keys.len() {
            let key = self.keys[index];
            let counter = self.counters[index];
            let symbol = self.symbols[index].as_deref();
            if key == 0 {
                if let Some(symbol) = symbol {
                    log.warn(&format!("Lost symbol {symbol} at {index}"));
                }
                if counter != 0 {
                    log.warn(&format!("Lost counter {counter} at {index}"));
                }
                continue;
            }
            total_keys += 1;
            let Some(symbol) = symbol else {
                if counter != 0 {
                    log.warn(&format!("Undefined symbol for key {key:#x} at {index}"));
                }
                continue;
            };
            if counter == 0 {
                continue;
            }
            let verify_index = expected.key_slot(expected.get_key(symbol), 0);
            let verify_counter = expected.counters[verify_index];
            if verify_counter != counter {
                log.warn(&format!(
                    "Unexpected counter {counter} (expected counter {verify_counter}) for key {key:#x}, symbol {symbol} at {index}"
                ));
            }
            expected.counters[verify_index] = 0;
        }
        for index in 1..expected.keys.len() {
            let verify_counter = expected.counters[index];
            if verify_counter != 0 {
                let symbol = expected.symbols[index].as_deref().unwrap_or("<none>");
                log.warn(&format!(
                    "Missing key or zero counter for symbol {symbol} (expected counter {verify_counter})"
                ));
            }
        }
        log.info(&format!("Verified {total_keys} keys"));
    }
}
