//! Open-addressed table of subscription rows.
//!
//! ```text
//! ints: | row 0 (void) | row 1 | row 2 | ... |      each row = `step` ints
//!          KEY RID ...   KEY RID ...
//! objs: | row 0 | row 1 | ...                       each row = `obj_step` slots
//! ```
//!
//! Rows are addressed by the offset of their first int ("index"). Index 0
//! is never a row, so `0` doubles as "not found". Callers own the meaning
//! of every column past [`RID`]; the matrix only reads the payload column
//! to tell live rows from tombstones.
//!
//! All mutations happen under the owner's locks. Point reads may race with
//! a writer: every int is an atomic word, and the key is published last
//! with `Release` so a reader that sees the key sees the rest of the row.

use crate::mapper::{Mapper, is_mapped_key};
use crate::{MatrixError, hashing, try_alloc};
use lithos_events::Attachment;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

pub const KEY: usize = 0;
pub const RID: usize = 1;

const RID_HASH: i32 = 0x5F3A_C769;

/// Row shape of a matrix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubMatrixLayout {
    /// Ints per row.
    pub step: usize,
    /// Object slots per row.
    pub obj_step: usize,
    /// Column that is non-zero for live rows.
    pub payload_offset: usize,
}

pub struct SubMatrix {
    mapper: Arc<Mapper>,
    layout: SubMatrixLayout,
    magic: i32,
    shift: u32,
    ints: Box<[AtomicI32]>,
    objs: Mutex<Vec<Option<Attachment>>>,
    overall_size: AtomicUsize,
    payload_size: AtomicUsize,
    payload_by_rid: Box<[AtomicUsize]>,
}

fn try_alloc_atomic<T>(len: usize, init: impl Fn() -> T) -> Result<Box<[T]>, MatrixError> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|_| MatrixError::OutOfMemory { rows: len })?;
    v.extend((0..len).map(|_| init()));
    Ok(v.into_boxed_slice())
}

impl SubMatrix {
    /// Allocates a matrix sized for `capacity` rows, never smaller than `max_shift` allows.
    pub fn new(
        mapper: Arc<Mapper>,
        layout: SubMatrixLayout,
        record_count: usize,
        capacity: usize,
        prev_magic: i32,
        max_shift: u32,
    ) -> Result<Self, MatrixError> {
        let shift = hashing::get_shift(capacity)?.min(max_shift);
        let magic = hashing::next_magic_for(prev_magic, capacity);
        let rows = 1usize << (32 - shift);
        let len = rows
            .checked_mul(layout.step)
            .ok_or(MatrixError::CapacityTooLarge { capacity })?;
        Ok(Self {
            mapper,
            layout,
            magic,
            shift,
            ints: try_alloc_atomic(len, || AtomicI32::new(0))?,
            objs: Mutex::new(try_alloc(rows * layout.obj_step, None)?),
            overall_size: AtomicUsize::new(0),
            payload_size: AtomicUsize::new(0),
            payload_by_rid: try_alloc_atomic(record_count, || AtomicUsize::new(0))?,
        })
    }

    pub fn layout(&self) -> SubMatrixLayout {
        self.layout
    }

    pub fn step(&self) -> usize {
        self.layout.step
    }

    /// Length of the int array; row indices are `step..len` in `step` strides.
    pub fn len(&self) -> usize {
        self.ints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload_size() == 0
    }

    pub fn shift(&self) -> u32 {
        self.shift
    }

    pub fn magic(&self) -> i32 {
        self.magic
    }

    pub fn mapper(&self) -> &Arc<Mapper> {
        &self.mapper
    }

    /// Row indices from the last row down to the first.
    pub fn rows(&self) -> impl Iterator<Item = usize> + '_ {
        let step = self.layout.step;
        (1..self.ints.len() / step).rev().map(move |r| r * step)
    }

    #[inline]
    pub fn get_int(&self, index: usize) -> i32 {
        self.ints[index].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_int(&self, index: usize, value: i32) {
        self.ints[index].store(value, Ordering::Relaxed);
    }

    /// Reads two words, high first. A racing writer may tear the value.
    #[inline]
    pub fn get_long(&self, index: usize) -> i64 {
        ((self.get_int(index) as i64) << 32) | (self.get_int(index + 1) as u32 as i64)
    }

    #[inline]
    pub fn set_long(&self, index: usize, value: i64) {
        self.set_int(index, (value >> 32) as i32);
        self.set_int(index + 1, value as i32);
    }

    fn obj_slot(&self, index: usize, offset: usize) -> usize {
        index / self.layout.step * self.layout.obj_step + offset
    }

    pub fn get_obj(&self, index: usize, offset: usize) -> Option<Attachment> {
        if self.layout.obj_step == 0 {
            return None;
        }
        self.objs.lock()[self.obj_slot(index, offset)].clone()
    }

    pub fn set_obj(&self, index: usize, offset: usize, value: Option<Attachment>) {
        if self.layout.obj_step == 0 {
            return;
        }
        let slot = self.obj_slot(index, offset);
        self.objs.lock()[slot] = value;
    }

    #[inline]
    fn hash_index(&self, key: i32, rid: i32) -> usize {
        let h = key.wrapping_add(rid.wrapping_mul(RID_HASH)).wrapping_mul(self.magic);
        ((h as u32) >> self.shift) as usize * self.layout.step
    }

    fn probe(&self, key: i32, rid: i32, miss_mask: usize, order: Ordering) -> usize {
        let step = self.layout.step;
        let mut index = self.hash_index(key, rid);
        loop {
            let test_key = self.ints[index + KEY].load(order);
            if test_key == key && self.get_int(index + RID) == rid {
                return index;
            }
            if test_key == 0 {
                if index > 0 {
                    return index & miss_mask;
                }
                index = self.ints.len();
            }
            index -= step;
        }
    }

    /// Row for (key, rid), or `0`. Tombstones are found too.
    pub fn get_index(&self, key: i32, rid: i32) -> usize {
        self.probe(key, rid, 0, Ordering::Relaxed)
    }

    /// [`SubMatrix::get_index`] for readers without the owner's lock.
    pub fn get_volatile_index(&self, key: i32, rid: i32) -> usize {
        self.probe(key, rid, 0, Ordering::Acquire)
    }

    /// Finds the row for (key, rid) or reserves a free one without publishing the key.
    pub fn add_index_begin(&self, key: i32, rid: i32) -> Result<usize, MatrixError> {
        let index = self.probe(key, rid, usize::MAX, Ordering::Relaxed);
        if self.get_int(index + KEY) != 0 {
            return Ok(index);
        }
        if is_mapped_key(key) {
            self.mapper.inc_counter(key)?;
        }
        self.overall_size.fetch_add(1, Ordering::Relaxed);
        self.set_int(index + RID, rid);
        Ok(index)
    }

    /// Publishes the key of a row reserved by [`SubMatrix::add_index_begin`].
    pub fn add_index_complete(&self, index: usize, key: i32, rid: i32) {
        debug_assert_eq!(self.get_int(index + RID), rid);
        if self.ints[index + KEY].load(Ordering::Relaxed) == 0 {
            self.ints[index + KEY].store(key, Ordering::Release);
        }
    }

    #[inline]
    pub fn is_payload(&self, index: usize) -> bool {
        self.get_int(index + self.layout.payload_offset) != 0
    }

    pub fn update_added_payload(&self, rid: i32) -> Result<(), MatrixError> {
        let payload = self.payload_size.fetch_add(1, Ordering::Relaxed) + 1;
        if payload > self.overall_size.load(Ordering::Relaxed) {
            return Err(MatrixError::PayloadOverflow);
        }
        if let Some(c) = self.payload_by_rid.get(rid as usize) {
            c.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn update_removed_payload(&self, rid: i32) -> Result<(), MatrixError> {
        self.payload_size
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |p| p.checked_sub(1))
            .map_err(|_| MatrixError::PayloadUnderflow)?;
        if let Some(c) = self.payload_by_rid.get(rid as usize) {
            let _ = c.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |p| p.checked_sub(1));
        }
        Ok(())
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size.load(Ordering::Relaxed)
    }

    pub fn payload_size_for(&self, rid: i32) -> usize {
        self.payload_by_rid
            .get(rid as usize)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Occupied rows, tombstones included.
    pub fn overall_size(&self) -> usize {
        self.overall_size.load(Ordering::Relaxed)
    }

    pub fn need_rehash(&self, max_shift: u32) -> bool {
        hashing::need_rehash(self.shift, self.overall_size(), self.payload_size(), max_shift)
    }

    /// Builds a fresh matrix holding only live rows, every column copied verbatim.
    ///
    /// Mapping references of dropped tombstones are released; those of live
    /// rows move to the new matrix. Columns that point at row offsets of
    /// this matrix must be repaired by the caller.
    pub fn rehash(&self, max_shift: u32) -> Result<SubMatrix, MatrixError> {
        let payload = self.payload_size();
        let dest = SubMatrix::new(
            self.mapper.clone(),
            self.layout,
            self.payload_by_rid.len(),
            payload,
            self.magic,
            max_shift,
        )?;
        dest.overall_size.store(payload, Ordering::Relaxed);
        let step = self.layout.step;
        let obj_step = self.layout.obj_step;
        let src_objs = self.objs.lock();
        let mut dest_objs = dest.objs.lock();
        let mut copied = 0;
        for index in self.rows() {
            let key = self.get_int(index + KEY);
            if key == 0 {
                continue;
            }
            let rid = self.get_int(index + RID);
            if !self.is_payload(index) {
                if is_mapped_key(key) {
                    self.mapper.dec_counter(key)?;
                }
                continue;
            }
            let dest_index = dest.probe(key, rid, usize::MAX, Ordering::Relaxed);
            if dest.get_int(dest_index + KEY) != 0 {
                return Err(MatrixError::RepeatedKey { key, rid });
            }
            for i in 0..step {
                dest.set_int(dest_index + i, self.get_int(index + i));
            }
            if obj_step > 0 {
                let src = self.obj_slot(index, 0);
                let dst = dest.obj_slot(dest_index, 0);
                for i in 0..obj_step {
                    dest_objs[dst + i] = src_objs[src + i].clone();
                }
            }
            dest.payload_size.fetch_add(1, Ordering::Relaxed);
            if let Some(c) = dest.payload_by_rid.get(rid as usize) {
                c.fetch_add(1, Ordering::Relaxed);
            }
            copied += 1;
        }
        drop(dest_objs);
        if copied != payload {
            return Err(MatrixError::PayloadCorrupted {
                expected: payload,
                copied,
            });
        }
        Ok(dest)
    }

    /// Releases mapping references of every row.
    pub fn close(&self) -> Result<(), MatrixError> {
        for index in self.rows() {
            let key = self.get_int(index + KEY);
            if is_mapped_key(key) {
                self.mapper.dec_counter(key)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for SubMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubMatrix")
            .field("layout", &self.layout)
            .field("shift", &self.shift)
            .field("overall_size", &self.overall_size())
            .field("payload_size", &self.payload_size())
            .finish()
    }
}
