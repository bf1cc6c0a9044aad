use crate::keys;
use basalt_matrix::Mapper;
use lithos_events::{DataScheme, RecordBuffer, RecordCursor};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Upstream interest feed of a collector.
///
/// `add_sub`/`remove_sub` run under the collector's global lock, exactly
/// when the total subscription for a (key, rid) appears, disappears or
/// lowers its time. They return true when the distributor wants
/// `notify_added`/`notify_removed`, which run after the lock is released.
pub trait Distributor: Send + Sync {
    fn add_sub(&self, key: i32, rid: i32, time: i64) -> bool;
    fn remove_sub(&self, key: i32, rid: i32) -> bool;

    fn notify_added(&self) {}
    fn notify_removed(&self) {}
}

/// [`Distributor`] that records total subscription changes as records, for
/// upstream feeds that poll.
pub struct SubscriptionTracker {
    scheme: Arc<DataScheme>,
    mapper: Arc<Mapper>,
    added: Mutex<RecordBuffer>,
    removed: Mutex<RecordBuffer>,
    add_calls: AtomicUsize,
    remove_calls: AtomicUsize,
    notified: AtomicUsize,
}

impl SubscriptionTracker {
    pub fn new(scheme: Arc<DataScheme>, mapper: Arc<Mapper>) -> Self {
        Self {
            scheme,
            mapper,
            added: Mutex::new(RecordBuffer::new()),
            removed: Mutex::new(RecordBuffer::new()),
            add_calls: AtomicUsize::new(0),
            remove_calls: AtomicUsize::new(0),
            notified: AtomicUsize::new(0),
        }
    }

    fn cursor(&self, key: i32, rid: i32, time: i64) -> Option<RecordCursor> {
        let record = self.scheme.record(rid)?;
        let (cipher, symbol) = keys::decode_key(&self.mapper, key);
        let mut cursor = RecordCursor::new(record.clone(), cipher, symbol);
        if record.has_time() {
            cursor.set_time(time);
        }
        Some(cursor)
    }

    pub fn take_added(&self) -> RecordBuffer {
        std::mem::take(&mut *self.added.lock())
    }

    pub fn take_removed(&self) -> RecordBuffer {
        std::mem::take(&mut *self.removed.lock())
    }

    pub fn add_calls(&self) -> usize {
        self.add_calls.load(Ordering::Relaxed)
    }

    pub fn remove_calls(&self) -> usize {
        self.remove_calls.load(Ordering::Relaxed)
    }

    /// Number of `notify_added`/`notify_removed` wake-ups received.
    pub fn notified(&self) -> usize {
        self.notified.load(Ordering::Relaxed)
    }
}

impl Distributor for SubscriptionTracker {
    fn add_sub(&self, key: i32, rid: i32, time: i64) -> bool {
        self.add_calls.fetch_add(1, Ordering::Relaxed);
        let Some(cursor) = self.cursor(key, rid, time) else {
            return false;
        };
        let mut added = self.added.lock();
        added.add(cursor);
        added.size() == 1
    }

    fn remove_sub(&self, key: i32, rid: i32) -> bool {
        self.remove_calls.fetch_add(1, Ordering::Relaxed);
        let Some(cursor) = self.cursor(key, rid, 0) else {
            return false;
        };
        let mut removed = self.removed.lock();
        removed.add(cursor);
        removed.size() == 1
    }

    fn notify_added(&self) {
        self.notified.fetch_add(1, Ordering::Relaxed);
    }

    fn notify_removed(&self) {
        self.notified.fetch_add(1, Ordering::Relaxed);
    }
}
