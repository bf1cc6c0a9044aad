//! Intrusive FIFO of subscription rows, threaded through one queue column.
//!
//! A column value of `0` means "not queued". A queued row holds the index
//! of the next queued row (or [`EOL`]) in the low 31 bits. [`QUEUE_BIT`]
//! is a per-row flag the owning contract interprets; for the ticker's
//! update queue it means "has undelivered data".

use crate::layout::{KEY, QUEUE_BIT, RID, SNAPSHOT_QUEUE, UPDATE_QUEUE};
use basalt_matrix::SubMatrix;
use lithos_events::RecordSink;

pub use crate::layout::EOL;

#[derive(Debug)]
pub struct AgentQueue {
    head: i32,
    tail: i32,
}

impl Default for AgentQueue {
    fn default() -> Self {
        Self { head: EOL, tail: EOL }
    }
}

/// Result of one queue walk during retrieval.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Retrieved {
    pub count: usize,
    pub no_capacity: bool,
}

impl AgentQueue {
    pub fn is_empty(&self) -> bool {
        self.head == EOL
    }

    pub fn head(&self) -> i32 {
        self.head
    }

    pub fn clear(&mut self) {
        self.head = EOL;
        self.tail = EOL;
    }

    pub fn reset_queue_bit(&self, asub: &SubMatrix, aindex: usize, ofs: usize) {
        asub.set_int(aindex + ofs, asub.get_int(aindex + ofs) & !QUEUE_BIT);
    }

    /// Appends `aindex` unless it is already queued. Returns true when the
    /// queue was empty before.
    pub fn link_to_queue(&mut self, asub: &SubMatrix, aindex: usize, ofs: usize, set_bit_on_existing: bool) -> bool {
        let val = asub.get_int(aindex + ofs);
        if val & !QUEUE_BIT != 0 {
            if set_bit_on_existing {
                asub.set_int(aindex + ofs, val | QUEUE_BIT);
            }
            return false;
        }
        let mut first = false;
        if self.tail == EOL {
            self.head = aindex as i32;
            first = true;
        } else {
            let tail = self.tail as usize;
            asub.set_int(tail + ofs, aindex as i32 | (asub.get_int(tail + ofs) & QUEUE_BIT));
        }
        asub.set_int(aindex + ofs, QUEUE_BIT | EOL);
        self.tail = aindex as i32;
        first
    }

    /// Unlinks the head row `aindex` and returns the new head.
    pub fn retrieve_next_queued(&mut self, asub: &SubMatrix, aindex: usize, ofs: usize, retain_bit: bool) -> i32 {
        let state = asub.get_int(aindex + ofs);
        let next = state & !QUEUE_BIT;
        asub.set_int(aindex + ofs, if retain_bit { state & QUEUE_BIT } else { 0 });
        self.head = next;
        if next == EOL {
            self.tail = EOL;
        }
        next
    }

    /// Pops leading rows that no longer have ticker data, if `aindex` is the head.
    pub fn cleanup_empty_head_for_ticker(&mut self, asub: &SubMatrix, aindex: usize, ofs: usize) {
        if aindex as i32 != self.head {
            return;
        }
        let mut aindex = aindex as i32;
        while aindex != EOL {
            if asub.get_int(aindex as usize + UPDATE_QUEUE) & QUEUE_BIT != 0 {
                break;
            }
            aindex = self.retrieve_next_queued(asub, aindex as usize, ofs, false);
        }
    }

    /// Rebuilds links after `asub` replaced `osub`. Rows that did not survive
    /// the rehash are skipped.
    pub fn fix_queue(&mut self, asub: &SubMatrix, osub: &SubMatrix, ofs: usize) {
        let mut oindex = self.head;
        if oindex == EOL {
            return;
        }
        let mut last = 0usize;
        while oindex != EOL {
            let o = oindex as usize;
            let aindex = asub.get_index(osub.get_int(o + KEY), osub.get_int(o + RID));
            if aindex > 0 {
                if last == 0 {
                    self.head = aindex as i32;
                } else {
                    asub.set_int(last + ofs, aindex as i32 | (asub.get_int(last + ofs) & QUEUE_BIT));
                }
                last = aindex;
            }
            oindex = osub.get_int(o + ofs) & !QUEUE_BIT;
        }
        if last == 0 {
            self.clear();
        } else {
            self.tail = last as i32;
            asub.set_int(last + ofs, EOL | (asub.get_int(last + ofs) & QUEUE_BIT));
        }
    }

    /// Walks the queue from the head, delivering rows whose update bit is
    /// set through `fetch`. `fetch` returns false when the row had nothing
    /// to deliver.
    pub fn retrieve_for_ticker<S, F>(&mut self, asub: &SubMatrix, sink: &mut S, limit: usize, ofs: usize, mut fetch: F) -> Retrieved
    where
        S: RecordSink + ?Sized,
        F: FnMut(usize, &mut S) -> bool,
    {
        let mut result = Retrieved::default();
        let mut aindex = self.head;
        while aindex != EOL && result.count < limit {
            let a = aindex as usize;
            let update = asub.get_int(a + UPDATE_QUEUE);
            let retain_snapshot_bit = ofs == SNAPSHOT_QUEUE && update & QUEUE_BIT == 0;
            if update & QUEUE_BIT != 0 {
                if !sink.has_capacity() {
                    result.no_capacity = true;
                    return result;
                }
                let snapshot = asub.get_int(a + SNAPSHOT_QUEUE);
                if snapshot & QUEUE_BIT != 0 {
                    asub.set_int(a + SNAPSHOT_QUEUE, snapshot & !QUEUE_BIT);
                }
                asub.set_int(a + UPDATE_QUEUE, update & !QUEUE_BIT);
                if fetch(a, sink) {
                    result.count += 1;
                }
            }
            aindex = self.retrieve_next_queued(asub, a, ofs, retain_snapshot_bit);
        }
        result
    }

    /// Indices of queued rows, head first.
    pub fn indices(&self, asub: &SubMatrix, ofs: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut aindex = self.head;
        while aindex != EOL && out.len() <= asub.len() {
            out.push(aindex as usize);
            aindex = asub.get_int(aindex as usize + ofs) & !QUEUE_BIT;
        }
        out
    }
}
