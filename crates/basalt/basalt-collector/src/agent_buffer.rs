use basalt_config::BufferOverflowStrategy;
use lithos_events::{DataRecord, RecordCursor, RecordSink, SymbolCodec};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Persistent position of the first record ever added.
pub const BASE: u64 = 1;

#[derive(Debug)]
struct Buffered {
    cursor: RecordCursor,
    unlinked: bool,
}

#[derive(Debug)]
struct LastDropped {
    record: Arc<DataRecord>,
    cipher: i32,
    symbol: Option<Arc<str>>,
}

/// Per-agent FIFO of records awaiting retrieval (Stream and History).
///
/// Every record gets a persistent position that survives retrieval of
/// earlier records, so a subscription row can remember where its last
/// record went and later ask whether it is still buffered.
#[derive(Debug)]
pub struct AgentBuffer {
    records: VecDeque<Buffered>,
    /// Records not unlinked.
    linked: usize,
    first_position: u64,
    max_size: usize,
    strategy: BufferOverflowStrategy,
    blocked: bool,
    dropped: u64,
    last_dropped: Option<LastDropped>,
    last_log: Option<Instant>,
}

impl AgentBuffer {
    pub fn new(max_size: usize, strategy: BufferOverflowStrategy) -> Self {
        Self {
            records: VecDeque::new(),
            linked: 0,
            first_position: BASE,
            max_size,
            strategy,
            blocked: false,
            dropped: 0,
            last_dropped: None,
            last_log: None,
        }
    }

    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
        if self.records.len() < max_size {
            self.blocked = false;
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn set_strategy(&mut self, strategy: BufferOverflowStrategy) {
        self.strategy = strategy;
        if strategy != BufferOverflowStrategy::Block {
            self.blocked = false;
        }
    }

    pub fn strategy(&self) -> BufferOverflowStrategy {
        self.strategy
    }

    /// Buffered records, unlinked ones included.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn has_next(&self) -> bool {
        self.linked > 0
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    pub fn is_in_buffer(&self, position: u64) -> bool {
        position >= self.first_position && position < self.first_position + self.records.len() as u64
    }

    /// Position the next added record will get.
    pub fn next_position(&self) -> u64 {
        self.first_position + self.records.len() as u64
    }

    /// Under `Block`, reports a full buffer and remembers that distribution stalled on it.
    pub fn block_new_record(&mut self) -> bool {
        if self.strategy != BufferOverflowStrategy::Block || self.records.len() < self.max_size {
            return false;
        }
        self.blocked = true;
        true
    }

    /// Under `DropNewest`, rejects `cursor` when the buffer is full.
    pub fn drop_new_record(&mut self, cursor: &RecordCursor) -> bool {
        if self.strategy != BufferOverflowStrategy::DropNewest || self.records.len() < self.max_size {
            return false;
        }
        self.make_dropped(cursor);
        true
    }

    /// Under `DropOldest`, evicts from the head until the buffer fits.
    pub fn drop_old_records(&mut self) {
        if self.strategy != BufferOverflowStrategy::DropOldest {
            return;
        }
        while self.records.len() > self.max_size {
            let Some(head) = self.records.pop_front() else {
                break;
            };
            self.first_position += 1;
            if !head.unlinked {
                self.linked -= 1;
                self.make_dropped(&head.cursor);
            }
        }
    }

    fn make_dropped(&mut self, cursor: &RecordCursor) {
        self.dropped += 1;
        self.last_dropped = Some(LastDropped {
            record: cursor.record().clone(),
            cipher: cursor.cipher(),
            symbol: cursor.symbol_arc().cloned(),
        });
    }

    /// Appends and returns the persistent position of the new record.
    pub fn add(&mut self, cursor: RecordCursor) -> u64 {
        let position = self.next_position();
        self.records.push_back(Buffered {
            cursor,
            unlinked: false,
        });
        self.linked += 1;
        position
    }

    /// Moves up to `limit` linked records into `sink`; unlinked ones are discarded on the way.
    pub fn retrieve<S: RecordSink + ?Sized>(&mut self, sink: &mut S, limit: usize) -> usize {
        let mut count = 0;
        while count < limit && sink.has_capacity() {
            let Some(head) = self.records.pop_front() else {
                break;
            };
            self.first_position += 1;
            if !head.unlinked {
                self.linked -= 1;
                sink.append(&head.cursor);
                count += 1;
            }
        }
        count
    }

    /// Clears the blocked flag once the consumer has drained everything.
    pub fn unblock(&mut self) -> bool {
        if self.blocked && !self.has_next() {
            self.blocked = false;
            return true;
        }
        false
    }

    /// Drops records rejected by `keep`. With `compact` the records are
    /// removed outright, otherwise they are unlinked and persistent
    /// positions stay valid.
    pub fn refilter(&mut self, compact: bool, mut keep: impl FnMut(&RecordCursor) -> bool) -> usize {
        let mut removed = 0;
        if compact {
            let before = self.records.len();
            self.records.retain(|r| !r.unlinked && keep(&r.cursor));
            removed = before - self.records.len();
            self.linked = self.records.len();
        } else {
            for r in self.records.iter_mut().filter(|r| !r.unlinked) {
                if !keep(&r.cursor) {
                    r.unlinked = true;
                    removed += 1;
                }
            }
            self.linked -= removed;
        }
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = &RecordCursor> {
        self.records.iter().filter(|r| !r.unlinked).map(|r| &r.cursor)
    }

    pub fn clear(&mut self) {
        self.first_position += self.records.len() as u64;
        self.records.clear();
        self.linked = 0;
        self.blocked = false;
    }

    /// Logs accumulated drops at most once per `interval` and returns the
    /// number reported, which the caller adds to its counters.
    pub fn log_drops(&mut self, agent: i32, contract: &str, codec: &SymbolCodec, interval: Duration) -> u64 {
        if self.dropped == 0 {
            return 0;
        }
        let now = Instant::now();
        if self.last_log.is_some_and(|t| now.duration_since(t) < interval) {
            return 0;
        }
        self.last_log = Some(now);
        let last = self
            .last_dropped
            .as_ref()
            .map(|d| format!("{}:{}", codec.decode_pair(d.cipher, d.symbol.as_deref()), d.record.name()))
            .unwrap_or_default();
        tracing::error!(
            agent,
            dropped = self.dropped,
            last_record = %last,
            "{contract} buffer overflow"
        );
        std::mem::take(&mut self.dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lithos_events::{DataScheme, RecordBuffer};

    fn cursors(n: usize) -> Vec<RecordCursor> {
        let scheme = DataScheme::builder().record("Trade", 2, 0).build();
        let trade = scheme.record(0).unwrap().clone();
        (0..n)
            .map(|i| {
                let mut c = scheme.cursor(&trade, "IBM");
                c.set_int(0, i as i32);
                c
            })
            .collect()
    }

    fn values(sink: &RecordBuffer) -> Vec<i32> {
        sink.iter().map(|c| c.int(0)).collect()
    }

    #[test]
    fn positions_survive_retrieval() {
        let mut buf = AgentBuffer::new(10, BufferOverflowStrategy::DropOldest);
        let positions: Vec<u64> = cursors(3).into_iter().map(|c| buf.add(c)).collect();
        assert_eq!(positions, vec![BASE, BASE + 1, BASE + 2]);
        let mut sink = RecordBuffer::new();
        assert_eq!(buf.retrieve(&mut sink, 1), 1);
        assert!(!buf.is_in_buffer(BASE));
        assert!(buf.is_in_buffer(BASE + 2));
        assert_eq!(buf.next_position(), BASE + 3);
    }

    #[test]
    fn drop_oldest_keeps_the_tail() {
        let mut buf = AgentBuffer::new(2, BufferOverflowStrategy::DropOldest);
        for c in cursors(5) {
            buf.add(c);
            buf.drop_old_records();
        }
        let mut sink = RecordBuffer::new();
        buf.retrieve(&mut sink, usize::MAX);
        assert_eq!(values(&sink), vec![3, 4]);
        let codec = SymbolCodec::new();
        assert_eq!(buf.log_drops(2, "Stream", &codec, Duration::ZERO), 3);
        assert_eq!(buf.log_drops(2, "Stream", &codec, Duration::ZERO), 0);
    }

    #[test]
    fn drop_newest_keeps_the_head() {
        let mut buf = AgentBuffer::new(2, BufferOverflowStrategy::DropNewest);
        for c in cursors(5) {
            if !buf.drop_new_record(&c) {
                buf.add(c);
            }
        }
        let mut sink = RecordBuffer::new();
        buf.retrieve(&mut sink, usize::MAX);
        assert_eq!(values(&sink), vec![0, 1]);
    }

    #[test]
    fn block_until_drained() {
        let mut buf = AgentBuffer::new(1, BufferOverflowStrategy::Block);
        let mut all = cursors(2).into_iter();
        assert!(!buf.block_new_record());
        buf.add(all.next().unwrap());
        assert!(buf.block_new_record());
        assert!(buf.is_blocked());
        assert!(!buf.unblock());
        buf.retrieve(&mut RecordBuffer::new(), usize::MAX);
        assert!(buf.unblock());
        assert!(!buf.is_blocked());
    }

    #[test]
    fn unlinked_records_are_skipped_but_keep_positions() {
        let mut buf = AgentBuffer::new(10, BufferOverflowStrategy::DropOldest);
        for c in cursors(4) {
            buf.add(c);
        }
        assert_eq!(buf.refilter(false, |c| c.int(0) % 2 == 0), 2);
        assert!(buf.is_in_buffer(BASE + 3));
        assert!(buf.has_next());
        let mut sink = RecordBuffer::new();
        assert_eq!(buf.retrieve(&mut sink, usize::MAX), 2);
        assert_eq!(values(&sink), vec![0, 2]);
    }

    #[test]
    fn compacting_refilter_removes_records() {
        let mut buf = AgentBuffer::new(10, BufferOverflowStrategy::DropOldest);
        for c in cursors(4) {
            buf.add(c);
        }
        buf.refilter(true, |c| c.int(0) > 1);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn has_next_tracks_linked_records() {
        let mut buf = AgentBuffer::new(2, BufferOverflowStrategy::DropOldest);
        assert!(!buf.has_next());
        for c in cursors(4) {
            buf.add(c);
            buf.drop_old_records();
        }
        buf.refilter(false, |c| c.int(0) != 3);
        assert!(buf.has_next());
        let mut sink = RecordBuffer::new();
        assert_eq!(buf.retrieve(&mut sink, 1), 1);
        assert!(!buf.has_next());
        assert_eq!(buf.len(), 1);
        buf.add(cursors(1).remove(0));
        buf.refilter(true, |_| false);
        assert!(!buf.has_next());
        assert!(buf.is_empty());
    }
}
