#![allow(dead_code)]

//! Shared fixtures for the collector integration tests.

use basalt_collector::{AgentBuilder, AgentHandle, Collector, Contract, Distributor};
use basalt_config::CollectorConfig;
use lithos_events::{DataRecord, DataScheme, RecordBuffer, RecordCursor};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// `Quote` (2 ints) and `Trade` (timed, value in int 2).
pub fn scheme() -> Arc<DataScheme> {
    DataScheme::builder()
        .record("Quote", 2, 0)
        .timed_record("Trade", 3, 0)
        .build()
}

pub fn collector(contract: Contract) -> Arc<Collector> {
    collector_with(contract, CollectorConfig::default())
}

pub fn collector_with(contract: Contract, config: CollectorConfig) -> Arc<Collector> {
    Collector::new(contract, scheme(), config).unwrap()
}

pub fn agent(collector: &Arc<Collector>, name: &str) -> AgentHandle {
    collector
        .create_agent(AgentBuilder::new().name(name))
        .unwrap()
}

pub fn quote_record(collector: &Collector) -> Arc<DataRecord> {
    collector.scheme().find_record("Quote").unwrap().clone()
}

pub fn trade_record(collector: &Collector) -> Arc<DataRecord> {
    collector.scheme().find_record("Trade").unwrap().clone()
}

pub fn quote(collector: &Collector, symbol: &str, bid: i32) -> RecordCursor {
    let record = quote_record(collector);
    let mut c = collector.scheme().cursor(&record, symbol);
    c.set_int(0, bid);
    c
}

pub fn trade(collector: &Collector, symbol: &str, time: i64, price: i32) -> RecordCursor {
    let record = trade_record(collector);
    let mut c = collector.scheme().cursor(&record, symbol).with_time(time);
    c.set_int(2, price);
    c
}

pub fn quote_sub(collector: &Collector, symbols: &[&str]) -> RecordBuffer {
    RecordBuffer::from_cursors(symbols.iter().map(|s| quote(collector, s, 0)))
}

pub fn trade_sub(collector: &Collector, items: &[(&str, i64)]) -> RecordBuffer {
    RecordBuffer::from_cursors(items.iter().map(|(s, t)| trade(collector, s, *t, 0)))
}

pub fn removal(mut cursor: RecordCursor) -> RecordCursor {
    cursor.set_remove(true);
    cursor
}

pub fn symbol_of(collector: &Collector, cursor: &RecordCursor) -> String {
    collector
        .scheme()
        .codec()
        .decode_pair(cursor.cipher(), cursor.symbol())
}

/// Drains everything pending for `agent`.
pub fn drain(agent: &AgentHandle) -> Vec<RecordCursor> {
    let mut sink = RecordBuffer::new();
    while agent.retrieve_data(&mut sink) {}
    sink.into_vec()
}

/// Distributor that remembers every total subscription change.
#[derive(Default)]
pub struct RecordingDistributor {
    pub added: Mutex<Vec<(i32, i32, i64)>>,
    pub removed: Mutex<Vec<(i32, i32)>>,
    pub notified_added: AtomicUsize,
    pub notified_removed: AtomicUsize,
}

impl RecordingDistributor {
    pub fn added(&self) -> Vec<(i32, i32, i64)> {
        self.added.lock().clone()
    }

    pub fn removed(&self) -> Vec<(i32, i32)> {
        self.removed.lock().clone()
    }
}

impl Distributor for RecordingDistributor {
    fn add_sub(&self, key: i32, rid: i32, time: i64) -> bool {
        self.added.lock().push((key, rid, time));
        true
    }

    fn remove_sub(&self, key: i32, rid: i32) -> bool {
        self.removed.lock().push((key, rid));
        true
    }

    fn notify_added(&self) {
        self.notified_added.fetch_add(1, Ordering::Relaxed);
    }

    fn notify_removed(&self) {
        self.notified_removed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Listener counting its wake-ups.
pub fn counting_listener() -> (Arc<AtomicUsize>, Arc<dyn basalt_collector::RecordListener>) {
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    let listener: Arc<dyn basalt_collector::RecordListener> = Arc::new(move || {
        c.fetch_add(1, Ordering::Relaxed);
    });
    (count, listener)
}
