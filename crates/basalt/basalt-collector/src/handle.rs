use crate::agent::Agent;
use crate::collector::Collector;
use crate::keys;
use crate::layout::*;
use crate::listener::RecordListener;
use crate::notification::{SNAPSHOT_BIT, UPDATE_BIT};
use crate::subscription::SubscriptionKind;
use crate::CollectorError;
use basalt_config::BufferOverflowStrategy;
use lithos_events::{DataRecord, RecordBuffer, RecordSink};
use std::sync::Arc;

/// A consumer's view of a collector.
///
/// Subscription changes are applied in buckets; each call loops until the
/// whole source is consumed, releasing the global lock between buckets.
#[derive(Clone)]
pub struct AgentHandle {
    collector: Arc<Collector>,
    agent: Arc<Agent>,
}

impl AgentHandle {
    pub(crate) fn new(collector: Arc<Collector>, agent: Arc<Agent>) -> Self {
        Self { collector, agent }
    }

    pub fn number(&self) -> i32 {
        self.agent.number()
    }

    pub fn name(&self) -> &str {
        self.agent.name()
    }

    pub fn collector(&self) -> &Arc<Collector> {
        &self.collector
    }

    pub fn is_closed(&self) -> bool {
        self.agent.is_closed()
    }

    /// Subscribes to every record of `source`. Records flagged `remove` are unsubscribed instead.
    pub fn add_subscription(&self, source: &mut RecordBuffer) -> Result<(), CollectorError> {
        self.change(source, SubscriptionKind::Add)
    }

    pub fn remove_subscription(&self, source: &mut RecordBuffer) -> Result<(), CollectorError> {
        self.change(source, SubscriptionKind::Remove)
    }

    /// Replaces the whole subscription with `source`.
    pub fn set_subscription(&self, source: &mut RecordBuffer) -> Result<(), CollectorError> {
        self.change(source, SubscriptionKind::Set)
    }

    fn change(&self, source: &mut RecordBuffer, kind: SubscriptionKind) -> Result<(), CollectorError> {
        self.collector.validate_subscription(source)?;
        let mut notify = 0;
        loop {
            notify = self
                .collector
                .subscription_part(&self.agent, source, kind, notify)?;
            if notify == 0 {
                return Ok(());
            }
        }
    }

    /// Unsubscribes everything and releases the agent's number.
    pub fn close(&self) -> Result<(), CollectorError> {
        self.close_inner(None)
    }

    /// Like [`AgentHandle::close`], first appending the stored value of each
    /// subscribed item to `sink` (ticker only).
    pub fn close_and_examine(&self, sink: &mut dyn RecordSink) -> Result<(), CollectorError> {
        self.close_inner(Some(sink))
    }

    fn close_inner(&self, mut sink: Option<&mut (dyn RecordSink + '_)>) -> Result<(), CollectorError> {
        if !self.agent.mark_closed() {
            return Ok(());
        }
        {
            let _local = self.agent.local.lock();
            self.agent.unblocked.notify_all();
        }
        let mut notify = 0;
        loop {
            notify = self
                .collector
                .close_part(&self.agent, sink.as_deref_mut(), notify)?;
            if notify == 0 {
                return Ok(());
            }
        }
    }

    /// Moves pending data into `sink`; returns true when more remains.
    pub fn retrieve_data<S: RecordSink + ?Sized>(&self, sink: &mut S) -> bool {
        self.collector.retrieve_data(&self.agent, sink)
    }

    /// Fires immediately when data is already pending.
    pub fn set_snapshot_listener(&self, listener: Option<Arc<dyn RecordListener>>) {
        self.agent.set_snapshot_listener(listener);
        if self.pending_bits() & SNAPSHOT_BIT != 0 {
            self.agent.notify_snapshot_listener();
        }
    }

    /// Fires immediately when data is already pending.
    pub fn set_data_listener(&self, listener: Option<Arc<dyn RecordListener>>) {
        self.agent.set_data_listener(listener);
        if self.pending_bits() & UPDATE_BIT != 0 {
            self.agent.notify_data_listener();
        }
    }

    fn pending_bits(&self) -> u32 {
        let local = self.agent.local.lock();
        self.collector.notification_bits(&local)
    }

    pub fn set_max_buffer_size(&self, size: usize) {
        let mut local = self.agent.local.lock();
        local.buffer.set_max_size(size);
        self.agent.unblocked.notify_all();
    }

    pub fn set_buffer_overflow_strategy(&self, strategy: BufferOverflowStrategy) {
        let mut local = self.agent.local.lock();
        local.buffer.set_strategy(strategy);
        self.agent.unblocked.notify_all();
    }

    /// Records buffered for this agent (stream and history).
    pub fn buffered(&self) -> usize {
        self.agent.local.lock().buffer.len()
    }

    /// Racy read of this agent's subscription.
    pub fn is_subscribed(&self, record: &Arc<DataRecord>, cipher: i32, symbol: Option<&str>, time: i64) -> bool {
        let Ok(rid) = self.collector.rid_of(record) else {
            return false;
        };
        let key = match keys::resolve_key(self.collector.mapper(), record, cipher, symbol) {
            Ok(0) | Err(_) => return false,
            Ok(key) => key,
        };
        let asub = self.agent.sub();
        let index = asub.get_volatile_index(key, rid);
        index != 0
            && asub.get_int(index + PREV_AGENT) != 0
            && (!self.collector.contract().has_time() || time >= asub.get_long(index + TIME_SUB))
    }

    pub fn subscription_size(&self) -> usize {
        self.agent.sub().payload_size()
    }

    /// Appends this agent's subscription, attachments included; returns
    /// true if the sink filled up first.
    pub fn examine_subscription<S: RecordSink + ?Sized>(&self, sink: &mut S) -> bool {
        let asub = self.agent.sub();
        let has_time = self.collector.contract().has_time();
        for index in asub.rows() {
            let key = asub.get_int(index + KEY);
            if key == 0 || asub.get_int(index + PREV_AGENT) == 0 {
                continue;
            }
            let time = if has_time { asub.get_long(index + TIME_SUB) } else { 0 };
            let attachment = asub.get_obj(index, ATTACHMENT);
            let Some(cursor) = self
                .collector
                .subscription_cursor(key, asub.get_int(index + RID), time, attachment)
            else {
                continue;
            };
            if !sink.has_capacity() {
                return true;
            }
            sink.append(&cursor);
        }
        false
    }
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle").field("agent", &self.agent).finish()
    }
}
