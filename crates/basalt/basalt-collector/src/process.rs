//! Incoming data distribution.
//!
//! Phase 1 runs under the global lock and only reads the total chains: for
//! every incoming record it queues `(agent, row)` pairs into a
//! [`Distribution`]. Phase 2 runs under each agent's local lock alone and
//! moves the queued records into that agent's queues or buffer. Agents
//! whose lock is busy are retried on later spins; agents whose buffer is
//! full under `Block` are parked until a consumer drains them.

use crate::agent::{Agent, AgentLocal};
use crate::collector::{Collector, GlobalState};
use crate::contract::Contract;
use crate::distribution::Distribution;
use crate::keys;
use crate::layout::*;
use crate::notification::Notification;
use crate::CollectorError;
use basalt_matrix::SubMatrix;
use lithos_events::RecordBuffer;
use parking_lot::MutexGuard;
use std::sync::Arc;
use std::time::Duration;

impl Collector {
    /// Distributes `source` to every agent subscribed to its records.
    ///
    /// Under `Block` this waits for consumers to drain full buffers. Records
    /// queued before a failing record are still delivered; the failure is
    /// then recorded as fatal and the collector stays halted until cleared.
    pub fn process_data(&self, source: &mut RecordBuffer) -> Result<(), CollectorError> {
        self.management.check_halted()?;
        #[cfg(feature = "perf")]
        let t0 = lithos_perf_recorder::now_ns();
        let mut dist = self.distributions.lock().pop().unwrap_or_default();
        let mut notification = self.notifications.lock().pop().unwrap_or_default();
        let result = self.process_with(&mut dist, &mut notification, source);
        dist.clear();
        notification.notify_listeners();
        self.distributions.lock().push(dist);
        self.notifications.lock().push(notification);
        #[cfg(feature = "perf")]
        self.perf
            .lock()
            .since(lithos_perf_recorder::PerfStage::ProcessDataTotal, t0);
        if let Err(e) = &result {
            self.management.set_fatal_error(e);
        }
        result
    }

    fn process_with(&self, dist: &mut Distribution, notification: &mut Notification, source: &mut RecordBuffer) -> Result<(), CollectorError> {
        loop {
            #[cfg(feature = "perf")]
            let t0 = lithos_perf_recorder::now_ns();
            let built = {
                let global = self.global.lock();
                dist.start(global.agents.len(), self.config().distribution_bucket);
                self.build_distribution(&global, dist, source)
            };
            #[cfg(feature = "perf")]
            self.perf
                .lock()
                .since(lithos_perf_recorder::PerfStage::DistributionBuild, t0);
            self.distribute(dist, notification, source)?;
            self.management
                .counters()
                .count_distribution(dist.incoming, dist.outgoing, dist.spins);
            dist.clear();
            if !built? {
                return Ok(());
            }
        }
    }

    /// Phase 1. Returns true when the distribution filled up before `source` ran out.
    fn build_distribution(&self, global: &GlobalState, dist: &mut Distribution, source: &mut RecordBuffer) -> Result<bool, CollectorError> {
        let tsub = self.total();
        let has_time = self.contract.has_time();
        while dist.has_capacity() {
            let Some(position) = source.next_position() else {
                return Ok(false);
            };
            let Some(cursor) = source.cursor_at(position) else {
                continue;
            };
            dist.incoming += 1;
            let rid = self.rid_of(cursor.record())?;
            let key = keys::resolve_key(&self.mapper, cursor.record(), cursor.cipher(), cursor.symbol())?;
            if key == 0 {
                continue;
            }
            let tindex = tsub.get_index(key, rid);
            if tindex == 0 {
                continue;
            }
            let mut nagent = tsub.get_int(tindex + NEXT_AGENT);
            if nagent <= 0 {
                continue;
            }
            let time = cursor.time();
            if has_time {
                let time_total = tsub.get_long(tindex + TIME_TOTAL);
                if time < time_total {
                    continue;
                }
                if let Some(history) = &self.history {
                    history.put(key, rid, cursor, time_total)?;
                }
            }
            if let Some(storage) = &self.storage {
                if !storage.put(key, rid, cursor)? {
                    continue;
                }
            }
            let mut nindex = tsub.get_int(tindex + NEXT_INDEX) as usize;
            let mut hops = 0;
            while nagent > 0 {
                let agent = global.agent(nagent).ok_or(CollectorError::ChainCorrupted {
                    what: "chain references a missing agent",
                    agent: nagent,
                    key,
                    rid,
                })?;
                hops += 1;
                if hops > global.agents.len() {
                    return Err(CollectorError::ChainCorrupted {
                        what: "chain is cyclic",
                        agent: nagent,
                        key,
                        rid,
                    });
                }
                let nsub = agent.sub();
                if !has_time || time >= nsub.get_long(nindex + TIME_SUB) {
                    dist.add(agent, nindex, position);
                }
                nagent = nsub.get_int(nindex + NEXT_AGENT);
                nindex = nsub.get_int(nindex + NEXT_INDEX) as usize;
            }
        }
        Ok(source.has_next())
    }

    /// Phase 2, including the waits for blocked agents.
    fn distribute(&self, dist: &mut Distribution, notification: &mut Notification, source: &RecordBuffer) -> Result<(), CollectorError> {
        loop {
            while dist.has_affected() {
                self.process_data_update(dist, notification, source)?;
            }
            #[cfg(feature = "perf")]
            let t0 = lithos_perf_recorder::now_ns();
            notification.notify_listeners();
            #[cfg(feature = "perf")]
            self.perf.lock().since(lithos_perf_recorder::PerfStage::Notify, t0);
            if !dist.has_blocked() {
                return Ok(());
            }
            dist.enqueue_blocked()?;
        }
    }

    /// One spin over the affected agents. Up to `n * (spins - 1) / spins`
    /// busy agents are skipped for a later spin; the rest are waited for.
    fn process_data_update(&self, dist: &mut Distribution, notification: &mut Notification, source: &RecordBuffer) -> Result<(), CollectorError> {
        dist.spins += 1;
        let affected = dist.take_affected();
        let max_spins = self.config().max_distribution_spins.max(1);
        let mut ignorable = affected.len() * (max_spins - 1) / max_spins;
        let mut skipped = Vec::new();
        for n in affected {
            let Some(agent) = dist.agent(n).cloned() else {
                continue;
            };
            let local = if ignorable == 0 {
                agent.local.lock()
            } else {
                match agent.local.try_lock() {
                    Some(local) => local,
                    None => {
                        ignorable -= 1;
                        skipped.push(n);
                        continue;
                    }
                }
            };
            #[cfg(feature = "perf")]
            let t0 = lithos_perf_recorder::now_ns();
            let block = self.update_agent(dist, n, &agent, local, notification, source)?;
            #[cfg(feature = "perf")]
            self.perf.lock().since(lithos_perf_recorder::PerfStage::AgentUpdate, t0);
            dist.finish_agent(n, block);
        }
        dist.set_affected(skipped);
        Ok(())
    }

    /// Returns the entry to resume from when the agent's buffer blocked, or `0`.
    fn update_agent(
        &self,
        dist: &mut Distribution,
        n: usize,
        agent: &Arc<Agent>,
        mut local: MutexGuard<'_, AgentLocal>,
        notification: &mut Notification,
        source: &RecordBuffer,
    ) -> Result<usize, CollectorError> {
        while local.buffer.is_blocked() && !agent.is_closed() {
            agent.unblocked.wait(&mut local);
        }
        if agent.is_closed() {
            return Ok(0);
        }
        let before = self.notification_bits(&local);
        let block = match self.contract {
            Contract::Ticker => {
                self.update_ticker(dist, n, agent, &mut local);
                0
            }
            Contract::Stream | Contract::History => self.update_buffer(dist, n, agent, &mut local, source),
        };
        let after = self.notification_bits(&local);
        notification.add(agent, !before & after);
        if self.contract.uses_buffer() {
            let interval = Duration::from_secs(self.config().buffer_overflow_log_interval_secs);
            let dropped = local
                .buffer
                .log_drops(agent.number(), self.contract.name(), self.scheme.codec(), interval);
            self.management.counters().count_dropped(dropped);
        }
        Ok(block)
    }

    /// Row of entry `entry` in the agent's current matrix, or `0` if it was
    /// unsubscribed since phase 1.
    fn current_row(dist: &Distribution, entry: usize, osub: Option<&Arc<SubMatrix>>, asub: &SubMatrix, dirty: bool) -> usize {
        let index = dist.entry_index(entry);
        if !dirty {
            return index;
        }
        let Some(osub) = osub else {
            return 0;
        };
        let aindex = asub.get_index(osub.get_int(index + KEY), osub.get_int(index + RID));
        if aindex == 0 || asub.get_int(aindex + PREV_AGENT) == 0 {
            return 0;
        }
        aindex
    }

    fn update_ticker(&self, dist: &mut Distribution, n: usize, agent: &Agent, local: &mut AgentLocal) {
        let asub = agent.sub();
        let osub = dist.sub(n).cloned();
        let dirty = agent.sub_mod_count() != dist.sub_mod_count(n);
        let mut entry = dist.first_entry(n);
        while entry != 0 {
            let aindex = Self::current_row(dist, entry, osub.as_ref(), &asub, dirty);
            entry = dist.next_entry(entry);
            if aindex == 0 {
                continue;
            }
            let snapshot = asub.get_int(aindex + SNAPSHOT_QUEUE);
            if snapshot == QUEUE_BIT {
                // first value for a row that was waiting for one
                local.snapshot_queue.link_to_queue(&asub, aindex, SNAPSHOT_QUEUE, true);
            } else if snapshot != 0 && asub.get_int(aindex + UPDATE_QUEUE) & QUEUE_BIT == 0 {
                asub.set_int(aindex + SNAPSHOT_QUEUE, snapshot | QUEUE_BIT);
            }
            local.update_queue.link_to_queue(&asub, aindex, UPDATE_QUEUE, true);
            dist.outgoing += 1;
        }
    }

    fn update_buffer(&self, dist: &mut Distribution, n: usize, agent: &Agent, local: &mut AgentLocal, source: &RecordBuffer) -> usize {
        let asub = agent.sub();
        let osub = dist.sub(n).cloned();
        let dirty = agent.sub_mod_count() != dist.sub_mod_count(n);
        let has_time = self.contract.has_time();
        let with_attachment = agent.has_attachment_strategy();
        let mut entry = dist.first_entry(n);
        while entry != 0 {
            let aindex = Self::current_row(dist, entry, osub.as_ref(), &asub, dirty);
            let position = dist.entry_position(entry);
            let current = entry;
            entry = dist.next_entry(entry);
            if aindex == 0 {
                continue;
            }
            let Some(cursor) = source.cursor_at(position) else {
                continue;
            };
            let time = cursor.time();
            if has_time && time < asub.get_long(aindex + TIME_SUB) {
                continue;
            }
            if local.buffer.block_new_record() {
                return current;
            }
            if local.buffer.drop_new_record(cursor) {
                continue;
            }
            let mut out = cursor.clone();
            out.set_attachment(if with_attachment { asub.get_obj(aindex, ATTACHMENT) } else { None });
            let buffered_at = local.buffer.add(out);
            if has_time {
                if time < asub.get_long(aindex + TIME_KNOWN) {
                    asub.set_long(aindex + TIME_KNOWN, time);
                }
                asub.set_long(aindex + LAST_RECORD, buffered_at as i64);
            }
            local.buffer.drop_old_records();
            dist.outgoing += 1;
        }
        0
    }
}
