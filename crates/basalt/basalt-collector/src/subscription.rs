//! Subscription changes: weaving agent rows into the per-(key, rid) chains
//! rooted at the total row.
//!
//! Every change runs in parts. A part holds the global lock and the agent's
//! local lock for at most `subscription_bucket` items and reports
//! `NOTIFY_SUB_HAS_MORE` when the caller must come back for the rest.
//! Distributors and listeners are notified once, after the last part, with
//! no lock held.

use crate::agent::{Agent, AgentLocal};
use crate::collector::{Collector, GlobalState};
use crate::contract::Contract;
use crate::keys;
use crate::layout::*;
use crate::CollectorError;
use basalt_matrix::hashing::MAX_SHIFT;
use basalt_matrix::SubMatrix;
use lithos_events::{RecordBuffer, RecordCursor, RecordSink};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionKind {
    Add,
    Remove,
    Set,
}

impl Collector {
    /// Rejects items that can never be subscribed, before any of them is applied.
    pub(crate) fn validate_subscription(&self, source: &RecordBuffer) -> Result<(), CollectorError> {
        for cursor in source.iter() {
            let record = cursor.record();
            self.rid_of(record)?;
            keys::resolve_key(&self.mapper, record, cursor.cipher(), cursor.symbol())?;
            if self.contract.has_time() && !cursor.is_remove() && !record.has_time() {
                return Err(CollectorError::RecordWithoutTime {
                    record: record.name().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Runs one part of a subscription change. Returns the accumulated
    /// notify bits while more parts are needed and `0` once done.
    pub(crate) fn subscription_part(
        &self,
        agent: &Arc<Agent>,
        source: &mut RecordBuffer,
        kind: SubscriptionKind,
        notify: u32,
    ) -> Result<u32, CollectorError> {
        if agent.is_closed() {
            return Ok(0);
        }
        self.management.check_halted()?;
        #[cfg(feature = "perf")]
        let t0 = lithos_perf_recorder::now_ns();
        let notify = {
            let mut global = self.global.lock();
            global.start_batch(self.config().subscription_bucket, notify);
            if !agent.is_closed() {
                let mut local = agent.local.lock();
                let result = self.subscription_part_locked(&mut global, agent, &mut local, source, kind);
                self.check_fatal(result)?;
            }
            global.done_batch()
        };
        #[cfg(feature = "perf")]
        self.perf
            .lock()
            .since(lithos_perf_recorder::PerfStage::SubscriptionChange, t0);
        if notify & NOTIFY_SUB_HAS_MORE != 0 {
            return Ok(notify);
        }
        self.management.counters().count_subscription_change();
        self.notify_sub_change(agent, notify);
        Ok(0)
    }

    fn subscription_part_locked(
        &self,
        g: &mut GlobalState,
        agent: &Agent,
        local: &mut AgentLocal,
        source: &mut RecordBuffer,
        kind: SubscriptionKind,
    ) -> Result<(), CollectorError> {
        // counted before any row moves so that an aborted part still invalidates distributions
        agent.inc_sub_mod_count();
        if self.perform_setter_cleanup_steps(g, agent, local)? {
            return Ok(());
        }
        match kind {
            SubscriptionKind::Add => {
                while let Some(cursor) = source.next() {
                    if cursor.is_remove() {
                        self.remove_sub_internal(g, agent, local, cursor)?;
                    } else if agent.accepts(cursor) {
                        self.add_sub_internal(g, agent, local, cursor, false)?;
                    }
                    if g.take_step() {
                        return Ok(());
                    }
                }
            }
            SubscriptionKind::Remove => {
                while let Some(cursor) = source.next() {
                    self.remove_sub_internal(g, agent, local, cursor)?;
                    if g.take_step() {
                        return Ok(());
                    }
                }
            }
            SubscriptionKind::Set => {
                if g.notify & NOTIFY_SUB_PHASE2 == 0 {
                    while let Some(cursor) = source.next() {
                        if agent.accepts(cursor) {
                            self.add_sub_internal(g, agent, local, cursor, true)?;
                            if g.take_step() {
                                return Ok(());
                            }
                        }
                    }
                    g.notify |= NOTIFY_SUB_PHASE2;
                    local.setter_cleanup = Some(agent.sub().len());
                    if self.perform_setter_cleanup_steps(g, agent, local)? {
                        return Ok(());
                    }
                }
            }
        }
        self.subscription_change_complete(g, agent, local)
    }

    /// Second phase of a set: unmarks rows added by it and removes the rest.
    /// Returns true when the bucket ran out first.
    fn perform_setter_cleanup_steps(&self, g: &mut GlobalState, agent: &Agent, local: &mut AgentLocal) -> Result<bool, CollectorError> {
        let Some(mut index) = local.setter_cleanup else {
            return Ok(false);
        };
        let asub = agent.sub();
        let step = asub.step();
        while index > step {
            index -= step;
            let pagent = asub.get_int(index + PREV_AGENT);
            if pagent == 0 {
                continue;
            }
            if pagent & PREV_AGENT_SET != 0 {
                asub.set_int(index + PREV_AGENT, pagent & PREV_AGENT_MASK);
            } else {
                self.remove_existing(g, agent, local, &asub, index, pagent)?;
                if g.take_step() {
                    local.setter_cleanup = Some(index);
                    return Ok(true);
                }
            }
        }
        local.setter_cleanup = None;
        Ok(false)
    }

    /// Subscription time and `HISTORY_SUB_FLAGS` for an item.
    fn trim_sub_time(&self, cursor: &RecordCursor) -> (i64, i32) {
        if !self.contract.has_time() {
            return (0, 0);
        }
        let time = cursor.time();
        let trimmed = time.max(self.config().min_history_time);
        (trimmed, if trimmed == time { 0 } else { HISTORY_SUB_SNIP })
    }

    pub(crate) fn add_sub_internal(
        &self,
        g: &mut GlobalState,
        agent: &Agent,
        local: &mut AgentLocal,
        cursor: &RecordCursor,
        set_sub: bool,
    ) -> Result<(), CollectorError> {
        // grow first so that running out of memory leaves the chains untouched
        self.rehash_agent_if_needed(g, agent, local)?;
        self.rehash_total_if_needed()?;

        let record = cursor.record();
        let rid = self.rid_of(record)?;
        if self.contract.has_time() && !record.has_time() {
            return Err(CollectorError::RecordWithoutTime {
                record: record.name().to_string(),
            });
        }
        let key = keys::add_key(&self.mapper, record, cursor.cipher(), cursor.symbol())?;
        let (time, flags) = self.trim_sub_time(cursor);
        let has_time = self.contract.has_time();

        // reserve both rows; keys are published only once the row is consistent
        let asub = agent.sub();
        let aindex = asub.add_index_begin(key, rid)?;
        let new_sub = asub.get_int(aindex + PREV_AGENT) == 0;
        let was_payload = asub.is_payload(aindex);
        let tsub = self.total();
        let tindex = tsub.add_index_begin(key, rid)?;

        let mut same_sub = false;
        let mut time_prev = i64::MAX;
        let mut total_added = false;
        let mut reduce = false;
        let mut time_total = 0;

        if let Some(strategy) = agent.attachment_strategy() {
            let attachment = if new_sub || set_sub {
                cursor.attachment().cloned()
            } else {
                strategy.update_attachment(asub.get_obj(aindex, ATTACHMENT), cursor, false)
            };
            asub.set_obj(aindex, ATTACHMENT, attachment);
        }

        if new_sub {
            if has_time {
                asub.set_int(aindex + HISTORY_SUB_FLAGS, flags);
                asub.set_long(aindex + TIME_SUB, time);
                asub.set_long(aindex + TIME_KNOWN, i64::MAX);
                asub.set_long(aindex + LAST_RECORD, 0);
            }
            // insert right after the total row
            let nagent = tsub.get_int(tindex + NEXT_AGENT);
            let nindex = tsub.get_int(tindex + NEXT_INDEX);
            asub.set_int(aindex + NEXT_AGENT, nagent);
            asub.set_int(aindex + NEXT_INDEX, nindex);
            asub.set_int(aindex + PREV_AGENT, TOTAL_AGENT_INDEX);
            tsub.set_int(tindex + NEXT_AGENT, agent.number());
            tsub.set_int(tindex + NEXT_INDEX, aindex as i32);
            if nagent > 0 {
                let nsub = self.matrix_of(g, nagent, key, rid)?;
                let nindex = nindex as usize;
                let nset = nsub.get_int(nindex + PREV_AGENT) & PREV_AGENT_SET;
                nsub.set_int(nindex + PREV_AGENT, agent.number() | nset);
                if has_time && time < tsub.get_long(tindex + TIME_TOTAL) {
                    tsub.set_long(tindex + TIME_TOTAL, time);
                    total_added = true;
                }
            } else {
                if has_time {
                    tsub.set_long(tindex + TIME_TOTAL, time);
                }
                if nagent == 0 {
                    tsub.update_added_payload(rid)?;
                }
                total_added = true;
            }
            if !was_payload {
                asub.update_added_payload(rid)?;
            }
        } else if has_time {
            time_prev = asub.get_long(aindex + TIME_SUB);
            let flags_prev = asub.get_int(aindex + HISTORY_SUB_FLAGS) & HISTORY_SUB_SNIP;
            asub.set_int(aindex + HISTORY_SUB_FLAGS, flags);
            same_sub = time == time_prev && flags == flags_prev;
            if !same_sub {
                asub.set_long(aindex + TIME_SUB, time);
                time_total = tsub.get_long(tindex + TIME_TOTAL);
                if time < time_total {
                    tsub.set_long(tindex + TIME_TOTAL, time);
                    total_added = true;
                } else if time > time_prev && time_prev == time_total {
                    reduce = true;
                }
            }
        } else {
            same_sub = true;
        }

        tracing::trace!(
            agent = agent.number(),
            key,
            rid,
            time,
            set_sub,
            new_sub,
            total_added,
            reduce,
            same_sub,
            "add_sub_internal"
        );

        if set_sub {
            let pagent = asub.get_int(aindex + PREV_AGENT);
            asub.set_int(aindex + PREV_AGENT, pagent | PREV_AGENT_SET);
            if same_sub {
                return Ok(());
            }
        }

        asub.add_index_complete(aindex, key, rid);
        tsub.add_index_complete(tindex, key, rid);

        if total_added {
            self.total_record_added(g, key, rid, time);
        }
        if reduce {
            self.reduce_time_total(g, key, rid, &tsub, tindex, time_total)?;
        }
        self.enqueue_added_record(g, local, &asub, aindex, time_prev);
        Ok(())
    }

    pub(crate) fn remove_sub_internal(
        &self,
        g: &mut GlobalState,
        agent: &Agent,
        local: &mut AgentLocal,
        cursor: &RecordCursor,
    ) -> Result<(), CollectorError> {
        let record = cursor.record();
        let rid = self.rid_of(record)?;
        let key = keys::resolve_key(&self.mapper, record, cursor.cipher(), cursor.symbol())?;
        if key == 0 {
            return Ok(());
        }
        let asub = agent.sub();
        let aindex = asub.get_index(key, rid);
        if aindex == 0 {
            return Ok(());
        }
        let pagent = asub.get_int(aindex + PREV_AGENT) & PREV_AGENT_MASK;
        if pagent == 0 {
            return Ok(());
        }
        if let Some(strategy) = agent.attachment_strategy() {
            let attachment = strategy.update_attachment(asub.get_obj(aindex, ATTACHMENT), cursor, true);
            let keep = attachment.is_some();
            asub.set_obj(aindex, ATTACHMENT, attachment);
            if keep {
                return Ok(());
            }
        }
        self.remove_existing(g, agent, local, &asub, aindex, pagent)
    }

    /// Unlinks a subscribed row from its chain.
    pub(crate) fn remove_existing(
        &self,
        g: &mut GlobalState,
        agent: &Agent,
        local: &mut AgentLocal,
        asub: &SubMatrix,
        aindex: usize,
        pagent: i32,
    ) -> Result<(), CollectorError> {
        let pagent = pagent & PREV_AGENT_MASK;
        let key = asub.get_int(aindex + KEY);
        let rid = asub.get_int(aindex + RID);
        let psub = self.matrix_of(g, pagent, key, rid)?;
        let pindex = psub.get_index(key, rid);
        if pindex == 0 {
            return Err(CollectorError::ChainCorrupted {
                what: "previous agent misses entry",
                agent: pagent,
                key,
                rid,
            });
        }
        let nagent = asub.get_int(aindex + NEXT_AGENT);
        let nindex = asub.get_int(aindex + NEXT_INDEX);
        psub.set_int(pindex + NEXT_AGENT, nagent);
        psub.set_int(pindex + NEXT_INDEX, nindex);
        asub.set_int(aindex + NEXT_AGENT, 0);
        asub.set_int(aindex + NEXT_INDEX, 0);
        asub.set_int(aindex + PREV_AGENT, 0);
        let mut total_removed = false;
        if nagent > 0 {
            let nsub = self.matrix_of(g, nagent, key, rid)?;
            let nindex = nindex as usize;
            let nset = nsub.get_int(nindex + PREV_AGENT) & PREV_AGENT_SET;
            nsub.set_int(nindex + PREV_AGENT, pagent | nset);
        } else if pagent == TOTAL_AGENT_INDEX {
            total_removed = true;
        }
        if self.contract.has_time() {
            let more_agents = nagent > 0 || pagent != TOTAL_AGENT_INDEX;
            self.remove_existing_time(g, asub, aindex, key, rid, &psub, pindex, more_agents)?;
        }
        local.reduced_sub = true;
        if !asub.is_payload(aindex) {
            asub.update_removed_payload(rid)?;
        }
        tracing::trace!(agent = agent.number(), key, rid, total_removed, "remove_sub_internal");
        if total_removed && self.total_record_removed(g, key, rid)? {
            psub.update_removed_payload(rid)?;
        }
        self.dequeue_removed_record(local, asub, aindex);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn remove_existing_time(
        &self,
        g: &mut GlobalState,
        asub: &SubMatrix,
        aindex: usize,
        key: i32,
        rid: i32,
        psub: &SubMatrix,
        pindex: usize,
        more_agents: bool,
    ) -> Result<(), CollectorError> {
        if more_agents {
            let tsub = self.total();
            let tindex = tsub.get_index(key, rid);
            if tindex == 0 || tsub.get_int(tindex + NEXT_AGENT) <= 0 {
                return Err(CollectorError::ChainCorrupted {
                    what: "total misses entry",
                    agent: TOTAL_AGENT_INDEX,
                    key,
                    rid,
                });
            }
            let time_total = tsub.get_long(tindex + TIME_TOTAL);
            if asub.get_long(aindex + TIME_SUB) == time_total {
                self.reduce_time_total(g, key, rid, &tsub, tindex, time_total)?;
            }
        } else {
            psub.set_long(pindex + TIME_TOTAL, i64::MAX);
        }
        asub.set_int(aindex + HISTORY_SUB_FLAGS, 0);
        asub.set_long(aindex + TIME_SUB, i64::MAX);
        asub.set_long(aindex + TIME_KNOWN, i64::MAX);
        Ok(())
    }

    /// Recomputes `TIME_TOTAL` as the chain minimum after the agent holding
    /// the old minimum moved up or left.
    fn reduce_time_total(
        &self,
        g: &mut GlobalState,
        key: i32,
        rid: i32,
        tsub: &SubMatrix,
        tindex: usize,
        time_total: i64,
    ) -> Result<(), CollectorError> {
        let mut nagent = tsub.get_int(tindex + NEXT_AGENT);
        let mut nindex = tsub.get_int(tindex + NEXT_INDEX) as usize;
        let mut time = i64::MAX;
        while nagent > 0 {
            let nsub = self.matrix_of(g, nagent, key, rid)?;
            let t = nsub.get_long(nindex + TIME_SUB);
            if t < time {
                if t <= time_total {
                    return Ok(());
                }
                time = t;
            }
            nagent = nsub.get_int(nindex + NEXT_AGENT);
            nindex = nsub.get_int(nindex + NEXT_INDEX) as usize;
        }
        tsub.set_long(tindex + TIME_TOTAL, time);
        self.total_record_added(g, key, rid, time);
        Ok(())
    }

    fn total_record_added(&self, g: &mut GlobalState, key: i32, rid: i32, time: i64) {
        for d in self.distributors.read().iter() {
            if d.add_sub(key, rid, time) {
                g.notify |= NOTIFY_SUB_TOTAL_ADDED;
            }
        }
    }

    /// Returns true when the total row stops being payload.
    fn total_record_removed(&self, g: &mut GlobalState, key: i32, rid: i32) -> Result<bool, CollectorError> {
        for d in self.distributors.read().iter() {
            if d.remove_sub(key, rid) {
                g.notify |= NOTIFY_SUB_TOTAL_REMOVED;
            }
        }
        if let Some(storage) = &self.storage {
            storage.remove(key, rid)?;
        }
        if let Some(history) = &self.history {
            history.remove(key, rid)?;
        }
        Ok(true)
    }

    /// Makes known data of a new or changed subscription reach the agent.
    /// `time_prev` is the row's subscription time before this change, or
    /// `i64::MAX` for a new row.
    fn enqueue_added_record(&self, g: &mut GlobalState, local: &mut AgentLocal, asub: &SubMatrix, aindex: usize, time_prev: i64) {
        match self.contract {
            Contract::Ticker => {
                let mut snapshot = asub.get_int(aindex + SNAPSHOT_QUEUE);
                if snapshot & QUEUE_BIT != 0 {
                    return;
                }
                if asub.get_int(aindex + UPDATE_QUEUE) & QUEUE_BIT != 0 {
                    snapshot = 0;
                }
                // QUEUE_BIT alone marks a row waiting for its first value
                asub.set_int(aindex + SNAPSHOT_QUEUE, snapshot | QUEUE_BIT);
                let key = asub.get_int(aindex + KEY);
                let rid = asub.get_int(aindex + RID);
                if !self.storage.as_ref().is_some_and(|s| s.contains(key, rid)) {
                    return;
                }
                if local.snapshot_queue.link_to_queue(asub, aindex, SNAPSHOT_QUEUE, true) {
                    g.notify |= NOTIFY_SUB_SNAPSHOT_AVAILABLE;
                }
                if local.update_queue.link_to_queue(asub, aindex, UPDATE_QUEUE, true) {
                    g.notify |= NOTIFY_SUB_DATA_AVAILABLE;
                }
            }
            Contract::History => {
                let time_sub = asub.get_long(aindex + TIME_SUB);
                self.unlink_buffered(local, asub, aindex, time_sub);
                asub.set_long(aindex + TIME_KNOWN, i64::MAX);
                // records at or after time_prev already reached the agent live
                let had_next = local.buffer.has_next();
                if self.replay_history(local, asub, aindex, time_sub, time_prev) > 0 && !had_next {
                    g.notify |= NOTIFY_SUB_DATA_AVAILABLE;
                }
            }
            Contract::Stream => {}
        }
    }

    fn dequeue_removed_record(&self, local: &mut AgentLocal, asub: &SubMatrix, aindex: usize) {
        match self.contract {
            Contract::Ticker => {
                if asub.get_int(aindex + SNAPSHOT_QUEUE) & QUEUE_BIT == 0 && asub.get_int(aindex + UPDATE_QUEUE) & QUEUE_BIT != 0 {
                    asub.set_int(aindex + SNAPSHOT_QUEUE, 0);
                }
                local.snapshot_queue.reset_queue_bit(asub, aindex, SNAPSHOT_QUEUE);
                local.update_queue.reset_queue_bit(asub, aindex, UPDATE_QUEUE);
                local.snapshot_queue.cleanup_empty_head_for_ticker(asub, aindex, SNAPSHOT_QUEUE);
                local.update_queue.cleanup_empty_head_for_ticker(asub, aindex, UPDATE_QUEUE);
            }
            Contract::History => self.unlink_buffered(local, asub, aindex, i64::MAX),
            Contract::Stream => {}
        }
    }

    /// History: buffers the stored records of the row's item with
    /// `from <= time < until` and returns how many were added.
    ///
    /// The buffer may grow past its size under `Block`; distribution then
    /// waits for the consumer as usual.
    fn replay_history(&self, local: &mut AgentLocal, asub: &SubMatrix, aindex: usize, from: i64, until: i64) -> usize {
        let Some(history) = &self.history else {
            return 0;
        };
        let key = asub.get_int(aindex + KEY);
        let rid = asub.get_int(aindex + RID);
        let attachment = asub.get_obj(aindex, ATTACHMENT);
        let mut added = 0;
        for mut cursor in history.range(key, rid, from, until) {
            if local.buffer.drop_new_record(&cursor) {
                continue;
            }
            let time = cursor.time();
            cursor.set_attachment(attachment.clone());
            let buffered_at = local.buffer.add(cursor);
            if time < asub.get_long(aindex + TIME_KNOWN) {
                asub.set_long(aindex + TIME_KNOWN, time);
            }
            asub.set_long(aindex + LAST_RECORD, buffered_at as i64);
            local.buffer.drop_old_records();
            added += 1;
        }
        if added > 0 {
            tracing::trace!(key, rid, from, added, "replay_history");
        }
        added
    }

    /// History: unlinks buffered records of the row's item older than `time`.
    fn unlink_buffered(&self, local: &mut AgentLocal, asub: &SubMatrix, aindex: usize, time: i64) {
        let position = asub.get_long(aindex + LAST_RECORD) as u64;
        if position != 0 && local.buffer.is_in_buffer(position) {
            let key = asub.get_int(aindex + KEY);
            let rid = asub.get_int(aindex + RID);
            local
                .buffer
                .refilter(false, |c| c.time() >= time || !self.is_item(c, key, rid));
        }
        if time == i64::MAX {
            asub.set_long(aindex + LAST_RECORD, 0);
        }
    }

    pub(crate) fn is_item(&self, cursor: &RecordCursor, key: i32, rid: i32) -> bool {
        cursor.record().id() == rid
            && keys::resolve_key(&self.mapper, cursor.record(), cursor.cipher(), cursor.symbol()).is_ok_and(|k| k == key)
    }

    fn subscription_change_complete(&self, g: &mut GlobalState, agent: &Agent, local: &mut AgentLocal) -> Result<(), CollectorError> {
        if !local.reduced_sub {
            return Ok(());
        }
        self.rehash_agent_if_needed(g, agent, local)?;
        self.rehash_total_if_needed()?;
        self.refilter_buffer(agent, local);
        self.mapper.rehash_if_needed()?;
        local.reduced_sub = false;
        Ok(())
    }

    /// Drops buffered records the agent is no longer subscribed to.
    fn refilter_buffer(&self, agent: &Agent, local: &mut AgentLocal) {
        let compact = match self.contract {
            Contract::Ticker => return,
            Contract::Stream => true,
            Contract::History => false,
        };
        let asub = agent.sub();
        let has_time = self.contract.has_time();
        let removed = local.buffer.refilter(compact, |c| {
            let Ok(key) = keys::resolve_key(&self.mapper, c.record(), c.cipher(), c.symbol()) else {
                return false;
            };
            let index = if key == 0 { 0 } else { asub.get_index(key, c.record().id()) };
            index != 0
                && asub.get_int(index + PREV_AGENT) != 0
                && (!has_time || c.time() >= asub.get_long(index + TIME_SUB))
        });
        if removed > 0 {
            tracing::debug!(agent = agent.number(), removed, "buffer refiltered after subscription change");
        }
        if local.buffer.unblock() {
            agent.unblocked.notify_all();
        }
    }

    pub(crate) fn rehash_agent_if_needed(&self, g: &GlobalState, agent: &Agent, local: &mut AgentLocal) -> Result<(), CollectorError> {
        if agent.sub().need_rehash(MAX_SHIFT) {
            self.rehash_agent(g, agent, local)?;
        }
        Ok(())
    }

    /// Moves the agent to a resized matrix and repoints its chain neighbours
    /// and queues at the new row offsets.
    pub(crate) fn rehash_agent(&self, g: &GlobalState, agent: &Agent, local: &mut AgentLocal) -> Result<(), CollectorError> {
        #[cfg(feature = "perf")]
        let t0 = lithos_perf_recorder::now_ns();
        let osub = agent.sub();
        let asub = Arc::new(osub.rehash(MAX_SHIFT)?);
        for aindex in asub.rows() {
            let pagent = asub.get_int(aindex + PREV_AGENT) & PREV_AGENT_MASK;
            if pagent == 0 {
                continue;
            }
            let key = asub.get_int(aindex + KEY);
            let rid = asub.get_int(aindex + RID);
            let psub = self.matrix_of(g, pagent, key, rid)?;
            let pindex = psub.get_index(key, rid);
            if pindex == 0 {
                return Err(CollectorError::ChainCorrupted {
                    what: "previous agent misses entry",
                    agent: pagent,
                    key,
                    rid,
                });
            }
            psub.set_int(pindex + NEXT_INDEX, aindex as i32);
        }
        if self.contract.uses_queues() {
            local.snapshot_queue.fix_queue(&asub, &osub, SNAPSHOT_QUEUE);
            local.update_queue.fix_queue(&asub, &osub, UPDATE_QUEUE);
        }
        tracing::debug!(
            agent = agent.number(),
            shift = asub.shift(),
            payload = asub.payload_size(),
            "agent subscription rehashed"
        );
        agent.set_sub(asub);
        #[cfg(feature = "perf")]
        self.perf.lock().since(lithos_perf_recorder::PerfStage::Rehash, t0);
        Ok(())
    }

    pub(crate) fn rehash_total_if_needed(&self) -> Result<(), CollectorError> {
        let tsub = self.total();
        if tsub.need_rehash(MAX_SHIFT) {
            let rehashed = tsub.rehash(MAX_SHIFT)?;
            tracing::debug!(shift = rehashed.shift(), payload = rehashed.payload_size(), "total subscription rehashed");
            *self.total.write() = Arc::new(rehashed);
        }
        Ok(())
    }

    /// Runs one part of closing `agent`. Returns the accumulated notify bits
    /// while more parts are needed and `0` once the agent is gone.
    pub(crate) fn close_part(
        &self,
        agent: &Arc<Agent>,
        sink: Option<&mut (dyn RecordSink + '_)>,
        notify: u32,
    ) -> Result<u32, CollectorError> {
        self.management.check_halted()?;
        let notify = {
            let mut global = self.global.lock();
            if global.agent(agent.number()).is_none_or(|a| !Arc::ptr_eq(a, agent)) {
                return Ok(0);
            }
            global.start_batch(self.config().subscription_bucket, notify);
            let mut local = agent.local.lock();
            let result = self.close_part_locked(&mut global, agent, &mut local, sink);
            self.check_fatal(result)?;
            global.done_batch()
        };
        if notify & NOTIFY_SUB_HAS_MORE != 0 {
            return Ok(notify);
        }
        self.notify_sub_change(agent, notify);
        Ok(0)
    }

    fn close_part_locked(
        &self,
        g: &mut GlobalState,
        agent: &Agent,
        local: &mut AgentLocal,
        mut sink: Option<&mut (dyn RecordSink + '_)>,
    ) -> Result<(), CollectorError> {
        agent.inc_sub_mod_count();
        let asub = agent.sub();
        let step = asub.step();
        let mut index = local.close_cursor.unwrap_or(asub.len());
        while index > step {
            index -= step;
            let pagent = asub.get_int(index + PREV_AGENT);
            if pagent == 0 {
                continue;
            }
            if let Some(sink) = sink.as_deref_mut() {
                self.examine_row_data(agent, &asub, index, sink);
            }
            self.remove_existing(g, agent, local, &asub, index, pagent)?;
            if g.take_step() {
                local.close_cursor = Some(index);
                return Ok(());
            }
        }
        local.close_cursor = Some(0);
        local.buffer.clear();
        local.snapshot_queue.clear();
        local.update_queue.clear();
        local.reduced_sub = false;
        asub.close()?;
        self.mapper.dec_max_counter(self.scheme.record_count())?;
        if let Some(slot) = g.agents.get_mut(agent.number() as usize) {
            *slot = None;
        }
        self.rehash_total_if_needed()?;
        self.mapper.rehash_if_needed()?;
        tracing::debug!(agent = agent.number(), name = agent.name(), "agent closed");
        Ok(())
    }

    /// Ticker: appends the stored value of a row about to be removed.
    fn examine_row_data(&self, agent: &Agent, asub: &SubMatrix, aindex: usize, sink: &mut dyn RecordSink) {
        let Some(storage) = &self.storage else {
            return;
        };
        let Some(mut cursor) = storage.get(asub.get_int(aindex + KEY), asub.get_int(aindex + RID)) else {
            return;
        };
        if agent.has_attachment_strategy() {
            cursor.set_attachment(asub.get_obj(aindex, ATTACHMENT));
        }
        if sink.has_capacity() {
            sink.append(&cursor);
        }
    }
}
