use crate::agent::{Agent, AgentLocal};
use crate::collector::Collector;
use crate::contract::Contract;
use crate::layout::*;
use lithos_events::RecordSink;

impl Collector {
    /// Moves pending data of `agent` into `sink`. Returns true when more
    /// data remains because the sink ran out of capacity.
    pub(crate) fn retrieve_data<S: RecordSink + ?Sized>(&self, agent: &Agent, sink: &mut S) -> bool {
        if agent.is_closed() {
            return false;
        }
        #[cfg(feature = "perf")]
        let t0 = lithos_perf_recorder::now_ns();
        let mut local = agent.local.lock();
        if agent.is_closed() {
            return false;
        }
        let more = match self.contract {
            Contract::Ticker => self.retrieve_ticker(agent, &mut local, sink),
            Contract::Stream | Contract::History => {
                let n = local.buffer.retrieve(sink, usize::MAX);
                self.management.counters().count_retrieved(n as u64);
                if local.buffer.unblock() {
                    agent.unblocked.notify_all();
                }
                local.buffer.has_next()
            }
        };
        drop(local);
        #[cfg(feature = "perf")]
        self.perf.lock().since(lithos_perf_recorder::PerfStage::Retrieve, t0);
        more
    }

    /// Alternates snapshot and update queues: every snapshot record earns the
    /// update queue one record of balance, up to `retrieve_batch_size`.
    fn retrieve_ticker<S: RecordSink + ?Sized>(&self, agent: &Agent, local: &mut AgentLocal, sink: &mut S) -> bool {
        let batch = self.config().retrieve_batch_size.max(1);
        let asub = agent.sub();
        let mut fetch = |aindex: usize, sink: &mut S| {
            let Some(storage) = &self.storage else {
                return false;
            };
            let Some(mut cursor) = storage.get(asub.get_int(aindex + KEY), asub.get_int(aindex + RID)) else {
                return false;
            };
            if agent.has_attachment_strategy() {
                cursor.set_attachment(asub.get_obj(aindex, ATTACHMENT));
            }
            sink.append(&cursor);
            true
        };
        let mut total = 0;
        let mut more_snapshot = !local.snapshot_queue.is_empty();
        let mut more_update = !local.update_queue.is_empty();
        let mut no_capacity = false;
        while more_snapshot || more_update {
            if !more_update {
                local.snapshot_retrieved = 0;
            }
            if local.snapshot_retrieved < batch && more_snapshot {
                let limit = batch - local.snapshot_retrieved;
                let r = local
                    .snapshot_queue
                    .retrieve_for_ticker(&asub, sink, limit, SNAPSHOT_QUEUE, &mut fetch);
                local.snapshot_retrieved += r.count;
                total += r.count;
                if r.no_capacity {
                    no_capacity = true;
                    break;
                }
                more_snapshot = !local.snapshot_queue.is_empty();
            }
            if !more_snapshot {
                local.snapshot_retrieved = batch;
            }
            if local.snapshot_retrieved > 0 && more_update {
                let limit = local.snapshot_retrieved;
                let r = local
                    .update_queue
                    .retrieve_for_ticker(&asub, sink, limit, UPDATE_QUEUE, &mut fetch);
                local.snapshot_retrieved -= r.count;
                total += r.count;
                if r.no_capacity {
                    no_capacity = true;
                    break;
                }
                more_update = !local.update_queue.is_empty();
            }
        }
        self.management.counters().count_retrieved(total as u64);
        no_capacity
    }
}
