use crate::agent::{Agent, AgentBuilder, AgentLocal};
use crate::contract::Contract;
use crate::distribution::Distribution;
use crate::distributor::Distributor;
use crate::handle::AgentHandle;
use crate::history_storage::HistoryStorage;
use crate::keys;
use crate::layout::*;
use crate::management::Management;
use crate::notification::{Notification, SNAPSHOT_BIT, UPDATE_BIT};
use crate::ticker_storage::TickerStorage;
use crate::CollectorError;
use basalt_config::CollectorConfig;
use basalt_matrix::hashing::MAX_SHIFT;
use basalt_matrix::{Mapper, SubMatrix};
use lithos_events::{Attachment, DataRecord, DataScheme, RecordBuffer, RecordCursor, RecordSink};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

#[cfg(feature = "perf")]
use lithos_perf_recorder::PerfRecorder;

/// State guarded by the global lock.
pub(crate) struct GlobalState {
    /// Indexed by agent number; slots 0 and 1 are never used.
    pub agents: Vec<Option<Arc<Agent>>>,
    pub last_agent_index: usize,
    /// Subscription steps left in the current bucket.
    pub steps_remaining: usize,
    /// `NOTIFY_SUB_*` bits gathered by the current subscription change.
    pub notify: u32,
}

impl GlobalState {
    pub fn start_batch(&mut self, bucket: usize, notify: u32) {
        self.steps_remaining = bucket.max(1);
        self.notify = notify & !NOTIFY_SUB_HAS_MORE;
    }

    pub fn done_batch(&self) -> u32 {
        if self.steps_remaining == 0 {
            self.notify | NOTIFY_SUB_HAS_MORE
        } else {
            self.notify
        }
    }

    /// Uses up one step; true when the bucket is exhausted.
    pub fn take_step(&mut self) -> bool {
        self.steps_remaining = self.steps_remaining.saturating_sub(1);
        self.steps_remaining == 0
    }

    pub fn agent(&self, number: i32) -> Option<&Arc<Agent>> {
        self.agents.get(usize::try_from(number).ok()?)?.as_ref()
    }
}

/// Routes records from distributors to the agents subscribed to them.
///
/// Lock order is global, then one agent's local lock. The total matrix,
/// ticker and history storage, mapper and distributor list are leaves
/// taken under either.
pub struct Collector {
    pub(crate) contract: Contract,
    pub(crate) scheme: Arc<DataScheme>,
    pub(crate) mapper: Arc<Mapper>,
    pub(crate) management: Management,
    pub(crate) global: Mutex<GlobalState>,
    pub(crate) total: RwLock<Arc<SubMatrix>>,
    pub(crate) storage: Option<TickerStorage>,
    pub(crate) history: Option<HistoryStorage>,
    pub(crate) distributors: RwLock<Vec<Arc<dyn Distributor>>>,
    pub(crate) distributions: Mutex<Vec<Distribution>>,
    pub(crate) notifications: Mutex<Vec<Notification>>,
    #[cfg(feature = "perf")]
    pub(crate) perf: Mutex<PerfRecorder>,
}

impl Collector {
    pub fn new(contract: Contract, scheme: Arc<DataScheme>, config: CollectorConfig) -> Result<Arc<Self>, CollectorError> {
        config.validate()?;
        let mapper = Arc::new(Mapper::new()?);
        let record_count = scheme.record_count();
        mapper.inc_max_counter(record_count)?;
        let total = SubMatrix::new(mapper.clone(), contract.total_layout(), record_count, 0, 0, MAX_SHIFT)?;
        let storage = match contract {
            Contract::Ticker => Some(TickerStorage::new(mapper.clone(), record_count)?),
            _ => None,
        };
        let history = match contract {
            Contract::History => Some(HistoryStorage::new(mapper.clone(), record_count)?),
            _ => None,
        };
        tracing::info!(%contract, records = record_count, "collector created");
        Ok(Arc::new(Self {
            contract,
            scheme,
            mapper,
            management: Management::new(config),
            global: Mutex::new(GlobalState {
                agents: vec![None; MIN_AGENT_INDEX as usize],
                last_agent_index: TOTAL_AGENT_INDEX as usize,
                steps_remaining: 0,
                notify: 0,
            }),
            total: RwLock::new(Arc::new(total)),
            storage,
            history,
            distributors: RwLock::new(Vec::new()),
            distributions: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
            #[cfg(feature = "perf")]
            perf: Mutex::new(PerfRecorder::new()),
        }))
    }

    pub fn contract(&self) -> Contract {
        self.contract
    }

    pub fn scheme(&self) -> &Arc<DataScheme> {
        &self.scheme
    }

    pub fn mapper(&self) -> &Arc<Mapper> {
        &self.mapper
    }

    pub fn management(&self) -> &Management {
        &self.management
    }

    pub(crate) fn config(&self) -> &CollectorConfig {
        self.management.config()
    }

    #[cfg(feature = "perf")]
    pub fn perf(&self) -> &Mutex<PerfRecorder> {
        &self.perf
    }

    pub(crate) fn total(&self) -> Arc<SubMatrix> {
        self.total.read().clone()
    }

    /// Registers an agent under the lowest free number after the last one handed out.
    pub fn create_agent(self: &Arc<Self>, builder: AgentBuilder) -> Result<AgentHandle, CollectorError> {
        self.management.check_halted()?;
        let mut global = self.global.lock();
        let number = Self::find_free_number(&mut global);
        let record_count = self.scheme.record_count();
        let layout = self.contract.agent_layout(builder.has_attachment_strategy());
        let sub = SubMatrix::new(self.mapper.clone(), layout, record_count, 0, 0, MAX_SHIFT)?;
        self.mapper.inc_max_counter(record_count)?;
        let agent = Arc::new(Agent::new(number as i32, sub, builder, self.config()));
        global.agents[number] = Some(agent.clone());
        global.last_agent_index = number;
        tracing::debug!(agent = number, name = agent.name(), contract = %self.contract, "agent created");
        Ok(AgentHandle::new(self.clone(), agent))
    }

    fn find_free_number(global: &mut GlobalState) -> usize {
        let min = MIN_AGENT_INDEX as usize;
        let len = global.agents.len();
        let start = (global.last_agent_index + 1).max(min);
        let free = (start..len)
            .chain(min..start.min(len))
            .find(|&i| global.agents[i].is_none());
        match free {
            Some(i) => i,
            None => {
                global.agents.resize(len.max(min) * 2, None);
                len.max(min)
            }
        }
    }

    /// Adds an upstream feed. It is told about every (key, rid) already in
    /// the total subscription before this returns.
    pub fn add_distributor(&self, distributor: Arc<dyn Distributor>) -> Result<(), CollectorError> {
        let mut notify = false;
        {
            let _global = self.global.lock();
            let tsub = self.total();
            for index in tsub.rows() {
                if tsub.get_int(index + NEXT_AGENT) <= 0 {
                    continue;
                }
                let time = if self.contract.has_time() { tsub.get_long(index + TIME_TOTAL) } else { 0 };
                notify |= distributor.add_sub(tsub.get_int(index + KEY), tsub.get_int(index + RID), time);
            }
            self.distributors.write().push(distributor.clone());
        }
        if notify {
            distributor.notify_added();
        }
        Ok(())
    }

    pub fn remove_distributor(&self, distributor: &Arc<dyn Distributor>) {
        let _global = self.global.lock();
        self.distributors.write().retain(|d| !Arc::ptr_eq(d, distributor));
    }

    pub(crate) fn rid_of(&self, record: &Arc<DataRecord>) -> Result<i32, CollectorError> {
        if self.scheme.owns(record) {
            Ok(record.id())
        } else {
            Err(CollectorError::UnknownRecord {
                rid: record.id(),
                name: record.name().to_string(),
            })
        }
    }

    /// Matrix of chain member `number`; the total is agent 1.
    pub(crate) fn matrix_of(&self, global: &GlobalState, number: i32, key: i32, rid: i32) -> Result<Arc<SubMatrix>, CollectorError> {
        if number == TOTAL_AGENT_INDEX {
            return Ok(self.total());
        }
        global
            .agent(number)
            .map(|a| a.sub())
            .ok_or(CollectorError::ChainCorrupted {
                what: "chain references a missing agent",
                agent: number,
                key,
                rid,
            })
    }

    /// Records `err` as fatal when it leaves shared state inconsistent.
    pub(crate) fn check_fatal<T>(&self, result: Result<T, CollectorError>) -> Result<T, CollectorError> {
        if let Err(e) = &result {
            if e.is_fatal() {
                self.management.set_fatal_error(e);
            }
        }
        result
    }

    pub(crate) fn notify_sub_change(&self, agent: &Agent, notify: u32) {
        if notify & (NOTIFY_SUB_TOTAL_ADDED | NOTIFY_SUB_TOTAL_REMOVED) != 0 {
            let distributors = self.distributors.read().clone();
            for d in &distributors {
                if notify & NOTIFY_SUB_TOTAL_ADDED != 0 {
                    d.notify_added();
                }
                if notify & NOTIFY_SUB_TOTAL_REMOVED != 0 {
                    d.notify_removed();
                }
            }
        }
        if notify & NOTIFY_SUB_SNAPSHOT_AVAILABLE != 0 {
            agent.notify_snapshot_listener();
        }
        if notify & NOTIFY_SUB_DATA_AVAILABLE != 0 {
            agent.notify_data_listener();
        }
    }

    /// Listener bits that are currently due for `local`'s agent.
    pub(crate) fn notification_bits(&self, local: &AgentLocal) -> u32 {
        match self.contract {
            Contract::Ticker => {
                if !local.snapshot_queue.is_empty() {
                    SNAPSHOT_BIT | UPDATE_BIT
                } else if !local.update_queue.is_empty() {
                    UPDATE_BIT
                } else {
                    0
                }
            }
            Contract::Stream | Contract::History => {
                if local.buffer.has_next() {
                    UPDATE_BIT
                } else {
                    0
                }
            }
        }
    }

    /// Cursor describing a subscription row.
    pub(crate) fn subscription_cursor(&self, key: i32, rid: i32, time: i64, attachment: Option<Attachment>) -> Option<RecordCursor> {
        let record = self.scheme.record(rid)?;
        let (cipher, symbol) = keys::decode_key(&self.mapper, key);
        let mut cursor = RecordCursor::new(record.clone(), cipher, symbol);
        if record.has_time() {
            cursor.set_time(time);
        }
        cursor.set_attachment(attachment);
        Some(cursor)
    }

    // ---- racy reads ----

    /// True when some agent is subscribed to the item at `time` or earlier.
    pub fn is_subscribed(&self, record: &Arc<DataRecord>, cipher: i32, symbol: Option<&str>, time: i64) -> bool {
        let Ok(rid) = self.rid_of(record) else {
            return false;
        };
        let key = match keys::resolve_key(&self.mapper, record, cipher, symbol) {
            Ok(0) | Err(_) => return false,
            Ok(key) => key,
        };
        let tsub = self.total();
        let index = tsub.get_volatile_index(key, rid);
        index != 0
            && tsub.get_int(index + NEXT_AGENT) > 0
            && (!self.contract.has_time() || time >= tsub.get_long(index + TIME_TOTAL))
    }

    /// Number of distinct subscribed (symbol, record) pairs.
    pub fn subscription_size(&self) -> usize {
        self.total().payload_size()
    }

    /// Appends the total subscription; returns true if the sink filled up first.
    pub fn examine_subscription<S: RecordSink + ?Sized>(&self, sink: &mut S) -> bool {
        let tsub = self.total();
        for index in tsub.rows() {
            let key = tsub.get_int(index + KEY);
            if key == 0 || tsub.get_int(index + NEXT_AGENT) <= 0 {
                continue;
            }
            let time = if self.contract.has_time() { tsub.get_long(index + TIME_TOTAL) } else { 0 };
            let Some(cursor) = self.subscription_cursor(key, tsub.get_int(index + RID), time, None) else {
                continue;
            };
            if !sink.has_capacity() {
                return true;
            }
            sink.append(&cursor);
        }
        false
    }

    /// Agents subscribed to the item, in chain order, with their subscription times.
    pub fn subscribers(&self, record: &Arc<DataRecord>, cipher: i32, symbol: Option<&str>) -> Result<Vec<(i32, i64)>, CollectorError> {
        let rid = self.rid_of(record)?;
        let key = keys::resolve_key(&self.mapper, record, cipher, symbol)?;
        if key == 0 {
            return Ok(Vec::new());
        }
        let global = self.global.lock();
        let tsub = self.total();
        let tindex = tsub.get_index(key, rid);
        if tindex == 0 {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        let mut nagent = tsub.get_int(tindex + NEXT_AGENT);
        let mut nindex = tsub.get_int(tindex + NEXT_INDEX) as usize;
        while nagent > 0 {
            let nsub = self.matrix_of(&global, nagent, key, rid)?;
            let time = if self.contract.has_time() { nsub.get_long(nindex + TIME_SUB) } else { 0 };
            out.push((nagent, time));
            if out.len() > global.agents.len() {
                return Err(CollectorError::ChainCorrupted {
                    what: "chain is cyclic",
                    agent: nagent,
                    key,
                    rid,
                });
            }
            nagent = nsub.get_int(nindex + NEXT_AGENT);
            nindex = nsub.get_int(nindex + NEXT_INDEX) as usize;
        }
        Ok(out)
    }

    /// Minimum subscription time over all agents, if the item is subscribed.
    pub fn total_time(&self, record: &Arc<DataRecord>, cipher: i32, symbol: Option<&str>) -> Option<i64> {
        let rid = self.rid_of(record).ok()?;
        let key = keys::resolve_key(&self.mapper, record, cipher, symbol)
            .ok()
            .filter(|&k| k != 0)?;
        let tsub = self.total();
        let index = tsub.get_volatile_index(key, rid);
        (index != 0 && tsub.get_int(index + NEXT_AGENT) > 0).then(|| tsub.get_long(index + TIME_TOTAL))
    }

    // ---- ticker storage ----

    /// Ticker only: whether a value is stored for the item.
    pub fn is_available(&self, record: &Arc<DataRecord>, cipher: i32, symbol: Option<&str>) -> bool {
        self.get_data(record, cipher, symbol).is_some()
    }

    /// Ticker only: the stored value of the item.
    pub fn get_data(&self, record: &Arc<DataRecord>, cipher: i32, symbol: Option<&str>) -> Option<RecordCursor> {
        let storage = self.storage.as_ref()?;
        let rid = self.rid_of(record).ok()?;
        match keys::resolve_key(&self.mapper, record, cipher, symbol) {
            Ok(0) | Err(_) => None,
            Ok(key) => storage.get(key, rid),
        }
    }

    /// Ticker only: appends every stored value; returns true if the sink filled up first.
    pub fn examine_data<S: RecordSink + ?Sized>(&self, sink: &mut S) -> bool {
        self.storage.as_ref().is_some_and(|s| s.examine(sink))
    }

    /// History only: stored records of the item at or after `from`, oldest first.
    pub fn get_history(&self, record: &Arc<DataRecord>, cipher: i32, symbol: Option<&str>, from: i64) -> Vec<RecordCursor> {
        let Some(history) = &self.history else {
            return Vec::new();
        };
        let Ok(rid) = self.rid_of(record) else {
            return Vec::new();
        };
        match keys::resolve_key(&self.mapper, record, cipher, symbol) {
            Ok(0) | Err(_) => Vec::new(),
            Ok(key) => history.range(key, rid, from, i64::MAX),
        }
    }

    /// Ticker only: forgets stored values. Queued agents keep their rows
    /// queued but have nothing to deliver until a new value arrives.
    pub fn remove_data(&self, source: &mut RecordBuffer) -> Result<(), CollectorError> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        self.management.check_halted()?;
        let _global = self.global.lock();
        while let Some(cursor) = source.next() {
            let rid = self.rid_of(cursor.record())?;
            let key = keys::resolve_key(&self.mapper, cursor.record(), cursor.cipher(), cursor.symbol())?;
            if key != 0 {
                self.check_fatal(storage.remove(key, rid).map_err(CollectorError::from))?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("contract", &self.contract)
            .field("subscription_size", &self.subscription_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(slots: usize) -> GlobalState {
        GlobalState {
            agents: vec![None; slots],
            last_agent_index: TOTAL_AGENT_INDEX as usize,
            steps_remaining: 0,
            notify: 0,
        }
    }

    #[test]
    fn batch_reports_has_more_only_when_exhausted() {
        let mut g = state(2);
        g.start_batch(2, NOTIFY_SUB_HAS_MORE | NOTIFY_SUB_TOTAL_ADDED);
        assert_eq!(g.notify, NOTIFY_SUB_TOTAL_ADDED);
        assert!(!g.take_step());
        assert_eq!(g.done_batch(), NOTIFY_SUB_TOTAL_ADDED);
        assert!(g.take_step());
        assert_eq!(g.done_batch(), NOTIFY_SUB_TOTAL_ADDED | NOTIFY_SUB_HAS_MORE);
    }

    #[test]
    fn free_numbers_grow_the_table() {
        let mut g = state(MIN_AGENT_INDEX as usize);
        assert_eq!(Collector::find_free_number(&mut g), 2);
        assert_eq!(g.agents.len(), 4);
        g.last_agent_index = 2;
        assert_eq!(Collector::find_free_number(&mut g), 3);
    }
}
