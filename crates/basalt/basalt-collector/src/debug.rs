//! Consistency checks and forensics over the live subscription state.
//!
//! Every pass takes the global lock, so the report is a consistent view.
//! Problems go to [`DebugLog::warn`]; summaries go to [`DebugLog::info`].

use crate::collector::{Collector, GlobalState};
use crate::contract::Contract;
use crate::layout::*;
use crate::CollectorError;
use basalt_matrix::mapper::is_mapped_key;
use basalt_matrix::{DebugLog, Mapper, SubMatrix};
use lithos_events::VALID_CIPHER;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Counts warnings on their way to the wrapped log.
struct CountingLog<'a> {
    inner: &'a dyn DebugLog,
    warnings: AtomicUsize,
}

impl DebugLog for CountingLog<'_> {
    fn info(&self, msg: &str) {
        self.inner.info(msg);
    }

    fn warn(&self, msg: &str) {
        self.warnings.fetch_add(1, Ordering::Relaxed);
        self.inner.warn(msg);
    }
}

#[derive(Default)]
struct RefCounts {
    payload_ciphers: usize,
    stale_ciphers: usize,
    payload_keys: usize,
    stale_keys: usize,
}

impl Collector {
    /// Cross-checks mapping references and every subscription chain.
    /// Returns the number of problems reported.
    pub fn verify(&self, log: &dyn DebugLog) -> Result<usize, CollectorError> {
        let log = CountingLog {
            inner: log,
            warnings: AtomicUsize::new(0),
        };
        let global = self.global.lock();
        log.info(&format!("Verifying {} collector...", self.contract));
        self.verify_symbol_refs(&global, &log)?;
        self.verify_chains(&global, &log);
        let problems = log.warnings.load(Ordering::Relaxed);
        log.info(&format!("Verification found {problems} problem(s)"));
        Ok(problems)
    }

    fn matrices(&self, global: &GlobalState) -> Vec<(String, Arc<SubMatrix>)> {
        let mut out = vec![("total".to_string(), self.total())];
        for agent in global.agents.iter().flatten() {
            out.push((format!("agent #{} {}", agent.number(), agent.name()), agent.sub()));
        }
        out
    }

    fn verify_symbol_refs(&self, global: &GlobalState, log: &dyn DebugLog) -> Result<(), CollectorError> {
        log.info("Verifying symbol references...");
        let expected = Mapper::new()?;
        let record_count = self.scheme.record_count();
        for (name, sub) in self.matrices(global) {
            expected.inc_max_counter(record_count)?;
            let mut counts = RefCounts::default();
            for index in sub.rows() {
                let key = sub.get_int(index + KEY);
                let rid = sub.get_int(index + RID);
                let payload = sub.is_payload(index);
                if key == 0 {
                    if payload || rid != 0 {
                        log.warn(&format!("{name}: row {index} has no key but payload={payload} rid={rid}"));
                    }
                    continue;
                }
                if key & VALID_CIPHER != 0 {
                    if payload {
                        counts.payload_ciphers += 1;
                    } else {
                        counts.stale_ciphers += 1;
                    }
                } else if is_mapped_key(key) {
                    if payload {
                        counts.payload_keys += 1;
                    } else {
                        counts.stale_keys += 1;
                    }
                    self.expect_reference(&expected, key, &name, index, log)?;
                } else {
                    log.warn(&format!("{name}: invalid key {key:#x} at row {index}"));
                }
            }
            log.info(&format!(
                "{name}: {} payload ciphers, {} stale ciphers, {} payload keys, {} stale keys",
                counts.payload_ciphers, counts.stale_ciphers, counts.payload_keys, counts.stale_keys
            ));
        }
        if let Some(storage) = &self.storage {
            expected.inc_max_counter(record_count)?;
            for (key, _rid) in storage.keys() {
                if is_mapped_key(key) {
                    self.expect_reference(&expected, key, "storage", 0, log)?;
                }
            }
        }
        if let Some(history) = &self.history {
            expected.inc_max_counter(record_count)?;
            for (key, _rid) in history.keys() {
                if is_mapped_key(key) {
                    self.expect_reference(&expected, key, "history", 0, log)?;
                }
            }
        }
        self.mapper.verify(log, &expected);
        Ok(())
    }

    fn expect_reference(&self, expected: &Mapper, key: i32, name: &str, index: usize, log: &dyn DebugLog) -> Result<(), CollectorError> {
        match self.mapper.get_symbol(key) {
            Some(symbol) => {
                let verify_key = expected.add_key(&symbol)?;
                expected.inc_counter(verify_key)?;
            }
            None => log.warn(&format!("{name}: unknown key {key:#x} at row {index}")),
        }
        Ok(())
    }

    fn verify_chains(&self, global: &GlobalState, log: &dyn DebugLog) {
        log.info("Verifying subscription chains...");
        let has_time = self.contract.has_time();
        // (key, rid) -> agents whose rows claim to be subscribed
        let mut subscribed: HashMap<(i32, i32), HashSet<i32>> = HashMap::new();
        for agent in global.agents.iter().flatten() {
            let asub = agent.sub();
            for index in asub.rows() {
                let key = asub.get_int(index + KEY);
                let pagent = asub.get_int(index + PREV_AGENT) & PREV_AGENT_MASK;
                if key == 0 || pagent == 0 {
                    continue;
                }
                if pagent != TOTAL_AGENT_INDEX && global.agent(pagent).is_none() {
                    log.warn(&format!(
                        "Reference to wrong previous agent {pagent} from agent #{} row {index}",
                        agent.number()
                    ));
                }
                subscribed
                    .entry((key, asub.get_int(index + RID)))
                    .or_default()
                    .insert(agent.number());
            }
        }
        let tsub = self.total();
        let mut chains = 0;
        for tindex in tsub.rows() {
            let key = tsub.get_int(tindex + KEY);
            let rid = tsub.get_int(tindex + RID);
            let mut nagent = tsub.get_int(tindex + NEXT_AGENT);
            if key == 0 || nagent <= 0 {
                continue;
            }
            chains += 1;
            let mut expected = subscribed.remove(&(key, rid)).unwrap_or_default();
            let mut nindex = tsub.get_int(tindex + NEXT_INDEX) as usize;
            let mut prev = TOTAL_AGENT_INDEX;
            let mut min_time = i64::MAX;
            let mut hops = 0;
            while nagent > 0 {
                hops += 1;
                if hops > global.agents.len() {
                    log.warn(&format!("Chain of key {key:#x} rid {rid} does not terminate"));
                    break;
                }
                let Some(agent) = global.agent(nagent) else {
                    log.warn(&format!("Invalid NEXT_AGENT {nagent} in chain of key {key:#x} rid {rid}"));
                    break;
                };
                let nsub = agent.sub();
                if nindex == 0 || nindex >= nsub.len() || nsub.get_int(nindex + KEY) != key || nsub.get_int(nindex + RID) != rid {
                    log.warn(&format!(
                        "Reference to wrong row {nindex} of agent #{nagent} in chain of key {key:#x} rid {rid}"
                    ));
                    break;
                }
                let pagent = nsub.get_int(nindex + PREV_AGENT) & PREV_AGENT_MASK;
                if pagent != prev {
                    log.warn(&format!(
                        "Reference to wrong previous agent {pagent} (expected {prev}) at agent #{nagent} key {key:#x} rid {rid}"
                    ));
                }
                if !expected.remove(&nagent) {
                    log.warn(&format!(
                        "Subscription of agent #{nagent} to key {key:#x} rid {rid} is not found, but is in total sub chain"
                    ));
                }
                if has_time {
                    min_time = min_time.min(nsub.get_long(nindex + TIME_SUB));
                }
                prev = nagent;
                nagent = nsub.get_int(nindex + NEXT_AGENT);
                nindex = nsub.get_int(nindex + NEXT_INDEX) as usize;
            }
            for missing in expected {
                log.warn(&format!(
                    "Subscription of agent #{missing} to key {key:#x} rid {rid} is missing in total sub chain"
                ));
            }
            if has_time && tsub.get_long(tindex + TIME_TOTAL) != min_time {
                log.warn(&format!(
                    "Invalid TIME_TOTAL {} (expected {min_time}) for key {key:#x} rid {rid}",
                    tsub.get_long(tindex + TIME_TOTAL)
                ));
            }
        }
        for ((key, rid), agents) in subscribed {
            log.warn(&format!(
                "Found key {key:#x} rid {rid} in agent subs {agents:?} but not in total sub"
            ));
        }
        log.info(&format!("Verified {chains} chains"));
    }

    fn key_of_symbol(&self, symbol: &str) -> i32 {
        match self.scheme.codec().encode(symbol) {
            0 => self.mapper.get_key(symbol),
            cipher => cipher,
        }
    }

    /// Reports how each agent's row for `symbol`/`record` sits in its
    /// queues (ticker) or buffer (stream and history).
    pub fn analyze_queue(&self, log: &dyn DebugLog, symbol: &str, record: &str) {
        let Some(rid) = self.scheme.find_record(record).map(|r| r.id()) else {
            log.warn(&format!("Unknown record {record}"));
            return;
        };
        let key = self.key_of_symbol(symbol);
        if key == 0 {
            log.info(&format!("Symbol {symbol} is not mapped"));
            return;
        }
        let global = self.global.lock();
        for agent in global.agents.iter().flatten() {
            let asub = agent.sub();
            let index = asub.get_index(key, rid);
            if index == 0 {
                continue;
            }
            let local = agent.local.lock();
            let prefix = format!("agent #{} {symbol}:{record} row {index}", agent.number());
            match self.contract {
                Contract::Ticker => {
                    let snapshot = asub.get_int(index + SNAPSHOT_QUEUE);
                    let update = asub.get_int(index + UPDATE_QUEUE);
                    let in_snapshot = local.snapshot_queue.indices(&asub, SNAPSHOT_QUEUE).contains(&index);
                    let in_update = local.update_queue.indices(&asub, UPDATE_QUEUE).contains(&index);
                    log.info(&format!(
                        "{prefix}: snapshot={snapshot:#x} (queued {in_snapshot}) update={update:#x} (queued {in_update})"
                    ));
                }
                Contract::History => {
                    let last = asub.get_long(index + LAST_RECORD) as u64;
                    log.info(&format!(
                        "{prefix}: flags={:#x} time_sub={} time_known={} last_record={last} (in buffer {})",
                        asub.get_int(index + HISTORY_SUB_FLAGS),
                        asub.get_long(index + TIME_SUB),
                        asub.get_long(index + TIME_KNOWN),
                        last != 0 && local.buffer.is_in_buffer(last)
                    ));
                }
                Contract::Stream => {
                    let buffered = local.buffer.iter().filter(|c| self.is_item(c, key, rid)).count();
                    log.info(&format!(
                        "{prefix}: prev={:#x} buffered={buffered}",
                        asub.get_int(index + PREV_AGENT)
                    ));
                }
            }
        }
    }

    /// Lists every row that refers to `symbol`, optionally only for `record`.
    pub fn analyze_symbol_refs(&self, log: &dyn DebugLog, symbol: &str, record: Option<&str>) {
        let rid = match record {
            Some(name) => match self.scheme.find_record(name) {
                Some(r) => Some(r.id()),
                None => {
                    log.warn(&format!("Unknown record {name}"));
                    return;
                }
            },
            None => None,
        };
        let key = self.key_of_symbol(symbol);
        if key == 0 {
            log.info(&format!("Symbol {symbol} is not mapped"));
            return;
        }
        if is_mapped_key(key) {
            log.info(&format!("Symbol {symbol} has key {key:#x} with {} references", self.mapper.counter(key)));
        }
        let global = self.global.lock();
        let mut found = 0;
        for (name, sub) in self.matrices(&global) {
            for index in sub.rows() {
                if sub.get_int(index + KEY) != key || rid.is_some_and(|r| r != sub.get_int(index + RID)) {
                    continue;
                }
                found += 1;
                log.info(&format!(
                    "{name}: row {index} rid {} {} next={}/{}",
                    sub.get_int(index + RID),
                    if sub.is_payload(index) { "payload" } else { "stale" },
                    sub.get_int(index + NEXT_AGENT),
                    sub.get_int(index + NEXT_INDEX)
                ));
            }
        }
        if let Some(storage) = &self.storage {
            for (k, r) in storage.keys() {
                if k == key && rid.is_none_or(|x| x == r) {
                    found += 1;
                    log.info(&format!("storage: rid {r}"));
                }
            }
        }
        if let Some(history) = &self.history {
            for (k, r) in history.keys() {
                if k == key && rid.is_none_or(|x| x == r) {
                    found += 1;
                    log.info(&format!("history: rid {r}, {} records", history.len_of(k, r)));
                }
            }
        }
        log.info(&format!("Found {found} references to {symbol}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AgentBuilder;
    use basalt_config::CollectorConfig;
    use basalt_matrix::CollectingLog;
    use lithos_events::{DataScheme, RecordBuffer};

    fn subscribed(contract: Contract) -> (Arc<Collector>, Vec<crate::AgentHandle>) {
        let scheme = DataScheme::builder().timed_record("Trade", 3, 0).build();
        let c = Collector::new(contract, scheme.clone(), CollectorConfig::default()).unwrap();
        let record = scheme.record(0).unwrap().clone();
        let agents: Vec<_> = [10, 20]
            .into_iter()
            .map(|time| {
                let a = c.create_agent(AgentBuilder::new()).unwrap();
                let cursor = scheme.cursor(&record, "IBM").with_time(time);
                a.add_subscription(&mut RecordBuffer::from_cursors([cursor])).unwrap();
                a
            })
            .collect();
        (c, agents)
    }

    fn total_row(c: &Collector) -> usize {
        let key = c.scheme.codec().encode("IBM");
        c.total().get_index(key, 0)
    }

    #[test]
    fn broken_next_agent_is_reported() {
        let (c, _agents) = subscribed(Contract::Stream);
        c.total().set_int(total_row(&c) + NEXT_AGENT, 99);
        let log = CollectingLog::default();
        assert!(c.verify(&log).unwrap() >= 2);
        let warnings = log.warnings();
        assert!(warnings.iter().any(|w| w.starts_with("Invalid NEXT_AGENT 99")));
        assert!(warnings.iter().any(|w| w.contains("is missing in total sub chain")));
    }

    #[test]
    fn stale_time_total_is_reported() {
        let (c, _agents) = subscribed(Contract::History);
        let log = CollectingLog::default();
        assert_eq!(c.verify(&log).unwrap(), 0, "{:?}", log.warnings());
        c.total().set_long(total_row(&c) + TIME_TOTAL, 15);
        let log = CollectingLog::default();
        assert_eq!(c.verify(&log).unwrap(), 1);
        assert!(log.warnings()[0].starts_with("Invalid TIME_TOTAL 15 (expected 10)"));
    }

    #[test]
    fn wrong_previous_agent_is_reported() {
        let (c, agents) = subscribed(Contract::Stream);
        // second agent is first in the chain; point its back link elsewhere
        let asub = c.global.lock().agent(agents[1].number()).unwrap().sub();
        let key = c.scheme.codec().encode("IBM");
        let index = asub.get_index(key, 0);
        asub.set_int(index + PREV_AGENT, agents[0].number());
        let log = CollectingLog::default();
        assert_eq!(c.verify(&log).unwrap(), 1);
        assert!(log.warnings()[0].starts_with("Reference to wrong previous agent"));
    }
}
