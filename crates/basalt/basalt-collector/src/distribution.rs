//! Scratch state of one `process_data` pass.
//!
//! Phase 1 appends `(row index, record position)` entries to per-agent
//! singly linked lists. Phase 2 walks each agent's list under that agent's
//! lock. Entries live in one flat array; entry `0` is reserved as the end
//! marker.

use crate::CollectorError;
use crate::agent::Agent;
use basalt_matrix::SubMatrix;
use std::sync::Arc;

const NEXT: usize = 0;
const INDEX: usize = 1;
const POSITION: usize = 2;
const N_INTS: usize = 3;

#[derive(Debug, Default)]
pub struct Distribution {
    agents: Vec<Option<Arc<Agent>>>,
    subs: Vec<Option<Arc<SubMatrix>>>,
    sub_mod_counts: Vec<u32>,
    heads: Vec<usize>,
    tails: Vec<usize>,
    entries: Vec<usize>,
    affected: Vec<usize>,
    blocked: Vec<usize>,
    size_threshold: usize,
    pub(crate) incoming: u64,
    pub(crate) outgoing: u64,
    pub(crate) spins: u64,
}

impl Distribution {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepares for a pass over a collector with `agent_slots` agent numbers.
    pub fn start(&mut self, agent_slots: usize, bucket: usize) {
        if self.heads.len() < agent_slots {
            self.agents.resize(agent_slots, None);
            self.subs.resize(agent_slots, None);
            self.sub_mod_counts.resize(agent_slots, 0);
            self.heads.resize(agent_slots, 0);
            self.tails.resize(agent_slots, 0);
        }
        if self.entries.is_empty() {
            self.entries.extend_from_slice(&[0; N_INTS]);
        }
        self.size_threshold = N_INTS * (bucket.max(1) + 1);
    }

    pub fn has_capacity(&self) -> bool {
        self.entries.len() < self.size_threshold
    }

    /// Queues record `position` for row `index` of `agent`. The agent's
    /// matrix and modification count are captured on its first entry.
    pub fn add(&mut self, agent: &Arc<Agent>, index: usize, position: usize) {
        let n = agent.number() as usize;
        let entry = self.entries.len();
        self.entries.extend_from_slice(&[0, index, position]);
        if self.heads[n] == 0 {
            self.agents[n] = Some(agent.clone());
            self.subs[n] = Some(agent.sub());
            self.sub_mod_counts[n] = agent.sub_mod_count();
            self.heads[n] = entry;
            self.affected.push(n);
        } else {
            let tail = self.tails[n];
            self.entries[tail + NEXT] = entry;
        }
        self.tails[n] = entry;
    }

    /// Matrix of agent `n` as seen when its first entry was queued.
    pub fn sub(&self, n: usize) -> Option<&Arc<SubMatrix>> {
        self.subs[n].as_ref()
    }

    pub fn agent(&self, n: usize) -> Option<&Arc<Agent>> {
        self.agents[n].as_ref()
    }

    pub fn sub_mod_count(&self, n: usize) -> u32 {
        self.sub_mod_counts[n]
    }

    pub fn first_entry(&self, n: usize) -> usize {
        self.heads[n]
    }

    pub fn next_entry(&self, entry: usize) -> usize {
        self.entries[entry + NEXT]
    }

    pub fn entry_index(&self, entry: usize) -> usize {
        self.entries[entry + INDEX]
    }

    pub fn entry_position(&self, entry: usize) -> usize {
        self.entries[entry + POSITION]
    }

    pub fn has_affected(&self) -> bool {
        !self.affected.is_empty()
    }

    pub fn take_affected(&mut self) -> Vec<usize> {
        std::mem::take(&mut self.affected)
    }

    /// Agents whose lock could not be taken this spin.
    pub fn set_affected(&mut self, agents: Vec<usize>) {
        self.affected = agents;
    }

    /// Marks agent `n` done. A non-zero `block_entry` parks the agent with
    /// its list resuming at that entry.
    pub fn finish_agent(&mut self, n: usize, block_entry: usize) {
        if block_entry != 0 {
            self.heads[n] = block_entry;
            self.blocked.push(n);
        } else {
            self.release(n);
        }
    }

    pub fn has_blocked(&self) -> bool {
        !self.blocked.is_empty()
    }

    /// Turns parked agents back into affected ones for another phase 2.
    pub fn enqueue_blocked(&mut self) -> Result<(), CollectorError> {
        if !self.affected.is_empty() {
            return Err(CollectorError::IllegalState("blocked agents enqueued while others are pending"));
        }
        self.affected = std::mem::take(&mut self.blocked);
        Ok(())
    }

    fn release(&mut self, n: usize) {
        self.heads[n] = 0;
        self.tails[n] = 0;
        self.agents[n] = None;
        self.subs[n] = None;
    }

    /// Empties the pass state; the allocation is kept for reuse.
    pub fn clear(&mut self) {
        for n in std::mem::take(&mut self.affected)
            .into_iter()
            .chain(std::mem::take(&mut self.blocked))
        {
            self.release(n);
        }
        self.entries.truncate(N_INTS);
        self.incoming = 0;
        self.outgoing = 0;
        self.spins = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_bucket_still_takes_one_record() {
        let mut dist = Distribution::default();
        dist.start(4, 0);
        assert!(dist.has_capacity());
    }
}
