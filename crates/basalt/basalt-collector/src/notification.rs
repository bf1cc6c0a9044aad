use crate::agent::Agent;
use std::sync::Arc;

pub const SNAPSHOT_BIT: u32 = 1;
pub const UPDATE_BIT: u32 = 2;

/// Listener wake-ups gathered under locks and fired after they are released.
#[derive(Debug, Default)]
pub struct Notification {
    bits: Vec<u32>,
    agents: Vec<Arc<Agent>>,
}

impl Notification {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, agent: &Arc<Agent>, bits: u32) {
        if bits == 0 {
            return;
        }
        let n = agent.number() as usize;
        if self.bits.len() <= n {
            self.bits.resize(n + 1, 0);
        }
        if self.bits[n] == 0 {
            self.agents.push(agent.clone());
        }
        self.bits[n] |= bits;
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn notify_listeners(&mut self) {
        for agent in self.agents.drain(..) {
            let n = agent.number() as usize;
            let bits = std::mem::take(&mut self.bits[n]);
            if bits & SNAPSHOT_BIT != 0 {
                agent.notify_snapshot_listener();
            }
            if bits & UPDATE_BIT != 0 {
                agent.notify_data_listener();
            }
        }
    }
}
