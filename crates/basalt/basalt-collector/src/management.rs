use crate::CollectorError;
use basalt_config::CollectorConfig;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Settings, counters and the fatal error slot of one collector.
#[derive(Debug)]
pub struct Management {
    config: CollectorConfig,
    fatal_error: Mutex<Option<String>>,
    counters: CollectorCounters,
}

#[derive(Debug, Default)]
pub struct CollectorCounters {
    incoming: AtomicU64,
    outgoing: AtomicU64,
    spins: AtomicU64,
    passes: AtomicU64,
    retrieved: AtomicU64,
    dropped: AtomicU64,
    subscription_changes: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub incoming: u64,
    pub outgoing: u64,
    pub spins: u64,
    pub passes: u64,
    pub retrieved: u64,
    pub dropped: u64,
    pub subscription_changes: u64,
}

impl CollectorCounters {
    pub(crate) fn count_distribution(&self, incoming: u64, outgoing: u64, spins: u64) {
        self.incoming.fetch_add(incoming, Ordering::Relaxed);
        self.outgoing.fetch_add(outgoing, Ordering::Relaxed);
        self.spins.fetch_add(spins, Ordering::Relaxed);
        self.passes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_retrieved(&self, n: u64) {
        self.retrieved.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn count_dropped(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn count_subscription_change(&self) {
        self.subscription_changes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            incoming: self.incoming.load(Ordering::Relaxed),
            outgoing: self.outgoing.load(Ordering::Relaxed),
            spins: self.spins.load(Ordering::Relaxed),
            passes: self.passes.load(Ordering::Relaxed),
            retrieved: self.retrieved.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            subscription_changes: self.subscription_changes.load(Ordering::Relaxed),
        }
    }
}

impl Management {
    pub fn new(config: CollectorConfig) -> Self {
        Self {
            config,
            fatal_error: Mutex::new(None),
            counters: CollectorCounters::default(),
        }
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    pub fn counters(&self) -> &CollectorCounters {
        &self.counters
    }

    /// Records `err` unless a fatal error is already pending.
    pub fn set_fatal_error(&self, err: &CollectorError) {
        let mut slot = self.fatal_error.lock();
        if slot.is_none() {
            tracing::error!(error = %err, "collector fatal error");
            *slot = Some(err.to_string());
        }
    }

    pub fn fatal_error(&self) -> Option<String> {
        self.fatal_error.lock().clone()
    }

    /// Lets the collector serve again after an operator has dealt with the fatal error.
    pub fn clear_fatal_error(&self) -> Option<String> {
        let prev = self.fatal_error.lock().take();
        if let Some(reason) = &prev {
            tracing::warn!(%reason, "fatal error cleared");
        }
        prev
    }

    pub(crate) fn check_halted(&self) -> Result<(), CollectorError> {
        match self.fatal_error.lock().as_ref() {
            Some(reason) => Err(CollectorError::Halted {
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }
}
