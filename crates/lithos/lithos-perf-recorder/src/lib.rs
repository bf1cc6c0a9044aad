//! Per-stage latency recorder for the collector's hot paths.
//!
//! With the `record` feature **off** (the default) `PerfRecorder` is a
//! zero-sized type and every method is an `#[inline(always)]` no-op.
//!
//! With `record` **on**, each stage owns a pre-allocated sample ring of
//! `MAX_SAMPLES` nanosecond durations read from `CLOCK_MONOTONIC`. Threads
//! take a timestamp with [`now_ns`] and hand the start back through
//! [`PerfRecorder::since`], so a shared recorder never holds a pending
//! begin across a lock.

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PerfStage {
    SubscriptionChange = 0,
    Rehash = 1,
    DistributionBuild = 2,
    AgentUpdate = 3,
    Notify = 4,
    Retrieve = 5,
    ProcessDataTotal = 6,
}

pub const NUM_STAGES: usize = 7;
pub const MAX_SAMPLES: usize = 131_072; // 128K per stage

impl PerfStage {
    pub const ALL: [PerfStage; NUM_STAGES] = [
        PerfStage::SubscriptionChange,
        PerfStage::Rehash,
        PerfStage::DistributionBuild,
        PerfStage::AgentUpdate,
        PerfStage::Notify,
        PerfStage::Retrieve,
        PerfStage::ProcessDataTotal,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PerfStage::SubscriptionChange => "subscription_change",
            PerfStage::Rehash => "rehash",
            PerfStage::DistributionBuild => "distribution_build",
            PerfStage::AgentUpdate => "agent_update",
            PerfStage::Notify => "notify",
            PerfStage::Retrieve => "retrieve",
            PerfStage::ProcessDataTotal => "process_data_total",
        }
    }
}

// ─── Feature: record ON ─────────────────────────────────────────────────────

#[cfg(feature = "record")]
mod inner {
    use super::*;

    #[inline(always)]
    pub fn now_ns() -> u64 {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        }
        (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
    }

    struct StageBuf {
        samples: Vec<u64>,
        count: usize,
        pending: u64,
    }

    impl StageBuf {
        fn new() -> Self {
            Self {
                samples: vec![0u64; MAX_SAMPLES],
                count: 0,
                pending: 0,
            }
        }

        #[inline(always)]
        fn push(&mut self, elapsed: u64) {
            if self.count < MAX_SAMPLES {
                self.samples[self.count] = elapsed;
                self.count += 1;
            }
        }
    }

    pub struct PerfRecorder {
        stages: Vec<StageBuf>,
    }

    impl PerfRecorder {
        pub fn new() -> Self {
            Self {
                stages: (0..NUM_STAGES).map(|_| StageBuf::new()).collect(),
            }
        }

        #[inline(always)]
        pub fn begin(&mut self, stage: PerfStage) {
            self.stages[stage as usize].pending = now_ns();
        }

        #[inline(always)]
        pub fn end(&mut self, stage: PerfStage) {
            let buf = &mut self.stages[stage as usize];
            let elapsed = now_ns().saturating_sub(buf.pending);
            buf.push(elapsed);
        }

        /// Records the time elapsed since `start_ns`, a value of [`now_ns`].
        #[inline(always)]
        pub fn since(&mut self, stage: PerfStage, start_ns: u64) {
            self.stages[stage as usize].push(now_ns().saturating_sub(start_ns));
        }

        #[inline(always)]
        pub fn record(&mut self, stage: PerfStage, duration_ns: u64) {
            self.stages[stage as usize].push(duration_ns);
        }

        pub fn samples(&self, stage: PerfStage) -> &[u64] {
            let buf = &self.stages[stage as usize];
            &buf.samples[..buf.count]
        }

        pub fn count(&self, stage: PerfStage) -> usize {
            self.stages[stage as usize].count
        }

        pub fn drain(&mut self, stage: PerfStage) {
            self.stages[stage as usize].count = 0;
        }

        pub fn reset(&mut self) {
            for buf in self.stages.iter_mut() {
                buf.count = 0;
            }
        }
    }

    impl Default for PerfRecorder {
        fn default() -> Self {
            Self::new()
        }
    }
}

// ─── Feature: record OFF (zero-cost stubs) ──────────────────────────────────

#[cfg(not(feature = "record"))]
mod inner {
    use super::*;

    #[inline(always)]
    pub fn now_ns() -> u64 {
        0
    }

    pub struct PerfRecorder;

    impl PerfRecorder {
        #[inline(always)]
        pub fn new() -> Self {
            Self
        }
        #[inline(always)]
        pub fn begin(&mut self, _stage: PerfStage) {}
        #[inline(always)]
        pub fn end(&mut self, _stage: PerfStage) {}
        #[inline(always)]
        pub fn since(&mut self, _stage: PerfStage, _start_ns: u64) {}
        #[inline(always)]
        pub fn record(&mut self, _stage: PerfStage, _duration_ns: u64) {}
        #[inline(always)]
        pub fn samples(&self, _stage: PerfStage) -> &[u64] {
            &[]
        }
        #[inline(always)]
        pub fn count(&self, _stage: PerfStage) -> usize {
            0
        }
        #[inline(always)]
        pub fn drain(&mut self, _stage: PerfStage) {}
        #[inline(always)]
        pub fn reset(&mut self) {}
    }

    impl Default for PerfRecorder {
        fn default() -> Self {
            Self
        }
    }
}

pub use inner::{PerfRecorder, now_ns};
