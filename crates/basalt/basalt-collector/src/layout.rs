//! Column offsets of total and agent rows, and the bit sets exchanged
//! between subscription code and its callers.
//!
//! ```text
//! total:   KEY RID NEXT_AGENT NEXT_INDEX [TIME_TOTAL(2)]
//! stream:  KEY RID NEXT_AGENT NEXT_INDEX PREV_AGENT
//! ticker:  ... PREV_AGENT SNAPSHOT_QUEUE UPDATE_QUEUE
//! history: ... PREV_AGENT SNAPSHOT_QUEUE HISTORY_SUB_FLAGS TIME_SUB(2) TIME_KNOWN(2) LAST_RECORD(2)
//! ```
//!
//! `NEXT_AGENT`/`NEXT_INDEX` point at the next row of the same (key, rid)
//! chain, which starts at the total row. `PREV_AGENT` holds the number of
//! the previous agent in the chain (the total is agent 1) and is zero for
//! rows that are not subscribed.

pub use basalt_matrix::sub_matrix::{KEY, RID};

pub const NEXT_AGENT: usize = 2;
pub const NEXT_INDEX: usize = 3;

pub const TIME_TOTAL: usize = 4;

pub const PREV_AGENT: usize = 4;
pub const PREV_AGENT_MASK: i32 = 0x7FFF_FFFF;
/// Marks rows touched by the running `set_subscription`.
pub const PREV_AGENT_SET: i32 = i32::MIN;

pub const SNAPSHOT_QUEUE: usize = 5;
pub const UPDATE_QUEUE: usize = 6;

pub const HISTORY_SUB_FLAGS: usize = 6;
pub const TIME_SUB: usize = 7;
pub const TIME_KNOWN: usize = 9;
pub const LAST_RECORD: usize = 11;
/// Subscription time was raised to the collector's minimum history time.
pub const HISTORY_SUB_SNIP: i32 = i32::MIN;

pub const TOTAL_STEP: usize = 4;
pub const TOTAL_TIME_STEP: usize = 6;
pub const STREAM_AGENT_STEP: usize = 5;
pub const TICKER_AGENT_STEP: usize = 7;
pub const HISTORY_AGENT_STEP: usize = 13;

/// Object column holding the subscription attachment.
pub const ATTACHMENT: usize = 0;

pub const TOTAL_AGENT_INDEX: i32 = 1;
pub const MIN_AGENT_INDEX: i32 = 2;

/// Queue link flag; see [`crate::agent_queue`].
pub const QUEUE_BIT: i32 = i32::MIN;
pub const EOL: i32 = !QUEUE_BIT;

// Bits accumulated by one part of a subscription change.
pub const NOTIFY_SUB_TOTAL_ADDED: u32 = 1;
pub const NOTIFY_SUB_TOTAL_REMOVED: u32 = 2;
pub const NOTIFY_SUB_SNAPSHOT_AVAILABLE: u32 = 4;
pub const NOTIFY_SUB_DATA_AVAILABLE: u32 = 8;
pub const NOTIFY_SUB_HAS_MORE: u32 = 16;
pub const NOTIFY_SUB_PHASE2: u32 = 32;
