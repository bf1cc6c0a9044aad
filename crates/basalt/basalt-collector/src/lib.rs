//! Subscription-driven distribution of market data records.
//!
//! A [`Collector`] owns the total subscription and a set of agents. Each
//! agent subscribes to (record, symbol) items through an [`AgentHandle`];
//! [`Collector::process_data`] routes incoming records to every subscribed
//! agent according to the collector's [`Contract`].

pub mod agent;
pub mod agent_buffer;
pub mod agent_queue;
pub mod collector;
pub mod contract;
pub mod debug;
pub mod distribution;
pub mod distributor;
pub mod error;
pub mod handle;
pub mod history_storage;
pub mod keys;
pub mod layout;
pub mod listener;
pub mod management;
pub mod notification;
pub mod process;
pub mod retrieve;
pub mod subscription;
pub mod ticker_storage;

pub use agent::{AgentBuilder, AttachmentStrategy, SubscriptionFilter};
pub use basalt_matrix::{CollectingLog, DebugLog, TracingLog};
pub use collector::Collector;
pub use contract::Contract;
pub use distributor::{Distributor, SubscriptionTracker};
pub use error::CollectorError;
pub use handle::AgentHandle;
pub use listener::RecordListener;
pub use management::{CountersSnapshot, Management};
pub use subscription::SubscriptionKind;
