pub mod config;

pub use config::{BasaltConfig, BufferOverflowStrategy, CollectorConfig, ConfigError, WorkloadConfig};
