use serde::Deserialize;
use std::path::Path;

#[derive(Deserialize, Debug)]
pub struct BasaltConfig {
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub workload: WorkloadConfig,
}

/// What an agent buffer does with a record that does not fit.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BufferOverflowStrategy {
    /// Stall distribution until the consumer drains the buffer.
    Block,
    DropNewest,
    #[default]
    DropOldest,
}

#[derive(Deserialize, Debug, Clone)]
pub struct CollectorConfig {
    #[serde(default = "defaults::subscription_bucket")]
    pub subscription_bucket: usize,
    #[serde(default = "defaults::distribution_bucket")]
    pub distribution_bucket: usize,
    #[serde(default = "defaults::max_distribution_spins")]
    pub max_distribution_spins: usize,
    #[serde(default = "defaults::agent_buffer_size")]
    pub agent_buffer_size: usize,
    #[serde(default)]
    pub buffer_overflow_strategy: BufferOverflowStrategy,
    #[serde(default = "defaults::buffer_overflow_log_interval_secs")]
    pub buffer_overflow_log_interval_secs: u64,
    #[serde(default = "defaults::retrieve_batch_size")]
    pub retrieve_batch_size: usize,
    #[serde(default = "defaults::min_history_time")]
    pub min_history_time: i64,
}

/// Sizes of the demo workload driven by the `basalt` binary.
#[derive(Deserialize, Debug, Clone)]
pub struct WorkloadConfig {
    #[serde(default = "defaults::agents")]
    pub agents: usize,
    #[serde(default = "defaults::symbols")]
    pub symbols: usize,
    #[serde(default = "defaults::batches")]
    pub batches: usize,
    #[serde(default = "defaults::batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

mod defaults {
    pub fn log_level() -> String {
        "info".into()
    }

    pub fn subscription_bucket() -> usize {
        10_000
    }

    pub fn distribution_bucket() -> usize {
        100_000
    }

    pub fn max_distribution_spins() -> usize {
        8
    }

    pub fn agent_buffer_size() -> usize {
        1_000_000
    }

    pub fn buffer_overflow_log_interval_secs() -> u64 {
        10
    }

    pub fn retrieve_batch_size() -> usize {
        100
    }

    pub fn min_history_time() -> i64 {
        i64::MIN
    }

    pub fn agents() -> usize {
        4
    }

    pub fn symbols() -> usize {
        1_000
    }

    pub fn batches() -> usize {
        100
    }

    pub fn batch_size() -> usize {
        500
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            subscription_bucket: defaults::subscription_bucket(),
            distribution_bucket: defaults::distribution_bucket(),
            max_distribution_spins: defaults::max_distribution_spins(),
            agent_buffer_size: defaults::agent_buffer_size(),
            buffer_overflow_strategy: BufferOverflowStrategy::default(),
            buffer_overflow_log_interval_secs: defaults::buffer_overflow_log_interval_secs(),
            retrieve_batch_size: defaults::retrieve_batch_size(),
            min_history_time: defaults::min_history_time(),
        }
    }
}

impl Default for BasaltConfig {
    fn default() -> Self {
        Self {
            log_level: defaults::log_level(),
            collector: CollectorConfig::default(),
            workload: WorkloadConfig::default(),
        }
    }
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            agents: defaults::agents(),
            symbols: defaults::symbols(),
            batches: defaults::batches(),
            batch_size: defaults::batch_size(),
        }
    }
}

impl CollectorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.subscription_bucket == 0 {
            return Err(ConfigError::Invalid("subscription_bucket must be positive".into()));
        }
        if self.distribution_bucket == 0 {
            return Err(ConfigError::Invalid("distribution_bucket must be positive".into()));
        }
        if self.max_distribution_spins == 0 {
            return Err(ConfigError::Invalid("max_distribution_spins must be positive".into()));
        }
        if self.retrieve_batch_size == 0 {
            return Err(ConfigError::Invalid("retrieve_batch_size must be positive".into()));
        }
        Ok(())
    }
}

impl BasaltConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let toml_to_str = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(&toml_to_str)
    }

    pub fn parse(toml_str: &str) -> Result<Self, ConfigError> {
        let basalt_config: BasaltConfig = toml::from_str(toml_str)?;
        basalt_config.collector.validate()?;
        Ok(basalt_config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let cfg = BasaltConfig::parse("").unwrap();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.collector.subscription_bucket, 10_000);
        assert_eq!(cfg.collector.buffer_overflow_strategy, BufferOverflowStrategy::DropOldest);
        assert_eq!(cfg.collector.min_history_time, i64::MIN);
        assert_eq!(cfg.workload.agents, 4);
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = BasaltConfig::parse(
            r#"
            log_level = "debug"

            [collector]
            distribution_bucket = 16
            buffer_overflow_strategy = "block"
            agent_buffer_size = 5
            "#,
        )
        .unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.collector.distribution_bucket, 16);
        assert_eq!(cfg.collector.agent_buffer_size, 5);
        assert_eq!(cfg.collector.buffer_overflow_strategy, BufferOverflowStrategy::Block);
        assert_eq!(cfg.collector.max_distribution_spins, 8);
    }

    #[test]
    fn zero_bucket_is_rejected() {
        let err = BasaltConfig::parse("[collector]\nsubscription_bucket = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn unknown_strategy_is_a_parse_error() {
        let err = BasaltConfig::parse("[collector]\nbuffer_overflow_strategy = \"spill\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = BasaltConfig::load("/nonexistent/basalt.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { ref path, .. } if path == "/nonexistent/basalt.toml"));
    }
}
