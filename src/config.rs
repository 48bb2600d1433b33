//! Node configuration.
//!
//! Loading is left to the embedding process; `NodeConfig` only derives serde
//! so it can sit inside whatever file format that process uses.

use crate::error::ConfigError;
use crate::module::MAX_THREADS;
use crate::resource_queue::QueueSettings;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::time::Duration;

/// Tunables of a mix node's dispatch core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Capacity of the completed-batch queue read by the gateway.
    pub completed_batch_capacity: usize,

    /// Capacity of the new-batch request queue.
    pub request_batch_capacity: usize,

    /// Timeout for phases that do not set their own.
    pub phase_timeout: Duration,

    /// How long a failed phase waits for its workers to stop.
    pub kill_timeout: Duration,

    /// Worker threads for modules that do not set their own.
    pub default_num_threads: u8,

    /// Smallest chunk any module may emit; also the output sink's granularity.
    pub min_slot_size: u32,

    /// Start threshold of every graph's output sink.
    pub output_threshold: f32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::auto()
    }
}

impl NodeConfig {
    /// Defaults, with one module thread per available core up to 64.
    pub fn auto() -> Self {
        let available = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        Self {
            completed_batch_capacity: 100,
            request_batch_capacity: 100,
            phase_timeout: Duration::from_secs(120),
            kill_timeout: Duration::from_secs(1),
            default_num_threads: available.min(MAX_THREADS as usize) as u8,
            min_slot_size: 1,
            output_threshold: 0.0,
        }
    }

    /// Single-threaded modules and short timeouts, for tests.
    pub fn minimal() -> Self {
        Self {
            default_num_threads: 1,
            phase_timeout: Duration::from_secs(5),
            kill_timeout: Duration::from_millis(200),
            ..Self::auto()
        }
    }

    pub fn builder() -> NodeConfigBuilder {
        NodeConfigBuilder::new()
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            phase_timeout: self.phase_timeout,
            kill_timeout: self.kill_timeout,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.completed_batch_capacity == 0 {
            return Err(ConfigError::Invalid(
                "completed_batch_capacity must be at least 1".to_string(),
            ));
        }
        if self.request_batch_capacity == 0 {
            return Err(ConfigError::Invalid(
                "request_batch_capacity must be at least 1".to_string(),
            ));
        }
        if self.default_num_threads == 0 || self.default_num_threads > MAX_THREADS {
            return Err(ConfigError::Invalid(format!(
                "default_num_threads must be between 1 and {}, got {}",
                MAX_THREADS, self.default_num_threads
            )));
        }
        if self.min_slot_size == 0 {
            return Err(ConfigError::Invalid(
                "min_slot_size must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.output_threshold) {
            return Err(ConfigError::Invalid(format!(
                "output_threshold must lie in [0, 1], got {}",
                self.output_threshold
            )));
        }
        if self.phase_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "phase_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfigBuilder {
    config: NodeConfig,
}

impl NodeConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: NodeConfig::auto(),
        }
    }

    pub fn completed_batch_capacity(mut self, capacity: usize) -> Self {
        self.config.completed_batch_capacity = capacity;
        self
    }

    pub fn request_batch_capacity(mut self, capacity: usize) -> Self {
        self.config.request_batch_capacity = capacity;
        self
    }

    pub fn phase_timeout(mut self, timeout: Duration) -> Self {
        self.config.phase_timeout = timeout;
        self
    }

    pub fn kill_timeout(mut self, timeout: Duration) -> Self {
        self.config.kill_timeout = timeout;
        self
    }

    pub fn default_num_threads(mut self, threads: u8) -> Self {
        self.config.default_num_threads = threads;
        self
    }

    pub fn min_slot_size(mut self, size: u32) -> Self {
        self.config.min_slot_size = size;
        self
    }

    pub fn output_threshold(mut self, threshold: f32) -> Self {
        self.config.output_threshold = threshold;
        self
    }

    /// Build the configuration, validating it first.
    pub fn build(self) -> Result<NodeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    pub fn build_unchecked(self) -> NodeConfig {
        self.config
    }
}

impl Default for NodeConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let c = NodeConfig::default();
        assert!(c.validate().is_ok());
        assert_eq!(c.completed_batch_capacity, 100);
        assert_eq!(c.request_batch_capacity, 100);
        assert_eq!(c.phase_timeout, Duration::from_secs(120));
        assert!((1..=MAX_THREADS).contains(&c.default_num_threads));
        assert!(NodeConfig::minimal().validate().is_ok());
    }

    #[test]
    fn builder_validates() {
        let err = NodeConfig::builder().default_num_threads(65).build().unwrap_err();
        assert!(err.to_string().contains("default_num_threads"));
        assert!(NodeConfig::builder().min_slot_size(0).build().is_err());
        assert!(NodeConfig::builder().output_threshold(1.5).build().is_err());
        assert!(NodeConfig::builder().completed_batch_capacity(0).build().is_err());

        let c = NodeConfig::builder().min_slot_size(4).build().unwrap();
        assert_eq!(c.min_slot_size, 4);
    }

    #[test]
    fn unchecked_build_skips_validation() {
        let c = NodeConfig::builder().default_num_threads(0).build_unchecked();
        assert_eq!(c.default_num_threads, 0);
    }
}
