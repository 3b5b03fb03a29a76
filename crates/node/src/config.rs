//! Node configuration.

use conclave_net::DeliveryConfig;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors from configuration validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Tunables for one node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Data directory for the store and the health-check file. `None`
    /// keeps everything in memory (tests, simulation).
    pub data_dir: Option<PathBuf>,
    /// Proposal-receipt window per height.
    pub proposal_timeout: Duration,
    /// Delivery-layer timing.
    pub delivery: DeliveryConfig,
    /// Threads in the envelope-verification pool.
    pub verify_threads: usize,
    /// Cadence of the monitoring thread's progress log.
    pub monitor_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> NodeConfig {
        NodeConfig {
            data_dir: None,
            proposal_timeout: conclave_consensus::BLOCK_PROPOSAL_RECEIVE_TIMEOUT,
            delivery: DeliveryConfig::default(),
            verify_threads: 2,
            monitor_interval: Duration::from_secs(10),
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.verify_threads == 0 {
            return Err(ConfigError::Invalid(
                "verify_threads must be at least 1".to_string(),
            ));
        }
        if self.proposal_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "proposal_timeout must be positive".to_string(),
            ));
        }
        if self.delivery.max_queue_size == 0 {
            return Err(ConfigError::Invalid(
                "delivery.max_queue_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        NodeConfig::default().validate().unwrap();
    }

    #[test]
    fn test_zero_threads_rejected() {
        let config = NodeConfig {
            verify_threads: 0,
            ..NodeConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
