//! # Pipeline Configuration
//!
//! Typed configuration for the pipeline core. Values are layered by
//! [`ConfigManager`]: built-in defaults, then an optional TOML file, then
//! `PIPELINE__*` environment variables.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use pipeline_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load_from_file(Some("config/pipeline.toml"))?;
//! let cooldown = manager.config().retry.cooldown();
//! let concurrent = manager.config().pipeline.running_concurrent;
//! # Ok(())
//! # }
//! ```

pub mod loader;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::constants;
use crate::error::{PipelineError, Result};

pub use loader::ConfigManager;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub pipeline: PipelineSection,
    pub retry: RetryConfig,
    pub saga: SagaConfig,
    pub scan: ScanConfig,
    pub benefit: BenefitConfig,
    pub subsystems: SubsystemsConfig,
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.channel_capacity == 0 {
            return Err(PipelineError::Configuration(
                "pipeline.channel_capacity must be greater than 0".to_string(),
            ));
        }
        if self.pipeline.executor_number == 0 {
            return Err(PipelineError::Configuration(
                "pipeline.executor_number must be greater than 0".to_string(),
            ));
        }
        if self.pipeline.running_concurrent == 0 {
            return Err(PipelineError::Configuration(
                "pipeline.running_concurrent must be greater than 0".to_string(),
            ));
        }
        if self.retry.cooldown_ms == 0 {
            return Err(PipelineError::Configuration(
                "retry.cooldown_ms must be greater than 0".to_string(),
            ));
        }
        if self.scan.row_limit == 0 {
            return Err(PipelineError::Configuration(
                "scan.row_limit must be greater than 0".to_string(),
            ));
        }
        if self.benefit.interval_secs == 0 {
            return Err(PipelineError::Configuration(
                "benefit.interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.saga.compensation_attempts == 0 {
            return Err(PipelineError::Configuration(
                "saga.compensation_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Channel and worker sizing shared by every subsystem handler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineSection {
    pub channel_capacity: usize,
    pub executor_number: usize,
    pub running_concurrent: usize,
    pub stale_running_ms: u64,
    pub lease_retry_interval_ms: u64,
    pub finalize_timeout_ms: u64,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            channel_capacity: constants::DEFAULT_CHANNEL_CAPACITY,
            executor_number: 1,
            running_concurrent: constants::DEFAULT_RUNNING_CONCURRENT,
            stale_running_ms: constants::STALE_RUNNING_THRESHOLD.as_millis() as u64,
            lease_retry_interval_ms: constants::DEFAULT_LEASE_RETRY_INTERVAL.as_millis() as u64,
            finalize_timeout_ms: 5_000,
        }
    }
}

impl PipelineSection {
    pub fn stale_running(&self) -> Duration {
        Duration::from_millis(self.stale_running_ms)
    }

    pub fn lease_retry_interval(&self) -> Duration {
        Duration::from_millis(self.lease_retry_interval_ms)
    }

    pub fn finalize_timeout(&self) -> Duration {
        Duration::from_millis(self.finalize_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub cooldown_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: constants::DEFAULT_RETRY_COOLDOWN.as_millis() as u64,
        }
    }
}

impl RetryConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Saga submission options, mapped onto [`crate::saga::TransOptions`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SagaConfig {
    pub wait_result: bool,
    pub request_timeout_secs: u64,
    pub timeout_to_fail_secs: u64,
    pub retry_interval_ms: u64,
    pub compensation_attempts: u32,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            wait_result: true,
            request_timeout_secs: 10,
            timeout_to_fail_secs: 30,
            retry_interval_ms: 500,
            compensation_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScanConfig {
    pub row_limit: u32,
    pub interval_ms: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            row_limit: constants::DEFAULT_ROW_LIMIT,
            interval_ms: constants::DEFAULT_SCAN_INTERVAL.as_millis() as u64,
        }
    }
}

impl ScanConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BenefitConfig {
    /// Length of one benefit period in seconds.
    pub interval_secs: u32,
}

impl Default for BenefitConfig {
    fn default() -> Self {
        Self {
            interval_secs: constants::DEFAULT_BENEFIT_INTERVAL_SECS,
        }
    }
}

/// Subsystem gating and per-subsystem scan intervals.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SubsystemsConfig {
    /// Subsystems allowed to run. Empty enables all of them.
    pub enabled: Vec<String>,
    pub scan_interval_ms: HashMap<String, u64>,
}

impl SubsystemsConfig {
    pub fn supports(&self, subsystem: &str) -> bool {
        self.enabled.is_empty() || self.enabled.iter().any(|s| s == subsystem)
    }

    pub fn scan_interval(&self, subsystem: &str, fallback: Duration) -> Duration {
        self.scan_interval_ms
            .get(subsystem)
            .map(|ms| Duration::from_millis(*ms))
            .unwrap_or(fallback)
    }
}
