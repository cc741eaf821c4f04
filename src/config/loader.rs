//! Configuration Loader
//!
//! Layers built-in defaults, an optional TOML file and `PIPELINE__*`
//! environment variables into a validated [`PipelineConfig`].

use config::{Config, Environment, File};
use std::env;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::PipelineConfig;
use crate::error::Result;

pub const ENV_PREFIX: &str = "PIPELINE";
pub const ENV_SEPARATOR: &str = "__";
pub const ENVIRONMENT_VAR: &str = "PIPELINE_ENV";

pub struct ConfigManager {
    config: PipelineConfig,
    environment: String,
}

impl ConfigManager {
    /// Load configuration from environment variables only
    pub fn load() -> Result<Arc<ConfigManager>> {
        Self::load_from_file(None::<&Path>)
    }

    /// Load configuration from an optional file, with environment overrides
    pub fn load_from_file<P: AsRef<Path>>(path: Option<P>) -> Result<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_with_env(path, &environment)
    }

    /// Load configuration with an explicit environment name
    pub fn load_with_env<P: AsRef<Path>>(
        path: Option<P>,
        environment: &str,
    ) -> Result<Arc<ConfigManager>> {
        let mut builder = Config::builder();

        if let Some(path) = path.as_ref() {
            debug!(
                path = %path.as_ref().display(),
                environment = %environment,
                "Loading pipeline configuration file"
            );
            builder = builder.add_source(File::from(path.as_ref()).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator(ENV_SEPARATOR)
                .list_separator(",")
                .with_list_parse_key("subsystems.enabled")
                .try_parsing(true),
        );

        let config: PipelineConfig = builder.build()?.try_deserialize()?;
        config.validate()?;

        info!(
            environment = %environment,
            executor_number = config.pipeline.executor_number,
            running_concurrent = config.pipeline.running_concurrent,
            retry_cooldown_ms = config.retry.cooldown_ms,
            enabled_subsystems = ?config.subsystems.enabled,
            "Pipeline configuration loaded"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
        }))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn detect_environment() -> String {
        env::var(ENVIRONMENT_VAR).unwrap_or_else(|_| "development".to_string())
    }
}
