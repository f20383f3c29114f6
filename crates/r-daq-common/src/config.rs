//! ---
//! daq_section: "01-core-functionality"
//! daq_subsection: "module"
//! daq_type: "source"
//! daq_scope: "code"
//! daq_description: "Shared primitives and utilities for the acquisition runtime."
//! daq_version: "v0.0.0-prealpha"
//! daq_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_equipment() -> String {
    "opc-equipment".to_owned()
}

fn default_failover_delay() -> Duration {
    Duration::from_millis(200)
}

fn default_health_publish_interval() -> Duration {
    Duration::from_millis(1000)
}

fn default_service_level_threshold() -> u8 {
    200
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(250)
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay() -> Duration {
    Duration::from_millis(10_000)
}

fn default_max_attempts() -> u32 {
    10
}

fn default_request_timeout() -> Duration {
    Duration::from_millis(5_000)
}

fn default_long_lost_threshold() -> Duration {
    Duration::from_secs(60)
}

fn default_min_time_deadband() -> Duration {
    Duration::from_millis(500)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

/// Primary configuration object for the R-DAQ runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_equipment")]
    pub equipment: String,
    #[serde(default)]
    pub daq: DaqConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "R_DAQ_CONFIG";

    /// Load configuration from disk, respecting the `R_DAQ_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: PathBuf) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.equipment.trim().is_empty() {
            return Err(anyhow!("equipment name must not be empty"));
        }
        self.daq.validate()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            equipment: default_equipment(),
            daq: DaqConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Acquisition settings consumed by the connection engine.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaqConfig {
    #[serde(default)]
    pub redundancy: RedundancyConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_request_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub request_timeout: Duration,
    /// Disconnection span after which a reconnect is no longer considered plausible.
    #[serde(default = "default_long_lost_threshold")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub long_lost_threshold: Duration,
    /// Floor applied to every time deadband to protect the server.
    #[serde(default = "default_min_time_deadband")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub min_time_deadband: Duration,
}

impl DaqConfig {
    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        if self.health.service_level_threshold == 0 {
            return Err(anyhow!("health.service_level_threshold must be greater than zero"));
        }
        if self.request_timeout.is_zero() {
            return Err(anyhow!("request_timeout must be greater than zero"));
        }
        Ok(())
    }
}

impl Default for DaqConfig {
    fn default() -> Self {
        Self {
            redundancy: RedundancyConfig::default(),
            health: HealthConfig::default(),
            retry: RetryConfig::default(),
            request_timeout: default_request_timeout(),
            long_lost_threshold: default_long_lost_threshold(),
            min_time_deadband: default_min_time_deadband(),
        }
    }
}

/// Redundancy topology requested by configuration.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RedundancyMode {
    None,
    Cold,
}

impl std::str::FromStr for RedundancyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(RedundancyMode::None),
            "cold" => Ok(RedundancyMode::Cold),
            other => Err(format!("unknown redundancy mode: {}", other)),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedundancyConfig {
    /// Overrides the redundancy support reported by the server when set.
    #[serde(default)]
    pub mode: Option<RedundancyMode>,
    /// Static list of redundant server URIs, preferred over the server's own listing.
    #[serde(default)]
    pub server_uris: Vec<String>,
    #[serde(default = "default_failover_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub failover_delay: Duration,
}

impl Default for RedundancyConfig {
    fn default() -> Self {
        Self {
            mode: None,
            server_uris: Vec::new(),
            failover_delay: default_failover_delay(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_publish_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub publish_interval: Duration,
    #[serde(default = "default_service_level_threshold")]
    pub service_level_threshold: u8,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            publish_interval: default_health_publish_interval(),
            service_level_threshold: default_service_level_threshold(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_initial_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub initial_delay: Duration,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_delay: Duration,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub jitter: Duration,
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.multiplier < 1.0 {
            return Err(anyhow!(
                "retry.multiplier must be at least 1.0 (got {})",
                self.multiplier
            ));
        }
        if self.max_delay < self.initial_delay {
            return Err(anyhow!(
                "retry.max_delay ({:?}) must not be smaller than retry.initial_delay ({:?})",
                self.max_delay,
                self.initial_delay
            ));
        }
        if self.max_attempts == 0 {
            return Err(anyhow!("retry.max_attempts must be at least 1"));
        }
        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            multiplier: default_multiplier(),
            max_delay: default_max_delay(),
            max_attempts: default_max_attempts(),
            jitter: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    /// Filter directives used when neither `R_DAQ_LOG` nor `RUST_LOG` is set.
    #[serde(default)]
    pub directives: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            directives: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config: AppConfig = "".parse().unwrap();
        assert_eq!(config.daq.retry, RetryConfig::default());
        assert_eq!(config.daq.health.service_level_threshold, 200);
        assert_eq!(config.daq.min_time_deadband, Duration::from_millis(500));
        assert!(config.daq.redundancy.mode.is_none());
    }

    #[test]
    fn retry_validation_rejects_shrinking_backoff() {
        let retry = RetryConfig {
            multiplier: 0.5,
            ..RetryConfig::default()
        };
        assert!(retry.validate().is_err());

        let retry = RetryConfig {
            max_delay: Duration::from_millis(10),
            ..RetryConfig::default()
        };
        assert!(retry.validate().is_err());
    }

    #[test]
    fn redundancy_mode_parses_case_insensitively() {
        assert_eq!("COLD".parse::<RedundancyMode>(), Ok(RedundancyMode::Cold));
        assert!("hot".parse::<RedundancyMode>().is_err());
    }
}
