//! ---
//! daq_section: "01-core-functionality"
//! daq_subsection: "module"
//! daq_type: "source"
//! daq_scope: "code"
//! daq_description: "Tracing setup tuned for connection and failover diagnostics."
//! daq_version: "v0.0.0-prealpha"
//! daq_owner: "tbd"
//! ---
use anyhow::Result;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "R_DAQ_LOG";

/// Failover decisions stay visible by default while per-request protocol
/// chatter from the client seam is reduced to warnings.
pub const DEFAULT_DIRECTIVES: &str =
    "info,r_daq_redundancy=debug,r_daq_core=info,r_daq_resilience=info,r_daq_net=warn";

static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static STDOUT_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Available log formats for the acquisition process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Where the effective filter came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterSource {
    Env,
    RustLog,
    Config,
    Default,
}

/// Resolve the filter directives in precedence order: `R_DAQ_LOG`, `RUST_LOG`,
/// the `[logging] directives` key, then [`DEFAULT_DIRECTIVES`]. A source whose
/// directives do not parse is skipped with a note on stderr.
pub fn resolve_filter(
    daq_env: Option<&str>,
    rust_log: Option<&str>,
    config: &LoggingConfig,
) -> (EnvFilter, FilterSource) {
    let candidates = [
        (daq_env, FilterSource::Env),
        (rust_log, FilterSource::RustLog),
        (config.directives.as_deref(), FilterSource::Config),
    ];
    for (directive, source) in candidates {
        let Some(directive) = directive.map(str::trim).filter(|d| !d.is_empty()) else {
            continue;
        };
        match EnvFilter::try_new(directive) {
            Ok(filter) => return (filter, source),
            Err(err) => eprintln!("ignoring {source:?} log directives {directive:?}: {err}"),
        }
    }
    (EnvFilter::new(DEFAULT_DIRECTIVES), FilterSource::Default)
}

/// Install the global subscriber: stdout in the configured [`LogFormat`] plus a
/// daily rolling JSON file under `config.directory`. A second call keeps the
/// first subscriber and only logs a warning.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    std::fs::create_dir_all(&config.directory)?;
    let prefix = config.file_prefix.as_deref().unwrap_or(service_name);

    let (file_writer, file_guard) = tracing_appender::non_blocking(daily(
        &config.directory,
        format!("{prefix}-{service_name}.log"),
    ));
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    let _ = FILE_GUARD.set(file_guard);
    let _ = STDOUT_GUARD.set(stdout_guard);

    let daq_env = std::env::var(LOG_ENV).ok();
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let (filter, source) = resolve_filter(daq_env.as_deref(), rust_log.as_deref(), config);

    // Targets carry the crate name, which is what operators filter failover logs by.
    let stdout_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .flatten_event(true)
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
    };

    let file_layer = fmt::layer()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_writer(file_writer)
        .boxed();

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .is_ok();

    if installed {
        info!(
            service = %service_name,
            log_dir = %config.directory.display(),
            format = ?config.format,
            filter_source = ?source,
            "tracing initialised"
        );
    } else {
        warn!(service = %service_name, "global subscriber already installed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(directives: Option<&str>) -> LoggingConfig {
        LoggingConfig {
            directives: directives.map(str::to_owned),
            ..LoggingConfig::default()
        }
    }

    #[test]
    fn daq_env_wins_over_everything() {
        let (_, source) = resolve_filter(
            Some("debug"),
            Some("trace"),
            &config_with(Some("warn")),
        );
        assert_eq!(source, FilterSource::Env);
    }

    #[test]
    fn config_directives_apply_without_environment() {
        let (filter, source) = resolve_filter(None, None, &config_with(Some("r_daq_core=trace")));
        assert_eq!(source, FilterSource::Config);
        assert!(filter.to_string().contains("r_daq_core=trace"));
    }

    #[test]
    fn blank_and_invalid_sources_fall_through_to_defaults() {
        let (filter, source) = resolve_filter(Some("  "), Some("r_daq_core=loud"), &config_with(None));
        assert_eq!(source, FilterSource::Default);
        assert!(filter.to_string().contains("r_daq_redundancy=debug"));
    }
}
