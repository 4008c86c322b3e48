//! Telemetry bootstrap for the migration binary.
//!
//! Installs the global `tracing` subscriber and fixes the `service` and
//! `run_id` labels attached to every metric the crate emits.

use crate::{Error, Result};

use std::sync::OnceLock;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

const RUN_ID_ENV: &str = "CARDINALSIN_TELEMETRY_RUN_ID";
const DEFAULT_SERVICE: &str = "cardinalsin-migrate";

static SERVICE: OnceLock<String> = OnceLock::new();
static RUN_ID: OnceLock<String> = OnceLock::new();

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Text => "text",
            LogFormat::Json => "json",
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{other}'; expected text or json")),
        }
    }
}

/// Handle describing the installed telemetry.
#[derive(Debug)]
pub struct Telemetry {
    service_name: String,
    run_id: String,
    format: LogFormat,
}

impl Telemetry {
    /// Install the global subscriber for `service_name`.
    ///
    /// Fails if the level does not parse or a subscriber is already set.
    pub fn init_for_component(
        service_name: &str,
        log_level: &str,
        format: LogFormat,
    ) -> Result<Self> {
        let service_name = service_name.trim();
        if service_name.is_empty() {
            return Err(Error::Config("service name cannot be empty".to_string()));
        }
        let level = parse_log_level(log_level)?;

        let builder = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(true);
        let installed = match format {
            LogFormat::Json => builder.json().with_thread_ids(true).try_init(),
            LogFormat::Text => builder.try_init(),
        };
        installed
            .map_err(|e| Error::Config(format!("failed to initialize telemetry subscriber: {e}")))?;

        let _ = SERVICE.set(service_name.to_string());
        let telemetry = Self {
            service_name: service().to_string(),
            run_id: run_id().to_string(),
            format,
        };

        info!(
            service_name = %telemetry.service_name,
            run_id = %telemetry.run_id,
            log_format = telemetry.format.as_str(),
            "Telemetry initialized"
        );
        Ok(telemetry)
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

/// `service` label value for metrics.
pub fn service() -> &'static str {
    SERVICE.get_or_init(|| DEFAULT_SERVICE.to_string())
}

/// `run_id` label value for metrics: `CARDINALSIN_TELEMETRY_RUN_ID` when
/// set, otherwise a random id fixed for the process lifetime.
pub fn run_id() -> &'static str {
    RUN_ID.get_or_init(|| {
        std::env::var(RUN_ID_ENV)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    })
}

pub fn parse_log_level(raw: &str) -> Result<Level> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(Error::Config(format!(
            "invalid log level '{other}', expected one of [trace, debug, info, warn, error]"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_log_level_accepts_known_levels() {
        assert_eq!(parse_log_level("INFO").unwrap(), Level::INFO);
        assert_eq!(parse_log_level(" debug ").unwrap(), Level::DEBUG);
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn parse_log_format() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("Text".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn run_id_is_stable() {
        assert!(!run_id().is_empty());
        assert_eq!(run_id(), run_id());
        assert!(!service().is_empty());
    }
}
