//! Configuration for the reader, the local TSDB and the migration loop
//!
//! Defaults mirror the command line defaults of the `cardinalsin-migrate`
//! binary.

use crate::tsdb::WalConfig;
use crate::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Default remote read endpoint
pub const DEFAULT_READ_URL: &str = "http://127.0.0.1:9090/api/v1/read";

/// Fifteen days, the default look-back and retention
pub const FIFTEEN_DAYS: Duration = Duration::from_secs(15 * 24 * 3600);

/// Source reader configuration
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Remote read endpoint
    pub url: Url,
    /// Re-check label and sample ordering of every fetched series
    pub strict: bool,
    /// Idle connections kept per host
    pub max_idle_per_host: usize,
    /// How long an idle connection is kept
    pub idle_timeout: Duration,
}

impl ReaderConfig {
    pub fn new(url: &str) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| Error::Config(format!("invalid read URL '{}': {}", url, e)))?;
        Ok(Self {
            url,
            ..Default::default()
        })
    }
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            url: Url::parse(DEFAULT_READ_URL).expect("default read URL is valid"),
            strict: false,
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// Local TSDB configuration
#[derive(Debug, Clone)]
pub struct TsdbConfig {
    /// Data directory
    pub dir: PathBuf,
    /// How long blocks are kept
    pub retention: Duration,
    /// Time span covered by one persisted block
    pub block_range: Duration,
    /// Write-ahead log settings
    pub wal: WalConfig,
}

impl TsdbConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn wal_dir(&self) -> PathBuf {
        self.dir.join("wal")
    }

    pub fn retention_ms(&self) -> i64 {
        self.retention.as_millis() as i64
    }

    pub fn block_range_ms(&self) -> i64 {
        self.block_range.as_millis() as i64
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_range < Duration::from_secs(60) {
            return Err(Error::Config(format!(
                "block range must be at least 1m, got {}",
                humantime::format_duration(self.block_range)
            )));
        }
        if self.retention.is_zero() {
            return Err(Error::Config("retention must be positive".to_string()));
        }
        Ok(())
    }
}

impl Default for TsdbConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data"),
            retention: FIFTEEN_DAYS,
            block_range: Duration::from_secs(2 * 3600),
            wal: WalConfig::default(),
        }
    }
}

/// Migration loop configuration
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// How far back from now the migration starts
    pub last: Duration,
    /// Width of one fetch/write slice
    pub slice: Duration,
    /// Batches that may wait between reader and writer
    pub queue_capacity: usize,
    /// How often progress is logged
    pub progress_interval: Duration,
    /// Directory holding the resume checkpoint; `None` disables resuming
    pub checkpoint_dir: Option<PathBuf>,
}

impl MigrationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.slice.is_zero() {
            return Err(Error::Config("slice must be positive".to_string()));
        }
        if self.slice.as_millis() % 1000 != 0 {
            return Err(Error::Config(format!(
                "slice must be a whole number of seconds, got {}",
                humantime::format_duration(self.slice)
            )));
        }
        if self.queue_capacity == 0 {
            return Err(Error::Config("queue capacity must be at least 1".to_string()));
        }
        if self.progress_interval.is_zero() {
            return Err(Error::Config("progress interval must be positive".to_string()));
        }
        Ok(())
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            last: FIFTEEN_DAYS,
            slice: Duration::from_secs(60),
            queue_capacity: 100,
            progress_interval: Duration::from_secs(10),
            checkpoint_dir: None,
        }
    }
}

/// Parse a human duration such as `15d`, `360h` or `90s`.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    humantime::parse_duration(raw.trim())
        .map_err(|e| Error::Config(format!("invalid duration '{}': {}", raw, e)))
}
