//! # CardinalSin Migrate
//!
//! Streams historical time series out of a remote-read endpoint into a local
//! time-series database, one fixed-width time slice at a time, so memory stays
//! bounded no matter how much history is moved.
//!
//! ## Architecture
//!
//! - **Reader**: one snappy-compressed protobuf range query per slice
//! - **Pipeline**: producer and consumer joined by a bounded channel, with
//!   cooperative cancellation and periodic progress reports
//! - **Writer**: one transaction per slice, with a per-transaction series
//!   reference cache and a label-based fallback for stale references
//! - **TSDB**: in-memory head, Arrow IPC write-ahead log and Parquet blocks
//!   with time-based retention

pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod model;
pub mod pipeline;
pub mod reader;
pub mod remote;
pub mod telemetry;
pub mod tsdb;
pub mod writer;

mod error;

pub use error::{AppendError, Error, Result};

/// Configuration for one migration run
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Source endpoint
    pub reader: config::ReaderConfig,
    /// Destination engine
    pub tsdb: config::TsdbConfig,
    /// Slicing, queueing and resume behaviour
    pub migration: config::MigrationConfig,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        self.tsdb.validate()?;
        self.migration.validate()
    }
}

/// Re-exports for convenience
pub mod prelude {
    pub use crate::clock::{BoundedClock, Clock, ManualClock};
    pub use crate::config::{MigrationConfig, ReaderConfig, TsdbConfig};
    pub use crate::model::{Label, Sample, SeriesBatch, TimeSeries, TimeWindow};
    pub use crate::pipeline::{Migration, MigrationReport, ProgressSnapshot};
    pub use crate::reader::{Reader, SeriesSource};
    pub use crate::tsdb::{AppendOutcome, Appender, Labels, LocalTsdb, SeriesRef, Storage};
    pub use crate::writer::{WriteStats, Writer};
    pub use crate::{AppendError, Config, Error, Result};
}
