//! Local TSDB: the migration destination
//!
//! The writer only sees the transactional [`Storage`]/[`Appender`] pair.
//! [`LocalTsdb`] implements it on top of:
//! - an in-memory head holding recent samples per series
//! - a write-ahead log that makes every commit durable
//! - Parquet blocks, one per block range, cut from the head as it grows
//! - retention that drops blocks past the configured horizon

mod block;
mod db;
mod head;
mod labels;
mod wal;

pub use block::{BlockMeta, BlockStore};
pub use db::{LocalTsdb, TsdbStats};
pub use labels::Labels;
pub use wal::{WalConfig, WalSyncMode, WriteAheadLog};

use crate::Result;
use async_trait::async_trait;

/// Handle to a series inside the engine.
///
/// Only meaningful for the transaction that obtained it; the engine may
/// drop the series behind it at any commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesRef(pub u64);

/// Result of appending by reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Sample accepted (or ignored as an exact duplicate)
    Appended,
    /// The reference no longer names a series; append by labels instead
    StaleReference,
}

/// One open transaction against the engine.
///
/// Nothing appended becomes visible until [`commit`](Appender::commit)
/// returns `Ok`. Dropping an appender without committing rolls it back.
#[async_trait]
pub trait Appender: Send {
    /// Append a sample to the series identified by `labels`, creating the
    /// series if needed. Returns a reference usable for later samples of the
    /// same series in this transaction.
    fn append(&mut self, labels: &Labels, timestamp_ms: i64, value: f64) -> Result<SeriesRef>;

    /// Append a sample by series reference.
    fn append_ref(&mut self, series: SeriesRef, timestamp_ms: i64, value: f64)
        -> Result<AppendOutcome>;

    /// Make every pending sample durable and visible. Returns how many
    /// samples were stored; exact duplicates of stored samples are not
    /// counted.
    async fn commit(&mut self) -> Result<usize>;

    /// Discard every pending sample.
    fn rollback(&mut self);
}

/// Transactional storage engine
#[async_trait]
pub trait Storage: Send + Sync {
    /// Open a new transaction
    fn appender(&self) -> Box<dyn Appender + '_>;

    /// Samples older than this are already persisted and will be refused.
    fn min_valid_time(&self) -> i64 {
        i64::MIN
    }

    /// Flush and release engine resources
    async fn close(&self) -> Result<()>;
}
