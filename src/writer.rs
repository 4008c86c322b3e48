//! Destination side of the migration
//!
//! [`Writer`] commits each [`SeriesBatch`] as one transaction. Within a
//! transaction it caches the series reference returned by the first append
//! of every series and appends the remaining samples by reference, falling
//! back to the label-based append when the engine reports the reference as
//! stale.

use crate::model::SeriesBatch;
use crate::tsdb::{AppendOutcome, Appender, Labels, SeriesRef, Storage};
use crate::{Error, Result};

use metrics::counter;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Counts for one committed batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub series: usize,
    /// Samples the engine stored
    pub samples: usize,
    /// Exact duplicates of stored samples, accepted but not stored again
    pub duplicates: usize,
    /// Appends that had to fall back from a stale reference to labels
    pub ref_fallbacks: usize,
}

/// Writes batches into a transactional [`Storage`].
pub struct Writer {
    storage: Arc<dyn Storage>,
    closed: AtomicBool,
}

impl Writer {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            closed: AtomicBool::new(false),
        }
    }

    /// Append every sample of `batch` in one transaction and commit it.
    ///
    /// On any append error the transaction is rolled back and nothing of the
    /// batch becomes visible.
    pub async fn write(&self, batch: SeriesBatch) -> Result<WriteStats> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Internal("writer is closed".to_string()));
        }

        let mut app = self.storage.appender();
        let (mut stats, appended) = match append_batch(app.as_mut(), &batch) {
            Ok(result) => result,
            Err(e) => {
                app.rollback();
                return Err(e);
            }
        };
        let stored = app.commit().await?;
        stats.samples = stored;
        stats.duplicates = appended.saturating_sub(stored);

        debug!(
            window = %batch.window,
            series = stats.series,
            samples = stats.samples,
            duplicates = stats.duplicates,
            fallbacks = stats.ref_fallbacks,
            "Committed batch"
        );
        Ok(stats)
    }

    /// Start of the range the engine still accepts; everything before it is
    /// already persisted.
    pub fn min_valid_time(&self) -> i64 {
        self.storage.min_valid_time()
    }

    /// Close the underlying engine. Later calls are no-ops.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.storage.close().await
    }
}

/// Append the batch; returns the stats so far and the number of samples
/// handed to the engine.
fn append_batch(
    app: &mut (dyn Appender + '_),
    batch: &SeriesBatch,
) -> Result<(WriteStats, usize)> {
    let mut refs: HashMap<Labels, SeriesRef> = HashMap::with_capacity(batch.series.len());
    let mut stats = WriteStats::default();
    let mut appended = 0;

    for ts in &batch.series {
        let labels = Labels::from_sorted(&ts.labels);
        stats.series += 1;

        for sample in &ts.samples {
            match refs.get(&labels).copied() {
                Some(series) => {
                    match app.append_ref(series, sample.timestamp_ms, sample.value)? {
                        AppendOutcome::Appended => {}
                        AppendOutcome::StaleReference => {
                            debug!(series = %labels, "Series reference went stale, appending by labels");
                            counter!(
                                "migrate_series_ref_fallbacks_total",
                                "service" => crate::telemetry::service(),
                                "run_id" => crate::telemetry::run_id()
                            )
                            .increment(1);
                            let fresh = app.append(&labels, sample.timestamp_ms, sample.value)?;
                            refs.insert(labels.clone(), fresh);
                            stats.ref_fallbacks += 1;
                        }
                    }
                }
                None => {
                    let series = app.append(&labels, sample.timestamp_ms, sample.value)?;
                    refs.insert(labels.clone(), series);
                }
            }
            appended += 1;
        }
    }

    Ok((stats, appended))
}
