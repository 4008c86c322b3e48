//! Migration orchestrator
//!
//! A producer task walks the migration window slice by slice, fetching each
//! slice from the source and handing non-empty batches to the consumer over
//! a bounded channel. The consumer commits batches in order through the
//! [`Writer`]. The channel bound is the backpressure: a slow destination
//! stalls the producer once `queue_capacity` batches are waiting.
//!
//! Cancellation is cooperative. When the run's token fires the producer stops
//! (abandoning an in-flight fetch), and the consumer closes the channel,
//! commits whatever was already queued and closes the writer.

use crate::checkpoint;
use crate::clock::Clock;
use crate::config::MigrationConfig;
use crate::model::{truncate, TimeWindow};
use crate::reader::SeriesSource;
use crate::writer::Writer;
use crate::{Error, Result};

use chrono::{DateTime, TimeDelta, Utc};
use metrics::{counter, gauge, histogram};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Producer position, published for the progress reporter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    /// Start of the next slice to fetch
    pub cursor: DateTime<Utc>,
    /// Batches waiting in the channel
    pub queued: usize,
    pub capacity: usize,
}

/// Outcome of a finished (or cancelled) migration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub begin: DateTime<Utc>,
    /// End of the last committed slice; equals `begin` when nothing was
    /// committed
    pub committed_end: DateTime<Utc>,
    pub slices_fetched: u64,
    pub batches_committed: u64,
    pub samples_committed: u64,
    pub empty_slices: u64,
    pub elapsed: Duration,
    pub cancelled: bool,
}

impl MigrationReport {
    /// Span of source time that was durably migrated
    pub fn migrated(&self) -> TimeDelta {
        self.committed_end - self.begin
    }
}

#[derive(Debug, Default)]
struct ProducerStats {
    slices_fetched: u64,
    empty_slices: u64,
}

#[derive(Debug, Default)]
struct ConsumerStats {
    committed_end: Option<DateTime<Utc>>,
    batches_committed: u64,
    samples_committed: u64,
}

/// Drives one migration from `begin` up to the present.
pub struct Migration {
    config: MigrationConfig,
    clock: Arc<dyn Clock>,
    progress: Arc<watch::Sender<ProgressSnapshot>>,
}

impl Migration {
    pub fn new(config: MigrationConfig, clock: Arc<dyn Clock>) -> Self {
        let (progress, _) = watch::channel(ProgressSnapshot {
            cursor: clock.now(),
            queued: 0,
            capacity: config.queue_capacity,
        });
        Self {
            config,
            clock,
            progress: Arc::new(progress),
        }
    }

    /// Observe the producer's progress
    pub fn progress(&self) -> watch::Receiver<ProgressSnapshot> {
        self.progress.subscribe()
    }

    fn slice(&self) -> Result<TimeDelta> {
        TimeDelta::from_std(self.config.slice)
            .map_err(|e| Error::Config(format!("slice out of range: {}", e)))
    }

    /// Start of the first slice: `now - last`, aligned down to the slice
    /// width, or the persisted checkpoint when resuming past that point.
    pub async fn begin(&self) -> Result<DateTime<Utc>> {
        let slice = self.slice()?;
        let last = TimeDelta::from_std(self.config.last)
            .map_err(|e| Error::Config(format!("look-back out of range: {}", e)))?;
        let begin = truncate(self.clock.now() - last, slice);

        let Some(dir) = &self.config.checkpoint_dir else {
            return Ok(begin);
        };
        match checkpoint::load_committed_end(dir).await? {
            Some(end) if end > begin => {
                info!(checkpoint = %end, "Resuming from checkpoint");
                Ok(truncate(end, slice))
            }
            _ => Ok(begin),
        }
    }

    /// Migrate everything from [`begin`](Self::begin) to now.
    ///
    /// Returns `Ok` on completion and on cancellation (the report says which).
    /// Any fetch, write or commit failure stops both sides and is returned
    /// after the writer has been closed.
    pub async fn run(
        &self,
        source: Arc<dyn SeriesSource>,
        writer: Arc<Writer>,
        cancel: CancellationToken,
    ) -> Result<MigrationReport> {
        self.config.validate()?;
        let started = Instant::now();
        let slice = self.slice()?;
        let begin = skip_persisted(self.begin().await?, writer.min_valid_time(), slice);
        let first = TimeWindow::starting_at(begin, slice);

        info!(
            begin = %begin,
            slice = %humantime::format_duration(self.config.slice),
            queue_capacity = self.config.queue_capacity,
            "Starting migration"
        );

        let (tx, rx) = mpsc::channel(self.config.queue_capacity);
        let stop = cancel.child_token();
        let done = CancellationToken::new();

        let reporter = tokio::spawn(report_progress(
            self.progress.subscribe(),
            begin,
            self.clock.clone(),
            self.config.progress_interval,
            done.clone(),
        ));

        let producer = tokio::spawn(produce(
            source,
            tx,
            first,
            self.clock.clone(),
            stop.clone(),
            self.progress.clone(),
        ));

        let consumed = self.consume(rx, &writer, &cancel, &stop).await;
        let produced = match producer.await {
            Ok(result) => result,
            Err(e) => Err(Error::Internal(format!("producer task failed: {}", e))),
        };

        done.cancel();
        if let Err(e) = reporter.await {
            warn!(error = %e, "Progress reporter task failed");
        }

        let consumed = consumed?;
        let produced = match produced {
            Ok(stats) => stats,
            Err(e) => {
                error!(error = %e, "Fetching from the source failed");
                return Err(e);
            }
        };

        let report = MigrationReport {
            begin,
            committed_end: consumed.committed_end.unwrap_or(begin),
            slices_fetched: produced.slices_fetched,
            batches_committed: consumed.batches_committed,
            samples_committed: consumed.samples_committed,
            empty_slices: produced.empty_slices,
            elapsed: started.elapsed(),
            cancelled: cancel.is_cancelled(),
        };

        info!(
            migrated = %humantime::format_duration(report.migrated().to_std().unwrap_or_default()),
            committed_end = %report.committed_end,
            slices = report.slices_fetched,
            batches = report.batches_committed,
            samples = report.samples_committed,
            cancelled = report.cancelled,
            elapsed = ?report.elapsed,
            "Done!"
        );
        Ok(report)
    }

    /// Commit batches until the channel is closed and drained, then close
    /// the writer.
    async fn consume(
        &self,
        mut rx: mpsc::Receiver<crate::model::SeriesBatch>,
        writer: &Writer,
        cancel: &CancellationToken,
        stop: &CancellationToken,
    ) -> Result<ConsumerStats> {
        let mut stats = ConsumerStats::default();
        let mut draining = false;

        loop {
            let batch = tokio::select! {
                biased;
                _ = cancel.cancelled(), if !draining => {
                    info!("Cancellation requested, committing queued batches");
                    rx.close();
                    draining = true;
                    continue;
                }
                batch = rx.recv() => batch,
            };
            let Some(batch) = batch else {
                break;
            };
            if batch.is_empty() {
                continue;
            }

            let window = batch.window;
            let commit_start = Instant::now();
            let written = match writer.write(batch).await {
                Ok(written) => written,
                Err(e) => {
                    error!(window = %window, error = %e, "Writing batch failed");
                    stop.cancel();
                    close_writer(writer).await;
                    return Err(e);
                }
            };
            histogram!(
                "migrate_commit_duration_seconds",
                "service" => crate::telemetry::service(),
                "run_id" => crate::telemetry::run_id()
            )
            .record(commit_start.elapsed().as_secs_f64());
            counter!(
                "migrate_slices_committed_total",
                "service" => crate::telemetry::service(),
                "run_id" => crate::telemetry::run_id()
            )
            .increment(1);
            counter!(
                "migrate_samples_committed_total",
                "service" => crate::telemetry::service(),
                "run_id" => crate::telemetry::run_id()
            )
            .increment(written.samples as u64);

            stats.committed_end = Some(window.end);
            stats.batches_committed += 1;
            stats.samples_committed += written.samples as u64;

            if let Some(dir) = &self.config.checkpoint_dir {
                if let Err(e) = checkpoint::persist_committed_end(dir, window.end).await {
                    error!(error = %e, "Persisting checkpoint failed");
                    stop.cancel();
                    close_writer(writer).await;
                    return Err(e);
                }
            }
        }

        writer.close().await?;
        Ok(stats)
    }
}

/// Move `begin` past the range the destination has already persisted as
/// blocks. The engine refuses samples there, and a rerun from the original
/// begin would otherwise fail on its first slice.
fn skip_persisted(begin: DateTime<Utc>, min_valid_time: i64, slice: TimeDelta) -> DateTime<Utc> {
    let Some(persisted) = DateTime::from_timestamp_millis(min_valid_time) else {
        return begin;
    };
    if persisted <= begin {
        return begin;
    }
    let mut start = truncate(persisted, slice);
    if start < persisted {
        start += slice;
    }
    info!(
        requested = %begin,
        persisted = %persisted,
        begin = %start,
        "Destination already persisted the start of the range, skipping ahead"
    );
    start
}

async fn close_writer(writer: &Writer) {
    if let Err(e) = writer.close().await {
        error!(error = %e, "Closing writer after failure also failed");
    }
}

/// Fetch slices from `first` until the next one would start in the future.
async fn produce(
    source: Arc<dyn SeriesSource>,
    tx: mpsc::Sender<crate::model::SeriesBatch>,
    first: TimeWindow,
    clock: Arc<dyn Clock>,
    stop: CancellationToken,
    progress: Arc<watch::Sender<ProgressSnapshot>>,
) -> Result<ProducerStats> {
    let mut stats = ProducerStats::default();
    let capacity = tx.max_capacity();
    let mut window = first;

    while !stop.is_cancelled() && window.start <= clock.now() {
        let fetch_start = Instant::now();
        let batch = tokio::select! {
            biased;
            _ = stop.cancelled() => {
                debug!(window = %window, "Abandoning in-flight fetch");
                break;
            }
            fetched = source.fetch(window) => fetched?,
        };
        histogram!(
            "migrate_fetch_duration_seconds",
            "service" => crate::telemetry::service(),
            "run_id" => crate::telemetry::run_id()
        )
        .record(fetch_start.elapsed().as_secs_f64());
        counter!(
            "migrate_slices_fetched_total",
            "service" => crate::telemetry::service(),
            "run_id" => crate::telemetry::run_id()
        )
        .increment(1);
        stats.slices_fetched += 1;

        if batch.is_empty() {
            debug!(window = %window, "Empty slice, nothing to write");
            stats.empty_slices += 1;
        } else {
            let sent = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                sent = tx.send(batch) => sent,
            };
            if sent.is_err() {
                debug!("Consumer stopped, no more slices will be fetched");
                break;
            }
        }

        window = window.next();
        let queued = capacity - tx.capacity();
        gauge!(
            "migrate_queue_depth",
            "service" => crate::telemetry::service(),
            "run_id" => crate::telemetry::run_id()
        )
        .set(queued as f64);
        progress.send_replace(ProgressSnapshot {
            cursor: window.start,
            queued,
            capacity,
        });
    }

    Ok(stats)
}

/// Log progress every `interval` and once more when `done` fires.
async fn report_progress(
    progress: watch::Receiver<ProgressSnapshot>,
    begin: DateTime<Utc>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    done: CancellationToken,
) {
    let log = |snapshot: ProgressSnapshot| {
        let total = (clock.now() - begin).num_milliseconds().max(1) as f64;
        let covered = (snapshot.cursor - begin).num_milliseconds().max(0) as f64;
        info!(
            cursor = %snapshot.cursor,
            progress = format!("{:.1}%", (covered / total * 100.0).min(100.0)),
            queued = snapshot.queued,
            capacity = snapshot.capacity,
            "Migration progress"
        );
    };

    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = done.cancelled() => break,
            _ = ticker.tick() => {
                let snapshot = *progress.borrow();
                log(snapshot);
            }
        }
    }
    let snapshot = *progress.borrow();
    log(snapshot);
}
