//! The local TSDB engine

use super::block::{BlockMeta, BlockStore};
use super::head::Head;
use super::wal::WriteAheadLog;
use super::{AppendOutcome, Appender, Labels, SeriesRef, Storage};
use crate::clock::Clock;
use crate::config::TsdbConfig;
use crate::error::AppendError;
use crate::model::{duplicate_label_name, Sample, TimeSeries};
use crate::{Error, Result};

use async_trait::async_trait;
use object_store::local::LocalFileSystem;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

const BLOCKS_DIR: &str = "blocks";

/// Point-in-time engine statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TsdbStats {
    pub head_series: usize,
    pub head_samples: usize,
    pub head_min_time: Option<i64>,
    pub head_max_time: Option<i64>,
    pub min_valid_time: i64,
    pub blocks: usize,
}

/// Local time-series database: head + WAL + Parquet blocks.
pub struct LocalTsdb {
    config: TsdbConfig,
    clock: Arc<dyn Clock>,
    head: RwLock<Head>,
    /// Serializes commits; compaction runs under the same lock.
    wal: Mutex<WriteAheadLog>,
    blocks: BlockStore,
    block_index: RwLock<Vec<BlockMeta>>,
    next_ref: AtomicU64,
    closed: AtomicBool,
}

impl LocalTsdb {
    /// Open the database in `config.dir`, replaying the WAL into the head.
    pub async fn open(config: TsdbConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let block_dir = config.dir.join(BLOCKS_DIR);
        tokio::fs::create_dir_all(&block_dir)
            .await
            .map_err(|e| Error::EngineOpen(format!("{}: {}", block_dir.display(), e)))?;

        let store = LocalFileSystem::new_with_prefix(&block_dir)
            .map_err(|e| Error::EngineOpen(e.to_string()))?;
        let blocks = BlockStore::new(Arc::new(store));
        let block_index = blocks
            .list()
            .await
            .map_err(|e| Error::EngineOpen(format!("listing blocks: {}", e)))?;
        let min_valid_time = block_index.iter().map(|b| b.maxt).max().unwrap_or(i64::MIN);

        let wal = WriteAheadLog::open(config.wal_dir(), config.wal.clone())
            .await
            .map_err(|e| Error::EngineOpen(format!("opening WAL: {}", e)))?;
        let records = wal
            .replay()
            .await
            .map_err(|e| Error::EngineOpen(format!("replaying WAL: {}", e)))?;

        let mut head = Head::new(min_valid_time);
        let mut next_ref = 1u64;
        let mut replayed = 0usize;
        for record in &records {
            for (labels, sample) in &record.samples {
                if sample.timestamp_ms < min_valid_time {
                    continue;
                }
                let series = head.get_or_create(labels, SeriesRef(next_ref));
                if series.0 == next_ref {
                    next_ref += 1;
                }
                let newer = head
                    .get(series)
                    .and_then(|s| s.last())
                    .map_or(true, |last| sample.timestamp_ms > last.timestamp_ms);
                if newer {
                    head.push(series, *sample);
                    replayed += 1;
                }
            }
        }

        info!(
            target: "tsdb",
            dir = %config.dir.display(),
            blocks = block_index.len(),
            wal_records = records.len(),
            samples = replayed,
            series = head.num_series(),
            "Opened local TSDB"
        );

        let db = Self {
            config,
            clock,
            head: RwLock::new(head),
            wal: Mutex::new(wal),
            blocks,
            block_index: RwLock::new(block_index),
            next_ref: AtomicU64::new(next_ref),
            closed: AtomicBool::new(false),
        };
        db.enforce_retention().await?;
        Ok(db)
    }

    pub fn stats(&self) -> TsdbStats {
        let head = self.head.read();
        let bounds = (!head.is_empty()).then(|| (head.min_time(), head.max_time()));
        TsdbStats {
            head_series: head.num_series(),
            head_samples: head.num_samples(),
            head_min_time: bounds.map(|b| b.0),
            head_max_time: bounds.map(|b| b.1),
            min_valid_time: head.min_valid_time(),
            blocks: self.block_index.read().len(),
        }
    }

    /// Persisted blocks, oldest first.
    pub fn blocks(&self) -> Vec<BlockMeta> {
        self.block_index.read().clone()
    }

    /// Every series with samples in `[mint, maxt)`, merged across blocks and
    /// the head, ordered by labels.
    pub async fn select(&self, mint: i64, maxt: i64) -> Result<Vec<TimeSeries>> {
        let overlapping: Vec<BlockMeta> = self
            .block_index
            .read()
            .iter()
            .filter(|b| b.overlaps(mint, maxt))
            .cloned()
            .collect();

        let mut merged: BTreeMap<Labels, Vec<Sample>> = BTreeMap::new();
        for meta in &overlapping {
            for (labels, samples) in self.blocks.read(meta, mint, maxt).await? {
                merged.entry(labels).or_default().extend(samples);
            }
        }
        let head_range = self.head.read().range(mint, maxt);
        for (labels, samples) in head_range {
            merged.entry(labels).or_default().extend(samples);
        }

        Ok(merged
            .into_iter()
            .map(|(labels, mut samples)| {
                samples.sort_by_key(|s| s.timestamp_ms);
                samples.dedup_by_key(|s| s.timestamp_ms);
                TimeSeries::new(labels.to_vec(), samples)
            })
            .collect())
    }

    /// Cut blocks out of the head until it spans at most 1.5 block ranges.
    ///
    /// Called with the WAL lock held.
    async fn compact(&self, wal: &mut WriteAheadLog) -> Result<()> {
        let range = self.config.block_range_ms();
        let mut cut = false;
        loop {
            let (min_time, max_time) = {
                let head = self.head.read();
                if head.is_empty() {
                    break;
                }
                (head.min_time(), head.max_time())
            };
            if max_time - min_time <= range / 2 * 3 {
                break;
            }

            let mint = min_time.div_euclid(range) * range;
            let maxt = mint + range;
            let series = self.head.read().range(mint, maxt);
            if !series.is_empty() {
                let meta = self.blocks.write(mint, maxt, &series).await?;
                let mut index = self.block_index.write();
                index.push(meta);
                index.sort_by_key(|b| (b.mint, b.maxt));
                metrics::counter!(
                    "tsdb_blocks_written_total",
                    "service" => crate::telemetry::service(),
                    "run_id" => crate::telemetry::run_id()
                )
                .increment(1);
            }
            let dropped = self.head.write().truncate(maxt);
            info!(
                target: "tsdb",
                block = %BlockMeta::new(mint, maxt),
                series = series.len(),
                dropped_series = dropped,
                "Compacted head block"
            );
            cut = true;
        }

        if cut {
            self.checkpoint_wal(wal).await?;
            self.enforce_retention().await?;
        }
        Ok(())
    }

    /// Replace the WAL history with one record holding the current head.
    async fn checkpoint_wal(&self, wal: &mut WriteAheadLog) -> Result<()> {
        wal.rotate().await?;
        let remaining: Vec<(Labels, Sample)> = self
            .head
            .read()
            .range(i64::MIN, i64::MAX)
            .into_iter()
            .flat_map(|(labels, samples)| samples.into_iter().map(move |s| (labels.clone(), s)))
            .collect();
        let replay_from = wal.next_seq();
        if !remaining.is_empty() {
            wal.append(&remaining).await?;
        }
        wal.truncate_before(replay_from).await?;
        debug!(target: "tsdb", replay_from, samples = remaining.len(), "Checkpointed WAL");
        Ok(())
    }

    /// Delete blocks that ended before `now - retention`.
    pub async fn enforce_retention(&self) -> Result<usize> {
        let cutoff = self.clock.retention_cutoff_ms(self.config.retention_ms());
        let expired: Vec<BlockMeta> = self
            .block_index
            .read()
            .iter()
            .filter(|b| b.maxt <= cutoff)
            .cloned()
            .collect();

        for meta in &expired {
            self.blocks.delete(meta).await?;
            self.block_index.write().retain(|b| b != meta);
            info!(target: "tsdb", block = %meta, cutoff, "Deleted block past retention");
        }
        Ok(expired.len())
    }

    fn allocate_ref(&self) -> SeriesRef {
        SeriesRef(self.next_ref.fetch_add(1, Ordering::Relaxed))
    }
}

#[async_trait]
impl Storage for LocalTsdb {
    fn appender(&self) -> Box<dyn Appender + '_> {
        Box::new(TsdbAppender::new(self))
    }

    fn min_valid_time(&self) -> i64 {
        self.head.read().min_valid_time()
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut wal = self.wal.lock().await;
        wal.sync().await?;
        let stats = self.stats();
        info!(
            target: "tsdb",
            series = stats.head_series,
            samples = stats.head_samples,
            blocks = stats.blocks,
            "Closed local TSDB"
        );
        Ok(())
    }
}

/// Series touched by the open transaction
struct PendingSeries {
    labels: Labels,
    /// Newest committed or pending sample
    last: Option<Sample>,
}

struct TsdbAppender<'a> {
    db: &'a LocalTsdb,
    series: HashMap<SeriesRef, PendingSeries>,
    created: HashMap<Labels, SeriesRef>,
    samples: Vec<(SeriesRef, Sample)>,
    min_valid_time: i64,
}

impl<'a> TsdbAppender<'a> {
    fn new(db: &'a LocalTsdb) -> Self {
        let min_valid_time = db.head.read().min_valid_time();
        Self {
            db,
            series: HashMap::new(),
            created: HashMap::new(),
            samples: Vec::new(),
            min_valid_time,
        }
    }

    fn add(&mut self, series: SeriesRef, sample: Sample) -> Result<()> {
        if sample.timestamp_ms < self.min_valid_time {
            return Err(AppendError::OutOfBounds {
                timestamp: sample.timestamp_ms,
                min_valid_time: self.min_valid_time,
            }
            .into());
        }
        let Some(pending) = self.series.get_mut(&series) else {
            return Err(Error::Internal(format!("series {:?} not tracked", series)));
        };
        if let Some(last) = pending.last {
            if sample.timestamp_ms < last.timestamp_ms {
                return Err(AppendError::OutOfOrderSample {
                    timestamp: sample.timestamp_ms,
                    last_timestamp: last.timestamp_ms,
                }
                .into());
            }
            if sample.timestamp_ms == last.timestamp_ms {
                if sample.value.to_bits() == last.value.to_bits() {
                    return Ok(());
                }
                return Err(AppendError::DuplicateSampleForTimestamp {
                    timestamp: sample.timestamp_ms,
                }
                .into());
            }
        }
        pending.last = Some(sample);
        self.samples.push((series, sample));
        Ok(())
    }

    fn clear(&mut self) {
        self.series.clear();
        self.created.clear();
        self.samples.clear();
    }
}

#[async_trait]
impl Appender for TsdbAppender<'_> {
    fn append(&mut self, labels: &Labels, timestamp_ms: i64, value: f64) -> Result<SeriesRef> {
        if labels.is_empty() {
            return Err(AppendError::EmptyLabelSet.into());
        }
        if let Some(name) = duplicate_label_name(labels.as_slice()) {
            return Err(AppendError::DuplicateLabelName {
                name: name.to_string(),
            }
            .into());
        }

        let series = match self.created.get(labels) {
            Some(series) => *series,
            None => {
                let existing = {
                    let head = self.db.head.read();
                    head.lookup(labels)
                        .map(|r| (r, head.get(r).and_then(|s| s.last())))
                };
                let (series, last) = match existing {
                    Some(found) => found,
                    None => (self.db.allocate_ref(), None),
                };
                self.series.entry(series).or_insert_with(|| PendingSeries {
                    labels: labels.clone(),
                    last,
                });
                self.created.insert(labels.clone(), series);
                series
            }
        };

        self.add(series, Sample::new(timestamp_ms, value))?;
        Ok(series)
    }

    fn append_ref(
        &mut self,
        series: SeriesRef,
        timestamp_ms: i64,
        value: f64,
    ) -> Result<AppendOutcome> {
        if !self.series.contains_key(&series) {
            let found = {
                let head = self.db.head.read();
                head.get(series).map(|s| (s.labels.clone(), s.last()))
            };
            let Some((labels, last)) = found else {
                return Ok(AppendOutcome::StaleReference);
            };
            self.created.insert(labels.clone(), series);
            self.series.insert(series, PendingSeries { labels, last });
        }

        self.add(series, Sample::new(timestamp_ms, value))?;
        Ok(AppendOutcome::Appended)
    }

    async fn commit(&mut self) -> Result<usize> {
        if self.samples.is_empty() {
            self.clear();
            return Ok(0);
        }
        if self.db.closed.load(Ordering::Acquire) {
            return Err(Error::EngineCommit("database is closed".to_string()));
        }

        let db = self.db;
        let records: Vec<(Labels, Sample)> = self
            .samples
            .iter()
            .filter_map(|(series, sample)| {
                self.series
                    .get(series)
                    .map(|p| (p.labels.clone(), *sample))
            })
            .collect();

        let mut wal = db.wal.lock().await;
        wal.append(&records)
            .await
            .map_err(|e| Error::EngineCommit(format!("WAL append failed: {}", e)))?;

        {
            let mut head = db.head.write();
            for (labels, sample) in &records {
                let preferred = self
                    .created
                    .get(labels)
                    .copied()
                    .unwrap_or_else(|| db.allocate_ref());
                let series = head.get_or_create(labels, preferred);
                let newer = head
                    .get(series)
                    .and_then(|s| s.last())
                    .map_or(true, |last| sample.timestamp_ms > last.timestamp_ms);
                if newer {
                    head.push(series, *sample);
                }
            }
        }
        self.clear();

        if let Err(e) = db.compact(&mut wal).await {
            error!(target: "tsdb", error = %e, "Head compaction failed, keeping samples in the head");
        }
        self.min_valid_time = db.head.read().min_valid_time();
        Ok(records.len())
    }

    fn rollback(&mut self) {
        self.clear();
    }
}
