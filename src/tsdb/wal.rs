//! Write-ahead log for committed samples
//!
//! Each commit becomes one record: an Arrow IPC stream holding a single
//! batch of `(labels, timestamp, value)` rows. Records live in numbered
//! segment files and carry a sequence number and CRC so a torn tail can be
//! detected and dropped on replay.

use super::Labels;
use crate::model::Sample;
use crate::{Error, Result};

use arrow_array::builder::{Float64Builder, Int64Builder, StringBuilder};
use arrow_array::{Array, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_ipc::reader::StreamReader;
use arrow_ipc::writer::StreamWriter;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use crc32fast::Hasher;
use std::fs::File as StdFile;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;

const MAGIC: &[u8; 4] = b"CMWA";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 18;
const SEGMENT_PREFIX: &str = "segment-";
const SEGMENT_SUFFIX: &str = ".wal";
const REPLAY_FROM_FILE: &str = "replay_from";

/// WAL configuration.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Maximum segment size before rotation.
    pub max_segment_size: usize,
    /// fsync strategy.
    pub sync_mode: WalSyncMode,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            max_segment_size: 64 * 1024 * 1024,
            sync_mode: WalSyncMode::EveryWrite,
        }
    }
}

/// WAL fsync strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalSyncMode {
    /// fsync after every commit.
    EveryWrite,
    /// fsync at most once per interval.
    Interval(Duration),
    /// fsync only on segment rotation and close.
    OnRotation,
    /// Leave flushing to the OS.
    None,
}

impl std::str::FromStr for WalSyncMode {
    type Err = String;

    /// Accepts `every_write`, `interval_100ms`, `interval_1s`, `on_rotation`
    /// and `none`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        match lower.as_str() {
            "every_write" => Ok(Self::EveryWrite),
            "on_rotation" => Ok(Self::OnRotation),
            "none" => Ok(Self::None),
            other => {
                let Some(suffix) = other.strip_prefix("interval_") else {
                    return Err(format!(
                        "unknown WAL sync mode '{other}', use every_write, interval_100ms, on_rotation or none"
                    ));
                };
                let millis = if let Some(ms) = suffix.strip_suffix("ms") {
                    ms.parse::<u64>().map_err(|e| format!("invalid interval: {e}"))?
                } else if let Some(secs) = suffix.strip_suffix('s') {
                    secs.parse::<u64>().map_err(|e| format!("invalid interval: {e}"))? * 1000
                } else {
                    return Err(format!("invalid interval '{suffix}' (use e.g. interval_100ms)"));
                };
                Ok(Self::Interval(Duration::from_millis(millis)))
            }
        }
    }
}

/// One decoded WAL record.
#[derive(Debug, Clone)]
pub struct WalRecord {
    pub seq: u64,
    pub samples: Vec<(Labels, Sample)>,
}

fn record_schema() -> SchemaRef {
    static SCHEMA: OnceLock<SchemaRef> = OnceLock::new();
    SCHEMA
        .get_or_init(|| {
            Arc::new(Schema::new(vec![
                Field::new("labels", DataType::Utf8, false),
                Field::new("timestamp", DataType::Int64, false),
                Field::new("value", DataType::Float64, false),
            ]))
        })
        .clone()
}

/// Build the Arrow batch for one commit.
///
/// Label sets are rendered once per series; consecutive samples of the same
/// series reuse the rendering.
pub(crate) fn encode_samples(samples: &[(Labels, Sample)]) -> Result<RecordBatch> {
    let mut labels = StringBuilder::new();
    let mut timestamps = Int64Builder::with_capacity(samples.len());
    let mut values = Float64Builder::with_capacity(samples.len());

    let mut prev: Option<&Labels> = None;
    let mut json = String::new();
    for (series, sample) in samples {
        if prev != Some(series) {
            json = series.to_json()?;
            prev = Some(series);
        }
        labels.append_value(&json);
        timestamps.append_value(sample.timestamp_ms);
        values.append_value(sample.value);
    }

    Ok(RecordBatch::try_new(
        record_schema(),
        vec![
            Arc::new(labels.finish()),
            Arc::new(timestamps.finish()),
            Arc::new(values.finish()),
        ],
    )?)
}

fn decode_samples(batch: &RecordBatch) -> Result<Vec<(Labels, Sample)>> {
    let column = |name: &str| {
        batch
            .column_by_name(name)
            .ok_or_else(|| Error::Serialization(format!("WAL record missing column {name}")))
    };
    let labels = column("labels")?
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| Error::Serialization("WAL labels column is not Utf8".to_string()))?;
    let timestamps = column("timestamp")?
        .as_any()
        .downcast_ref::<Int64Array>()
        .ok_or_else(|| Error::Serialization("WAL timestamp column is not Int64".to_string()))?;
    let values = column("value")?
        .as_any()
        .downcast_ref::<Float64Array>()
        .ok_or_else(|| Error::Serialization("WAL value column is not Float64".to_string()))?;

    let mut out = Vec::with_capacity(batch.num_rows());
    let mut prev_raw: Option<&str> = None;
    let mut series = Labels::default();
    for row in 0..batch.num_rows() {
        let raw = labels.value(row);
        if prev_raw != Some(raw) {
            series = Labels::from_json(raw)?;
            prev_raw = Some(raw);
        }
        out.push((series.clone(), Sample::new(timestamps.value(row), values.value(row))));
    }
    Ok(out)
}

fn encode_payload(samples: &[(Labels, Sample)]) -> Result<Vec<u8>> {
    let batch = encode_samples(samples)?;
    let mut buffer = Vec::new();
    let mut writer = StreamWriter::try_new(&mut buffer, &batch.schema())?;
    writer.write(&batch)?;
    writer.finish()?;
    drop(writer);
    Ok(buffer)
}

fn decode_payload(payload: &[u8]) -> Result<Vec<(Labels, Sample)>> {
    let reader = StreamReader::try_new(io::Cursor::new(payload), None)?;
    let mut samples = Vec::new();
    for batch in reader {
        samples.extend(decode_samples(&batch?)?);
    }
    Ok(samples)
}

/// Segmented write-ahead log.
pub struct WriteAheadLog {
    dir: PathBuf,
    config: WalConfig,
    segment_id: u64,
    segment_size: u64,
    file: tokio::fs::File,
    next_seq: u64,
    last_sync: Instant,
    dirty: bool,
}

impl WriteAheadLog {
    /// Open or create the log in `dir`.
    pub async fn open(dir: impl Into<PathBuf>, config: WalConfig) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;

        let segments = list_segments(&dir)?;
        let segment_id = segments.last().map(|s| s.id).unwrap_or(1);
        let path = dir.join(segment_file_name(segment_id));

        let file = open_segment(&path).await?;
        let mut segment_size = file.metadata().await?.len();

        // Appending after a torn record would hide every later record from
        // replay, so cut the active segment back to its last valid record.
        let valid_len = read_segment(&path)?.valid_len;
        if valid_len < segment_size {
            warn!(
                target: "tsdb",
                path = %path.display(),
                valid_len,
                file_len = segment_size,
                "Truncating torn WAL tail"
            );
            file.set_len(valid_len).await?;
            file.sync_data().await?;
            segment_size = valid_len;
        }

        let mut last_seq = 0;
        for segment in segments.iter().rev() {
            if let Some(seq) = last_sequence_in(&segment.path)? {
                last_seq = seq;
                break;
            }
        }
        let next_seq = (last_seq + 1).max(load_replay_from(&dir).await?);

        Ok(Self {
            dir,
            config,
            segment_id,
            segment_size,
            file,
            next_seq,
            last_sync: Instant::now(),
            dirty: false,
        })
    }

    /// Sequence number the next record will get.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Append the samples of one commit. Returns the record's sequence.
    pub async fn append(&mut self, samples: &[(Labels, Sample)]) -> Result<u64> {
        let payload = encode_payload(samples)?;
        let seq = self.next_seq;

        let header = encode_header(seq, &payload);
        let crc = checksum(&payload).to_le_bytes();
        let record_size = (header.len() + payload.len() + crc.len()) as u64;
        if self.config.max_segment_size > 0
            && self.segment_size > 0
            && self.segment_size + record_size > self.config.max_segment_size as u64
        {
            self.rotate().await?;
        }

        self.file.write_all(&header).await?;
        self.file.write_all(&payload).await?;
        self.file.write_all(&crc).await?;
        self.segment_size += record_size;
        self.next_seq += 1;
        self.dirty = true;

        match self.config.sync_mode {
            WalSyncMode::EveryWrite => self.sync().await?,
            WalSyncMode::Interval(interval) => {
                if interval.is_zero() || self.last_sync.elapsed() >= interval {
                    self.sync().await?;
                }
            }
            WalSyncMode::OnRotation | WalSyncMode::None => {}
        }

        Ok(seq)
    }

    /// Start a new segment.
    pub async fn rotate(&mut self) -> Result<()> {
        if self.dirty && self.config.sync_mode != WalSyncMode::None {
            self.sync().await?;
        }
        self.segment_id += 1;
        self.file = open_segment(&self.dir.join(segment_file_name(self.segment_id))).await?;
        self.segment_size = 0;
        Ok(())
    }

    /// Flush buffered writes to disk.
    pub async fn sync(&mut self) -> Result<()> {
        self.file.flush().await?;
        self.file.sync_data().await?;
        self.last_sync = Instant::now();
        self.dirty = false;
        Ok(())
    }

    /// Records that replay must apply: those at or after the persisted
    /// replay point.
    pub async fn replay(&self) -> Result<Vec<WalRecord>> {
        let from = load_replay_from(&self.dir).await?;
        let mut records = Vec::new();
        for segment in list_segments(&self.dir)? {
            for (seq, payload) in read_segment(&segment.path)?.records {
                if seq < from {
                    continue;
                }
                records.push(WalRecord {
                    seq,
                    samples: decode_payload(&payload)?,
                });
            }
        }
        Ok(records)
    }

    /// Mark `seq` as the first record replay needs and delete segments that
    /// only hold older records.
    pub async fn truncate_before(&mut self, seq: u64) -> Result<()> {
        persist_replay_from(&self.dir, seq).await?;
        for segment in list_segments(&self.dir)? {
            if segment.id >= self.segment_id {
                break;
            }
            match last_sequence_in(&segment.path)? {
                Some(last) if last >= seq => break,
                _ => fs::remove_file(&segment.path).await?,
            }
        }
        Ok(())
    }
}

fn encode_header(seq: u64, payload: &[u8]) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(MAGIC);
    header[4] = VERSION;
    header[5] = 0;
    header[6..14].copy_from_slice(&seq.to_le_bytes());
    header[14..18].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    header
}

fn checksum(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

fn decode_header(header: &[u8; HEADER_LEN]) -> Option<(u64, usize)> {
    if &header[0..4] != MAGIC || header[4] != VERSION {
        return None;
    }
    let seq = u64::from_le_bytes(header[6..14].try_into().ok()?);
    let len = u32::from_le_bytes(header[14..18].try_into().ok()?) as usize;
    Some((seq, len))
}

/// Records of one segment up to the first torn or corrupt record.
struct SegmentScan {
    records: Vec<(u64, Vec<u8>)>,
    /// Byte offset just past the last valid record.
    valid_len: u64,
}

/// Read `(seq, payload)` pairs from one segment, stopping at the first torn
/// or corrupt record.
fn read_segment(path: &Path) -> Result<SegmentScan> {
    let mut reader = BufReader::new(StdFile::open(path)?);
    let mut records = Vec::new();
    let mut valid_len = 0u64;
    loop {
        let mut header = [0u8; HEADER_LEN];
        match read_full(&mut reader, &mut header)? {
            ReadState::Eof => break,
            ReadState::Partial => {
                warn!(target: "tsdb", path = %path.display(), records = records.len(), "Truncated WAL header, treating as crash point");
                break;
            }
            ReadState::Full => {}
        }
        let Some((seq, len)) = decode_header(&header) else {
            warn!(target: "tsdb", path = %path.display(), records = records.len(), "Corrupt WAL header, stopping replay of segment");
            break;
        };

        let mut payload = vec![0u8; len];
        let mut crc = [0u8; 4];
        if read_full(&mut reader, &mut payload)? != ReadState::Full
            || read_full(&mut reader, &mut crc)? != ReadState::Full
        {
            warn!(target: "tsdb", seq, path = %path.display(), "Truncated WAL record, discarding it");
            break;
        }
        if u32::from_le_bytes(crc) != checksum(&payload) {
            warn!(target: "tsdb", seq, path = %path.display(), "WAL checksum mismatch, discarding trailing record");
            break;
        }
        valid_len += (HEADER_LEN + len + crc.len()) as u64;
        records.push((seq, payload));
    }
    Ok(SegmentScan { records, valid_len })
}

#[derive(Debug, PartialEq, Eq)]
enum ReadState {
    Full,
    Partial,
    Eof,
}

fn read_full<R: Read>(reader: &mut R, buffer: &mut [u8]) -> Result<ReadState> {
    let mut offset = 0;
    while offset < buffer.len() {
        let read = reader.read(&mut buffer[offset..])?;
        if read == 0 {
            return Ok(if offset == 0 {
                ReadState::Eof
            } else {
                ReadState::Partial
            });
        }
        offset += read;
    }
    Ok(ReadState::Full)
}

fn segment_file_name(id: u64) -> String {
    format!("{}{:06}{}", SEGMENT_PREFIX, id, SEGMENT_SUFFIX)
}

#[derive(Debug)]
struct SegmentInfo {
    id: u64,
    path: PathBuf,
}

fn list_segments(dir: &Path) -> Result<Vec<SegmentInfo>> {
    let mut segments = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let id = name
            .to_str()
            .and_then(|n| n.strip_prefix(SEGMENT_PREFIX))
            .and_then(|n| n.strip_suffix(SEGMENT_SUFFIX))
            .and_then(|n| n.parse::<u64>().ok());
        if let Some(id) = id {
            segments.push(SegmentInfo {
                id,
                path: entry.path(),
            });
        }
    }
    segments.sort_by_key(|s| s.id);
    Ok(segments)
}

fn last_sequence_in(path: &Path) -> Result<Option<u64>> {
    Ok(read_segment(path)?.records.last().map(|(seq, _)| *seq))
}

async fn open_segment(path: &Path) -> Result<tokio::fs::File> {
    Ok(OpenOptions::new()
        .create(true)
        .append(true)
        .read(true)
        .open(path)
        .await?)
}

async fn persist_replay_from(dir: &Path, seq: u64) -> Result<()> {
    let path = dir.join(REPLAY_FROM_FILE);
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, seq.to_le_bytes()).await?;
    fs::rename(&tmp, &path).await?;
    Ok(())
}

async fn load_replay_from(dir: &Path) -> Result<u64> {
    match fs::read(dir.join(REPLAY_FROM_FILE)).await {
        Ok(bytes) => match <[u8; 8]>::try_from(bytes.as_slice()) {
            Ok(raw) => Ok(u64::from_le_bytes(raw)),
            Err(_) => {
                warn!(target: "tsdb", "Corrupt WAL replay marker, replaying everything");
                Ok(0)
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(Error::Io(e)),
    }
}
