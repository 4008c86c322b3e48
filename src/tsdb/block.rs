//! Persisted blocks
//!
//! A block holds every sample of one block range in a single Parquet file
//! named `<mint>_<maxt>.parquet`. Rows are laid out with labels as columns:
//! `timestamp`, `metric_name`, `value_f64`, then one nullable `label_<name>`
//! column per label name seen in the block, sorted by name.

use super::Labels;
use crate::model::{Label, Sample, METRIC_NAME_LABEL};
use crate::{Error, Result};

use arrow_array::{Array, ArrayRef, Float64Array, RecordBatch, StringArray, TimestampMillisecondArray};
use arrow_schema::{DataType, Field, Schema, TimeUnit};
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::{EnabledStatistics, WriterProperties, WriterVersion};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

const TIMESTAMP_FIELD: &str = "timestamp";
const METRIC_NAME_FIELD: &str = "metric_name";
const VALUE_F64_FIELD: &str = "value_f64";
const LABEL_PREFIX: &str = "label_";
const BLOCK_SUFFIX: &str = ".parquet";

/// Time range and location of one persisted block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMeta {
    /// Inclusive lower bound (millis)
    pub mint: i64,
    /// Exclusive upper bound (millis)
    pub maxt: i64,
    pub location: ObjectPath,
}

impl BlockMeta {
    pub fn new(mint: i64, maxt: i64) -> Self {
        Self {
            mint,
            maxt,
            location: ObjectPath::from(format!("{}_{}{}", mint, maxt, BLOCK_SUFFIX)),
        }
    }

    /// Parse a block file name; anything else in the directory is ignored.
    pub fn from_location(location: &ObjectPath) -> Option<Self> {
        let name = location.filename()?.strip_suffix(BLOCK_SUFFIX)?;
        let (mint, maxt) = name.split_once('_')?;
        let (mint, maxt) = (mint.parse().ok()?, maxt.parse().ok()?);
        (mint < maxt).then(|| Self::new(mint, maxt))
    }

    /// Whether the block holds any timestamp in `[mint, maxt)`.
    pub fn overlaps(&self, mint: i64, maxt: i64) -> bool {
        self.mint < maxt && mint < self.maxt
    }
}

impl fmt::Display for BlockMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.mint, self.maxt)
    }
}

/// Reads and writes blocks through an object store rooted at the block
/// directory.
pub struct BlockStore {
    store: Arc<dyn ObjectStore>,
    props: WriterProperties,
}

impl BlockStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            props: writer_properties(),
        }
    }

    /// Every block in the store, oldest first.
    pub async fn list(&self) -> Result<Vec<BlockMeta>> {
        let objects: Vec<_> = self.store.list(None).try_collect().await?;
        let mut blocks: Vec<BlockMeta> = objects
            .iter()
            .filter_map(|o| BlockMeta::from_location(&o.location))
            .collect();
        blocks.sort_by_key(|b| (b.mint, b.maxt));
        Ok(blocks)
    }

    /// Persist `series` as the block `[mint, maxt)`.
    pub async fn write(
        &self,
        mint: i64,
        maxt: i64,
        series: &[(Labels, Vec<Sample>)],
    ) -> Result<BlockMeta> {
        let meta = BlockMeta::new(mint, maxt);
        let batch = series_to_batch(series)?;

        let mut buffer = Vec::new();
        {
            let mut writer =
                ArrowWriter::try_new(&mut buffer, batch.schema(), Some(self.props.clone()))?;
            writer.write(&batch)?;
            writer.close()?;
        }

        self.store
            .put(&meta.location, Bytes::from(buffer).into())
            .await?;
        Ok(meta)
    }

    /// Load the series stored in `meta`, restricted to `[mint, maxt)`.
    pub async fn read(
        &self,
        meta: &BlockMeta,
        mint: i64,
        maxt: i64,
    ) -> Result<Vec<(Labels, Vec<Sample>)>> {
        let data = self.store.get(&meta.location).await?.bytes().await?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(data)?.build()?;

        let mut series: BTreeMap<Labels, Vec<Sample>> = BTreeMap::new();
        for batch in reader {
            batch_to_series(&batch?, mint, maxt, &mut series)?;
        }
        Ok(series.into_iter().collect())
    }

    pub async fn delete(&self, meta: &BlockMeta) -> Result<()> {
        self.store.delete(&meta.location).await?;
        Ok(())
    }
}

fn writer_properties() -> WriterProperties {
    let compression = ZstdLevel::try_new(3)
        .map(Compression::ZSTD)
        .unwrap_or(Compression::SNAPPY);
    WriterProperties::builder()
        .set_writer_version(WriterVersion::PARQUET_2_0)
        .set_compression(compression)
        .set_dictionary_enabled(true)
        .set_max_row_group_size(500_000)
        .set_statistics_enabled(EnabledStatistics::Page)
        .set_data_page_size_limit(1024 * 1024)
        .build()
}

fn series_to_batch(series: &[(Labels, Vec<Sample>)]) -> Result<RecordBatch> {
    let label_names: BTreeSet<&str> = series
        .iter()
        .flat_map(|(labels, _)| labels.iter())
        .filter(|l| l.name != METRIC_NAME_LABEL)
        .map(|l| l.name.as_str())
        .collect();

    let total: usize = series.iter().map(|(_, s)| s.len()).sum();
    let mut timestamps = Vec::with_capacity(total);
    let mut metric_names = Vec::with_capacity(total);
    let mut values = Vec::with_capacity(total);
    let mut label_values: BTreeMap<&str, Vec<Option<&str>>> = label_names
        .iter()
        .map(|name| (*name, Vec::with_capacity(total)))
        .collect();

    for (labels, samples) in series {
        let metric_name = labels.metric_name();
        for sample in samples {
            timestamps.push(sample.timestamp_ms);
            metric_names.push(metric_name);
            values.push(sample.value);
            for (name, column) in label_values.iter_mut() {
                column.push(labels.get(name));
            }
        }
    }

    let mut fields = vec![
        Field::new(
            TIMESTAMP_FIELD,
            DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into())),
            false,
        ),
        Field::new(METRIC_NAME_FIELD, DataType::Utf8, true),
        Field::new(VALUE_F64_FIELD, DataType::Float64, false),
    ];
    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(TimestampMillisecondArray::from(timestamps).with_timezone("UTC")),
        Arc::new(StringArray::from(metric_names)),
        Arc::new(Float64Array::from(values)),
    ];
    for (name, column) in label_values {
        fields.push(Field::new(format!("{LABEL_PREFIX}{name}"), DataType::Utf8, true));
        columns.push(Arc::new(StringArray::from(column)));
    }

    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?)
}

fn batch_to_series(
    batch: &RecordBatch,
    mint: i64,
    maxt: i64,
    out: &mut BTreeMap<Labels, Vec<Sample>>,
) -> Result<()> {
    let schema = batch.schema();
    let timestamps = typed_column::<TimestampMillisecondArray>(batch, TIMESTAMP_FIELD)?;
    let metric_names = typed_column::<StringArray>(batch, METRIC_NAME_FIELD)?;
    let values = typed_column::<Float64Array>(batch, VALUE_F64_FIELD)?;

    let mut label_columns = Vec::new();
    for (index, field) in schema.fields().iter().enumerate() {
        if let Some(name) = field.name().strip_prefix(LABEL_PREFIX) {
            let column = batch
                .column(index)
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| Error::Serialization(format!("label column {name} is not Utf8")))?;
            label_columns.push((name, column));
        }
    }

    for row in 0..batch.num_rows() {
        let timestamp = timestamps.value(row);
        if timestamp < mint || timestamp >= maxt {
            continue;
        }

        let mut labels = Vec::with_capacity(label_columns.len() + 1);
        if metric_names.is_valid(row) {
            labels.push(Label::new(METRIC_NAME_LABEL, metric_names.value(row)));
        }
        for (name, column) in &label_columns {
            if column.is_valid(row) {
                labels.push(Label::new(*name, column.value(row)));
            }
        }

        out.entry(Labels::new(labels))
            .or_default()
            .push(Sample::new(timestamp, values.value(row)));
    }
    Ok(())
}

fn typed_column<'a, T: Array + 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .ok_or_else(|| Error::Serialization(format!("block is missing column {name}")))
}
