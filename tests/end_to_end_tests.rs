//! End-to-end integration tests
//!
//! Tests the complete system with all parts working together:
//! - Remote read over HTTP with snappy protobuf bodies
//! - Slice-by-slice migration through the bounded pipeline
//! - Local TSDB with WAL, block compaction and reopen

mod support;

use cardinalsin_migrate::clock::ManualClock;
use cardinalsin_migrate::config::{MigrationConfig, ReaderConfig, TsdbConfig};
use cardinalsin_migrate::model::{Label, TimeSeries};
use cardinalsin_migrate::pipeline::Migration;
use cardinalsin_migrate::reader::Reader;
use cardinalsin_migrate::tsdb::{LocalTsdb, Storage};
use cardinalsin_migrate::writer::Writer;
use cardinalsin_migrate::Error;

use chrono::TimeDelta;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use support::{series, spawn_remote_read, t0};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const SCRAPE_INTERVAL_MS: i64 = 15_000;

/// `up` and `node_load1` scraped every 15s for `minutes` minutes from t0.
fn scraped(minutes: i64) -> Vec<TimeSeries> {
    let start = t0().timestamp_millis();
    let samples: Vec<(i64, f64)> = (0..minutes * 4)
        .map(|i| (start + i * SCRAPE_INTERVAL_MS, 1.0))
        .collect();
    let load: Vec<(i64, f64)> = samples
        .iter()
        .enumerate()
        .map(|(i, (t, _))| (*t, i as f64 / 10.0))
        .collect();
    vec![
        series(
            &[("__name__", "up"), ("instance", "localhost:9100"), ("job", "node")],
            &samples,
        ),
        series(
            &[("job", "node"), ("__name__", "node_load1"), ("instance", "localhost:9100")],
            &load,
        ),
    ]
}

fn reader(addr: SocketAddr, strict: bool) -> Arc<Reader> {
    let config = ReaderConfig {
        strict,
        ..ReaderConfig::new(&format!("http://{addr}/api/v1/read")).unwrap()
    };
    Arc::new(Reader::new(config).unwrap())
}

fn tsdb_config(dir: &TempDir) -> TsdbConfig {
    TsdbConfig {
        block_range: Duration::from_secs(120),
        ..TsdbConfig::new(dir.path())
    }
}

#[tokio::test]
async fn test_migrates_all_history_into_tsdb() {
    let dir = TempDir::new().unwrap();
    let addr = spawn_remote_read(scraped(10)).await;
    let clock = Arc::new(ManualClock::new(t0() + TimeDelta::minutes(10)));
    let tsdb = Arc::new(
        LocalTsdb::open(tsdb_config(&dir), clock.clone())
            .await
            .unwrap(),
    );

    let migration = Migration::new(
        MigrationConfig {
            last: Duration::from_secs(600),
            queue_capacity: 3,
            ..Default::default()
        },
        clock.clone(),
    );
    let report = migration
        .run(
            reader(addr, true),
            Arc::new(Writer::new(tsdb.clone())),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.begin, t0());
    assert_eq!(report.slices_fetched, 11);
    assert_eq!(report.batches_committed, 10);
    assert_eq!(report.empty_slices, 1);
    assert_eq!(report.samples_committed, 80);
    assert_eq!(report.migrated(), TimeDelta::minutes(10));

    // Ten minutes with a two minute block range leaves some of it in blocks.
    assert!(!tsdb.blocks().is_empty());

    let start = t0().timestamp_millis();
    let end = start + 10 * 60_000;
    let stored = tsdb.select(start, end).await.unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(
        stored[0].labels,
        vec![
            Label::new("__name__", "node_load1"),
            Label::new("instance", "localhost:9100"),
            Label::new("job", "node"),
        ]
    );
    assert_eq!(stored[1].labels[0], Label::new("__name__", "up"));
    for ts in &stored {
        assert_eq!(ts.samples.len(), 40);
        assert!(ts.samples.windows(2).all(|w| w[0].timestamp_ms < w[1].timestamp_ms));
    }
    assert_eq!(stored[0].samples[39].value, 3.9);
}

#[tokio::test]
async fn test_migrated_data_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let addr = spawn_remote_read(scraped(5)).await;
    let clock = Arc::new(ManualClock::new(t0() + TimeDelta::minutes(5)));

    let expected = {
        let tsdb = Arc::new(
            LocalTsdb::open(tsdb_config(&dir), clock.clone())
                .await
                .unwrap(),
        );
        Migration::new(
            MigrationConfig {
                last: Duration::from_secs(300),
                ..Default::default()
            },
            clock.clone(),
        )
        .run(
            reader(addr, false),
            Arc::new(Writer::new(tsdb.clone())),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        tsdb.select(i64::MIN, i64::MAX).await.unwrap()
    };

    let reopened = LocalTsdb::open(tsdb_config(&dir), clock).await.unwrap();
    assert_eq!(reopened.select(i64::MIN, i64::MAX).await.unwrap(), expected);
    assert_eq!(expected.iter().map(|ts| ts.samples.len()).sum::<usize>(), 40);
    reopened.close().await.unwrap();
}

#[tokio::test]
async fn test_strict_check_failure_stops_migration() {
    let dir = TempDir::new().unwrap();
    let start = t0().timestamp_millis();
    let mut data = scraped(3);
    data.push(series(
        &[("__name__", "broken")],
        &[(start + 60_000 + 2000, 1.0), (start + 60_000 + 1000, 1.0)],
    ));
    let addr = spawn_remote_read(data).await;
    let clock = Arc::new(ManualClock::new(t0() + TimeDelta::minutes(3)));
    let tsdb = Arc::new(
        LocalTsdb::open(tsdb_config(&dir), clock.clone())
            .await
            .unwrap(),
    );

    let err = Migration::new(
        MigrationConfig {
            last: Duration::from_secs(180),
            ..Default::default()
        },
        clock,
    )
    .run(
        reader(addr, true),
        Arc::new(Writer::new(tsdb.clone())),
        CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::Validation(_)), "unexpected error {err:?}");
    // Only the slice before the broken one was committed.
    let stored = tsdb.select(start, start + 10 * 60_000).await.unwrap();
    assert_eq!(stored.iter().map(|ts| ts.samples.len()).sum::<usize>(), 8);
    assert!(stored.iter().all(|ts| ts.samples.iter().all(|s| s.timestamp_ms < start + 60_000)));
}
