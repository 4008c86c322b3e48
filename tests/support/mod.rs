//! Shared fixtures for the integration tests
//!
//! - `MockSource`: in-memory `SeriesSource` keyed by slice start
//! - `FlakyStorage`: wraps an engine and injects append failures, stale
//!   references and slow commits
//! - `spawn_remote_read`: in-process axum server speaking remote read

#![allow(dead_code)]

use axum::body::Bytes;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use cardinalsin_migrate::model::{Label, Sample, SeriesBatch, TimeSeries, TimeWindow};
use cardinalsin_migrate::reader::SeriesSource;
use cardinalsin_migrate::remote::{self, QueryResult, ReadResponse};
use cardinalsin_migrate::tsdb::{AppendOutcome, Appender, Labels, SeriesRef, Storage};
use cardinalsin_migrate::{Error, Result};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// 2017-11-01T00:00:00Z, minute aligned
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2017, 11, 1, 0, 0, 0).unwrap()
}

pub fn series(pairs: &[(&str, &str)], samples: &[(i64, f64)]) -> TimeSeries {
    TimeSeries::new(
        pairs.iter().map(|(n, v)| Label::new(*n, *v)).collect(),
        samples.iter().map(|(t, v)| Sample::new(*t, *v)).collect(),
    )
}

// ============================================================================
// Source
// ============================================================================

/// Serves fixed series per slice and records every fetch.
#[derive(Default)]
pub struct MockSource {
    slices: HashMap<DateTime<Utc>, Vec<TimeSeries>>,
    fail_at: Option<DateTime<Utc>>,
    /// Cancel this token once the given number of fetches completed
    cancel_after: Option<(usize, CancellationToken)>,
    /// Hold fetches at or after this slice start until cancelled
    hang_at: Option<DateTime<Utc>>,
    pub fetched: Mutex<Vec<TimeWindow>>,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_slice(mut self, start: DateTime<Utc>, series: Vec<TimeSeries>) -> Self {
        self.slices.insert(start, series);
        self
    }

    pub fn failing_at(mut self, start: DateTime<Utc>) -> Self {
        self.fail_at = Some(start);
        self
    }

    pub fn cancel_after(mut self, fetches: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((fetches, token));
        self
    }

    pub fn hanging_at(mut self, start: DateTime<Utc>) -> Self {
        self.hang_at = Some(start);
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetched.lock().len()
    }

    pub fn fetched_starts(&self) -> Vec<DateTime<Utc>> {
        self.fetched.lock().iter().map(|w| w.start).collect()
    }
}

#[async_trait]
impl SeriesSource for MockSource {
    async fn fetch(&self, window: TimeWindow) -> Result<SeriesBatch> {
        if self.hang_at.is_some_and(|at| window.start >= at) {
            std::future::pending::<()>().await;
        }
        let count = {
            let mut fetched = self.fetched.lock();
            fetched.push(window);
            fetched.len()
        };
        if self.fail_at == Some(window.start) {
            return Err(Error::Transport(format!("connection refused fetching {window}")));
        }
        if let Some((after, token)) = &self.cancel_after {
            if count >= *after {
                token.cancel();
            }
        }
        let series = self.slices.get(&window.start).cloned().unwrap_or_default();
        Ok(SeriesBatch::new(window, series))
    }
}

// ============================================================================
// Storage
// ============================================================================

/// Failure-injecting wrapper around a real engine.
pub struct FlakyStorage {
    inner: Arc<dyn Storage>,
    /// Fail the append after this many successful appends (across the run)
    fail_after: Option<usize>,
    /// Report every n-th append by reference as stale
    stale_every: Option<usize>,
    /// Sleep before each commit
    commit_delay: Option<Duration>,
    appends: AtomicUsize,
    ref_appends: AtomicUsize,
    pub commits: AtomicUsize,
}

impl FlakyStorage {
    pub fn new(inner: Arc<dyn Storage>) -> Self {
        Self {
            inner,
            fail_after: None,
            stale_every: None,
            commit_delay: None,
            appends: AtomicUsize::new(0),
            ref_appends: AtomicUsize::new(0),
            commits: AtomicUsize::new(0),
        }
    }

    pub fn fail_after(mut self, appends: usize) -> Self {
        self.fail_after = Some(appends);
        self
    }

    pub fn stale_every(mut self, n: usize) -> Self {
        self.stale_every = Some(n);
        self
    }

    pub fn commit_delay(mut self, delay: Duration) -> Self {
        self.commit_delay = Some(delay);
        self
    }

    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    fn count_append(&self) -> Result<()> {
        let done = self.appends.fetch_add(1, Ordering::SeqCst);
        if self.fail_after.is_some_and(|limit| done >= limit) {
            return Err(Error::Internal(format!("injected failure after {done} appends")));
        }
        Ok(())
    }
}

struct FlakyAppender<'a> {
    owner: &'a FlakyStorage,
    inner: Box<dyn Appender + 'a>,
}

#[async_trait]
impl Appender for FlakyAppender<'_> {
    fn append(&mut self, labels: &Labels, timestamp_ms: i64, value: f64) -> Result<SeriesRef> {
        self.owner.count_append()?;
        self.inner.append(labels, timestamp_ms, value)
    }

    fn append_ref(
        &mut self,
        series: SeriesRef,
        timestamp_ms: i64,
        value: f64,
    ) -> Result<AppendOutcome> {
        let n = self.owner.ref_appends.fetch_add(1, Ordering::SeqCst) + 1;
        if self.owner.stale_every.is_some_and(|every| n % every == 0) {
            return Ok(AppendOutcome::StaleReference);
        }
        self.owner.count_append()?;
        self.inner.append_ref(series, timestamp_ms, value)
    }

    async fn commit(&mut self) -> Result<usize> {
        if let Some(delay) = self.owner.commit_delay {
            tokio::time::sleep(delay).await;
        }
        let stored = self.inner.commit().await?;
        self.owner.commits.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }

    fn rollback(&mut self) {
        self.inner.rollback();
    }
}

#[async_trait]
impl Storage for FlakyStorage {
    fn appender(&self) -> Box<dyn Appender + '_> {
        Box::new(FlakyAppender {
            owner: self,
            inner: self.inner.appender(),
        })
    }

    fn min_valid_time(&self) -> i64 {
        self.inner.min_valid_time()
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

// ============================================================================
// Remote read server
// ============================================================================

/// Start a remote read server holding `series`; each query answers with the
/// samples inside its inclusive `[start, end]` bounds.
pub async fn spawn_remote_read(series: Vec<TimeSeries>) -> SocketAddr {
    let series = Arc::new(series);
    let app = Router::new().route(
        "/api/v1/read",
        post(move |headers: HeaderMap, body: Bytes| {
            let series = series.clone();
            async move { answer(&series, &headers, &body) }
        }),
    );
    serve(app).await
}

/// Start a server whose every answer is `status` with `body`.
pub async fn spawn_failing_endpoint(status: StatusCode, body: &'static str) -> SocketAddr {
    let app = Router::new().route("/api/v1/read", post(move || async move { (status, body) }));
    serve(app).await
}

/// Start a server returning `results` result sets per response.
pub async fn spawn_result_count_endpoint(results: usize) -> SocketAddr {
    let app = Router::new().route(
        "/api/v1/read",
        post(move || async move {
            let response = ReadResponse {
                results: vec![QueryResult::default(); results],
            };
            match remote::encode_response(&response) {
                Ok(body) => (StatusCode::OK, body).into_response(),
                Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
            }
        }),
    );
    serve(app).await
}

async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn answer(series: &[TimeSeries], headers: &HeaderMap, body: &[u8]) -> axum::response::Response {
    let encoding = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok());
    if encoding != Some(remote::CONTENT_ENCODING) {
        return (StatusCode::BAD_REQUEST, "expected snappy body").into_response();
    }
    let request = match remote::decode_request(body) {
        Ok(request) => request,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    let results = request
        .queries
        .iter()
        .map(|query| {
            let timeseries = series
                .iter()
                .filter_map(|ts| {
                    let samples: Vec<Sample> = ts
                        .samples
                        .iter()
                        .filter(|s| {
                            s.timestamp_ms >= query.start_timestamp_ms
                                && s.timestamp_ms <= query.end_timestamp_ms
                        })
                        .copied()
                        .collect();
                    (!samples.is_empty()).then(|| {
                        remote::TimeSeries::from(&TimeSeries::new(ts.labels.clone(), samples))
                    })
                })
                .collect();
            QueryResult { timeseries }
        })
        .collect();

    match remote::encode_response(&ReadResponse { results }) {
        Ok(body) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, remote::CONTENT_TYPE),
                (header::CONTENT_ENCODING, remote::CONTENT_ENCODING),
            ],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
