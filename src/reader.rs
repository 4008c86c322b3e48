//! Source side of the migration
//!
//! [`Reader`] issues one remote read query per time slice and turns the
//! answer into a [`SeriesBatch`] with canonically ordered labels.

use crate::config::ReaderConfig;
use crate::model::{
    canonicalize, duplicate_label_name, labels_sorted, samples_sorted, SeriesBatch, TimeSeries,
    TimeWindow,
};
use crate::remote::{self, LabelMatcher, Query, ReadRequest};
use crate::{Error, Result};

use async_trait::async_trait;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use tracing::debug;
use url::Url;

/// Largest response body carried inside a protocol error
const MAX_ERROR_BODY: usize = 4096;

/// Anything that can produce the series for one time window
#[async_trait]
pub trait SeriesSource: Send + Sync {
    /// Fetch every series with samples inside `window`
    async fn fetch(&self, window: TimeWindow) -> Result<SeriesBatch>;
}

/// Reads historical series through the remote read API
pub struct Reader {
    url: Url,
    strict: bool,
    client: Client,
}

impl Reader {
    pub fn new(config: ReaderConfig) -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            url: config.url,
            strict: config.strict,
            client,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn send(&self, request: &ReadRequest) -> Result<Vec<u8>> {
        let body = remote::encode_request(request)?;

        let resp = self
            .client
            .post(self.url.clone())
            .header(CONTENT_TYPE, remote::CONTENT_TYPE)
            .header(CONTENT_ENCODING, remote::CONTENT_ENCODING)
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        if status != StatusCode::OK {
            let body = resp.bytes().await.unwrap_or_default();
            return Err(Error::Protocol {
                status: Some(status.as_u16()),
                message: "unexpected response status".to_string(),
                body: truncate_body(&body),
            });
        }

        Ok(resp.bytes().await?.to_vec())
    }
}

#[async_trait]
impl SeriesSource for Reader {
    async fn fetch(&self, window: TimeWindow) -> Result<SeriesBatch> {
        let request = build_request(window);
        let body = self.send(&request).await?;

        let response = remote::decode_response(&body)?;
        if response.results.len() != 1 {
            return Err(Error::Protocol {
                status: Some(StatusCode::OK.as_u16()),
                message: format!("expected 1 result set, got {}", response.results.len()),
                body: String::new(),
            });
        }

        let mut series: Vec<TimeSeries> = response
            .results
            .into_iter()
            .flat_map(|result| result.timeseries)
            .map(TimeSeries::from)
            .collect();

        for ts in &mut series {
            canonicalize(&mut ts.labels);
        }

        if self.strict {
            validate_series(&series)?;
        }

        debug!(
            window = %window,
            series = series.len(),
            samples = series.iter().map(|s| s.samples.len()).sum::<usize>(),
            "Fetched slice"
        );

        Ok(SeriesBatch::new(window, series))
    }
}

/// Remote read request selecting every series inside `window`.
///
/// The protocol treats both bounds as inclusive, so the end is pulled in by
/// one millisecond to keep adjacent windows disjoint.
pub fn build_request(window: TimeWindow) -> ReadRequest {
    ReadRequest {
        queries: vec![Query {
            start_timestamp_ms: window.start_ms(),
            end_timestamp_ms: window.end_ms() - 1,
            matchers: vec![LabelMatcher::all_series()],
        }],
    }
}

/// Strict-mode checks: canonical label order, unique label names and
/// non-decreasing sample timestamps.
pub fn validate_series(series: &[TimeSeries]) -> Result<()> {
    for ts in series {
        if !labels_sorted(&ts.labels) {
            return Err(Error::Validation(format!(
                "labels are not sorted: {}",
                describe(ts)
            )));
        }
        if let Some(name) = duplicate_label_name(&ts.labels) {
            return Err(Error::Validation(format!(
                "label {} appears more than once: {}",
                name,
                describe(ts)
            )));
        }
        if !samples_sorted(&ts.samples) {
            return Err(Error::Validation(format!(
                "samples are not sorted: {}",
                describe(ts)
            )));
        }
    }
    Ok(())
}

fn describe(ts: &TimeSeries) -> String {
    let pairs: Vec<String> = ts
        .labels
        .iter()
        .map(|l| format!("{}={:?}", l.name, l.value))
        .collect();
    format!("{{{}}}", pairs.join(", "))
}

fn truncate_body(body: &[u8]) -> String {
    let end = body.len().min(MAX_ERROR_BODY);
    let mut text = String::from_utf8_lossy(&body[..end]).into_owned();
    if body.len() > MAX_ERROR_BODY {
        text.push_str("...");
    }
    text
}
