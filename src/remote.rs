//! Prometheus remote read protocol
//!
//! Message definitions for the 1.x remote storage protocol, written by hand
//! with prost derives since the schema is tiny. Bodies travel as
//! snappy-block-compressed protobuf in both directions.

use crate::model::{self, METRIC_NAME_LABEL};
use crate::{Error, Result};
use prost::Message;

/// Content type of request and response bodies
pub const CONTENT_TYPE: &str = "application/x-protobuf";

/// Content encoding of request and response bodies
pub const CONTENT_ENCODING: &str = "snappy";

#[derive(Clone, PartialEq, prost::Message)]
pub struct Sample {
    #[prost(double, tag = "1")]
    pub value: f64,
    #[prost(int64, tag = "2")]
    pub timestamp_ms: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LabelPair {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TimeSeries {
    #[prost(message, repeated, tag = "1")]
    pub labels: Vec<LabelPair>,
    #[prost(message, repeated, tag = "2")]
    pub samples: Vec<Sample>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MatchType {
    Equal = 0,
    NotEqual = 1,
    RegexMatch = 2,
    RegexNoMatch = 3,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LabelMatcher {
    #[prost(enumeration = "MatchType", tag = "1")]
    pub r#type: i32,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub value: String,
}

impl LabelMatcher {
    /// Matcher selecting every series: `__name__ != ""`
    pub fn all_series() -> Self {
        Self {
            r#type: MatchType::NotEqual as i32,
            name: METRIC_NAME_LABEL.to_string(),
            value: String::new(),
        }
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Query {
    #[prost(int64, tag = "1")]
    pub start_timestamp_ms: i64,
    #[prost(int64, tag = "2")]
    pub end_timestamp_ms: i64,
    #[prost(message, repeated, tag = "3")]
    pub matchers: Vec<LabelMatcher>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ReadRequest {
    #[prost(message, repeated, tag = "1")]
    pub queries: Vec<Query>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct QueryResult {
    #[prost(message, repeated, tag = "1")]
    pub timeseries: Vec<TimeSeries>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ReadResponse {
    #[prost(message, repeated, tag = "1")]
    pub results: Vec<QueryResult>,
}

impl From<TimeSeries> for model::TimeSeries {
    fn from(ts: TimeSeries) -> Self {
        model::TimeSeries {
            labels: ts
                .labels
                .into_iter()
                .map(|l| model::Label {
                    name: l.name,
                    value: l.value,
                })
                .collect(),
            samples: ts
                .samples
                .into_iter()
                .map(|s| model::Sample {
                    timestamp_ms: s.timestamp_ms,
                    value: s.value,
                })
                .collect(),
        }
    }
}

impl From<&model::TimeSeries> for TimeSeries {
    fn from(ts: &model::TimeSeries) -> Self {
        TimeSeries {
            labels: ts
                .labels
                .iter()
                .map(|l| LabelPair {
                    name: l.name.clone(),
                    value: l.value.clone(),
                })
                .collect(),
            samples: ts
                .samples
                .iter()
                .map(|s| Sample {
                    value: s.value,
                    timestamp_ms: s.timestamp_ms,
                })
                .collect(),
        }
    }
}

fn compress(message: &impl Message) -> Result<Vec<u8>> {
    snap::raw::Encoder::new()
        .compress_vec(&message.encode_to_vec())
        .map_err(|e| Error::Serialization(format!("snappy compression failed: {}", e)))
}

fn decompress(body: &[u8]) -> std::result::Result<Vec<u8>, String> {
    snap::raw::Decoder::new()
        .decompress_vec(body)
        .map_err(|e| format!("snappy decompression failed: {}", e))
}

/// Encode a read request body
pub fn encode_request(request: &ReadRequest) -> Result<Vec<u8>> {
    compress(request)
}

/// Encode a read response body (server side)
pub fn encode_response(response: &ReadResponse) -> Result<Vec<u8>> {
    compress(response)
}

/// Decode a read request body (server side)
pub fn decode_request(body: &[u8]) -> Result<ReadRequest> {
    let raw = decompress(body).map_err(Error::Serialization)?;
    ReadRequest::decode(raw.as_slice()).map_err(|e| Error::Serialization(e.to_string()))
}

/// Decode a read response body.
///
/// Anything that is not a snappy-compressed `ReadResponse` is a protocol
/// error.
pub fn decode_response(body: &[u8]) -> Result<ReadResponse> {
    let raw = decompress(body).map_err(|message| Error::Protocol {
        status: None,
        message,
        body: String::new(),
    })?;
    ReadResponse::decode(raw.as_slice()).map_err(|e| Error::Protocol {
        status: None,
        message: format!("malformed read response: {}", e),
        body: String::new(),
    })
}
