//! Data model moved between the reader and the writer
//!
//! A [`SeriesBatch`] holds every series the source returned for one
//! [`TimeWindow`]. Series labels are kept in canonical order (sorted by
//! name, then value); the destination engine and the writer's reference
//! cache both rely on that.

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Label carrying the metric name
pub const METRIC_NAME_LABEL: &str = "__name__";

/// Label name/value pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Sample with millisecond timestamp and value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub timestamp_ms: i64,
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp_ms: i64, value: f64) -> Self {
        Self {
            timestamp_ms,
            value,
        }
    }
}

/// One labelled series and its samples
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TimeSeries {
    pub labels: Vec<Label>,
    pub samples: Vec<Sample>,
}

impl TimeSeries {
    pub fn new(labels: Vec<Label>, samples: Vec<Sample>) -> Self {
        Self { labels, samples }
    }

    /// Value of the `__name__` label, if any
    pub fn metric_name(&self) -> Option<&str> {
        self.labels
            .iter()
            .find(|l| l.name == METRIC_NAME_LABEL)
            .map(|l| l.value.as_str())
    }
}

/// Order labels by name, then value
fn compare_labels(a: &Label, b: &Label) -> Ordering {
    a.name.cmp(&b.name).then_with(|| a.value.cmp(&b.value))
}

/// Sort a label list into canonical order in place.
pub fn canonicalize(labels: &mut [Label]) {
    labels.sort_unstable_by(compare_labels);
}

/// Whether a label list is already in canonical order.
pub fn labels_sorted(labels: &[Label]) -> bool {
    labels
        .windows(2)
        .all(|w| compare_labels(&w[0], &w[1]) != Ordering::Greater)
}

/// First label name that appears more than once in a sorted label list.
pub fn duplicate_label_name(labels: &[Label]) -> Option<&str> {
    labels
        .windows(2)
        .find(|w| w[0].name == w[1].name)
        .map(|w| w[0].name.as_str())
}

/// Whether sample timestamps are non-decreasing.
pub fn samples_sorted(samples: &[Sample]) -> bool {
    samples
        .windows(2)
        .all(|w| w[0].timestamp_ms <= w[1].timestamp_ms)
}

/// Half-open time range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Window of width `step` beginning at `start`
    pub fn starting_at(start: DateTime<Utc>, step: TimeDelta) -> Self {
        Self::new(start, start + step)
    }

    /// The adjacent window of the same width
    pub fn next(&self) -> Self {
        Self::new(self.end, self.end + self.width())
    }

    pub fn width(&self) -> TimeDelta {
        self.end - self.start
    }

    pub fn start_ms(&self) -> i64 {
        self.start.timestamp_millis()
    }

    pub fn end_ms(&self) -> i64 {
        self.end.timestamp_millis()
    }

    pub fn contains_ms(&self, timestamp_ms: i64) -> bool {
        timestamp_ms >= self.start_ms() && timestamp_ms < self.end_ms()
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            self.start.format("%Y-%m-%dT%H:%M:%SZ"),
            self.end.format("%Y-%m-%dT%H:%M:%SZ")
        )
    }
}

/// Truncate `t` down to a multiple of `step` since the epoch.
///
/// Falls back to `t` unchanged if `step` is zero or not representable.
pub fn truncate(t: DateTime<Utc>, step: TimeDelta) -> DateTime<Utc> {
    t.duration_trunc(step).unwrap_or(t)
}

/// Everything the source returned for one window.
///
/// Ownership moves from the reader to the writer through the pipeline
/// channel; the batch is consumed by exactly one write.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesBatch {
    pub window: TimeWindow,
    pub series: Vec<TimeSeries>,
}

impl SeriesBatch {
    pub fn new(window: TimeWindow, series: Vec<TimeSeries>) -> Self {
        Self { window, series }
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn sample_count(&self) -> usize {
        self.series.iter().map(|s| s.samples.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn labels(pairs: &[(&str, &str)]) -> Vec<Label> {
        pairs.iter().map(|(n, v)| Label::new(*n, *v)).collect()
    }

    #[test]
    fn test_canonicalize_sorts_by_name_then_value() {
        let mut l = labels(&[("job", "node"), ("__name__", "up"), ("instance", "b"), ("instance", "a")]);
        canonicalize(&mut l);
        assert_eq!(
            l,
            labels(&[("__name__", "up"), ("instance", "a"), ("instance", "b"), ("job", "node")])
        );
        assert!(labels_sorted(&l));
    }

    #[test]
    fn test_canonicalize_is_idempotent() {
        let inputs = vec![
            labels(&[]),
            labels(&[("a", "1")]),
            labels(&[("z", "1"), ("a", "2"), ("m", "")]),
            labels(&[("b", "x"), ("b", "a"), ("a", "z")]),
        ];
        for input in inputs {
            let mut once = input.clone();
            canonicalize(&mut once);
            let mut twice = once.clone();
            canonicalize(&mut twice);
            assert_eq!(once, twice);
            assert!(labels_sorted(&twice));
        }
    }

    #[test]
    fn test_duplicate_label_name() {
        let l = labels(&[("a", "1"), ("b", "1"), ("b", "2")]);
        assert_eq!(duplicate_label_name(&l), Some("b"));
        assert_eq!(duplicate_label_name(&labels(&[("a", "1"), ("b", "1")])), None);
    }

    #[test]
    fn test_samples_sorted_allows_ties() {
        assert!(samples_sorted(&[Sample::new(1, 0.0), Sample::new(1, 0.0), Sample::new(2, 0.0)]));
        assert!(!samples_sorted(&[Sample::new(2, 0.0), Sample::new(1, 0.0)]));
        assert!(samples_sorted(&[]));
    }

    #[test]
    fn test_window_next_is_adjacent() {
        let start = Utc.with_ymd_and_hms(2017, 11, 1, 10, 0, 0).unwrap();
        let window = TimeWindow::starting_at(start, TimeDelta::minutes(1));
        let next = window.next();
        assert_eq!(next.start, window.end);
        assert_eq!(next.width(), TimeDelta::minutes(1));
        assert!(window.contains_ms(window.start_ms()));
        assert!(!window.contains_ms(window.end_ms()));
    }

    #[test]
    fn test_truncate_to_minute() {
        let t = Utc.with_ymd_and_hms(2017, 11, 1, 10, 3, 47).unwrap();
        let truncated = truncate(t, TimeDelta::minutes(1));
        assert_eq!(truncated, Utc.with_ymd_and_hms(2017, 11, 1, 10, 3, 0).unwrap());
    }
}
