//! In-memory head block
//!
//! Holds every committed sample newer than the last persisted block, indexed
//! by series reference and by label set.

use super::{Labels, SeriesRef};
use crate::model::Sample;
use std::collections::HashMap;

#[derive(Debug)]
pub(crate) struct MemSeries {
    pub labels: Labels,
    /// Samples in timestamp order
    pub samples: Vec<Sample>,
}

impl MemSeries {
    pub fn last(&self) -> Option<Sample> {
        self.samples.last().copied()
    }
}

#[derive(Debug)]
pub(crate) struct Head {
    series: HashMap<SeriesRef, MemSeries>,
    refs: HashMap<Labels, SeriesRef>,
    min_time: i64,
    max_time: i64,
    /// Samples older than this are already persisted in blocks
    min_valid_time: i64,
}

impl Head {
    pub fn new(min_valid_time: i64) -> Self {
        Self {
            series: HashMap::new(),
            refs: HashMap::new(),
            min_time: i64::MAX,
            max_time: i64::MIN,
            min_valid_time,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.min_time > self.max_time
    }

    pub fn min_time(&self) -> i64 {
        self.min_time
    }

    pub fn max_time(&self) -> i64 {
        self.max_time
    }

    pub fn min_valid_time(&self) -> i64 {
        self.min_valid_time
    }

    pub fn num_series(&self) -> usize {
        self.series.len()
    }

    pub fn num_samples(&self) -> usize {
        self.series.values().map(|s| s.samples.len()).sum()
    }

    pub fn lookup(&self, labels: &Labels) -> Option<SeriesRef> {
        self.refs.get(labels).copied()
    }

    pub fn get(&self, series: SeriesRef) -> Option<&MemSeries> {
        self.series.get(&series)
    }

    /// Resolve `labels` to a series, registering it under `preferred` if the
    /// head does not know it yet.
    pub fn get_or_create(&mut self, labels: &Labels, preferred: SeriesRef) -> SeriesRef {
        if let Some(existing) = self.refs.get(labels) {
            return *existing;
        }
        self.refs.insert(labels.clone(), preferred);
        self.series.insert(
            preferred,
            MemSeries {
                labels: labels.clone(),
                samples: Vec::new(),
            },
        );
        preferred
    }

    /// Append an already validated sample.
    pub fn push(&mut self, series: SeriesRef, sample: Sample) {
        if let Some(mem) = self.series.get_mut(&series) {
            mem.samples.push(sample);
            self.min_time = self.min_time.min(sample.timestamp_ms);
            self.max_time = self.max_time.max(sample.timestamp_ms);
        }
    }

    /// Samples of every series inside `[mint, maxt)`.
    pub fn range(&self, mint: i64, maxt: i64) -> Vec<(Labels, Vec<Sample>)> {
        self.series
            .values()
            .filter_map(|mem| {
                let samples: Vec<Sample> = mem
                    .samples
                    .iter()
                    .filter(|s| s.timestamp_ms >= mint && s.timestamp_ms < maxt)
                    .copied()
                    .collect();
                (!samples.is_empty()).then(|| (mem.labels.clone(), samples))
            })
            .collect()
    }

    /// Drop every sample older than `before` and forget series left empty.
    ///
    /// References to dropped series become stale.
    pub fn truncate(&mut self, before: i64) -> usize {
        let mut dropped = Vec::new();
        for (series, mem) in self.series.iter_mut() {
            mem.samples.retain(|s| s.timestamp_ms >= before);
            if mem.samples.is_empty() {
                dropped.push(*series);
            }
        }
        for series in &dropped {
            if let Some(mem) = self.series.remove(series) {
                self.refs.remove(&mem.labels);
            }
        }

        self.min_valid_time = self.min_valid_time.max(before);
        self.recompute_bounds();
        dropped.len()
    }

    fn recompute_bounds(&mut self) {
        self.min_time = i64::MAX;
        self.max_time = i64::MIN;
        for mem in self.series.values() {
            if let (Some(first), Some(last)) = (mem.samples.first(), mem.samples.last()) {
                self.min_time = self.min_time.min(first.timestamp_ms);
                self.max_time = self.max_time.max(last.timestamp_ms);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_create_reuses_existing() {
        let mut head = Head::new(i64::MIN);
        let labels = Labels::from_pairs([("__name__", "up")]);
        let first = head.get_or_create(&labels, SeriesRef(1));
        let second = head.get_or_create(&labels, SeriesRef(2));
        assert_eq!(first, SeriesRef(1));
        assert_eq!(second, SeriesRef(1));
        assert_eq!(head.num_series(), 1);
    }

    #[test]
    fn test_truncate_drops_empty_series() {
        let mut head = Head::new(i64::MIN);
        let old = head.get_or_create(&Labels::from_pairs([("__name__", "old")]), SeriesRef(1));
        let live = head.get_or_create(&Labels::from_pairs([("__name__", "live")]), SeriesRef(2));
        head.push(old, Sample::new(100, 1.0));
        head.push(live, Sample::new(100, 1.0));
        head.push(live, Sample::new(300, 2.0));
        assert_eq!((head.min_time(), head.max_time()), (100, 300));

        let dropped = head.truncate(200);

        assert_eq!(dropped, 1);
        assert!(head.get(old).is_none());
        assert!(head.lookup(&Labels::from_pairs([("__name__", "old")])).is_none());
        assert_eq!(head.get(live).unwrap().samples, vec![Sample::new(300, 2.0)]);
        assert_eq!((head.min_time(), head.max_time()), (300, 300));
        assert_eq!(head.min_valid_time(), 200);
    }

    #[test]
    fn test_range_is_half_open() {
        let mut head = Head::new(i64::MIN);
        let s = head.get_or_create(&Labels::from_pairs([("__name__", "up")]), SeriesRef(1));
        for t in [0, 50, 100] {
            head.push(s, Sample::new(t, t as f64));
        }
        let range = head.range(0, 100);
        assert_eq!(range.len(), 1);
        assert_eq!(range[0].1.len(), 2);
        assert!(head.range(200, 300).is_empty());
    }
}
