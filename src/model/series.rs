//! In-memory flux timeseries: a pair of time/value columns sorted by time.

use chrono::{DateTime, Utc};

use super::range::TimeRange;

/// A flux series over time, always sorted ascending by timestamp.
///
/// Values are stored as `f32` matching the `REAL` column in the store; the
/// numeric pipeline widens to `f64` internally.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FluxSeries {
    times: Vec<DateTime<Utc>>,
    values: Vec<f32>,
}

impl FluxSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            times: Vec::with_capacity(capacity),
            values: Vec::with_capacity(capacity),
        }
    }

    /// Builds a series from possibly unsorted points, dropping duplicate
    /// timestamps (first occurrence wins).
    pub fn from_unsorted(mut points: Vec<(DateTime<Utc>, f32)>) -> Self {
        points.sort_by_key(|(time, _)| *time);
        let mut series = Self::with_capacity(points.len());
        for (time, value) in points {
            if series.times.last() == Some(&time) {
                continue;
            }
            series.push(time, value);
        }
        series
    }

    /// Appends a point. Must be called in non-decreasing time order;
    /// duplicate timestamps are tolerated (the cleaner's sanity filter is
    /// responsible for dropping them).
    pub fn push(&mut self, time: DateTime<Utc>, value: f32) {
        debug_assert!(self.times.last().is_none_or(|last| *last <= time));
        self.times.push(time);
        self.values.push(value);
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn times(&self) -> &[DateTime<Utc>] {
        &self.times
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn first_time(&self) -> Option<DateTime<Utc>> {
        self.times.first().copied()
    }

    pub fn last_time(&self) -> Option<DateTime<Utc>> {
        self.times.last().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (DateTime<Utc>, f32)> + '_ {
        self.times.iter().copied().zip(self.values.iter().copied())
    }

    /// Timestamps as epoch microseconds, for the numeric kernels.
    pub fn epoch_micros(&self) -> Vec<i64> {
        self.times.iter().map(|t| t.timestamp_micros()).collect()
    }

    /// The part of the series inside the half-open `range`.
    pub fn slice(&self, range: &TimeRange) -> Self {
        let start = self.times.partition_point(|t| *t < range.start);
        let end = self.times.partition_point(|t| *t < range.end);
        Self {
            times: self.times[start..end].to_vec(),
            values: self.values[start..end].to_vec(),
        }
    }

    /// Concatenates time-disjoint sections in the given order.
    pub fn concat(sections: impl IntoIterator<Item = FluxSeries>) -> Self {
        let mut result = Self::new();
        for section in sections {
            debug_assert!(match (result.last_time(), section.first_time()) {
                (Some(last), Some(first)) => last < first,
                _ => true,
            });
            result.times.extend(section.times);
            result.values.extend(section.values);
        }
        result
    }
}

impl FromIterator<(DateTime<Utc>, f32)> for FluxSeries {
    fn from_iter<I: IntoIterator<Item = (DateTime<Utc>, f32)>>(iter: I) -> Self {
        let mut series = Self::new();
        for (time, value) in iter {
            series.push(time, value);
        }
        series
    }
}
