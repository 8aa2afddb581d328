//! In-memory [`FluxRead`] double for tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use super::{FluxRead, StorageResult};
use crate::model::{Channel, FluxSeries, FluxSource, TimeRange};

/// Serves fixed per-source, per-channel series. Downsampling is ignored:
/// fetches return the raw points inside the range.
#[derive(Default)]
pub struct MemStore {
    sources: BTreeMap<FluxSource, BTreeMap<Channel, FluxSeries>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, source: FluxSource, channel: Channel, series: FluxSeries) {
        self.sources.entry(source).or_default().insert(channel, series);
    }

    fn channels(&self, source: FluxSource) -> impl Iterator<Item = (&Channel, &FluxSeries)> {
        self.sources.get(&source).into_iter().flatten()
    }
}

#[async_trait]
impl FluxRead for MemStore {
    async fn fetch(
        &self,
        source: FluxSource,
        channel: Channel,
        _interval: Duration,
        range: TimeRange,
        _timeout: Option<Duration>,
    ) -> StorageResult<FluxSeries> {
        Ok(self
            .sources
            .get(&source)
            .and_then(|channels| channels.get(&channel))
            .map(|series| series.slice(&range))
            .unwrap_or_default())
    }

    async fn fetch_raw(
        &self,
        source: FluxSource,
        channel: Channel,
        interval: Duration,
        range: TimeRange,
        timeout: Option<Duration>,
    ) -> StorageResult<Vec<(i64, f32)>> {
        let series = self.fetch(source, channel, interval, range, timeout).await?;
        Ok(series
            .iter()
            .map(|(time, flux)| (time.timestamp_millis(), flux))
            .collect())
    }

    async fn available_channels(
        &self,
        source: FluxSource,
        range: Option<TimeRange>,
    ) -> StorageResult<Vec<Channel>> {
        Ok(self
            .channels(source)
            .filter(|(_, series)| match range {
                Some(range) => !series.slice(&range).is_empty(),
                None => !series.is_empty(),
            })
            .map(|(channel, _)| *channel)
            .collect())
    }

    async fn timestamp_range(
        &self,
        source: FluxSource,
        channel: Option<Channel>,
    ) -> StorageResult<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        let mut start: Option<DateTime<Utc>> = None;
        let mut end: Option<DateTime<Utc>> = None;
        for (key, series) in self.channels(source) {
            if channel.is_some_and(|c| c != *key) {
                continue;
            }
            if let (Some(first), Some(last)) = (series.first_time(), series.last_time()) {
                start = Some(start.map_or(first, |s| s.min(first)));
                end = Some(end.map_or(last, |e| e.max(last)));
            }
        }
        Ok(start.zip(end))
    }

    async fn last_non_combined_timestamp(
        &self,
        source: FluxSource,
    ) -> StorageResult<Option<DateTime<Utc>>> {
        Ok(self
            .channels(source)
            .filter(|(channel, _)| !channel.is_combined())
            .filter_map(|(_, series)| series.last_time())
            .max())
    }
}
