//! Query-time source routing.
//!
//! Keeps an in-memory index of every source's stored time range, refreshed
//! periodically, and answers range queries by splitting the interval across
//! the sources in priority order (archive first, live second), fetching the
//! sections concurrently and concatenating the results.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures_util::future::try_join_all;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::model::{Band, Channel, FluxSeries, FluxSource, TimeRange, SATELLITE_COMBINED_ID};
use crate::storage::{FluxRead, StorageResult};

/// The channel served to clients: the cleaned combined long band.
pub const DEFAULT_CHANNEL: Channel = Channel {
    satellite: SATELLITE_COMBINED_ID,
    band: Band::Long,
    is_clean: true,
};

/// Per-source stored ranges plus their union.
#[derive(Debug, Clone, Default)]
struct RangeIndex {
    /// In source priority order.
    ranges: Vec<(FluxSource, (DateTime<Utc>, DateTime<Utc>))>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

/// Splits `[start, end)` into per-source sections by priority: a source
/// serves from the carried section start up to the end of its stored range,
/// the next source continues from there.
fn split_sections(
    ranges: &[(FluxSource, (DateTime<Utc>, DateTime<Utc>))],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<(FluxSource, TimeRange)> {
    let mut sections = Vec::new();
    let mut section_start = start;
    for &(source, (source_start, source_end)) in ranges {
        if source_end < section_start {
            continue;
        }
        if end < source_start {
            break;
        }
        let section_end = source_end.min(end);
        sections.push((source, TimeRange::new(section_start, section_end)));
        if end <= source_end {
            break;
        }
        section_start = section_end;
    }
    sections
}

pub struct FluxFetcher {
    store: Arc<dyn FluxRead>,
    index: RwLock<RangeIndex>,
    update_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl FluxFetcher {
    /// Creates the fetcher and starts its periodic range refresh.
    pub fn spawn(store: Arc<dyn FluxRead>, update_interval: Duration) -> Arc<Self> {
        let fetcher = Arc::new(Self {
            store,
            index: RwLock::new(RangeIndex::default()),
            update_task: std::sync::Mutex::new(None),
        });
        let task = tokio::spawn({
            let fetcher = fetcher.clone();
            async move {
                loop {
                    if let Err(err) = fetcher.update().await {
                        warn!("Range index refresh failed: {err}");
                    }
                    tokio::time::sleep(update_interval.to_std().unwrap_or_default()).await;
                }
            }
        });
        if let Ok(mut slot) = fetcher.update_task.lock() {
            *slot = Some(task);
        }
        fetcher
    }

    /// Re-reads every source's stored timestamp range.
    pub async fn update(&self) -> StorageResult<()> {
        let mut ranges = Vec::new();
        let mut start: Option<DateTime<Utc>> = None;
        let mut end: Option<DateTime<Utc>> = None;
        for source in FluxSource::ALL {
            let Some(range) = self.store.timestamp_range(source, None).await? else {
                continue;
            };
            ranges.push((source, range));
            start = Some(start.map_or(range.0, |s| s.min(range.0)));
            end = Some(end.map_or(range.1, |e| e.max(range.1)));
        }
        *self.index.write().await = RangeIndex { ranges, start, end };
        Ok(())
    }

    /// Earliest known timestamp across all sources.
    pub async fn start(&self) -> Option<DateTime<Utc>> {
        self.index.read().await.start
    }

    /// Latest known timestamp across all sources.
    pub async fn end(&self) -> Option<DateTime<Utc>> {
        self.index.read().await.end
    }

    async fn sections(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<(FluxSource, TimeRange)> {
        let index = self.index.read().await;
        split_sections(&index.ranges, start, end)
    }

    /// Fetches the default channel over `[start, end)`, downsampled to
    /// `interval`, concatenated across sources in priority order.
    pub async fn fetch(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: Duration,
        timeout: Option<Duration>,
    ) -> StorageResult<FluxSeries> {
        let sections = self.sections(start, end).await;
        let fetches = sections.into_iter().map(|(source, range)| {
            self.store
                .fetch(source, DEFAULT_CHANNEL, interval, range, timeout)
        });
        Ok(FluxSeries::concat(try_join_all(fetches).await?))
    }

    /// Like [`FluxFetcher::fetch`] but yields `(epoch_ms, flux)` pairs ready
    /// for JSON serialization.
    pub async fn fetch_raw(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: Duration,
        timeout: Option<Duration>,
    ) -> StorageResult<Vec<(i64, f32)>> {
        let sections = self.sections(start, end).await;
        let fetches = sections.into_iter().map(|(source, range)| {
            self.store
                .fetch_raw(source, DEFAULT_CHANNEL, interval, range, timeout)
        });
        Ok(try_join_all(fetches).await?.into_iter().flatten().collect())
    }

    /// Stops the periodic refresh.
    pub fn cancel(&self) {
        if let Ok(mut slot) = self.update_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}

impl Drop for FluxFetcher {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use crate::storage::testing::MemStore;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn days(count: i64) -> Duration {
        Duration::days(count)
    }

    #[test]
    fn test_split_routes_across_sources() {
        // Archive covers 30 days, live the last 3 (one overlapping).
        let ranges = vec![
            (FluxSource::Archive, (t0(), t0() + days(30))),
            (FluxSource::Live, (t0() + days(28), t0() + days(31))),
        ];
        let sections = split_sections(
            &ranges,
            t0() + days(29),
            t0() + days(30) + Duration::hours(12),
        );
        assert_eq!(
            sections,
            vec![
                (
                    FluxSource::Archive,
                    TimeRange::new(t0() + days(29), t0() + days(30))
                ),
                (
                    FluxSource::Live,
                    TimeRange::new(
                        t0() + days(30),
                        t0() + days(30) + Duration::hours(12)
                    )
                ),
            ]
        );
    }

    #[test]
    fn test_split_single_source_when_covered() {
        let ranges = vec![
            (FluxSource::Archive, (t0(), t0() + days(30))),
            (FluxSource::Live, (t0() + days(28), t0() + days(31))),
        ];
        let sections = split_sections(&ranges, t0() + days(1), t0() + days(2));
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].0, FluxSource::Archive);
    }

    #[test]
    fn test_split_skips_stale_source() {
        // Archive ends before the query range starts.
        let ranges = vec![
            (FluxSource::Archive, (t0(), t0() + days(10))),
            (FluxSource::Live, (t0() + days(20), t0() + days(31))),
        ];
        let sections = split_sections(&ranges, t0() + days(25), t0() + days(26));
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].0, FluxSource::Live);
    }

    #[test]
    fn test_split_empty_index() {
        assert!(split_sections(&[], t0(), t0() + days(1)).is_empty());
    }

    #[tokio::test]
    async fn test_fetch_concatenates_without_duplicates() {
        let mut store = MemStore::new();
        // Archive holds minutes 0..60, live 50..90 of the default channel.
        let archive: FluxSeries = (0..60)
            .map(|i| (t0() + Duration::minutes(i), 1e-6f32))
            .collect();
        let live: FluxSeries = (50..90)
            .map(|i| (t0() + Duration::minutes(i), 2e-6f32))
            .collect();
        store.insert(FluxSource::Archive, DEFAULT_CHANNEL, archive);
        store.insert(FluxSource::Live, DEFAULT_CHANNEL, live);

        let fetcher = FluxFetcher::spawn(Arc::new(store), Duration::seconds(10));
        fetcher.update().await.unwrap();

        let series = fetcher
            .fetch(
                t0(),
                t0() + Duration::minutes(90),
                Duration::zero(),
                None,
            )
            .await
            .unwrap();
        // Strictly ascending: no duplicate timestamps at the boundary.
        assert!(series.times().windows(2).all(|pair| pair[0] < pair[1]));
        // Archive serves [0, 59), live continues with [59, 89).
        assert_eq!(series.len(), 59 + 30);
        let boundary = series.slice(&TimeRange::new(
            t0() + Duration::minutes(59),
            t0() + Duration::minutes(60),
        ));
        assert_eq!(boundary.values(), &[2e-6]);
        assert_eq!(fetcher.start().await, Some(t0()));
        assert_eq!(fetcher.end().await, Some(t0() + Duration::minutes(89)));
        fetcher.cancel();
    }
}
