//! Importer for the high-resolution science archive.
//!
//! Imports month-sized batches from the resume point to now. Every batch
//! runs three stages — search, download, database — and the batches form a
//! pipeline: batch N's stage may only start once batch N-1 has finished the
//! same stage, so searches and downloads run ahead while the database stage
//! works strictly past-to-future.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use futures_util::future::try_join_all;
use tokio::sync::{watch, Semaphore};
use tracing::{info, warn};

use super::catalog::{select_best_files, parse_band, Catalog, DailyFile};
use super::{import_channels, ImportError, Importer};
use crate::model::{Band, Channel, FluxSeries, FluxSource, TimeRange};
use crate::storage::access::RECOMPRESSION_THRESHOLD;
use crate::storage::Store;

const MAX_DOWNLOAD_TRIES: usize = 5;
const MAX_PARALLEL_DOWNLOADS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    Search = 0,
    Download = 1,
    Database = 2,
}

/// Completion events of one batch's stages, chained to the previous batch.
pub(crate) struct BatchGates {
    done: [watch::Sender<bool>; 3],
    previous: Option<[watch::Receiver<bool>; 3]>,
}

impl BatchGates {
    /// Builds the gate chain for `count` batches.
    pub(crate) fn chain(count: usize) -> Vec<BatchGates> {
        let mut gates = Vec::with_capacity(count);
        let mut previous: Option<[watch::Receiver<bool>; 3]> = None;
        for _ in 0..count {
            let senders = [
                watch::channel(false).0,
                watch::channel(false).0,
                watch::channel(false).0,
            ];
            let receivers = [
                senders[0].subscribe(),
                senders[1].subscribe(),
                senders[2].subscribe(),
            ];
            gates.push(BatchGates {
                done: senders,
                previous: previous.take(),
            });
            previous = Some(receivers);
        }
        gates
    }

    /// Waits until the previous batch finished this stage.
    pub(crate) async fn wait(&mut self, stage: Stage) {
        if let Some(previous) = self.previous.as_mut() {
            // The sender side never closes before signalling.
            let _ = previous[stage as usize].wait_for(|done| *done).await;
        }
    }

    /// Marks this batch's stage as done, releasing the next batch.
    pub(crate) fn complete(&self, stage: Stage) {
        let _ = self.done[stage as usize].send(true);
    }
}

fn month_start(time: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(time.year(), time.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(time)
}

fn next_month_start(time: DateTime<Utc>) -> DateTime<Utc> {
    month_start(month_start(time) + Duration::days(32))
}

/// The month-sized batch windows covering `[start, now)`.
pub(crate) fn month_batches(start: DateTime<Utc>, now: DateTime<Utc>) -> Vec<TimeRange> {
    let mut batches = Vec::new();
    let mut month = month_start(start);
    while month < now {
        let next = next_month_start(month);
        batches.push(TimeRange::new(start.max(month), now.min(next)));
        month = next;
    }
    batches
}

/// Imports highest resolution data (1s-3s) from the science archive.
pub struct ArchiveImporter {
    store: Store,
    catalog: Arc<dyn Catalog>,
    staging: PathBuf,
}

impl ArchiveImporter {
    pub fn new(store: Store, catalog: Arc<dyn Catalog>, staging: PathBuf) -> Self {
        Self {
            store,
            catalog,
            staging,
        }
    }
}

#[async_trait]
impl Importer for ArchiveImporter {
    fn source(&self) -> FluxSource {
        FluxSource::Archive
    }

    async fn import_from(&mut self, start: DateTime<Utc>) -> Result<Duration, ImportError> {
        let batches = month_batches(start, Utc::now());
        info!("archive: importing {} monthly batches", batches.len());

        let gates = BatchGates::chain(batches.len());
        let mut handles = Vec::with_capacity(batches.len());
        for (range, gate) in batches.into_iter().zip(gates) {
            let batch = Batch {
                store: self.store.clone(),
                catalog: self.catalog.clone(),
                staging: self.staging.clone(),
                range,
            };
            handles.push(tokio::spawn(batch.run(gate)));
        }

        // Batches complete in order; the first failure aborts the rest and
        // lets the supervisor restart the importer.
        let mut result = Ok(());
        for handle in &mut handles {
            match handle.await {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => {
                    result = Err(err);
                    break;
                }
                Err(join_error) => {
                    result = Err(ImportError::Transient(join_error.to_string()));
                    break;
                }
            }
        }
        if result.is_err() {
            for handle in &handles {
                handle.abort();
            }
        }
        result?;
        Ok(Duration::hours(1))
    }
}

struct Batch {
    store: Store,
    catalog: Arc<dyn Catalog>,
    staging: PathBuf,
    range: TimeRange,
}

impl Batch {
    async fn run(self, mut gate: BatchGates) -> Result<(), ImportError> {
        gate.wait(Stage::Search).await;
        let results = self.catalog.search(self.range).await?;
        let by_satellite = select_best_files(results)?;
        let file_count: usize = by_satellite.values().map(Vec::len).sum();
        info!(
            "archive: found {} files from {} satellites for {}",
            file_count,
            by_satellite.len(),
            self.range
        );
        gate.complete(Stage::Search);

        gate.wait(Stage::Download).await;
        let downloads = self.download_all(&by_satellite).await?;
        gate.complete(Stage::Download);

        gate.wait(Stage::Database).await;
        let channels = self.load_all(&downloads).await?;
        import_channels(&self.store, FluxSource::Archive, channels, self.range).await?;
        self.store
            .recompress_chunks(FluxSource::Archive, self.range.start, RECOMPRESSION_THRESHOLD)
            .await?;
        delete_files(downloads.into_values().flatten()).await;
        gate.complete(Stage::Database);
        Ok(())
    }

    /// Downloads every satellite's files: at most two satellites in
    /// parallel, staggered by five seconds, each retried with back-off.
    async fn download_all(
        &self,
        by_satellite: &BTreeMap<u16, Vec<DailyFile>>,
    ) -> Result<BTreeMap<u16, Vec<PathBuf>>, ImportError> {
        let semaphore = Arc::new(Semaphore::new(MAX_PARALLEL_DOWNLOADS));
        let tasks = by_satellite
            .iter()
            .enumerate()
            .map(|(index, (&satellite, files))| {
                let semaphore = semaphore.clone();
                async move {
                    tokio::time::sleep(std::time::Duration::from_secs(5 * index as u64)).await;
                    let _permit = semaphore
                        .acquire()
                        .await
                        .map_err(|err| ImportError::Transient(err.to_string()))?;
                    let paths = self.download_satellite(satellite, files).await?;
                    Ok::<_, ImportError>((satellite, paths))
                }
            });
        Ok(try_join_all(tasks).await?.into_iter().collect())
    }

    async fn download_satellite(
        &self,
        satellite: u16,
        files: &[DailyFile],
    ) -> Result<Vec<PathBuf>, ImportError> {
        let mut last_error = ImportError::Transient("no files to download".into());
        for attempt in 1..=MAX_DOWNLOAD_TRIES {
            match self.try_download(files).await {
                Ok(paths) => return Ok(paths),
                Err(err) if attempt < MAX_DOWNLOAD_TRIES => {
                    // Probably rate limits: back off and retry.
                    let wait = Duration::seconds(30) * attempt as i32;
                    warn!(
                        "archive: download for satellite {satellite} failed (try {attempt}): \
                         {err}. Retrying in {}s",
                        wait.num_seconds()
                    );
                    tokio::time::sleep(wait.to_std().unwrap_or_default()).await;
                    last_error = err;
                }
                Err(err) => {
                    warn!(
                        "archive: download for satellite {satellite} failed. \
                         Giving up after {MAX_DOWNLOAD_TRIES} tries"
                    );
                    return Err(err);
                }
            }
        }
        Err(last_error)
    }

    async fn try_download(&self, files: &[DailyFile]) -> Result<Vec<PathBuf>, ImportError> {
        let mut paths = Vec::with_capacity(files.len());
        for file in files {
            paths.push(self.catalog.download(file, &self.staging).await?);
        }
        Ok(paths)
    }

    /// Parses every satellite's files into its SHORT and LONG channels.
    /// A file that fails to parse is skipped with a warning, the rest of the
    /// satellite still loads.
    async fn load_all(
        &self,
        downloads: &BTreeMap<u16, Vec<PathBuf>>,
    ) -> Result<BTreeMap<Channel, FluxSeries>, ImportError> {
        let mut channels = BTreeMap::new();
        for (&satellite, paths) in downloads {
            let mut contents = Vec::with_capacity(paths.len());
            for path in paths {
                match tokio::fs::read_to_string(path).await {
                    Ok(content) => contents.push(content),
                    Err(err) => warn!("archive: unreadable file {}: {err}", path.display()),
                }
            }
            let range = self.range;
            let parsed = tokio::task::spawn_blocking(move || {
                Band::ALL.map(|band| {
                    let mut points = Vec::new();
                    for content in &contents {
                        match parse_band(content, band) {
                            Ok(series) => points.extend(series.iter()),
                            Err(err) => warn!("archive: skipping unparsable file: {err}"),
                        }
                    }
                    // Daily files reach before the batch: trim to the range.
                    FluxSeries::from_unsorted(points).slice(&range)
                })
            })
            .await
            .map_err(|err| ImportError::Transient(err.to_string()))?;

            let [short, long] = parsed;
            // Even an empty channel is declared, erasing stale rows.
            channels.insert(Channel::new(satellite, Band::Short, false), short);
            channels.insert(Channel::new(satellite, Band::Long, false), long);
        }
        Ok(channels)
    }
}

async fn delete_files(paths: impl Iterator<Item = PathBuf>) {
    for path in paths {
        if let Err(err) = tokio::fs::remove_file(&path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!("archive: could not delete {}: {err}", path.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;
    use tokio::time::timeout;

    fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_month_batches_clip_to_window() {
        let start = Utc.with_ymd_and_hms(2024, 1, 20, 6, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        let batches = month_batches(start, now);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0], TimeRange::new(start, at(2024, 2, 1)));
        assert_eq!(batches[1], TimeRange::new(at(2024, 2, 1), at(2024, 3, 1)));
        assert_eq!(batches[2], TimeRange::new(at(2024, 3, 1), now));
    }

    #[test]
    fn test_month_batches_cross_year() {
        let batches = month_batches(at(2023, 12, 5), at(2024, 1, 15));
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].end, at(2024, 1, 1));
    }

    #[test]
    fn test_month_batches_empty_when_caught_up() {
        assert!(month_batches(at(2024, 3, 1), at(2024, 3, 1)).is_empty());
    }

    async fn is_pending(gate: &mut BatchGates, stage: Stage) -> bool {
        timeout(StdDuration::from_millis(20), gate.wait(stage))
            .await
            .is_err()
    }

    #[tokio::test]
    async fn test_pipeline_gating_depth() {
        let mut gates = BatchGates::chain(4);
        let batch4 = gates.pop().expect("four gates");
        let mut batch3 = gates.pop().expect("three gates");
        let mut batch2 = gates.pop().expect("two gates");
        let batch1 = gates.pop().expect("one gate");
        drop(batch4);

        // Batch 1 has no predecessor: nothing to wait for.
        let mut first = batch1;
        first.wait(Stage::Search).await;
        first.wait(Stage::Download).await;

        // Batch 1 finished its search but not its download.
        first.complete(Stage::Search);
        // Batch 2 may start searching but not downloading.
        batch2.wait(Stage::Search).await;
        assert!(is_pending(&mut batch2, Stage::Download).await);
        // Batch 3 may not start searching: batch 2's search isn't done.
        assert!(is_pending(&mut batch3, Stage::Search).await);

        // Once batch 2 finishes searching, batch 3 is released.
        batch2.complete(Stage::Search);
        batch3.wait(Stage::Search).await;

        // The download chain releases independently.
        first.complete(Stage::Download);
        batch2.wait(Stage::Download).await;
        assert!(is_pending(&mut batch3, Stage::Download).await);
    }
}
