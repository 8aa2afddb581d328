//! Importers feeding the flux store.
//!
//! Two long-lived importers exist: the archive importer (month-batched,
//! high resolution, lagging by days) and the live importer (minute
//! resolution, polled). Both share the resume logic, the prepare step
//! (clean + combine) and the catch-log-restart supervision.

pub mod archive;
pub mod catalog;
pub mod clean;
pub mod combine;
pub mod live;
pub mod prepare;
pub mod rolling;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{error, info};

use crate::model::{Channel, FluxSeries, FluxSource, TimeRange};
use crate::storage::{FluxRead, Store, StorageError};

pub use clean::{clean_border, clean_flux};
pub use combine::{combine_border, combine_flux_channels, CombineError};
pub use prepare::prepare_flux_channels;

/// Delay before a crashed importer is restarted.
pub fn restart_delay() -> Duration {
    Duration::minutes(1)
}

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Combine(#[from] CombineError),

    #[error("cannot clean an already cleaned channel")]
    AlreadyClean,

    #[error("transient upstream error: {0}")]
    Transient(String),

    #[error("invalid upstream data: {0}")]
    InvalidData(String),

    #[error("upstream data integrity violation: {0}")]
    DataIntegrity(String),
}

impl From<reqwest::Error> for ImportError {
    fn from(error: reqwest::Error) -> Self {
        ImportError::Transient(error.to_string())
    }
}

/// A long-lived importer for one source.
#[async_trait]
pub trait Importer: Send {
    fn source(&self) -> FluxSource;

    /// Imports all available data from `start`, sequentially from the past
    /// to the present so an interruption never leaves holes.
    ///
    /// Returns how long to wait before the next call.
    async fn import_from(&mut self, start: DateTime<Utc>) -> Result<Duration, ImportError>;
}

/// Resume point of an importer: right after the last stored non-combined
/// measurement, but never before the configured import start.
pub async fn resume_point(
    store: &Store,
    source: FluxSource,
    import_start: DateTime<Utc>,
) -> Result<DateTime<Utc>, ImportError> {
    let last = store.last_non_combined_timestamp(source).await?;
    Ok(match last {
        Some(timestamp) => (timestamp + Duration::milliseconds(1)).max(import_start),
        None => import_start,
    })
}

/// Runs an importer forever: resume, import, sleep, repeat.
pub async fn run_import_loop(
    store: &Store,
    importer: &mut dyn Importer,
    import_start: DateTime<Utc>,
) -> Result<(), ImportError> {
    loop {
        let start = resume_point(store, importer.source(), import_start).await?;
        info!("{}: starting import from {}", importer.source().name(), start);
        let begun = std::time::Instant::now();
        let wait = importer.import_from(start).await?;
        info!(
            "{}: finished import in {:.1?}, next import in {}s",
            importer.source().name(),
            begun.elapsed(),
            wait.num_seconds()
        );
        tokio::time::sleep(wait.to_std().unwrap_or_default()).await;
    }
}

/// The classic catch-log-restart retry loop around an importer task.
/// Returns only if the task itself returns cleanly.
pub async fn run_supervised<F, Fut>(name: &str, delay: Duration, task: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<(), ImportError>>,
{
    loop {
        match task().await {
            Ok(()) => return,
            Err(err) => {
                error!(
                    "{name} importer failed: {err}. Restarting in {}s",
                    delay.num_seconds()
                );
                tokio::time::sleep(delay.to_std().unwrap_or_default()).await;
            }
        }
    }
}

/// Logs what a bulk upsert is about to write.
pub(crate) fn log_import(
    source: FluxSource,
    channels: &BTreeMap<Channel, (FluxSeries, TimeRange)>,
) {
    if channels.is_empty() {
        info!("{}: not importing any channels", source.name());
        return;
    }
    let entries: usize = channels.values().map(|(series, _)| series.len()).sum();
    let range = TimeRange::which_includes(channels.values().map(|(_, range)| range));
    match range {
        Some(range) => info!(
            "{}: importing {} channels with {} entries for {}",
            source.name(),
            channels.len(),
            entries,
            range
        ),
        None => info!(
            "{}: importing {} channels with {} entries",
            source.name(),
            channels.len(),
            entries
        ),
    }
}

/// Prepares and writes a batch of raw channels.
pub(crate) async fn import_channels(
    store: &Store,
    source: FluxSource,
    channels: BTreeMap<Channel, FluxSeries>,
    range: TimeRange,
) -> Result<(), ImportError> {
    let prepared = prepare_flux_channels(store, source, channels, range).await?;
    log_import(source, &prepared);
    store.bulk_upsert(source, &prepared).await?;
    Ok(())
}
