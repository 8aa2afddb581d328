//! Database storage layer.
//!
//! This module provides:
//! - Connection-pool construction against the TimescaleDB store
//! - The read seam (`FluxRead`) used by the query fetcher and the prepare
//!   step, so both can be exercised against an in-memory double in tests
//! - The access operations: per-channel fetch, idempotent bulk upsert,
//!   roll-up refresh, chunk recompression and range introspection

pub mod access;
#[cfg(test)]
pub mod testing;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use tracing::info;

use crate::config::Config;
use crate::model::{Channel, FluxSeries, FluxSource, TimeRange};

/// Errors that can occur during storage operations.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("query exceeded its deadline")]
    QueryTimeout,
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Read access to the flux store.
///
/// The trait carries exactly the operations the read paths need; writes are
/// inherent methods of [`Store`] because only the importers hold them.
#[async_trait]
pub trait FluxRead: Send + Sync {
    /// Fetches one channel over the half-open `range`, downsampled so that
    /// no two points are closer than `interval` (see `select_relation`).
    async fn fetch(
        &self,
        source: FluxSource,
        channel: Channel,
        interval: Duration,
        range: TimeRange,
        timeout: Option<Duration>,
    ) -> StorageResult<FluxSeries>;

    /// Like [`FluxRead::fetch`] but yields `(epoch_ms, flux)` pairs computed
    /// in SQL, ready for JSON serialization without a series allocation.
    async fn fetch_raw(
        &self,
        source: FluxSource,
        channel: Channel,
        interval: Duration,
        range: TimeRange,
        timeout: Option<Duration>,
    ) -> StorageResult<Vec<(i64, f32)>>;

    /// Distinct channels with at least one row, optionally limited to a range.
    async fn available_channels(
        &self,
        source: FluxSource,
        range: Option<TimeRange>,
    ) -> StorageResult<Vec<Channel>>;

    /// Min and max timestamp of a source, optionally of a single channel.
    ///
    /// Can be slow on hypertables with many chunks; callers cache the result.
    async fn timestamp_range(
        &self,
        source: FluxSource,
        channel: Option<Channel>,
    ) -> StorageResult<Option<(DateTime<Utc>, DateTime<Utc>)>>;

    /// Latest timestamp produced by an importer, combined channels excluded.
    async fn last_non_combined_timestamp(
        &self,
        source: FluxSource,
    ) -> StorageResult<Option<DateTime<Utc>>>;
}

/// Connection pool handle for the flux store.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Connects a pool to the configured database.
    pub async fn connect(config: &Config) -> StorageResult<Self> {
        info!("Connecting to database at {}", config.database_host);
        let pool = PgPoolOptions::new()
            .max_connections(config.database_pool_size)
            .min_connections(config.database_pool_size.min(10))
            .connect(&config.database_url())
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
