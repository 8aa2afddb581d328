//! Access operations against the time-partitioned flux store.
//!
//! All writes go through [`Store::bulk_upsert`]: a single transaction that
//! erases each channel's declared range and re-inserts the new rows from a
//! serialized COPY buffer, followed by a post-commit roll-up refresh. Reads
//! route through the raw table or the coarsest fitting roll-up aggregate.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::types::PgInterval;
use sqlx::QueryBuilder;
use tracing::{debug, info};

use super::{FluxRead, StorageError, StorageResult, Store};
use crate::model::{
    auto_refresh_horizon, auto_refresh_slack, Band, Channel, FluxSeries, FluxSource, TimeRange,
    SATELLITE_COMBINED_ID,
};

/// Recompress a chunk once its on-disk size exceeds its post-compression
/// size by this factor (deletes leave dead space in compressed chunks).
pub const RECOMPRESSION_THRESHOLD: f64 = 1.2;

fn pg_interval(duration: Duration) -> PgInterval {
    PgInterval {
        months: 0,
        days: 0,
        microseconds: duration.num_microseconds().unwrap_or(i64::MAX),
    }
}

/// Builds the SELECT answering a downsampled channel fetch.
///
/// `time_component` wraps the emitted time column so the raw variant can
/// compute epoch milliseconds in SQL.
fn select_flux_sql(
    source: FluxSource,
    interval: Duration,
    time_component: impl Fn(&str) -> String,
) -> String {
    if interval <= source.raw_resolution() {
        return format!(
            "SELECT {time} AS time, flux \
             FROM {table} \
             WHERE satellite = $1 AND band = $2 AND is_clean = $3 \
               AND $4 <= time AND time < $5 \
             ORDER BY time",
            time = time_component("time"),
            table = source.table_name(),
        );
    }
    let relation = source.select_relation(interval);
    // Raw tables expose `flux`, aggregates `flux_max`.
    let value = if relation == source.table_name() {
        "flux"
    } else {
        "flux_max"
    };
    format!(
        "WITH downscale AS ( \
             SELECT time_bucket($1, time) AS bucket, MAX({value}) AS flux \
             FROM {relation} \
             WHERE satellite = $2 AND band = $3 AND is_clean = $4 \
               AND $5 <= time AND time < $6 \
             GROUP BY bucket \
         ) \
         SELECT {time} AS time, flux FROM downscale ORDER BY bucket",
        time = time_component("bucket"),
    )
}

async fn with_timeout<T>(
    timeout: Option<Duration>,
    query: impl Future<Output = Result<T, sqlx::Error>>,
) -> StorageResult<T> {
    match timeout {
        Some(limit) => {
            let limit = limit.to_std().unwrap_or_default();
            match tokio::time::timeout(limit, query).await {
                Ok(result) => Ok(result?),
                Err(_) => Err(StorageError::QueryTimeout),
            }
        }
        None => Ok(query.await?),
    }
}

impl Store {
    async fn select_flux<R>(
        &self,
        source: FluxSource,
        channel: Channel,
        interval: Duration,
        range: TimeRange,
        timeout: Option<Duration>,
        time_component: impl Fn(&str) -> String,
    ) -> StorageResult<Vec<R>>
    where
        R: for<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> + Send + Unpin,
    {
        let sql = select_flux_sql(source, interval, time_component);
        let query = if interval <= source.raw_resolution() {
            sqlx::query_as::<_, R>(&sql)
                .bind(channel.satellite as i16)
                .bind(channel.band)
                .bind(channel.is_clean)
                .bind(range.start)
                .bind(range.end)
                .fetch_all(self.pool())
        } else {
            sqlx::query_as::<_, R>(&sql)
                .bind(pg_interval(interval))
                .bind(channel.satellite as i16)
                .bind(channel.band)
                .bind(channel.is_clean)
                .bind(range.start)
                .bind(range.end)
                .fetch_all(self.pool())
        };
        with_timeout(timeout, query).await
    }

    /// Deletes each channel's declared range and inserts its new rows, all in
    /// one transaction. A channel with an empty series but non-empty range is
    /// a legitimate erase of that window. Afterwards the roll-up aggregates
    /// covering the union range are refreshed.
    pub async fn bulk_upsert(
        &self,
        source: FluxSource,
        channels: &BTreeMap<Channel, (FluxSeries, TimeRange)>,
    ) -> StorageResult<()> {
        let Some(union_range) = TimeRange::which_includes(channels.values().map(|(_, r)| r))
        else {
            return Ok(());
        };

        let mut tx = self.pool().begin().await?;
        // Deletes inside compressed chunks would otherwise abort the batch.
        sqlx::query("SET timescaledb.max_tuples_decompressed_per_dml_transaction = 0")
            .execute(&mut *tx)
            .await?;

        let mut delete = delete_statement(source, channels.iter().map(|(c, (_, r))| (*c, *r)));
        delete.build().execute(&mut *tx).await?;

        for (channel, (series, _)) in channels {
            if series.is_empty() {
                continue;
            }
            let statement = format!(
                "COPY {} (time, flux, satellite, band, is_clean) FROM STDIN",
                source.table_name()
            );
            let mut copy = (&mut *tx).copy_in_raw(&statement).await?;
            copy.send(copy_buffer(*channel, series).into_bytes())
                .await?;
            copy.finish().await?;
        }
        tx.commit().await?;

        self.refresh_rollups(source, union_range).await
    }

    /// Refreshes the continuous aggregates over `range`, each window extended
    /// by one bucket on either side to capture straddling buckets.
    /// `refresh_continuous_aggregate` cannot run inside a transaction.
    async fn refresh_rollups(&self, source: FluxSource, range: TimeRange) -> StorageResult<()> {
        let now = Utc::now();
        for resolution in source.resolutions() {
            // Recent buckets of real-time aggregates are computed on the fly
            // and picked up by the store's own refresh policy later.
            if resolution.is_real_time()
                && now - auto_refresh_horizon() + auto_refresh_slack() < range.start
            {
                continue;
            }
            let statement = format!(
                "CALL refresh_continuous_aggregate('{}{}', $1::TIMESTAMPTZ, $2::TIMESTAMPTZ)",
                source.table_name(),
                resolution.suffix()
            );
            sqlx::query(&statement)
                .bind(range.start - resolution.size())
                .bind(range.end + resolution.size())
                .execute(self.pool())
                .await?;
        }
        Ok(())
    }

    /// Recompresses every chunk fully older than `before` whose current size
    /// exceeds its post-compression size by `threshold`, or that was never
    /// compressed.
    pub async fn recompress_chunks(
        &self,
        source: FluxSource,
        before: DateTime<Utc>,
        threshold: f64,
    ) -> StorageResult<()> {
        let chunks: Vec<(String, String, bool, Option<i64>, i64)> = sqlx::query_as(
            "SELECT c.chunk_schema, c.chunk_name, c.is_compressed, \
                    s.after_compression_total_bytes, \
                    pg_total_relation_size(format('%I.%I', c.chunk_schema, c.chunk_name)) \
             FROM timescaledb_information.chunks c \
             LEFT JOIN chunk_compression_stats($1::regclass) s \
               ON s.chunk_schema = c.chunk_schema AND s.chunk_name = c.chunk_name \
             WHERE c.hypertable_name = $2 AND c.range_end <= $3",
        )
        .bind(source.table_name())
        .bind(source.table_name())
        .bind(before)
        .fetch_all(self.pool())
        .await?;

        let mut recompressed = 0usize;
        for (schema, name, is_compressed, compressed_bytes, current_bytes) in chunks {
            let oversized = match compressed_bytes {
                Some(bytes) if is_compressed => current_bytes as f64 > bytes as f64 * threshold,
                _ => true,
            };
            if !oversized {
                continue;
            }
            let chunk = format!("{schema}.{name}");
            if is_compressed {
                sqlx::query("SELECT decompress_chunk($1::regclass)")
                    .bind(&chunk)
                    .execute(self.pool())
                    .await?;
            }
            sqlx::query("SELECT compress_chunk($1::regclass, if_not_compressed => true)")
                .bind(&chunk)
                .execute(self.pool())
                .await?;
            recompressed += 1;
        }
        if recompressed > 0 {
            info!(
                "Recompressed {} chunks of {}",
                recompressed,
                source.table_name()
            );
        } else {
            debug!("No chunks of {} needed recompression", source.table_name());
        }
        Ok(())
    }
}

#[async_trait]
impl FluxRead for Store {
    async fn fetch(
        &self,
        source: FluxSource,
        channel: Channel,
        interval: Duration,
        range: TimeRange,
        timeout: Option<Duration>,
    ) -> StorageResult<FluxSeries> {
        let rows: Vec<(DateTime<Utc>, f32)> = self
            .select_flux(source, channel, interval, range, timeout, |column| {
                column.to_string()
            })
            .await?;
        Ok(rows.into_iter().collect())
    }

    async fn fetch_raw(
        &self,
        source: FluxSource,
        channel: Channel,
        interval: Duration,
        range: TimeRange,
        timeout: Option<Duration>,
    ) -> StorageResult<Vec<(i64, f32)>> {
        self.select_flux(source, channel, interval, range, timeout, |column| {
            format!("(EXTRACT(EPOCH FROM {column}) * 1000)::BIGINT")
        })
        .await
    }

    async fn available_channels(
        &self,
        source: FluxSource,
        range: Option<TimeRange>,
    ) -> StorageResult<Vec<Channel>> {
        let rows: Vec<(i16, Band, bool)> = match range {
            Some(range) => {
                let sql = format!(
                    "SELECT DISTINCT satellite, band, is_clean FROM {} \
                     WHERE $1 <= time AND time < $2",
                    source.table_name()
                );
                sqlx::query_as(&sql)
                    .bind(range.start)
                    .bind(range.end)
                    .fetch_all(self.pool())
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT DISTINCT satellite, band, is_clean FROM {}",
                    source.table_name()
                );
                sqlx::query_as(&sql).fetch_all(self.pool()).await?
            }
        };
        Ok(rows
            .into_iter()
            .map(|(satellite, band, is_clean)| Channel::new(satellite as u16, band, is_clean))
            .collect())
    }

    async fn timestamp_range(
        &self,
        source: FluxSource,
        channel: Option<Channel>,
    ) -> StorageResult<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        let row: (Option<DateTime<Utc>>, Option<DateTime<Utc>>) = match channel {
            Some(channel) => {
                let sql = format!(
                    "SELECT MIN(time), MAX(time) FROM {} \
                     WHERE satellite = $1 AND band = $2 AND is_clean = $3",
                    source.table_name()
                );
                sqlx::query_as(&sql)
                    .bind(channel.satellite as i16)
                    .bind(channel.band)
                    .bind(channel.is_clean)
                    .fetch_one(self.pool())
                    .await?
            }
            None => {
                let sql = format!("SELECT MIN(time), MAX(time) FROM {}", source.table_name());
                sqlx::query_as(&sql).fetch_one(self.pool()).await?
            }
        };
        Ok(match row {
            (Some(start), Some(end)) => Some((start, end)),
            _ => None,
        })
    }

    async fn last_non_combined_timestamp(
        &self,
        source: FluxSource,
    ) -> StorageResult<Option<DateTime<Utc>>> {
        let sql = format!(
            "SELECT MAX(time) FROM {} WHERE satellite <> $1",
            source.table_name()
        );
        let last: Option<DateTime<Utc>> = sqlx::query_scalar(&sql)
            .bind(SATELLITE_COMBINED_ID as i16)
            .fetch_one(self.pool())
            .await?;
        Ok(last)
    }
}

/// One DELETE statement with OR-joined per-channel range predicates.
fn delete_statement(
    source: FluxSource,
    channels: impl Iterator<Item = (Channel, TimeRange)>,
) -> QueryBuilder<'static, sqlx::Postgres> {
    let mut builder = QueryBuilder::new(format!("DELETE FROM {} WHERE ", source.table_name()));
    for (index, (channel, range)) in channels.enumerate() {
        if index > 0 {
            builder.push(" OR ");
        }
        builder.push("(satellite = ");
        builder.push_bind(channel.satellite as i16);
        builder.push(" AND band = ");
        builder.push_bind(channel.band);
        builder.push(" AND is_clean = ");
        builder.push_bind(channel.is_clean);
        builder.push(" AND ");
        builder.push_bind(range.start);
        builder.push(" <= time AND time < ");
        builder.push_bind(range.end);
        builder.push(")");
    }
    builder
}

/// Serializes a channel's rows into a text COPY buffer: tab-separated
/// columns, one row per line, floats with 9 significant digits.
fn copy_buffer(channel: Channel, series: &FluxSeries) -> String {
    let mut buffer = String::with_capacity(series.len() * 56);
    for (time, flux) in series.iter() {
        let _ = writeln!(
            buffer,
            "{}\t{:.8e}\t{}\t{}\t{}",
            time.format("%Y-%m-%d %H:%M:%S%.6f+00"),
            flux,
            channel.satellite as i16,
            channel.band.as_str(),
            if channel.is_clean { "t" } else { "f" },
        );
    }
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, second).unwrap()
    }

    #[test]
    fn test_select_sql_uses_raw_table_for_fine_intervals() {
        let sql = select_flux_sql(FluxSource::Archive, Duration::seconds(1), |c| c.to_string());
        assert!(sql.contains("FROM flux_archive "));
        assert!(sql.contains("ORDER BY time"));
        assert!(!sql.contains("time_bucket"));
    }

    #[test]
    fn test_select_sql_buckets_on_aggregates() {
        let sql = select_flux_sql(FluxSource::Archive, Duration::minutes(90), |c| c.to_string());
        assert!(sql.contains("FROM flux_archive_1h"));
        assert!(sql.contains("time_bucket($1, time)"));
        assert!(sql.contains("MAX(flux_max)"));
    }

    #[test]
    fn test_select_sql_buckets_on_raw_table_below_first_rollup() {
        // 5s is above the 1s raw resolution but below the 10s roll-up.
        let sql = select_flux_sql(FluxSource::Archive, Duration::seconds(5), |c| c.to_string());
        assert!(sql.contains("FROM flux_archive "));
        assert!(sql.contains("MAX(flux)"));
    }

    #[test]
    fn test_raw_time_component_is_applied() {
        let sql = select_flux_sql(FluxSource::Live, Duration::hours(1), |column| {
            format!("(EXTRACT(EPOCH FROM {column}) * 1000)::BIGINT")
        });
        assert!(sql.contains("(EXTRACT(EPOCH FROM bucket) * 1000)::BIGINT AS time"));
    }

    #[test]
    fn test_copy_buffer_format() {
        let channel = Channel::new(16, Band::Short, false);
        let series: FluxSeries = [(at(0), 1.25e-6f32), (at(1), 3.0e-7f32)]
            .into_iter()
            .collect();
        let buffer = copy_buffer(channel, &series);
        let lines: Vec<&str> = buffer.lines().collect();
        assert_eq!(lines.len(), 2);
        let columns: Vec<&str> = lines[0].split('\t').collect();
        assert_eq!(columns[0], "2024-05-01 00:00:00.000000+00");
        // 9 significant digits.
        assert_eq!(columns[1], "1.25000000e-6");
        assert_eq!(columns[2], "16");
        assert_eq!(columns[3], "short");
        assert_eq!(columns[4], "f");
    }

    #[test]
    fn test_delete_statement_joins_channels_with_or() {
        let channels = [
            (
                Channel::new(16, Band::Short, false),
                TimeRange::new(at(0), at(10)),
            ),
            (
                Channel::new(18, Band::Long, true),
                TimeRange::new(at(0), at(10)),
            ),
        ];
        let builder = delete_statement(FluxSource::Live, channels.into_iter());
        let sql = builder.sql();
        assert!(sql.starts_with("DELETE FROM flux_live WHERE (satellite = $1"));
        assert_eq!(sql.matches(" OR ").count(), 1);
        assert_eq!(sql.matches("satellite = ").count(), 2);
        // Half-open range predicate per channel.
        assert_eq!(sql.matches("<= time AND time < ").count(), 2);
    }
}
