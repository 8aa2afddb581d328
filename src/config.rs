//! Environment configuration, read once at startup.

use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_host: String,
    pub database_port: u16,
    pub database_name: String,
    pub database_username: String,
    pub database_password: String,
    pub database_pool_size: u32,
    /// Memory available to the store, used there for chunk sizing.
    pub database_memory_gb: u32,

    /// Earliest timestamp the importers will ever fetch.
    pub import_start: DateTime<Utc>,

    pub flux_max_resolution: u32,
    pub flux_query_timeout: Duration,

    /// Serve the API without starting the importers.
    pub only_api: bool,

    pub api_bind: String,
    pub archive_catalog_url: String,
    pub archive_staging_dir: PathBuf,
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

/// `IMPORT_START` as an ISO 8601 timestamp; default is 30 days back.
fn parse_import_start(value: Option<&str>, now: DateTime<Utc>) -> DateTime<Utc> {
    value
        .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
        .map(|time| time.with_timezone(&Utc))
        .unwrap_or(now - Duration::days(30))
}

impl Config {
    pub fn from_env() -> Self {
        let now = Utc::now();
        Self {
            database_host: env_var("DATABASE_HOST").unwrap_or_else(|| "localhost".into()),
            database_port: env_var("DATABASE_PORT")
                .and_then(|value| value.parse().ok())
                .unwrap_or(5432),
            database_name: env_var("DATABASE_DATABASE").unwrap_or_else(|| "postgres".into()),
            database_username: env_var("DATABASE_USERNAME").unwrap_or_else(|| "postgres".into()),
            database_password: env_var("DATABASE_PASSWORD").unwrap_or_else(|| "solarflux".into()),
            database_pool_size: env_var("DATABASE_POOL_SIZE")
                .and_then(|value| value.parse().ok())
                .unwrap_or(20),
            database_memory_gb: env_var("DATABASE_MEMORY_GB")
                .and_then(|value| value.parse().ok())
                .unwrap_or(28),
            import_start: parse_import_start(env_var("IMPORT_START").as_deref(), now),
            flux_max_resolution: env_var("FLUX_MAX_RESOLUTION")
                .and_then(|value| value.parse().ok())
                .unwrap_or(2000),
            flux_query_timeout: Duration::milliseconds(
                (env_var("FLUX_QUERY_TIMEOUT")
                    .and_then(|value| value.parse::<f64>().ok())
                    .unwrap_or(30.0)
                    * 1000.0) as i64,
            ),
            only_api: env_var("ONLY_API")
                .map(|value| value.to_lowercase() == "true")
                .unwrap_or(false),
            api_bind: env_var("API_BIND").unwrap_or_else(|| "0.0.0.0:8000".into()),
            archive_catalog_url: env_var("ARCHIVE_CATALOG_URL")
                .unwrap_or_else(|| "https://www.ncei.noaa.gov/data/goes-xrs-science".into()),
            archive_staging_dir: env_var("ARCHIVE_STAGING_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| std::env::temp_dir().join("solarflux-archive")),
        }
    }

    pub fn database_url(&self) -> String {
        format!(
            "postgresql://{}:{}@{}:{}/{}",
            self.database_username,
            self.database_password,
            self.database_host,
            self.database_port,
            self.database_name
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_import_start_parses_iso() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let parsed = parse_import_start(Some("2024-02-01T12:00:00Z"), now);
        assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_import_start_defaults_to_thirty_days() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        assert_eq!(parse_import_start(None, now), now - Duration::days(30));
        // Unparsable values fall back too.
        assert_eq!(
            parse_import_start(Some("yesterday"), now),
            now - Duration::days(30)
        );
    }
}
