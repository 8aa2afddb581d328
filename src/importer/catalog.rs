//! Contract to the external archive catalog.
//!
//! The catalog is a third-party collaborator: it answers a time-range search
//! with daily files per satellite and serves those files for download. The
//! importer only relies on the [`Catalog`] trait plus the daily-file line
//! format; [`HttpCatalog`] is the thin reqwest-backed implementation.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};
use serde::Deserialize;

use super::ImportError;
use crate::model::{Band, FluxSeries, TimeRange};

/// One daily file the catalog offers for one satellite.
#[derive(Debug, Clone, Deserialize)]
pub struct DailyFile {
    pub satellite: u16,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Only present when the satellite offers multiple resolutions.
    pub resolution: Option<String>,
    pub url: String,
}

impl DailyFile {
    pub fn day(&self) -> NaiveDate {
        self.start_time.date_naive()
    }
}

#[async_trait]
pub trait Catalog: Send + Sync {
    /// All daily results intersecting the half-open `range`.
    async fn search(&self, range: TimeRange) -> Result<Vec<DailyFile>, ImportError>;

    /// Downloads one daily file into the staging directory.
    async fn download(&self, file: &DailyFile, staging: &Path) -> Result<PathBuf, ImportError>;
}

/// Groups the search results by satellite, keeping one file per day: the
/// `flx1s` file where a resolution is offered, else the day's only file.
///
/// The catalog promises whole-day intervals; anything else is a data
/// integrity violation.
pub fn select_best_files(
    results: Vec<DailyFile>,
) -> Result<std::collections::BTreeMap<u16, Vec<DailyFile>>, ImportError> {
    use std::collections::BTreeMap;

    let mut by_day: BTreeMap<(u16, NaiveDate), Vec<DailyFile>> = BTreeMap::new();
    for file in results {
        by_day
            .entry((file.satellite, file.day()))
            .or_default()
            .push(file);
    }

    let mut by_satellite: BTreeMap<u16, Vec<DailyFile>> = BTreeMap::new();
    for ((satellite, day), mut files) in by_day {
        for file in &files {
            if file.start_time.time().num_seconds_from_midnight() != 0 {
                return Err(ImportError::DataIntegrity(format!(
                    "daily file for {satellite} on {day} does not start at midnight"
                )));
            }
            if file.end_time != day_end(day) {
                return Err(ImportError::DataIntegrity(format!(
                    "daily file for {satellite} on {day} does not span the whole day"
                )));
            }
        }
        let has_resolutions = files.iter().any(|file| file.resolution.is_some());
        let best = if has_resolutions {
            let position = files
                .iter()
                .position(|file| file.resolution.as_deref() == Some("flx1s"))
                .unwrap_or(0);
            files.swap_remove(position)
        } else {
            files.swap_remove(0)
        };
        by_satellite.entry(satellite).or_default().push(best);
    }
    Ok(by_satellite)
}

fn day_end(day: NaiveDate) -> DateTime<Utc> {
    day.and_hms_milli_opt(23, 59, 59, 999)
        .map(|t| t.and_utc())
        .unwrap_or_default()
}

/// Parses one band out of a daily file.
///
/// The line format is CSV with a header naming at least `time` and the band
/// columns `xrsa` (SHORT) / `xrsb` (LONG); `<band>_quality` columns are
/// optional and non-zero quality drops the row (early GOES satellites have
/// no quality flag yet). Unparsable or missing flux values count as missing.
pub fn parse_band(content: &str, band: Band) -> Result<FluxSeries, ImportError> {
    let column = match band {
        Band::Short => "xrsa",
        Band::Long => "xrsb",
    };
    let quality_column = format!("{column}_quality");

    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(content.as_bytes());
    let headers = reader
        .headers()
        .map_err(|err| ImportError::InvalidData(format!("bad daily file header: {err}")))?
        .clone();
    let position = |name: &str| headers.iter().position(|header| header == name);
    let time_index = position("time")
        .ok_or_else(|| ImportError::InvalidData("daily file has no time column".into()))?;
    let value_index = position(column)
        .ok_or_else(|| ImportError::InvalidData(format!("daily file has no {column} column")))?;
    let quality_index = position(&quality_column);

    let mut points = Vec::new();
    for record in reader.into_records() {
        let record =
            record.map_err(|err| ImportError::InvalidData(format!("bad daily file row: {err}")))?;
        let time_field = record.get(time_index).unwrap_or_default();
        let time = DateTime::parse_from_rfc3339(time_field)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| {
                ImportError::InvalidData(format!("bad timestamp {time_field:?} in daily file"))
            })?;
        if let Some(quality_index) = quality_index {
            if record.get(quality_index).unwrap_or("0") != "0" {
                continue;
            }
        }
        let Some(value) = record.get(value_index).and_then(|f| f.parse::<f32>().ok()) else {
            continue;
        };
        if !value.is_finite() {
            continue;
        }
        points.push((time, value));
    }
    Ok(FluxSeries::from_unsorted(points))
}

/// Search/download client against a JSON catalog index.
pub struct HttpCatalog {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCatalog {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }
}

#[async_trait]
impl Catalog for HttpCatalog {
    async fn search(&self, range: TimeRange) -> Result<Vec<DailyFile>, ImportError> {
        // The upstream search treats the end as inclusive.
        let inclusive_end = range.end - Duration::milliseconds(1);
        let response = self
            .client
            .get(format!("{}/search", self.base_url))
            .query(&[
                ("start", range.start.to_rfc3339()),
                ("end", inclusive_end.to_rfc3339()),
                ("instrument", "XRS".to_string()),
            ])
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn download(&self, file: &DailyFile, staging: &Path) -> Result<PathBuf, ImportError> {
        let name = file
            .url
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}-{}.csv", file.satellite, file.day()));
        let path = staging.join(name);
        let response = self
            .client
            .get(&file.url)
            .send()
            .await?
            .error_for_status()?;
        let body = response.bytes().await?;
        tokio::fs::create_dir_all(staging)
            .await
            .map_err(|err| ImportError::Transient(err.to_string()))?;
        tokio::fs::write(&path, &body)
            .await
            .map_err(|err| ImportError::Transient(err.to_string()))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn day_file(satellite: u16, day: u32, resolution: Option<&str>) -> DailyFile {
        DailyFile {
            satellite,
            start_time: Utc.with_ymd_and_hms(2024, 5, day, 0, 0, 0).unwrap(),
            end_time: Utc
                .with_ymd_and_hms(2024, 5, day, 23, 59, 59)
                .unwrap()
                .with_nanosecond(999_000_000)
                .unwrap(),
            resolution: resolution.map(str::to_string),
            url: format!("https://catalog.example/{satellite}/{day}"),
        }
    }

    #[test]
    fn test_select_prefers_high_resolution() {
        let selected = select_best_files(vec![
            day_file(16, 1, Some("avg1m")),
            day_file(16, 1, Some("flx1s")),
            day_file(18, 1, None),
        ])
        .unwrap();
        assert_eq!(selected[&16].len(), 1);
        assert_eq!(selected[&16][0].resolution.as_deref(), Some("flx1s"));
        assert_eq!(selected[&18].len(), 1);
    }

    #[test]
    fn test_select_falls_back_to_first_resolution() {
        let selected =
            select_best_files(vec![day_file(16, 2, Some("avg1m"))]).unwrap();
        assert_eq!(selected[&16][0].resolution.as_deref(), Some("avg1m"));
    }

    #[test]
    fn test_select_rejects_partial_days() {
        let mut partial = day_file(16, 1, None);
        partial.end_time = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert!(matches!(
            select_best_files(vec![partial]),
            Err(ImportError::DataIntegrity(_))
        ));
    }

    #[test]
    fn test_parse_band_filters_quality() {
        let content = "\
time,xrsa,xrsa_quality,xrsb,xrsb_quality
2024-05-01T00:00:00Z,1e-7,0,1e-6,0
2024-05-01T00:00:01Z,2e-7,1,2e-6,0
2024-05-01T00:00:02Z,3e-7,0,3e-6,4
";
        let short = parse_band(content, Band::Short).unwrap();
        assert_eq!(short.len(), 2);
        assert_eq!(short.values(), &[1e-7, 3e-7]);
        let long = parse_band(content, Band::Long).unwrap();
        assert_eq!(long.len(), 2);
        assert_eq!(long.values(), &[1e-6, 2e-6]);
    }

    #[test]
    fn test_parse_band_without_quality_columns() {
        let content = "\
time,xrsb
2024-05-01T00:00:00Z,
2024-05-01T00:00:01Z,2e-6
2024-05-01T00:00:01Z,5e-6
";
        let series = parse_band(content, Band::Long).unwrap();
        // The empty value is missing, not an error; duplicates keep first.
        assert_eq!(series.len(), 1);
        assert_eq!(series.values(), &[2e-6]);
    }

    #[test]
    fn test_parse_band_rejects_bad_timestamps() {
        let content = "time,xrsb\nnot-a-time,1e-6\n";
        assert!(parse_band(content, Band::Long).is_err());
    }
}
