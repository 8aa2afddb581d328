//! Importer for the near-real-time flux feeds.
//!
//! Polls the primary and secondary live JSON endpoints, picking the shortest
//! window that still covers the resume point, and paces itself from the
//! response cache headers. It will not fall back to the secondary feed if
//! the primary stops updating, and won't error when part of the range is no
//! longer served (older than a week) — it imports what is available.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::header::{HeaderMap, AGE, CACHE_CONTROL};
use serde::Deserialize;

use super::{import_channels, ImportError, Importer};
use crate::model::{Band, Channel, FluxSeries, FluxSource, TimeRange};
use crate::storage::Store;

pub const LIVE_BASE_URL: &str = "https://services.swpc.noaa.gov/json/goes/";

fn energy_tag(band: Band) -> &'static str {
    match band {
        Band::Short => "0.05-0.4nm",
        Band::Long => "0.1-0.8nm",
    }
}

/// The shortest feed window that still covers everything since `start`.
fn select_live_url(
    base_url: &str,
    primary: bool,
    start: DateTime<Utc>,
    now: DateTime<Utc>,
) -> String {
    let url = format!("{base_url}{}", if primary { "primary/" } else { "secondary/" });
    if now - Duration::hours(6) <= start {
        return url + "xrays-6-hour.json";
    }
    if now - Duration::days(1) <= start {
        return url + "xrays-1-day.json";
    }
    if now - Duration::days(3) <= start {
        return url + "xrays-3-day.json";
    }
    url + "xrays-7-day.json"
}

#[derive(Debug, Deserialize)]
struct LiveRecord {
    time_tag: String,
    energy: String,
    #[serde(default)]
    flux: Option<f64>,
    satellite: u16,
}

/// Extracts one band's series from a feed payload.
///
/// Walks from newest to oldest so it can stop at the resume point. A feed is
/// expected to carry exactly one satellite.
fn from_live_json(
    records: &[LiveRecord],
    band: Band,
    start: DateTime<Utc>,
) -> Result<(FluxSeries, Option<u16>), ImportError> {
    let energy = energy_tag(band);
    let mut satellite = None;
    let mut points = Vec::new();
    for record in records.iter().rev() {
        let timestamp = DateTime::parse_from_rfc3339(&record.time_tag)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| {
                ImportError::InvalidData(format!("bad live time_tag {:?}", record.time_tag))
            })?;
        if record.energy != energy {
            continue;
        }
        match satellite {
            None => satellite = Some(record.satellite),
            Some(known) if known != record.satellite => {
                return Err(ImportError::InvalidData(
                    "unexpected multiple satellites in live data".into(),
                ));
            }
            _ => {}
        }
        if timestamp < start {
            break;
        }
        let Some(flux) = record.flux else { continue };
        if !(0.0 < flux && flux < 1.0) {
            continue;
        }
        points.push((timestamp, flux as f32));
    }
    points.reverse();
    Ok((FluxSeries::from_unsorted(points), satellite))
}

/// Seconds until the feed serves fresh data, from `Cache-Control: max-age`
/// and `Age` (defaulting to 60 and 0).
fn wait_from_headers(headers: &HeaderMap) -> Duration {
    let max_age = headers
        .get(CACHE_CONTROL)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            value.split("max-age=").nth(1).map(|rest| {
                rest.chars()
                    .take_while(char::is_ascii_digit)
                    .collect::<String>()
            })
        })
        .and_then(|digits| digits.parse::<i64>().ok())
        .unwrap_or(60);
    let age = headers
        .get(AGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<i64>().ok())
        .unwrap_or(0);
    Duration::seconds(max_age - age)
}

pub struct LiveImporter {
    store: Store,
    client: reqwest::Client,
    base_url: String,
}

impl LiveImporter {
    pub fn new(store: Store) -> Self {
        Self::with_base_url(store, LIVE_BASE_URL.to_string())
    }

    pub fn with_base_url(store: Store, base_url: String) -> Self {
        Self {
            store,
            client: reqwest::Client::new(),
            base_url,
        }
    }
}

#[async_trait]
impl Importer for LiveImporter {
    fn source(&self) -> FluxSource {
        FluxSource::Live
    }

    async fn import_from(&mut self, start: DateTime<Utc>) -> Result<Duration, ImportError> {
        let mut channels: BTreeMap<Channel, FluxSeries> = BTreeMap::new();
        let mut min_wait = Duration::seconds(60);
        for primary in [true, false] {
            let url = select_live_url(&self.base_url, primary, start, Utc::now());
            let response = self.client.get(&url).send().await?.error_for_status()?;

            let wait = wait_from_headers(response.headers());
            if wait < min_wait {
                min_wait = wait;
            }

            let records: Vec<LiveRecord> = response.json().await?;
            for band in Band::ALL {
                let (flux, satellite) = from_live_json(&records, band, start)?;
                let Some(satellite) = satellite else { continue };
                if flux.is_empty() {
                    continue;
                }
                channels.insert(Channel::new(satellite, band, false), flux);
            }
        }

        let range = TimeRange::new(start, Utc::now());
        import_channels(&self.store, FluxSource::Live, channels, range).await?;
        // One extra second to account for timing inaccuracies.
        Ok(min_wait + Duration::seconds(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use reqwest::header::HeaderValue;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap()
    }

    fn record(time: &str, energy: &str, flux: f64, satellite: u16) -> LiveRecord {
        LiveRecord {
            time_tag: time.to_string(),
            energy: energy.to_string(),
            flux: Some(flux),
            satellite,
        }
    }

    #[test]
    fn test_select_live_url_windows() {
        let base = LIVE_BASE_URL;
        let url = |start| select_live_url(base, true, start, now());
        assert!(url(now() - Duration::hours(2)).ends_with("primary/xrays-6-hour.json"));
        assert!(url(now() - Duration::hours(20)).ends_with("primary/xrays-1-day.json"));
        assert!(url(now() - Duration::days(2)).ends_with("primary/xrays-3-day.json"));
        assert!(url(now() - Duration::days(20)).ends_with("primary/xrays-7-day.json"));
        assert!(
            select_live_url(base, false, now(), now()).ends_with("secondary/xrays-6-hour.json")
        );
    }

    #[test]
    fn test_from_live_json_filters_and_orders() {
        let records = vec![
            record("2024-05-10T11:58:00Z", "0.1-0.8nm", 1e-6, 16),
            record("2024-05-10T11:58:00Z", "0.05-0.4nm", 1e-7, 16),
            record("2024-05-10T11:59:00Z", "0.1-0.8nm", 2.0, 16),
            record("2024-05-10T12:00:00Z", "0.1-0.8nm", 3e-6, 16),
        ];
        let start = Utc.with_ymd_and_hms(2024, 5, 10, 0, 0, 0).unwrap();
        let (series, satellite) = from_live_json(&records, Band::Long, start).unwrap();
        assert_eq!(satellite, Some(16));
        // The short-band record and the out-of-range flux are dropped.
        assert_eq!(series.len(), 2);
        assert_eq!(series.values(), &[1e-6, 3e-6]);
        assert!(series.times().windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn test_from_live_json_stops_at_resume_point() {
        let records = vec![
            record("2024-05-10T11:00:00Z", "0.1-0.8nm", 1e-6, 16),
            record("2024-05-10T11:30:00Z", "0.1-0.8nm", 2e-6, 16),
            record("2024-05-10T11:59:00Z", "0.1-0.8nm", 3e-6, 16),
        ];
        let start = Utc.with_ymd_and_hms(2024, 5, 10, 11, 15, 0).unwrap();
        let (series, _) = from_live_json(&records, Band::Long, start).unwrap();
        assert_eq!(series.values(), &[2e-6, 3e-6]);
    }

    #[test]
    fn test_from_live_json_rejects_mixed_satellites() {
        let records = vec![
            record("2024-05-10T11:58:00Z", "0.1-0.8nm", 1e-6, 16),
            record("2024-05-10T11:59:00Z", "0.1-0.8nm", 1e-6, 18),
        ];
        let start = Utc.with_ymd_and_hms(2024, 5, 10, 0, 0, 0).unwrap();
        assert!(matches!(
            from_live_json(&records, Band::Long, start),
            Err(ImportError::InvalidData(_))
        ));
    }

    #[test]
    fn test_wait_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(
            CACHE_CONTROL,
            HeaderValue::from_static("public, max-age=120"),
        );
        headers.insert(AGE, HeaderValue::from_static("45"));
        assert_eq!(wait_from_headers(&headers), Duration::seconds(75));
    }

    #[test]
    fn test_wait_from_headers_defaults() {
        assert_eq!(wait_from_headers(&HeaderMap::new()), Duration::seconds(60));
    }
}
