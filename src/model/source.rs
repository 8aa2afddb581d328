//! Physical flux sources and their roll-up resolution catalog.

use chrono::Duration;

/// Bucket sizes of the continuous roll-up aggregates, ordered fine to coarse.
/// Each level is computed from the next-lower one by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    TenSeconds,
    OneMinute,
    TenMinutes,
    OneHour,
    TwelveHours,
    FiveDays,
}

impl Resolution {
    pub const ALL: [Resolution; 6] = [
        Resolution::TenSeconds,
        Resolution::OneMinute,
        Resolution::TenMinutes,
        Resolution::OneHour,
        Resolution::TwelveHours,
        Resolution::FiveDays,
    ];

    /// Suffix of the aggregate's relation name (`<table><suffix>`).
    pub fn suffix(&self) -> &'static str {
        match self {
            Resolution::TenSeconds => "_10s",
            Resolution::OneMinute => "_1m",
            Resolution::TenMinutes => "_10m",
            Resolution::OneHour => "_1h",
            Resolution::TwelveHours => "_12h",
            Resolution::FiveDays => "_5d",
        }
    }

    pub fn size(&self) -> Duration {
        match self {
            Resolution::TenSeconds => Duration::seconds(10),
            Resolution::OneMinute => Duration::minutes(1),
            Resolution::TenMinutes => Duration::minutes(10),
            Resolution::OneHour => Duration::hours(1),
            Resolution::TwelveHours => Duration::hours(12),
            Resolution::FiveDays => Duration::days(5),
        }
    }

    /// Whether the aggregate computes recent buckets on the fly
    /// (timescaledb real-time aggregation). Coarser levels are materialized
    /// only and always need a manual refresh after out-of-band writes.
    pub fn is_real_time(&self) -> bool {
        matches!(
            self,
            Resolution::TenSeconds | Resolution::OneMinute | Resolution::TenMinutes
        )
    }
}

/// How long after insertion the store's own aggregate-refresh policy is
/// guaranteed to have picked a bucket up.
pub fn auto_refresh_horizon() -> Duration {
    Duration::days(29)
}

/// Slack subtracted from the horizon to not race the refresh schedule.
pub fn auto_refresh_slack() -> Duration {
    Duration::days(1)
}

/// Source from which data was retrieved:
/// - Archive has the highest resolution but lags by a few days.
/// - Live has a lower resolution but is up to date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FluxSource {
    Archive,
    Live,
}

impl FluxSource {
    /// Sorted from highest to lowest query priority.
    pub const ALL: [FluxSource; 2] = [FluxSource::Archive, FluxSource::Live];

    pub fn table_name(&self) -> &'static str {
        match self {
            FluxSource::Archive => "flux_archive",
            FluxSource::Live => "flux_live",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FluxSource::Archive => "archive",
            FluxSource::Live => "live",
        }
    }

    /// Native sampling period of the source's raw table.
    pub fn raw_resolution(&self) -> Duration {
        match self {
            FluxSource::Archive => Duration::seconds(1),
            FluxSource::Live => Duration::minutes(1),
        }
    }

    /// Roll-up resolutions this source participates in, fine to coarse.
    pub fn resolutions(&self) -> &'static [Resolution] {
        match self {
            FluxSource::Archive => &Resolution::ALL,
            FluxSource::Live => &[
                Resolution::TenMinutes,
                Resolution::OneHour,
                Resolution::TwelveHours,
                Resolution::FiveDays,
            ],
        }
    }

    /// The relation answering a query at `interval`: the coarsest roll-up
    /// whose bucket fits inside the interval, else the raw table.
    pub fn select_relation(&self, interval: Duration) -> String {
        for resolution in self.resolutions().iter().rev() {
            if interval >= resolution.size() {
                return format!("{}{}", self.table_name(), resolution.suffix());
            }
        }
        self.table_name().to_string()
    }
}
