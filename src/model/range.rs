//! Half-open time ranges used throughout the import and query paths.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A half-open range of time: `start` is included, `end` is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// Grows the range by `delta` on both sides.
    pub fn extend(&self, delta: Duration) -> Self {
        Self {
            start: self.start - delta,
            end: self.end + delta,
        }
    }

    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        self.start <= time && time < self.end
    }

    /// Smallest range covering both `self` and `other`.
    pub fn union(&self, other: &TimeRange) -> Self {
        Self {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    /// Smallest range covering every range in `ranges`. `None` when empty.
    pub fn which_includes<'a>(ranges: impl IntoIterator<Item = &'a TimeRange>) -> Option<Self> {
        ranges
            .into_iter()
            .fold(None, |acc: Option<TimeRange>, range| match acc {
                Some(union) => Some(union.union(range)),
                None => Some(*range),
            })
    }
}

impl std::fmt::Display for TimeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} - {}", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_contains_is_half_open() {
        let range = TimeRange::new(at(1), at(3));
        assert!(range.contains(at(1)));
        assert!(range.contains(at(2)));
        assert!(!range.contains(at(3)));
        assert!(!range.contains(at(0)));
    }

    #[test]
    fn test_extend() {
        let range = TimeRange::new(at(2), at(3)).extend(Duration::hours(1));
        assert_eq!(range, TimeRange::new(at(1), at(4)));
    }

    #[test]
    fn test_union() {
        let a = TimeRange::new(at(1), at(3));
        let b = TimeRange::new(at(2), at(5));
        assert_eq!(a.union(&b), TimeRange::new(at(1), at(5)));
    }

    #[test]
    fn test_which_includes() {
        let ranges = [
            TimeRange::new(at(3), at(4)),
            TimeRange::new(at(1), at(2)),
            TimeRange::new(at(2), at(6)),
        ];
        assert_eq!(
            TimeRange::which_includes(&ranges),
            Some(TimeRange::new(at(1), at(6)))
        );
        assert_eq!(TimeRange::which_includes([].iter()), None);
    }
}
