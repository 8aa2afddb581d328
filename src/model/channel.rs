//! Channel identity: which satellite recorded the data, on which frequency
//! band, and whether it went through the cleaning pass.

use serde::{Deserialize, Serialize};

/// Satellite id reserved for the combined consensus channel produced by the
/// combiner across all available satellites of a band.
pub const SATELLITE_COMBINED_ID: u16 = 0;

/// X-ray frequency band of a measurement.
///
/// SHORT covers 0.05-0.4 nm, LONG covers 0.1-0.8 nm. Maps onto the
/// `frequency_band` postgres enum.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "frequency_band", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Band {
    Short,
    Long,
}

impl Band {
    pub const ALL: [Band; 2] = [Band::Short, Band::Long];

    pub fn as_str(&self) -> &'static str {
        match self {
            Band::Short => "short",
            Band::Long => "long",
        }
    }
}

/// Identity of a logical flux series.
///
/// Cleaned-ness is a field, not a subtype: every raw channel written to the
/// store has a clean counterpart with the same `(satellite, band)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Channel {
    pub satellite: u16,
    pub band: Band,
    pub is_clean: bool,
}

impl Channel {
    pub fn new(satellite: u16, band: Band, is_clean: bool) -> Self {
        Self {
            satellite,
            band,
            is_clean,
        }
    }

    /// The same channel with `is_clean` set.
    pub fn as_clean(&self) -> Self {
        Self {
            is_clean: true,
            ..*self
        }
    }

    /// The same channel with `is_clean` unset.
    pub fn as_raw(&self) -> Self {
        Self {
            is_clean: false,
            ..*self
        }
    }

    pub fn is_combined(&self) -> bool {
        self.satellite == SATELLITE_COMBINED_ID
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.satellite,
            self.band.as_str(),
            if self.is_clean { "clean" } else { "raw" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_raw_conversion() {
        let raw = Channel::new(16, Band::Long, false);
        assert_eq!(raw.as_clean(), Channel::new(16, Band::Long, true));
        assert_eq!(raw.as_clean().as_raw(), raw);
    }

    #[test]
    fn test_combined_id() {
        assert!(Channel::new(SATELLITE_COMBINED_ID, Band::Short, true).is_combined());
        assert!(!Channel::new(18, Band::Short, true).is_combined());
    }
}
