//! Core value types: time ranges, channel identity, series data and the
//! source/resolution catalogs.

pub mod channel;
pub mod range;
pub mod series;
pub mod source;

pub use channel::{Band, Channel, SATELLITE_COMBINED_ID};
pub use range::TimeRange;
pub use series::FluxSeries;
pub use source::{auto_refresh_horizon, auto_refresh_slack, FluxSource, Resolution};
