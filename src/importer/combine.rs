//! Fusion of multiple satellites' channels into one combined channel per
//! band.
//!
//! Per band, the per-satellite series are merged column-wise by timestamp,
//! segmented at measurement gaps, weighted by per-segment point counts,
//! smoothed with a time-weighted window so transitions are gradual, and
//! finally averaged. The clean and raw sets are processed separately with
//! the segmentation derived once from the clean set.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use super::rolling::{clip, rolling_sum};
use crate::model::{Band, Channel, FluxSeries, TimeRange, SATELLITE_COMBINED_ID};

/// Time range at start and end which will not be properly combined because
/// there was no bordering data to compare to.
pub fn combine_border() -> Duration {
    Duration::hours(6)
}

const MICROS_PER_SEC: i64 = 1_000_000;
const GAP_THRESHOLD: i64 = 5 * 60 * MICROS_PER_SEC;
const MAX_INTERVAL_SECS: f64 = 60.0;
const WEIGHT_SMOOTHING_WINDOW: i64 = 10 * 60 * MICROS_PER_SEC;
/// Satellites with less than this share of the best satellite's points in a
/// segment contribute nothing.
const WEIGHT_CUTOFF: f64 = 0.25;

#[derive(Error, Debug)]
pub enum CombineError {
    #[error("missing raw channels for band {0:?}")]
    MissingRaw(Band),

    #[error("missing clean channels for band {0:?}")]
    MissingClean(Band),
}

/// Combines flux data from multiple satellites into a single channel per
/// band, producing both a clean and a raw combined channel.
///
/// Every raw channel must come with its clean counterpart (and vice versa);
/// combined inputs are not allowed.
pub fn combine_flux_channels(
    channels: &BTreeMap<Channel, FluxSeries>,
    range: TimeRange,
) -> Result<BTreeMap<Channel, FluxSeries>, CombineError> {
    let mut result = BTreeMap::new();
    for band in Band::ALL {
        let band_channels: Vec<(&Channel, &FluxSeries)> = channels
            .iter()
            .filter(|(channel, _)| channel.band == band)
            .collect();
        if band_channels.is_empty() {
            continue;
        }

        // Pair every raw channel with its clean counterpart; both orderings
        // line up because the channel map is sorted by satellite.
        let raw: Vec<(Channel, &FluxSeries)> = band_channels
            .iter()
            .filter(|(channel, _)| !channel.is_clean)
            .map(|(channel, series)| (**channel, *series))
            .collect();
        if raw.len() * 2 != band_channels.len() {
            return Err(CombineError::MissingRaw(band));
        }
        let clean: Vec<&FluxSeries> = raw
            .iter()
            .map(|(channel, _)| {
                channels
                    .get(&channel.as_clean())
                    .ok_or(CombineError::MissingClean(band))
            })
            .collect::<Result<_, _>>()?;

        let raw_series: Vec<&FluxSeries> = raw.iter().map(|(_, series)| *series).collect();
        result.extend(process_band(band, &raw_series, &clean, range));
    }
    Ok(result)
}

/// Column-wise merge of per-satellite series over the union of timestamps.
struct Frame {
    times: Vec<DateTime<Utc>>,
    micros: Vec<i64>,
    /// One column per satellite; NaN where the satellite has no measurement.
    columns: Vec<Vec<f64>>,
}

impl Frame {
    fn merge(series_list: &[&FluxSeries]) -> Self {
        let mut micros: Vec<i64> = series_list
            .iter()
            .flat_map(|series| series.epoch_micros())
            .collect();
        micros.sort_unstable();
        micros.dedup();
        let times: Vec<DateTime<Utc>> = micros
            .iter()
            .map(|&us| DateTime::from_timestamp_micros(us).unwrap_or_default())
            .collect();

        let columns = series_list
            .iter()
            .map(|series| {
                let mut column = vec![f64::NAN; micros.len()];
                for (time, value) in series.iter() {
                    let position = micros
                        .binary_search(&time.timestamp_micros())
                        .unwrap_or_default();
                    column[position] = value as f64;
                }
                column
            })
            .collect();
        Self {
            times,
            micros,
            columns,
        }
    }

    fn row_count(&self) -> usize {
        self.micros.len()
    }

    /// Index of the given timestamp, if present.
    fn position(&self, micros: i64) -> Option<usize> {
        self.micros.binary_search(&micros).ok()
    }
}

/// Forward and backward time deltas (seconds) of a time index, with the
/// declared range providing the edge fill values.
fn bidirectional_time_delta(micros: &[i64], range: TimeRange) -> (Vec<f64>, Vec<f64>) {
    let n = micros.len();
    let mut forward = vec![0.0; n];
    if n > 0 {
        forward[0] = (range.start.timestamp_micros() - micros[0]) as f64 / 1e6;
        for i in 1..n {
            forward[i] = (micros[i] - micros[i - 1]) as f64 / 1e6;
        }
    }
    let mut backward = vec![0.0; n];
    if n > 0 {
        for i in 0..n - 1 {
            backward[i] = forward[i + 1];
        }
        backward[n - 1] = (micros[n - 1] - range.end.timestamp_micros()) as f64 / 1e6;
    }
    (forward, backward)
}

/// Per-point time weights: how much span a measurement covers, capped so
/// lonely points don't dominate.
fn time_weights(micros: &[i64], range: TimeRange) -> Vec<f64> {
    let (forward, backward) = bidirectional_time_delta(micros, range);
    forward
        .iter()
        .zip(&backward)
        .map(|(f, b)| f.min(MAX_INTERVAL_SECS) + b.min(MAX_INTERVAL_SECS))
        .collect()
}

fn process_band(
    band: Band,
    raw_series: &[&FluxSeries],
    clean_series: &[&FluxSeries],
    range: TimeRange,
) -> BTreeMap<Channel, FluxSeries> {
    let clean_frame = Frame::merge(clean_series);
    let raw_frame = Frame::merge(raw_series);

    // Gap detection, done once on the clean set: segment boundaries sit
    // wherever any satellite enters or exits a measurement gap.
    let mut is_after_gap = vec![false; clean_frame.row_count()];
    let mut is_before_gap = vec![false; clean_frame.row_count()];
    for series in clean_series {
        let micros = series.epoch_micros();
        let (forward, backward) = bidirectional_time_delta(&micros, range);
        for (k, &us) in micros.iter().enumerate() {
            if let Some(position) = clean_frame.position(us) {
                is_after_gap[position] |= forward[k] * 1e6 > GAP_THRESHOLD as f64;
                is_before_gap[position] |= backward[k] * 1e6 > GAP_THRESHOLD as f64;
            }
        }
    }

    let mut result = BTreeMap::new();
    for (frame, is_clean) in [(&raw_frame, false), (&clean_frame, true)] {
        let channel = Channel::new(SATELLITE_COMBINED_ID, band, is_clean);
        let combined = combine_frame(
            frame,
            &clean_frame,
            &is_after_gap,
            &is_before_gap,
            range,
        );
        result.insert(channel, combined);
    }
    result
}

fn combine_frame(
    frame: &Frame,
    clean_frame: &Frame,
    is_after_gap: &[bool],
    is_before_gap: &[bool],
    range: TimeRange,
) -> FluxSeries {
    let rows = frame.row_count();
    let column_count = frame.columns.len();
    if rows == 0 {
        return FluxSeries::new();
    }

    // The gap marks live on the clean index which might be missing entries;
    // reindex them onto this frame.
    let complete_after: Vec<bool> = frame
        .micros
        .iter()
        .map(|&us| clean_frame.position(us).is_some_and(|p| is_after_gap[p]))
        .collect();
    let complete_before: Vec<bool> = frame
        .micros
        .iter()
        .map(|&us| clean_frame.position(us).is_some_and(|p| is_before_gap[p]))
        .collect();

    // Split the rows into segments at the detected gaps.
    let mut segments: Vec<(usize, usize)> = Vec::new();
    let mut segment_start = 0usize;
    for row in 0..rows {
        let boundary = (row > 0 && complete_before[row - 1]) || complete_after[row];
        if boundary && row > segment_start {
            segments.push((segment_start, row));
            segment_start = row;
        }
    }
    segments.push((segment_start, rows));

    // ----- Weight calculation -----
    // Per segment: weight satellites by their share of points, judged on the
    // clean data when available, and drop rows that would be pure
    // interpolations.
    let mut weight_rows: Vec<usize> = Vec::new();
    let mut weights: Vec<Vec<f64>> = Vec::new();
    for &(start, end) in &segments {
        let clean_start = clean_frame
            .micros
            .partition_point(|&us| us < frame.micros[start]);
        let clean_end = clean_frame
            .micros
            .partition_point(|&us| us <= frame.micros[end - 1]);
        let counts: Vec<usize> = if clean_start < clean_end {
            (0..column_count)
                .map(|c| {
                    clean_frame.columns[c][clean_start..clean_end]
                        .iter()
                        .filter(|v| !v.is_nan())
                        .count()
                })
                .collect()
        } else {
            (0..column_count)
                .map(|c| {
                    frame.columns[c][start..end]
                        .iter()
                        .filter(|v| !v.is_nan())
                        .count()
                })
                .collect()
        };
        let best = counts.iter().copied().max().unwrap_or(0);
        if best == 0 {
            continue;
        }
        let channel_weights: Vec<f64> = counts
            .iter()
            .map(|&count| {
                let weight = count as f64 / best as f64;
                if weight >= WEIGHT_CUTOFF {
                    weight
                } else {
                    0.0
                }
            })
            .collect();
        if channel_weights.iter().all(|w| *w == 0.0) {
            continue;
        }

        for row in start..end {
            let has_value = (0..column_count)
                .any(|c| channel_weights[c] > 0.0 && !frame.columns[c][row].is_nan());
            if !has_value {
                continue;
            }
            weight_rows.push(row);
            weights.push(channel_weights.clone());
        }
    }
    if weight_rows.is_empty() {
        return FluxSeries::new();
    }

    // ----- Weight smoothing -----
    let weight_micros: Vec<i64> = weight_rows.iter().map(|&row| frame.micros[row]).collect();
    let point_weights = time_weights(&weight_micros, range);
    let weight_sum = rolling_sum(&weight_micros, &point_weights, WEIGHT_SMOOTHING_WINDOW);

    let mut smoothed: Vec<Vec<f64>> = vec![vec![0.0; column_count]; weight_rows.len()];
    for c in 0..column_count {
        // Transition factor: ramps a satellite's weight down to zero at
        // segment boundaries instead of cutting hard.
        let zero_weighted: Vec<f64> = weights
            .iter()
            .zip(&point_weights)
            .map(|(w, tw)| if w[c] == 0.0 { *tw } else { 0.0 })
            .collect();
        let zero_smoothed = rolling_sum(&weight_micros, &zero_weighted, WEIGHT_SMOOTHING_WINDOW);
        let column_weighted: Vec<f64> = weights
            .iter()
            .zip(&point_weights)
            .map(|(w, tw)| w[c] * tw)
            .collect();
        let column_smoothed =
            rolling_sum(&weight_micros, &column_weighted, WEIGHT_SMOOTHING_WINDOW);
        for r in 0..weight_rows.len() {
            let transition = if weights[r][c] == 0.0 {
                // Account for slight border inaccuracies.
                0.0
            } else {
                1.0 - clip(2.0 * zero_smoothed[r] / weight_sum[r], f64::NEG_INFINITY, 1.0)
            };
            smoothed[r][c] = column_smoothed[r] / weight_sum[r] * transition;
        }
    }

    // Drop rows whose weights are all zero.
    let kept: Vec<usize> = (0..weight_rows.len())
        .filter(|&r| smoothed[r].iter().any(|w| *w != 0.0 && !w.is_nan()))
        .collect();
    if kept.is_empty() {
        return FluxSeries::new();
    }

    // ----- Final combination -----
    // Time-interpolate each column onto the surviving index (filling the
    // edges) and take the weighted average.
    let kept_micros: Vec<i64> = kept.iter().map(|&r| weight_micros[r]).collect();
    let interpolated: Vec<Vec<f64>> = (0..column_count)
        .map(|c| {
            let mut column: Vec<f64> = kept
                .iter()
                .map(|&r| frame.columns[c][weight_rows[r]])
                .collect();
            interpolate_time(&kept_micros, &mut column);
            column
        })
        .collect();

    let mut combined = FluxSeries::with_capacity(kept.len());
    for (position, &r) in kept.iter().enumerate() {
        let mut numerator = 0.0;
        let mut denominator = 0.0;
        for c in 0..column_count {
            let product = interpolated[c][position] * smoothed[r][c];
            if !product.is_nan() {
                numerator += product;
                denominator += smoothed[r][c];
            }
        }
        let value = numerator / denominator;
        if value.is_nan() {
            continue;
        }
        combined.push(frame.times[weight_rows[r]], value as f32);
    }
    combined
}

/// Linear interpolation in time across NaN runs, with the edges filled from
/// the nearest valid value.
fn interpolate_time(micros: &[i64], values: &mut [f64]) {
    let n = values.len();
    let mut last_valid: Option<usize> = None;
    for i in 0..n {
        if !values[i].is_nan() {
            if let Some(previous) = last_valid {
                if i > previous + 1 {
                    let span = (micros[i] - micros[previous]) as f64;
                    for k in previous + 1..i {
                        let fraction = (micros[k] - micros[previous]) as f64 / span;
                        values[k] = values[previous] + (values[i] - values[previous]) * fraction;
                    }
                }
            } else {
                // Back-fill the leading edge.
                for k in 0..i {
                    values[k] = values[i];
                }
            }
            last_valid = Some(i);
        }
    }
    // Forward-fill the trailing edge.
    if let Some(previous) = last_valid {
        for k in previous + 1..n {
            values[k] = values[previous];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
    }

    fn series_every(step_secs: i64, count: usize, value: f32) -> FluxSeries {
        (0..count)
            .map(|i| (t0() + Duration::seconds(i as i64 * step_secs), value))
            .collect()
    }

    fn with_pair(
        channels: &mut BTreeMap<Channel, FluxSeries>,
        satellite: u16,
        band: Band,
        series: FluxSeries,
    ) {
        channels.insert(Channel::new(satellite, band, false), series.clone());
        channels.insert(Channel::new(satellite, band, true), series);
    }

    #[test]
    fn test_missing_clean_counterpart_errors() {
        let mut channels = BTreeMap::new();
        channels.insert(
            Channel::new(16, Band::Long, false),
            series_every(1, 60, 1e-6),
        );
        let range = TimeRange::new(t0(), t0() + Duration::minutes(1));
        assert!(matches!(
            combine_flux_channels(&channels, range),
            Err(CombineError::MissingClean(Band::Long))
        ));
    }

    #[test]
    fn test_sparse_satellite_below_cutoff_contributes_nothing() {
        let mut channels = BTreeMap::new();
        // A: 600 points over 10 minutes; B: 50 points, below the 25% cutoff.
        with_pair(&mut channels, 16, Band::Long, series_every(1, 600, 1e-6));
        with_pair(&mut channels, 18, Band::Long, series_every(12, 50, 4e-6));
        let range = TimeRange::new(t0(), t0() + Duration::seconds(600));

        let combined = combine_flux_channels(&channels, range).unwrap();
        let clean = &combined[&Channel::new(SATELLITE_COMBINED_ID, Band::Long, true)];
        assert_eq!(clean.len(), 600);
        // B's value never shows: the output equals A exactly.
        assert!(clean.iter().all(|(_, value)| value == 1e-6));
        // Both variants are produced.
        assert!(combined.contains_key(&Channel::new(SATELLITE_COMBINED_ID, Band::Long, false)));
    }

    #[test]
    fn test_combined_stays_within_contributor_bounds() {
        let mut channels = BTreeMap::new();
        with_pair(&mut channels, 16, Band::Short, series_every(1, 600, 1e-6));
        with_pair(&mut channels, 18, Band::Short, series_every(1, 600, 2e-6));
        let range = TimeRange::new(t0(), t0() + Duration::seconds(600));

        let combined = combine_flux_channels(&channels, range).unwrap();
        let clean = &combined[&Channel::new(SATELLITE_COMBINED_ID, Band::Short, true)];
        assert_eq!(clean.len(), 600);
        for (_, value) in clean.iter() {
            assert!((1e-6..=2e-6).contains(&value));
        }
    }

    #[test]
    fn test_gap_segment_excludes_absent_satellite() {
        let mut channels = BTreeMap::new();
        // A runs the full 30 minutes.
        with_pair(&mut channels, 16, Band::Long, series_every(1, 1800, 1e-6));
        // B misses the middle 10 minutes entirely.
        let b: FluxSeries = (0..1800)
            .filter(|i| *i < 600 || *i >= 1200)
            .map(|i| (t0() + Duration::seconds(i), 8e-6f32))
            .collect();
        with_pair(&mut channels, 18, Band::Long, b);
        let range = TimeRange::new(t0(), t0() + Duration::seconds(1800));

        let combined = combine_flux_channels(&channels, range).unwrap();
        let clean = &combined[&Channel::new(SATELLITE_COMBINED_ID, Band::Long, true)];
        // Deep inside the gap segment (more than the smoothing window away
        // from its boundaries) only A contributes.
        let probe = TimeRange::new(
            t0() + Duration::seconds(880),
            t0() + Duration::seconds(920),
        );
        let inside = clean.slice(&probe);
        assert!(!inside.is_empty());
        assert!(inside.iter().all(|(_, value)| value == 1e-6));
        // Outside the gap both contribute.
        let outside = clean.slice(&TimeRange::new(
            t0() + Duration::seconds(200),
            t0() + Duration::seconds(220),
        ));
        assert!(outside.iter().all(|(_, value)| value > 1e-6));
    }

    #[test]
    fn test_interpolation_midpoint() {
        let micros = vec![0, 1_000_000, 3_000_000];
        let mut values = vec![1.0, f64::NAN, 4.0];
        interpolate_time(&micros, &mut values);
        assert_eq!(values[1], 2.0);
    }

    #[test]
    fn test_interpolation_fills_edges() {
        let micros = vec![0, 1_000_000, 2_000_000];
        let mut values = vec![f64::NAN, 2.0, f64::NAN];
        interpolate_time(&micros, &mut values);
        assert_eq!(values, vec![2.0, 2.0, 2.0]);
    }
}
