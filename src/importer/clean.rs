//! Denoising and outlier removal for a single raw flux channel.
//!
//! The measurements span several orders of magnitude, so every filter works
//! on `log10(flux)`. The pipeline smooths sensor noise while preserving real
//! flares, then drops clipped stretches, acceleration spikes, groups with
//! unnatural velocities, impossible dips below the signal baseline, groups
//! that don't connect to their neighborhood, and points that are too sparse
//! to judge. Noisy input never errors: the result is simply emptier.

use std::collections::{HashSet, VecDeque};

use chrono::Duration;

use super::rolling::{
    change_speed, clip, nan_mean, nan_median, nan_min, nan_percentile, pairwise_min_next,
    pick_abs_max, rolling_count, rolling_max, rolling_mean, rolling_median,
    rolling_median_samples, rolling_min, rolling_quantile, rolling_sum,
};
use crate::model::FluxSeries;

/// Time range at start and end which will not be properly cleaned because
/// there was no bordering data to compare to.
pub fn clean_border() -> Duration {
    Duration::hours(9)
}

const MICROS_PER_SEC: i64 = 1_000_000;
const CLEAN_BORDER_MICROS: i64 = 9 * 3600 * MICROS_PER_SEC;

// Centered window sizes: how long the shortest flare would be, and the
// window used for smoothing noisy measurements.
const SUSTAINED_MOTION_WINDOW: i64 = 40 * MICROS_PER_SEC;
const SMOOTHING_WINDOW: i64 = 5 * 60 * MICROS_PER_SEC;

const UPPER_VALUE_BORDER: f64 = -3.0;
const LOWER_VALUE_BORDER: f64 = -8.0;
const VALUE_BORDER_SLACK: f64 = 0.1;

const CONNECTIVITY_SAMPLE_SECS: f64 = 60.0;

/// Denoises and removes outliers from the provided measured flux.
/// Tuned to work on the archive and live data.
///
/// Pure and deterministic; an empty, all-invalid or all-NaN input yields the
/// empty series, never an error.
pub fn clean_flux(flux: &FluxSeries) -> FluxSeries {
    if flux.is_empty() {
        return FluxSeries::new();
    }

    // Remove obviously incorrect values and duplicate timestamps.
    let mut times = Vec::with_capacity(flux.len());
    let mut micros = Vec::with_capacity(flux.len());
    let mut log = Vec::with_capacity(flux.len());
    for (time, value) in flux.iter() {
        if !(value > 0.0 && value < 1.0) {
            continue;
        }
        if times.last() == Some(&time) {
            continue;
        }
        times.push(time);
        micros.push(time.timestamp_micros());
        // Value range is exponential so find outliers in log space.
        log.push((value as f64).log10());
    }
    if log.is_empty() {
        return FluxSeries::new();
    }

    denoise(&micros, &mut log);
    let Some(kept) = remove_outliers(&micros, &log) else {
        return FluxSeries::new();
    };

    let mut result = FluxSeries::with_capacity(kept.len());
    for index in kept {
        let value = 10f64.powf(log[index]);
        if value.is_nan() {
            continue;
        }
        result.push(times[index], value as f32);
    }
    result
}

fn denoise(times: &[i64], log: &mut [f64]) {
    let n = log.len();

    // Smooth out possible noise while keeping any actual motion.
    let sustained = rolling_mean(times, log, SUSTAINED_MOTION_WINDOW);

    // Mask already smooth parts.
    let sustained_diff: Vec<f64> = (0..n).map(|i| (sustained[i] - log[i]).abs()).collect();
    let is_rough: Vec<f64> = sustained_diff
        .iter()
        .map(|d| if *d > 0.004 { 1.0 } else { 0.0 })
        .collect();
    let is_slightly_rough: Vec<f64> = sustained_diff
        .iter()
        .map(|d| if *d > 0.0035 { 1.0 } else { 0.0 })
        .collect();

    // Mark valid slopes to not smooth out solar flares: a real flare resides
    // for at least a few seconds, so the cumulative velocity doesn't drop as
    // much after smoothing as it does for zigzagging noise. Take the rolling
    // max as the big velocities sit at the flare's edges and the tops must
    // not be smoothed either.
    let log_speed: Vec<f64> = change_speed(times, log, false)
        .iter()
        .map(|v| v.abs())
        .collect();
    let rough_velocity_max = rolling_max(
        times,
        &rolling_sum(times, &log_speed, SUSTAINED_MOTION_WINDOW),
        SMOOTHING_WINDOW,
    );
    let sustained_speed: Vec<f64> = change_speed(times, &sustained, false)
        .iter()
        .map(|v| v.abs())
        .collect();
    let sustained_velocity_max = rolling_max(
        times,
        &rolling_sum(times, &sustained_speed, SUSTAINED_MOTION_WINDOW),
        SMOOTHING_WINDOW,
    );
    let is_valid_slope: Vec<f64> = (0..n)
        .map(|i| {
            if sustained_velocity_max[i] / rough_velocity_max[i] > 0.35 {
                1.0
            } else {
                0.0
            }
        })
        .collect();

    // If 20% nearby is rough, smooth also this point.
    let is_rough_nearby: Vec<f64> = rolling_mean(times, &is_rough, SMOOTHING_WINDOW)
        .iter()
        .map(|m| clip(m / 0.2, f64::NEG_INFINITY, 1.0))
        .collect();
    let is_slightly_rough_nearby: Vec<f64> =
        rolling_mean(times, &is_slightly_rough, SMOOTHING_WINDOW)
            .iter()
            .map(|m| clip(m / 0.2, f64::NEG_INFINITY, 1.0))
            .collect();
    // Strong smoothing where there is no valid slope, and it's rough nearby.
    let smooth_force: Vec<f64> = (0..n)
        .map(|i| nan_min(1.0 - is_valid_slope[i], is_rough_nearby[i]))
        .collect();
    // Small smoothing where it's slightly rough and not already strongly
    // smoothed.
    let detail_smooth_force: Vec<f64> = (0..n)
        .map(|i| clip(is_slightly_rough_nearby[i] - smooth_force[i], 0.0, f64::INFINITY))
        .collect();

    // Smooth out the forces themselves to not create hard edges.
    let smooth_force = rolling_mean(times, &smooth_force, SUSTAINED_MOTION_WINDOW);
    let detail_smooth_force = rolling_mean(times, &detail_smooth_force, SUSTAINED_MOTION_WINDOW);

    // Calculate smoothing corrections.
    let smooth = rolling_mean(times, log, SMOOTHING_WINDOW);
    let corrections: Vec<f64> = (0..n)
        .map(|i| {
            let detail = clip((sustained[i] - log[i]) * detail_smooth_force[i], -0.1, 0.1);
            (smooth[i] - log[i]) * smooth_force[i] + detail
        })
        .collect();

    // Clip corrections: excessive corrections only smooth out outlier spikes
    // making them harder to detect later.
    let max_correction = nan_percentile(&corrections, 99.0);
    let min_correction = nan_percentile(&corrections, 1.0);
    let upper = (max_correction + 0.1).min(0.8);
    let lower = (min_correction - 0.1).max(-0.8);
    for i in 0..n {
        log[i] += clip(corrections[i], lower, upper);
    }
}

fn remove_outliers(times: &[i64], log: &[f64]) -> Option<Vec<usize>> {
    let n = log.len();

    // Velocity and acceleration of the flux value, computed in both
    // directions: measurements are not evenly distributed, so an outlier
    // right after a gap would be missed by the forward pass alone because
    // the value jump is damped by the large time delta.
    let forward_velocity = change_speed(times, log, false);
    let forward_acceleration = change_speed(times, &forward_velocity, false);
    let backward_velocity = change_speed(times, log, true);
    let backward_acceleration = change_speed(times, &backward_velocity, true);
    let abs_velocity = pick_abs_max(&backward_velocity, &forward_velocity);
    let abs_acceleration = pick_abs_max(&backward_acceleration, &forward_acceleration);

    // Determine the data frequency. Not constant: sections fall back to
    // 1-minute averaged data.
    let mut time_delta = vec![60.0f64; n];
    for i in 1..n {
        time_delta[i] = (times[i] - times[i - 1]) as f64 / 1e6;
    }
    let is_after_huge_gap: Vec<bool> = time_delta.iter().map(|d| *d > 3600.0).collect();
    let clipped_delta: Vec<f64> = time_delta.iter().map(|d| d.clamp(1.0, 60.0)).collect();
    // Median over a sample-count window so lower intervals don't dominate;
    // half the window can be missing and it still respects the clean border.
    let median_window = (CLEAN_BORDER_MICROS / (60 * MICROS_PER_SEC)) as usize;
    let mut interval = vec![f64::NAN; n];
    let mut segment_start = 0usize;
    for i in 1..=n {
        // Split by big gaps to keep the window from reaching across them.
        if i == n || is_after_huge_gap[i] {
            let medians = rolling_median_samples(&clipped_delta[segment_start..i], median_window);
            interval[segment_start..i].copy_from_slice(&medians);
            segment_start = i;
        }
    }
    // Velocity and acceleration use both directions, so the last 1-minute
    // measurement is treated like the next measurement's interval.
    let interval = pairwise_min_next(&interval);
    let is_minute_averaged: Vec<bool> = interval.iter().map(|v| *v == 60.0).collect();
    let median_interval_secs = nan_median(&interval);
    let median_interval_micros = (median_interval_secs * 1e6) as i64;

    // Mark clipped values at the value borders.
    let log_max = rolling_max(times, log, 2 * CLEAN_BORDER_MICROS);
    let log_min = rolling_min(times, log, 2 * CLEAN_BORDER_MICROS);
    let velocity_median = rolling_median(times, &abs_velocity, median_interval_micros * 30);
    let mut is_clipped = vec![false; n];
    for i in 0..n {
        let near_upper =
            log[i] > log_max[i].max(UPPER_VALUE_BORDER) - VALUE_BORDER_SLACK;
        let near_lower =
            log[i] < log_min[i].min(LOWER_VALUE_BORDER) + VALUE_BORDER_SLACK;
        is_clipped[i] = (near_upper || near_lower) && velocity_median[i] < 1e-6;
    }
    let clipped_edge = bool_changed(&is_clipped);

    // Mark measurements with high acceleration.
    let mut has_high = vec![false; n];
    let mut has_excessive = vec![false; n];
    for i in 0..n {
        let (high, excessive) = if is_minute_averaged[i] {
            (0.0002, 0.0007)
        } else {
            (0.01, 0.04)
        };
        has_high[i] = abs_acceleration[i] > high;
        has_excessive[i] = abs_acceleration[i] > excessive;
    }
    // Bridge small gaps in high acceleration regions.
    let high_numeric: Vec<f64> = has_high.iter().map(|h| *h as u8 as f64).collect();
    let bridged = rolling_sum(times, &high_numeric, median_interval_micros * 5);
    for i in 0..n {
        has_high[i] |= bridged[i] >= 2.0;
    }
    let high_acceleration_edge = bool_changed(&has_high);

    // Mark measurements after a large time gap.
    let is_after_gap: Vec<bool> = (0..n)
        .map(|i| time_delta[i] > interval[i] * 10.0)
        .collect();

    // Remove marked outliers and split into groups at the marked edges.
    // Groups bigger than the clean border would give the group filters a
    // bigger dependency range than allowed, but such groups are typically
    // already clean and won't be filtered, so this can be ignored.
    let mut group_ids = vec![0usize; n];
    let mut next_id = 0usize;
    for i in 0..n {
        if clipped_edge[i] || high_acceleration_edge[i] || is_after_gap[i] {
            next_id += 1;
        }
        group_ids[i] = next_id;
    }
    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut current_id: Option<usize> = None;
    for i in 0..n {
        if is_clipped[i] || has_excessive[i] {
            continue;
        }
        if current_id != Some(group_ids[i]) {
            if !current.is_empty() {
                groups.push(std::mem::take(&mut current));
            }
            current_id = Some(group_ids[i]);
        }
        current.push(i);
    }
    if !current.is_empty() {
        groups.push(current);
    }

    // Filter groups with unnatural velocities.
    groups.retain(|group| {
        // If possible omit the first velocity, as it isn't part of the group.
        let members: &[usize] = if group.len() > 1 { &group[1..] } else { group };
        let velocities: Vec<f64> = members.iter().map(|&i| abs_velocity[i]).collect();
        // Extremely high sustained velocity is probably an outlier; nearly no
        // velocity is probably an artifact or at the value border.
        !(nan_mean(&velocities) > 0.01 || nan_median(&velocities) < 1e-6)
    });
    if groups.is_empty() {
        return None;
    }

    let groups = filter_impossible_dips(times, log, groups);
    if groups.is_empty() {
        return None;
    }
    let groups = filter_by_connectivity(times, log, groups, median_interval_secs);
    if groups.is_empty() {
        return None;
    }

    // Remove measurements without enough neighbors to determine their
    // correctness; often small groups with questionable measurements.
    let selected: Vec<usize> = groups.concat();
    let selected_times: Vec<i64> = selected.iter().map(|&i| times[i]).collect();
    let selected_values: Vec<f64> = selected.iter().map(|&i| log[i]).collect();
    let neighbors = rolling_count(&selected_times, &selected_values, 2 * CLEAN_BORDER_MICROS);
    let window_secs = (2 * CLEAN_BORDER_MICROS) as f64 / 1e6;
    let kept: Vec<usize> = selected
        .iter()
        .enumerate()
        .filter(|(position, &index)| {
            let expected = window_secs / interval[index];
            neighbors[*position] >= expected * 0.02
        })
        .map(|(_, &index)| index)
        .collect();
    Some(kept)
}

/// Marks the edges where the boolean series changes (the first element never
/// counts as an edge).
fn bool_changed(values: &[bool]) -> Vec<bool> {
    (0..values.len())
        .map(|i| i > 0 && values[i] != values[i - 1])
        .collect()
}

/// The flux only ever spikes up with solar flares, so any sharp dip below
/// the signal baseline is impossible and gets removed.
fn filter_impossible_dips(
    times: &[i64],
    log: &[f64],
    groups: Vec<Vec<usize>>,
) -> Vec<Vec<usize>> {
    let selected: Vec<usize> = groups.concat();
    let t: Vec<i64> = selected.iter().map(|&i| times[i]).collect();
    let v: Vec<f64> = selected.iter().map(|&i| log[i]).collect();

    let half_hour = 30 * 60 * MICROS_PER_SEC;
    let narrow_min = rolling_min(&t, &v, half_hour);
    let wide_min = rolling_min(&t, &narrow_min, half_hour);
    // The "bottom" of the signal without the dips. The windows are centered,
    // halving their reach, which keeps them inside the clean border.
    let narrow_base = rolling_quantile(&t, &narrow_min, 4 * 3600 * MICROS_PER_SEC, 0.3);
    let wide_base = rolling_quantile(&t, &wide_min, 16 * 3600 * MICROS_PER_SEC, 0.3);
    let base: Vec<f64> = narrow_base
        .iter()
        .zip(&wide_base)
        .map(|(a, b)| nan_min(*a, *b))
        .collect();

    let mut filtered = Vec::with_capacity(groups.len());
    let mut offset = 0usize;
    for group in groups {
        let flat: Vec<f64> = (0..group.len()).map(|k| v[offset + k] - base[offset + k]).collect();
        let flat_min = flat.iter().copied().fold(f64::NAN, nan_min);
        let group_len = group.len();
        if flat_min < -0.2 {
            // Only cut the dip parts in case the group also has valid parts.
            let kept: Vec<usize> = group
                .into_iter()
                .enumerate()
                .filter(|(k, _)| flat[*k] > -0.05)
                .map(|(_, index)| index)
                .collect();
            // If the group was only the dip, drop it.
            if kept.len() >= 10 {
                filtered.push(kept);
            }
        } else {
            filtered.push(group);
        }
        offset += group_len;
    }
    filtered
}

/// An uncertainty section: groups inside it are judged against a linear
/// interpolation between the neighboring certain regions.
#[derive(Debug, Clone, Copy)]
struct UncertainSection {
    start: i64,
    end: i64,
    reference: (f64, f64),
}

impl UncertainSection {
    fn slope(&self) -> f64 {
        (self.reference.1 - self.reference.0) / ((self.end - self.start) as f64 / 1e6)
    }

    fn interpolate(&self, time: i64) -> f64 {
        self.reference.0 + self.slope() * ((time - self.start) as f64 / 1e6)
    }

    /// Resizes the section, recalculating the references.
    fn resize(&self, start: i64, end: i64) -> Self {
        Self {
            start,
            end,
            reference: (self.interpolate(start), self.interpolate(end)),
        }
    }

    fn is_before(&self, group_last: i64) -> bool {
        self.end < group_last
    }

    fn includes(&self, group_first: i64, group_last: i64) -> bool {
        self.start <= group_first && group_last <= self.end
    }

    fn is_outlier(&self, time: i64, value: f64) -> bool {
        (value - self.interpolate(time)).abs() > 0.2
    }
}

/// A section of low confidence found by one directional pass:
/// `reference` is the sample median at the section's certain end.
#[derive(Debug, Clone, Copy)]
struct RawSection {
    start: i64,
    end: i64,
    reference: f64,
}

/// Filter outliers by checking connectivity: whether the ends and starts of
/// neighboring groups match up into a smooth transition.
fn filter_by_connectivity(
    times: &[i64],
    log: &[f64],
    groups: Vec<Vec<usize>>,
    median_interval_secs: f64,
) -> Vec<Vec<usize>> {
    if groups.len() <= 1 {
        // Checking connectivity on a single group doesn't make sense.
        return groups;
    }
    // Number of measurements targeted for calculating a reference.
    let target_sample_count = (CONNECTIVITY_SAMPLE_SECS / median_interval_secs).ceil() as usize;
    let target_sample_count = target_sample_count.max(1);

    let (forward_outliers, forward_sections) =
        check_group_connectivity(times, log, &groups, target_sample_count, true);
    let (backward_outliers, backward_sections) =
        check_group_connectivity(times, log, &groups, target_sample_count, false);

    // Intersect the uncertain sections of both directions. Forward provides
    // the start reference, backward the end reference.
    let mut forward_sections = forward_sections;
    let mut backward_sections = backward_sections;
    let mut uncertain: VecDeque<UncertainSection> = VecDeque::new();
    while let (Some(forward), Some(backward)) =
        (forward_sections.front().copied(), backward_sections.front().copied())
    {
        if forward.start < backward.end && backward.start < forward.end {
            let section = UncertainSection {
                start: forward.start,
                end: backward.end,
                reference: (forward.reference, backward.reference),
            }
            .resize(
                forward.start.max(backward.start),
                forward.end.min(backward.end),
            );
            uncertain.push_back(section);
        }
        // Drop the section that ends first to move forward.
        if forward.end < backward.end {
            forward_sections.pop_front();
        } else {
            backward_sections.pop_front();
        }
    }

    // Filter out the outliers.
    let mut filtered = Vec::with_capacity(groups.len());
    let mut sections = uncertain.into_iter();
    let mut section = sections.next();
    for (position, group) in groups.into_iter().enumerate() {
        // Rejected only when both directions agree.
        if forward_outliers.contains(&position) && backward_outliers.contains(&position) {
            continue;
        }

        let first = times[group[0]];
        let last = times[group[group.len() - 1]];
        while let Some(current) = section {
            if current.is_before(last) {
                section = sections.next();
            } else {
                break;
            }
        }
        if let Some(current) = section {
            if current.includes(first, last) {
                let (min_index, max_index) = arg_min_max(log, &group);
                if current.is_outlier(times[min_index], log[min_index])
                    || current.is_outlier(times[max_index], log[max_index])
                {
                    continue;
                }
            }
        }
        filtered.push(group);
    }
    filtered
}

fn arg_min_max(log: &[f64], group: &[usize]) -> (usize, usize) {
    let mut min_index = group[0];
    let mut max_index = group[0];
    for &index in group {
        if log[index] < log[min_index] || log[min_index].is_nan() {
            min_index = index;
        }
        if log[index] > log[max_index] || log[max_index].is_nan() {
            max_index = index;
        }
    }
    (min_index, max_index)
}

/// One directional connectivity pass.
///
/// Maintains a rolling sample of roughly one minute of recently accepted
/// points. A group whose joining value deviates more than the allowed cone
/// (growing with sample spread and age, shrinking with sample sparsity) is
/// an outlier in this direction. Stretches where the allowed deviation
/// exceeds 2 open an uncertainty section, closed when a large group rejoins
/// or the sample has advanced past the gap. The first group is always
/// uncertain because it lacks a previous reference.
fn check_group_connectivity(
    times: &[i64],
    log: &[f64],
    groups: &[Vec<usize>],
    target_sample_count: usize,
    is_forward: bool,
) -> (HashSet<usize>, VecDeque<RawSection>) {
    let mut outliers = HashSet::new();
    let mut sections: VecDeque<RawSection> = VecDeque::new();
    if groups.is_empty() {
        return (outliers, sections);
    }

    // Cuts the old part of the sample once it's too big: at most
    // `target_sample_count` points, all within the clean border of the
    // sample's recent end.
    let limit_sample = |sample: Vec<(i64, f64)>| -> Vec<(i64, f64)> {
        if sample.is_empty() {
            return sample;
        }
        if is_forward {
            let from = sample.len().saturating_sub(target_sample_count);
            let tail = &sample[from..];
            let cutoff = tail[tail.len() - 1].0 - CLEAN_BORDER_MICROS;
            tail.iter().copied().filter(|(t, _)| *t >= cutoff).collect()
        } else {
            let to = target_sample_count.min(sample.len());
            let head = &sample[..to];
            let cutoff = head[0].0 + CLEAN_BORDER_MICROS;
            head.iter().copied().filter(|(t, _)| *t <= cutoff).collect()
        }
    };
    let sample_median = |sample: &[(i64, f64)]| {
        let values: Vec<f64> = sample.iter().map(|(_, v)| *v).collect();
        nan_median(&values)
    };
    let group_points = |position: usize| -> Vec<(i64, f64)> {
        groups[position].iter().map(|&i| (times[i], log[i])).collect()
    };

    let order: Vec<usize> = if is_forward {
        (0..groups.len()).collect()
    } else {
        (0..groups.len()).rev().collect()
    };
    let mut positions = order.into_iter();
    let Some(first) = positions.next() else {
        return (outliers, sections);
    };
    let mut sample = limit_sample(group_points(first));
    // Start of the open uncertainty section (in iteration direction).
    // The first group is always uncertain: it lacks a previous reference.
    let mut section_start: Option<i64> = Some(if is_forward {
        sample[0].0
    } else {
        sample[sample.len() - 1].0
    });
    let mut section_reference: Option<f64> = Some(sample_median(&sample));
    let mut last_position = first;

    for position in positions {
        last_position = position;
        let group = &groups[position];
        let median = sample_median(&sample);
        let sample_range =
            (sample[sample.len() - 1].0 - sample[0].0) as f64 / 1e6;
        let sample_age = if is_forward {
            (times[group[0]] - sample[sample.len() - 1].0) as f64 / 1e6
        } else {
            (sample[0].0 - times[group[group.len() - 1]]) as f64 / 1e6
        };

        // Delta to the sampled reference against a cone-shaped allowance:
        // wider for older and more spread-out samples, narrower when the
        // sample holds fewer measurements than targeted.
        let join_value = if is_forward {
            log[group[0]]
        } else {
            log[group[group.len() - 1]]
        };
        let delta = join_value - median;
        let allowed_delta = (0.001 * sample_range + 0.03 * sample_age)
            / (sample.len() as f64 / target_sample_count as f64).sqrt();
        if allowed_delta < delta.abs() {
            outliers.insert(position);
            // Do not use outliers as reference.
            continue;
        }

        // Maybe start an uncertainty section.
        let mut just_opened = false;
        if section_start.is_none() && allowed_delta > 2.0 {
            // Pick the farthest end of the sample as start, as the borders
            // of gaps tend to also be outliers.
            section_start = Some(if is_forward {
                sample[0].0
            } else {
                sample[sample.len() - 1].0
            });
            section_reference = Some(median);
            just_opened = true;
        }
        // Maybe close it.
        if let Some(start) = section_start {
            let mut section_end: Option<i64> = None;
            if group.len() > target_sample_count * 5 {
                // Group is big enough to end the gap; assumed to be no
                // outlier, so use the closest point.
                section_end = Some(if is_forward {
                    times[group[0]]
                } else {
                    times[group[group.len() - 1]]
                });
            } else if !just_opened && sample_range < CONNECTIVITY_SAMPLE_SECS * 1.5 {
                // The sample has passed the gap. The used groups might be
                // outliers, so use the farthest point.
                section_end = Some(if is_forward {
                    sample[sample.len() - 1].0
                } else {
                    sample[0].0
                });
            }
            if let Some(end) = section_end {
                let closes_validly = if is_forward { start < end } else { end < start };
                if closes_validly {
                    let reference = section_reference.unwrap_or(f64::NAN);
                    if is_forward {
                        sections.push_back(RawSection {
                            start,
                            end,
                            reference,
                        });
                    } else {
                        sections.push_front(RawSection {
                            start: end,
                            end: start,
                            reference,
                        });
                    }
                    section_start = None;
                    section_reference = None;
                }
            }
        }

        // Update the sample with the accepted group.
        if is_forward {
            sample.extend(group_points(position));
        } else {
            let mut joined = group_points(position);
            joined.extend(sample);
            sample = joined;
        }
        sample = limit_sample(sample);
    }

    // Close the last uncertainty section.
    if let Some(start) = section_start {
        let reference = section_reference.unwrap_or(f64::NAN);
        let last_group = &groups[last_position];
        if is_forward {
            sections.push_back(RawSection {
                start,
                end: times[last_group[last_group.len() - 1]],
                reference,
            });
        } else {
            sections.push_front(RawSection {
                start: times[last_group[0]],
                end: start,
                reference,
            });
        }
    }

    (outliers, merge_sections(sections, is_forward))
}

/// Merges overlapping sections, keeping the reference of the section whose
/// certain end reaches furthest in the pass direction.
fn merge_sections(sections: VecDeque<RawSection>, is_forward: bool) -> VecDeque<RawSection> {
    let mut iterator = sections.into_iter();
    let Some(mut open) = iterator.next() else {
        return VecDeque::new();
    };
    let mut merged = VecDeque::new();
    for section in iterator {
        if open.end < section.start {
            merged.push_back(open);
            open = section;
            continue;
        }
        let reference = if is_forward {
            if open.start < section.start {
                open.reference
            } else {
                section.reference
            }
        } else if section.end < open.end {
            open.reference
        } else {
            section.reference
        };
        open = RawSection {
            start: open.start.min(section.start),
            end: open.end.max(section.end),
            reference,
        };
    }
    merged.push_back(open);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
    }

    /// A gently varying signal: log10 flux around -6 with a 0.3 amplitude
    /// hour-long oscillation, sampled every second.
    fn smooth_series(points: usize) -> FluxSeries {
        let mut series = FluxSeries::with_capacity(points);
        for i in 0..points {
            let phase = i as f64 * 2.0 * std::f64::consts::PI / 3600.0;
            let log = -6.0 + 0.3 * phase.sin();
            series.push(t0() + Duration::seconds(i as i64), 10f64.powf(log) as f32);
        }
        series
    }

    #[test]
    fn test_empty_input_yields_empty_output() {
        assert!(clean_flux(&FluxSeries::new()).is_empty());
    }

    #[test]
    fn test_all_invalid_input_yields_empty_output() {
        let mut series = FluxSeries::new();
        series.push(t0(), 0.0);
        series.push(t0() + Duration::seconds(1), -2.0);
        series.push(t0() + Duration::seconds(2), 1.5);
        series.push(t0() + Duration::seconds(3), f32::NAN);
        assert!(clean_flux(&series).is_empty());
    }

    #[test]
    fn test_sanity_filter_scenario() {
        // Out-of-range values and a duplicate timestamp: the two surviving
        // points form a zero-velocity group that gets dropped entirely.
        let mut series = FluxSeries::new();
        series.push(t0(), 0.0);
        series.push(t0() + Duration::seconds(1), 5e-7);
        series.push(t0() + Duration::seconds(2), 1.2);
        series.push(t0() + Duration::seconds(3), 5e-7);
        series.push(t0() + Duration::seconds(3), 6e-7);
        assert!(clean_flux(&series).is_empty());
    }

    #[test]
    fn test_constant_series_is_dropped_as_artifact() {
        let series: FluxSeries = (0..600)
            .map(|i| (t0() + Duration::seconds(i), 1e-6f32))
            .collect();
        assert!(clean_flux(&series).is_empty());
    }

    #[test]
    fn test_smooth_signal_passes_through() {
        let series = smooth_series(7200);
        let cleaned = clean_flux(&series);
        assert_eq!(cleaned.len(), series.len());
        for ((_, raw), (_, clean)) in series.iter().zip(cleaned.iter()) {
            let difference = ((raw as f64).log10() - (clean as f64).log10()).abs();
            assert!(difference < 0.01, "deviation {difference} too large");
        }
    }

    #[test]
    fn test_cleaning_is_idempotent() {
        let cleaned = clean_flux(&smooth_series(7200));
        let recleaned = clean_flux(&cleaned);
        assert_eq!(cleaned.len(), recleaned.len());
        for ((_, a), (_, b)) in cleaned.iter().zip(recleaned.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_spike_outlier_is_removed() {
        let mut points: Vec<_> = smooth_series(7200).iter().collect();
        // Two decades up for a single second is impossibly fast.
        let spike_value = 10f64.powf(-4.0) as f32;
        points[3600].1 = spike_value;
        let series: FluxSeries = points.into_iter().collect();
        let cleaned = clean_flux(&series);
        assert!(!cleaned.is_empty());
        assert!(cleaned.iter().all(|(_, value)| value < 1e-5));
        // The removal is local: almost everything else survives.
        assert!(cleaned.len() > series.len() * 9 / 10);
    }

    #[test]
    fn test_output_never_contains_nan() {
        let mut series = smooth_series(600);
        series.push(t0() + Duration::seconds(4000), 0.5);
        let cleaned = clean_flux(&series);
        assert!(cleaned.iter().all(|(_, value)| !value.is_nan()));
    }
}
