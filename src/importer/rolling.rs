//! Windowed statistics over irregularly sampled timeseries.
//!
//! All kernels take parallel `times` (epoch microseconds, ascending) and
//! `values` slices and evaluate a centered window `[t - w/2, t + w/2]`
//! around every point. NaN values are transparent: they never enter a
//! window, and a window without any valid value yields NaN (count excepted).

use std::collections::VecDeque;

/// Running sum and count of the valid values per centered window.
fn rolling_sum_count(times: &[i64], values: &[f64], window: i64) -> (Vec<f64>, Vec<usize>) {
    let n = times.len();
    let half = window / 2;
    let mut sums = vec![f64::NAN; n];
    let mut counts = vec![0usize; n];
    let mut sum = 0.0;
    let mut count = 0usize;
    let mut lo = 0usize;
    let mut hi = 0usize;
    for i in 0..n {
        let start = times[i] - half;
        let end = times[i] + half;
        while hi < n && times[hi] <= end {
            if !values[hi].is_nan() {
                sum += values[hi];
                count += 1;
            }
            hi += 1;
        }
        while lo < hi && times[lo] < start {
            if !values[lo].is_nan() {
                sum -= values[lo];
                count -= 1;
            }
            lo += 1;
        }
        if count > 0 {
            sums[i] = sum;
        }
        counts[i] = count;
    }
    (sums, counts)
}

/// Mean of the valid values in the centered window.
pub fn rolling_mean(times: &[i64], values: &[f64], window: i64) -> Vec<f64> {
    let (sums, counts) = rolling_sum_count(times, values, window);
    sums.into_iter()
        .zip(counts)
        .map(|(sum, count)| sum / count as f64)
        .collect()
}

/// Sum of the valid values in the centered window.
pub fn rolling_sum(times: &[i64], values: &[f64], window: i64) -> Vec<f64> {
    rolling_sum_count(times, values, window).0
}

/// Number of valid values in the centered window.
pub fn rolling_count(times: &[i64], values: &[f64], window: i64) -> Vec<f64> {
    rolling_sum_count(times, values, window)
        .1
        .into_iter()
        .map(|count| count as f64)
        .collect()
}

/// Minimum of the valid values in the centered window.
pub fn rolling_min(times: &[i64], values: &[f64], window: i64) -> Vec<f64> {
    rolling_extreme(times, values, window, |new, old| new <= old)
}

/// Maximum of the valid values in the centered window.
pub fn rolling_max(times: &[i64], values: &[f64], window: i64) -> Vec<f64> {
    rolling_extreme(times, values, window, |new, old| new >= old)
}

/// Median of the valid values in the centered window.
pub fn rolling_median(times: &[i64], values: &[f64], window: i64) -> Vec<f64> {
    rolling_quantile(times, values, window, 0.5)
}

/// Linearly interpolated quantile of the valid values in the centered
/// window, maintained in a sorted insertion buffer.
pub fn rolling_quantile(times: &[i64], values: &[f64], window: i64, q: f64) -> Vec<f64> {
    let n = times.len();
    let half = window / 2;
    let mut out = vec![f64::NAN; n];
    let mut sorted: Vec<f64> = Vec::new();
    let mut lo = 0usize;
    let mut hi = 0usize;
    for i in 0..n {
        let start = times[i] - half;
        let end = times[i] + half;
        while hi < n && times[hi] <= end {
            let value = values[hi];
            if !value.is_nan() {
                let at = sorted.partition_point(|x| *x < value);
                sorted.insert(at, value);
            }
            hi += 1;
        }
        while lo < hi && times[lo] < start {
            let value = values[lo];
            if !value.is_nan() {
                let at = sorted.partition_point(|x| *x < value);
                sorted.remove(at);
            }
            lo += 1;
        }
        out[i] = quantile_sorted(&sorted, q);
    }
    out
}

/// Median over a centered sample-count window (irrespective of time).
pub fn rolling_median_samples(values: &[f64], window: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    let mut sorted: Vec<f64> = Vec::new();
    // Window [i - (w-1)/2, i + w/2], clamped to the slice.
    let before = (window - 1) / 2;
    let after = window / 2;
    let mut lo = 0usize;
    let mut hi = 0usize;
    for i in 0..n {
        let start = i.saturating_sub(before);
        let end = (i + after).min(n - 1);
        while hi <= end {
            let value = values[hi];
            if !value.is_nan() {
                let at = sorted.partition_point(|x| *x < value);
                sorted.insert(at, value);
            }
            hi += 1;
        }
        while lo < start {
            let value = values[lo];
            if !value.is_nan() {
                let at = sorted.partition_point(|x| *x < value);
                sorted.remove(at);
            }
            lo += 1;
        }
        out[i] = quantile_sorted(&sorted, 0.5);
    }
    out
}

/// `series.diff() / index.diff().total_seconds()` for a timeseries: the
/// difference to the previous (or, `backward`, the next) value divided by
/// the seconds elapsed. The edge without a neighbor is NaN.
pub fn change_speed(times: &[i64], values: &[f64], backward: bool) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    for i in 0..n {
        let j = if backward {
            if i + 1 >= n {
                continue;
            }
            i + 1
        } else {
            if i == 0 {
                continue;
            }
            i - 1
        };
        let elapsed = (times[i] - times[j]) as f64 / 1_000_000.0;
        out[i] = (values[i] - values[j]) / elapsed;
    }
    out
}

/// Element-wise `min(v[i], v[i+1])`; the last element keeps its own value.
pub fn pairwise_min_next(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    (0..n)
        .map(|i| {
            if i + 1 < n {
                nan_min(values[i], values[i + 1])
            } else {
                values[i]
            }
        })
        .collect()
}

/// Element-wise maximum of the absolute values, NaN-transparent.
pub fn pick_abs_max(a: &[f64], b: &[f64]) -> Vec<f64> {
    a.iter()
        .zip(b)
        .map(|(x, y)| nan_max(x.abs(), y.abs()))
        .collect()
}

/// NaN-preserving clamp (`f64::min`/`max` would swallow the NaN; here it
/// stays missing).
pub fn clip(value: f64, low: f64, high: f64) -> f64 {
    if value.is_nan() {
        return value;
    }
    value.clamp(low, high)
}

pub fn nan_min(a: f64, b: f64) -> f64 {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => f64::NAN,
        (true, false) => b,
        (false, true) => a,
        (false, false) => a.min(b),
    }
}

pub fn nan_max(a: f64, b: f64) -> f64 {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => f64::NAN,
        (true, false) => b,
        (false, true) => a,
        (false, false) => a.max(b),
    }
}

/// Mean over the valid values of a slice.
pub fn nan_mean(values: &[f64]) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for &value in values {
        if !value.is_nan() {
            sum += value;
            count += 1;
        }
    }
    if count == 0 {
        f64::NAN
    } else {
        sum / count as f64
    }
}

/// Linearly interpolated percentile (0..=100) over the valid values.
pub fn nan_percentile(values: &[f64], percentile: f64) -> f64 {
    nan_quantile(values, percentile / 100.0)
}

/// Linearly interpolated quantile (0..=1) over the valid values.
pub fn nan_quantile(values: &[f64], q: f64) -> f64 {
    let mut valid: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    valid.sort_by(f64::total_cmp);
    quantile_sorted(&valid, q)
}

pub fn nan_median(values: &[f64]) -> f64 {
    nan_quantile(values, 0.5)
}

fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let position = q * (sorted.len() - 1) as f64;
    let low = position.floor() as usize;
    let high = position.ceil() as usize;
    if low == high {
        sorted[low]
    } else {
        sorted[low] + (sorted[high] - sorted[low]) * (position - low as f64)
    }
}

/// Min/max via a monotonic index deque; `dominates(new, old)` decides which
/// extreme survives.
fn rolling_extreme(
    times: &[i64],
    values: &[f64],
    window: i64,
    dominates: impl Fn(f64, f64) -> bool,
) -> Vec<f64> {
    let n = times.len();
    let half = window / 2;
    let mut out = vec![f64::NAN; n];
    let mut deque: VecDeque<usize> = VecDeque::new();
    let mut hi = 0usize;
    for i in 0..n {
        let start = times[i] - half;
        let end = times[i] + half;
        while hi < n && times[hi] <= end {
            if !values[hi].is_nan() {
                while let Some(&back) = deque.back() {
                    if dominates(values[hi], values[back]) {
                        deque.pop_back();
                    } else {
                        break;
                    }
                }
                deque.push_back(hi);
            }
            hi += 1;
        }
        while let Some(&front) = deque.front() {
            if times[front] < start {
                deque.pop_front();
            } else {
                break;
            }
        }
        out[i] = deque.front().map_or(f64::NAN, |&front| values[front]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const S: i64 = 1_000_000;

    fn seconds(count: usize) -> Vec<i64> {
        (0..count as i64).map(|i| i * S).collect()
    }

    #[test]
    fn test_rolling_mean_centered() {
        let times = seconds(5);
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        // 2s window covers one neighbor on each side.
        let means = rolling_mean(&times, &values, 2 * S);
        assert_eq!(means[0], 1.5);
        assert_eq!(means[2], 3.0);
        assert_eq!(means[4], 4.5);
    }

    #[test]
    fn test_rolling_mean_skips_nan() {
        let times = seconds(3);
        let values = [1.0, f64::NAN, 3.0];
        let means = rolling_mean(&times, &values, 10 * S);
        assert_eq!(means[1], 2.0);
    }

    #[test]
    fn test_rolling_sum_all_nan_window_is_nan() {
        let times = seconds(2);
        let values = [f64::NAN, f64::NAN];
        let sums = rolling_sum(&times, &values, 10 * S);
        assert!(sums[0].is_nan());
    }

    #[test]
    fn test_rolling_count_is_zero_for_nan() {
        let times = seconds(3);
        let values = [1.0, f64::NAN, 3.0];
        let counts = rolling_count(&times, &values, 10 * S);
        assert_eq!(counts, vec![2.0, 2.0, 2.0]);
    }

    #[test]
    fn test_rolling_min_max() {
        let times = seconds(5);
        let values = [3.0, 1.0, 4.0, 1.5, 5.0];
        let minimums = rolling_min(&times, &values, 2 * S);
        let maximums = rolling_max(&times, &values, 2 * S);
        assert_eq!(minimums[2], 1.0);
        assert_eq!(maximums[2], 4.0);
        assert_eq!(maximums[3], 5.0);
    }

    #[test]
    fn test_rolling_median_interpolates() {
        let times = seconds(4);
        let values = [1.0, 2.0, 3.0, 10.0];
        let medians = rolling_median(&times, &values, 100 * S);
        assert_eq!(medians[0], 2.5);
    }

    #[test]
    fn test_rolling_quantile_against_naive() {
        let times = seconds(6);
        let values = [0.5, 0.1, 0.9, 0.3, 0.7, 0.2];
        let rolled = rolling_quantile(&times, &values, 4 * S, 0.3);
        // Window of point 2 covers indices 0..=4.
        assert!((rolled[2] - nan_quantile(&values[0..5], 0.3)).abs() < 1e-12);
    }

    #[test]
    fn test_rolling_median_samples_window_placement() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        let medians = rolling_median_samples(&values, 3);
        assert_eq!(medians[0], 1.5); // only [1, 2] in reach
        assert_eq!(medians[2], 3.0);
        assert_eq!(medians[4], 4.5);
    }

    #[test]
    fn test_change_speed_directions() {
        let times = vec![0, 2 * S, 3 * S];
        let values = [1.0, 5.0, 4.0];
        let forward = change_speed(&times, &values, false);
        assert!(forward[0].is_nan());
        assert_eq!(forward[1], 2.0);
        assert_eq!(forward[2], -1.0);
        let backward = change_speed(&times, &values, true);
        assert_eq!(backward[0], 2.0);
        assert_eq!(backward[1], -1.0);
        assert!(backward[2].is_nan());
    }

    #[test]
    fn test_pairwise_min_next() {
        let values = [3.0, 1.0, 2.0];
        assert_eq!(pairwise_min_next(&values), vec![1.0, 1.0, 2.0]);
    }

    #[test]
    fn test_clip_preserves_nan() {
        assert!(clip(f64::NAN, 0.0, 1.0).is_nan());
        assert_eq!(clip(2.0, 0.0, 1.0), 1.0);
    }

    #[test]
    fn test_nan_percentile() {
        let values = [1.0, f64::NAN, 3.0, 2.0];
        assert_eq!(nan_percentile(&values, 50.0), 2.0);
        assert_eq!(nan_percentile(&values, 100.0), 3.0);
    }
}
