//! Load benchmark: simulates panning viewers against a running instance and
//! reports latency and error counts.

use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use futures_util::future::join_all;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::Deserialize;
use tracing::{info, warn};

const READY_TRIES: usize = 10;
const PANS_PER_VIEWER: usize = 10;
const STEPS_PER_PAN: usize = 30;

#[derive(Debug, Deserialize)]
struct Status {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

async fn fetch_flux_range(
    client: &reqwest::Client,
    base_url: &str,
) -> anyhow::Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
    let status: Status = client
        .get(format!("{base_url}/status"))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    Ok(status.start.zip(status.end))
}

/// Polls `/status` until the target knows its data range.
async fn fetch_flux_range_definitive(
    client: &reqwest::Client,
    base_url: &str,
) -> anyhow::Result<(DateTime<Utc>, DateTime<Utc>)> {
    for _ in 0..READY_TRIES {
        if let Some(range) = fetch_flux_range(client, base_url).await? {
            return Ok(range);
        }
        warn!("Benchmark target is initializing or has no data. Retrying in 5s");
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
    }
    anyhow::bail!("benchmark target did not become ready");
}

async fn measure_request(
    client: &reqwest::Client,
    base_url: &str,
    resolution: u32,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> anyhow::Result<Duration> {
    let begun = Instant::now();
    let response = client
        .get(format!("{base_url}/flux"))
        .query(&[
            ("resolution", resolution.to_string()),
            ("start", start.to_rfc3339()),
            ("end", end.to_rfc3339()),
        ])
        .send()
        .await?;
    response.error_for_status()?;
    Ok(Duration::from_std(begun.elapsed()).unwrap_or_default())
}

/// One viewer panning through the data: a pan walks `STEPS_PER_PAN` views
/// forward, firing a request every 200 ms without waiting for the replies.
async fn simulate_viewer(
    client: reqwest::Client,
    base_url: String,
    resolution: u32,
    flux_range: (DateTime<Utc>, DateTime<Utc>),
    seed: u64,
) -> (Duration, usize) {
    let mut rng = StdRng::seed_from_u64(seed);
    let range_size = flux_range.1 - flux_range.0;

    let mut latencies = Vec::new();
    let mut errors = 0usize;
    for _ in 0..PANS_PER_VIEWER {
        let pan_start = flux_range.0 + mul_duration(range_size, rng.random::<f64>());
        // Log-normal view sizes: mostly small windows, occasionally wide.
        let normal: f64 = rng.sample(StandardNormal);
        let view_size = mul_duration(range_size, (normal.exp() / 40.0).min(1.5));
        let step_size = mul_duration(view_size, 0.6);

        let mut requests = Vec::with_capacity(STEPS_PER_PAN);
        let mut view_start = pan_start;
        for step in 0..STEPS_PER_PAN {
            let view_end = view_start + step_size;
            requests.push(measure_request(
                &client,
                &base_url,
                resolution,
                view_start,
                view_end,
            ));
            if step == STEPS_PER_PAN - 1 {
                break;
            }
            view_start = view_end;
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
        for result in join_all(requests).await {
            match result {
                Ok(latency) => latencies.push(latency),
                Err(err) => {
                    warn!("Benchmark request failed: {err}");
                    errors += 1;
                }
            }
        }
    }
    (mean_duration(&latencies), errors)
}

fn mul_duration(duration: Duration, factor: f64) -> Duration {
    Duration::milliseconds((duration.num_milliseconds() as f64 * factor) as i64)
}

fn mean_duration(durations: &[Duration]) -> Duration {
    if durations.is_empty() {
        return Duration::zero();
    }
    let total: i64 = durations.iter().map(|d| d.num_milliseconds()).sum();
    Duration::milliseconds(total / durations.len() as i64)
}

/// Runs the benchmark against `base_url` with `viewers` concurrent panning
/// users.
pub async fn run(
    base_url: String,
    viewers: usize,
    seed: Option<u64>,
    resolution: u32,
) -> anyhow::Result<()> {
    info!("Benchmarking {base_url}");
    let client = reqwest::Client::new();
    let flux_range = fetch_flux_range_definitive(&client, &base_url).await?;

    info!("Simulating {viewers} constantly panning users");
    let tasks: Vec<_> = (0..viewers)
        .map(|index| {
            simulate_viewer(
                client.clone(),
                base_url.clone(),
                resolution,
                flux_range,
                seed.unwrap_or_else(rand::random) + index as u64,
            )
        })
        .collect();
    let results = join_all(tasks).await;

    let latencies: Vec<Duration> = results.iter().map(|(latency, _)| *latency).collect();
    let errors: usize = results.iter().map(|(_, errors)| errors).sum();
    info!(
        "Average latency was {}ms",
        mean_duration(&latencies).num_milliseconds()
    );
    info!("Encountered {errors} errors");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_duration() {
        let durations = [Duration::milliseconds(100), Duration::milliseconds(300)];
        assert_eq!(mean_duration(&durations), Duration::milliseconds(200));
        assert_eq!(mean_duration(&[]), Duration::zero());
    }

    #[test]
    fn test_mul_duration() {
        assert_eq!(
            mul_duration(Duration::seconds(10), 0.5),
            Duration::seconds(5)
        );
    }
}
