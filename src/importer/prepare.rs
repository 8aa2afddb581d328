//! Prepares raw channels for import: extends them with bordering stored
//! data, cleans every raw channel that lacks a clean counterpart, computes
//! the combined channels and trims everything back to its effective range.

use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use futures_util::future::try_join_all;

use super::clean::{clean_border, clean_flux};
use super::combine::{combine_border, combine_flux_channels};
use super::ImportError;
use crate::model::{Band, Channel, FluxSeries, FluxSource, TimeRange};
use crate::storage::FluxRead;

/// Extends the provided flux to the target range by loading the missing
/// border sections from the store.
async fn extend_flux(
    store: &dyn FluxRead,
    source: FluxSource,
    channel: Channel,
    flux: FluxSeries,
    original: TimeRange,
    target: TimeRange,
) -> Result<FluxSeries, ImportError> {
    let mut sections = Vec::with_capacity(3);
    if target.start < original.start {
        sections.push(
            store
                .fetch(
                    source,
                    channel,
                    Duration::zero(),
                    TimeRange::new(target.start, original.start),
                    None,
                )
                .await?,
        );
    }
    sections.push(flux);
    if target.end > original.end {
        sections.push(
            store
                .fetch(
                    source,
                    channel,
                    Duration::zero(),
                    TimeRange::new(original.end, target.end),
                    None,
                )
                .await?,
        );
    }
    Ok(FluxSeries::concat(
        sections.into_iter().filter(|section| !section.is_empty()),
    ))
}

/// Cleans the provided flux including its bordering sections.
///
/// Returns the cleaned flux and its new effective range: one border wider
/// than the input range, because that much can be cleaned deterministically
/// with the fetched context around it.
async fn clean_channel(
    store: &dyn FluxRead,
    source: FluxSource,
    channel: Channel,
    flux: FluxSeries,
    range: TimeRange,
) -> Result<(Channel, (FluxSeries, TimeRange)), ImportError> {
    if channel.is_clean {
        return Err(ImportError::AlreadyClean);
    }
    let reclean_range = range.extend(clean_border());
    let fetch_range = reclean_range.extend(clean_border());
    let all = extend_flux(store, source, channel, flux, range, fetch_range).await?;
    let cleaned = tokio::task::spawn_blocking(move || clean_flux(&all))
        .await
        .map_err(|err| ImportError::Transient(err.to_string()))?;
    // The bordering data was only context: throw it away again.
    Ok((
        channel.as_clean(),
        (cleaned.slice(&reclean_range), reclean_range),
    ))
}

/// Computes the combined channels for every band present in `channels`,
/// pulling any satellite missing from the input out of the store.
async fn combine_channels(
    store: &dyn FluxRead,
    source: FluxSource,
    channels: &BTreeMap<Channel, (FluxSeries, TimeRange)>,
) -> Result<BTreeMap<Channel, (FluxSeries, TimeRange)>, ImportError> {
    let provided_range = TimeRange::which_includes(channels.values().map(|(_, range)| range))
        .unwrap_or_else(|| TimeRange::new(Utc::now(), Utc::now()));
    let recombine_range = provided_range.extend(combine_border());
    let fetch_range = recombine_range.extend(combine_border());

    // Extend the provided channels to the fetch range.
    let mut input = BTreeMap::new();
    for (channel, (flux, range)) in channels {
        if channel.is_combined() {
            continue;
        }
        input.insert(
            *channel,
            extend_flux(store, source, *channel, flux.clone(), *range, fetch_range).await?,
        );
    }

    // Load whatever other satellites the store knows in this window.
    for channel in store
        .available_channels(source, Some(recombine_range))
        .await?
    {
        if channel.is_combined() || input.contains_key(&channel) {
            continue;
        }
        input.insert(
            channel,
            store
                .fetch(source, channel, Duration::zero(), fetch_range, None)
                .await?,
        );
    }

    // Combine each band on its own blocking task.
    let mut tasks = Vec::with_capacity(Band::ALL.len());
    for band in Band::ALL {
        let band_input: BTreeMap<Channel, FluxSeries> = input
            .iter()
            .filter(|(channel, _)| channel.band == band)
            .map(|(channel, series)| (*channel, series.clone()))
            .collect();
        if band_input.is_empty() {
            continue;
        }
        tasks.push(tokio::task::spawn_blocking(move || {
            combine_flux_channels(&band_input, fetch_range)
        }));
    }

    let mut combined = BTreeMap::new();
    for task in tasks {
        let band_combined = task
            .await
            .map_err(|err| ImportError::Transient(err.to_string()))??;
        combined.extend(band_combined.into_iter().map(|(channel, series)| {
            (
                channel,
                (series.slice(&recombine_range), recombine_range),
            )
        }));
    }
    Ok(combined)
}

/// Prepares the provided raw channels for import by cleaning and combining
/// them. Cleaning runs concurrently per channel on the blocking pool;
/// cancelling the returned future abandons all in-flight work.
///
/// Returns every channel that should be imported, with its effective range.
pub async fn prepare_flux_channels(
    store: &dyn FluxRead,
    source: FluxSource,
    channels: BTreeMap<Channel, FluxSeries>,
    range: TimeRange,
) -> Result<BTreeMap<Channel, (FluxSeries, TimeRange)>, ImportError> {
    if channels.is_empty() {
        return Ok(BTreeMap::new());
    }

    // Every channel starts out covering the declared range; cleaning and
    // combining extend it.
    let mut channels: BTreeMap<Channel, (FluxSeries, TimeRange)> = channels
        .into_iter()
        .map(|(channel, flux)| (channel, (flux, range)))
        .collect();

    // Clean channels missing their clean counterpart, concurrently.
    let clean_tasks: Vec<_> = channels
        .iter()
        .filter(|(channel, _)| !channels.contains_key(&channel.as_clean()))
        .map(|(channel, (flux, channel_range))| {
            clean_channel(store, source, *channel, flux.clone(), *channel_range)
        })
        .collect();
    for (channel, prepared) in try_join_all(clean_tasks).await? {
        channels.insert(channel, prepared);
    }

    // Combine the channels (per band, both clean and raw variants).
    let combined = combine_channels(store, source, &channels).await?;
    channels.extend(combined);
    Ok(channels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone};

    use crate::storage::testing::MemStore;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn smooth_series(start: DateTime<Utc>, points: usize) -> FluxSeries {
        (0..points)
            .map(|i| {
                let phase = i as f64 * 2.0 * std::f64::consts::PI / 3600.0;
                (
                    start + Duration::seconds(i as i64),
                    10f64.powf(-6.0 + 0.3 * phase.sin()) as f32,
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_prepare_empty_input() {
        let store = MemStore::new();
        let prepared = prepare_flux_channels(
            &store,
            FluxSource::Archive,
            BTreeMap::new(),
            TimeRange::new(t0(), t0() + Duration::hours(1)),
        )
        .await
        .unwrap();
        assert!(prepared.is_empty());
    }

    #[tokio::test]
    async fn test_prepare_produces_clean_and_combined_channels() {
        let raw = Channel::new(16, Band::Long, false);
        let store = MemStore::new();
        let series = smooth_series(t0(), 7200);
        let range = TimeRange::new(t0(), t0() + Duration::seconds(7200));
        let prepared = prepare_flux_channels(
            &store,
            FluxSource::Archive,
            BTreeMap::from([(raw, series)]),
            range,
        )
        .await
        .unwrap();

        assert!(prepared.contains_key(&raw));
        assert!(prepared.contains_key(&raw.as_clean()));
        assert!(prepared.contains_key(&Channel::new(0, Band::Long, true)));
        assert!(prepared.contains_key(&Channel::new(0, Band::Long, false)));

        // The clean channel's declared range is one border wider than the
        // input range, the combined one a combine border wider still.
        let (_, clean_range) = &prepared[&raw.as_clean()];
        assert_eq!(*clean_range, range.extend(clean_border()));
        let (_, combined_range) = &prepared[&Channel::new(0, Band::Long, true)];
        assert_eq!(
            *combined_range,
            TimeRange::which_includes([range.extend(clean_border()), range].iter())
                .unwrap()
                .extend(combine_border())
        );
    }

    #[tokio::test]
    async fn test_prepare_skips_cleaning_when_clean_provided() {
        let raw = Channel::new(16, Band::Long, false);
        let series = smooth_series(t0(), 600);
        let range = TimeRange::new(t0(), t0() + Duration::seconds(600));
        let store = MemStore::new();
        let prepared = prepare_flux_channels(
            &store,
            FluxSource::Archive,
            BTreeMap::from([(raw, series.clone()), (raw.as_clean(), series.clone())]),
            range,
        )
        .await
        .unwrap();
        // The provided clean channel keeps the declared range untouched.
        let (clean_series, clean_range) = &prepared[&raw.as_clean()];
        assert_eq!(*clean_range, range);
        assert_eq!(clean_series.len(), series.len());
    }
}
