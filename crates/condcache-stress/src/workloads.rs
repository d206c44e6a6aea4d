use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Result, ensure};
use condcache::{ConditionsCache, InvalidInterval, ValidityInterval};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    pub concurrency: usize,
    #[serde(flatten)]
    pub payload: Payload,
}

/// Describes the conditions requested by a workload, and how expensive they are to produce.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Payload {
    /// The number of distinct keys requests are spread over.
    pub keys: u32,
    /// The length of the validity intervals the producer hands out.
    pub interval_length: u64,
    /// How far the clock of the workload advances with every request.
    pub time_step: u64,
    /// How long a single production takes.
    #[serde(default, with = "humantime_serde")]
    pub producer_delay: Duration,
    /// The probability of a production failing.
    #[serde(default)]
    pub failure_rate: f64,
}

/// Identifies a conditions entry; every workload has its own keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConditionsKey {
    pub workload: usize,
    pub channel: u32,
}

/// The value produced for a [`ConditionsKey`].
#[derive(Debug)]
pub struct Calibration {
    pub channel: u32,
    pub produced_at: u64,
    pub gain: f64,
}

#[derive(Clone, Debug, Error)]
pub enum ProducerError {
    #[error("failed to produce conditions for {key:?} at {t}")]
    Failed { key: ConditionsKey, t: u64 },
    #[error(transparent)]
    Interval(#[from] InvalidInterval<u64>),
}

pub type StressCache = ConditionsCache<ConditionsKey, u64, Calibration, ProducerError>;

/// A validated workload along with its clock.
#[derive(Debug)]
pub struct ParsedPayload {
    index: usize,
    payload: Payload,
    clock: AtomicU64,
}

impl ParsedPayload {
    /// The time point the clock of this workload has reached.
    pub fn now(&self) -> u64 {
        self.clock.load(Ordering::Relaxed)
    }
}

pub fn prepare_payload(index: usize, payload: Payload) -> Result<ParsedPayload> {
    ensure!(payload.keys > 0, "workload {index} needs at least one key");
    ensure!(
        payload.interval_length > 0,
        "workload {index} needs a non-empty interval length"
    );
    ensure!(
        (0.0..=1.0).contains(&payload.failure_rate),
        "failure rate of workload {index} must be between 0 and 1"
    );

    Ok(ParsedPayload {
        index,
        payload,
        clock: AtomicU64::new(0),
    })
}

/// Requests the conditions for a random key at the next time point of the workload.
///
/// Returns whether the request succeeded.
pub async fn process_payload(cache: &StressCache, workload: &ParsedPayload) -> bool {
    let payload = &workload.payload;
    let t = workload.clock.fetch_add(payload.time_step, Ordering::Relaxed);
    let key = ConditionsKey {
        workload: workload.index,
        channel: rand::rng().random_range(0..payload.keys),
    };

    match cache.get(&key, t, |key, t| produce(*key, t, payload)).await {
        Ok(view) => {
            tracing::trace!(
                channel = view.channel,
                produced_at = view.produced_at,
                gain = view.gain,
                "request served"
            );
            true
        }
        Err(error) => {
            tracing::trace!(%error, "request failed");
            false
        }
    }
}

async fn produce(
    key: ConditionsKey,
    t: u64,
    payload: &Payload,
) -> Result<(Calibration, ValidityInterval<u64>), ProducerError> {
    if !payload.producer_delay.is_zero() {
        tokio::time::sleep(payload.producer_delay).await;
    }

    let failed = rand::rng().random_bool(payload.failure_rate);
    if failed {
        return Err(ProducerError::Failed { key, t });
    }

    let start = t - t % payload.interval_length;
    let interval = ValidityInterval::new(start, start.saturating_add(payload.interval_length))?;
    let calibration = Calibration {
        channel: key.channel,
        produced_at: t,
        gain: 1.0 + f64::from(key.channel) / 1000.0,
    };
    Ok((calibration, interval))
}
