use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    gate::Gate, AdmissionError, AdmissionLimiter, AdmissionMetrics, AdmissionPermit,
    NormalizedLoad,
};

/// The load level at which degradation starts and how far it goes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DegradedSettings {
    /// Normalized load up to which the full ceiling applies.
    pub degraded_load: f64,
    /// At `degraded_load * degraded_multiply` the ceiling has degraded to
    /// `concurrent / degraded_multiply`; load beyond that changes nothing.
    pub degraded_multiply: f64,
}

impl Default for DegradedSettings {
    fn default() -> Self {
        Self {
            degraded_load: 1.0,
            degraded_multiply: 4.0,
        }
    }
}

/// Everything an adaptive limiter needs to follow the system load.
#[derive(Debug, Clone)]
pub struct Adaptation {
    /// Cell the load sampler publishes into.
    pub load: NormalizedLoad,
    pub settings: DegradedSettings,
    /// How often the ceiling is re-evaluated.
    pub period: Duration,
}

impl Adaptation {
    pub fn new(load: NormalizedLoad) -> Self {
        Self {
            load,
            settings: DegradedSettings::default(),
            period: Duration::from_secs(10),
        }
    }
}

/// Target ceiling for a given normalized load.
///
/// At or below `degraded_load` the full `concurrent` ceiling applies;
/// beyond it the ceiling degrades linearly down to
/// `concurrent / degraded_multiply`, clamped below at 1. The result is
/// quantized to `adaptive` distinct steps so the ceiling does not chase
/// every load wiggle.
pub fn ceiling_for_load(
    concurrent: usize,
    adaptive: usize,
    settings: &DegradedSettings,
    load: f64,
) -> usize {
    if adaptive == 0 || !load.is_finite() || load <= settings.degraded_load {
        return concurrent;
    }

    let bounded = load.min(settings.degraded_load * settings.degraded_multiply);
    let raw = (concurrent as f64 * settings.degraded_load / bounded).max(1.0);
    let floor = (concurrent as f64 / settings.degraded_multiply).round().max(1.0);

    // nearest of `adaptive` evenly spaced steps between the full ceiling
    // and the degradation floor
    let span = (adaptive - 1).max(1) as f64;
    let mut nearest = concurrent as f64;
    let mut nearest_distance = f64::INFINITY;
    for step in 0..adaptive {
        let anchor = concurrent as f64 - step as f64 * (concurrent as f64 - floor) / span;
        let distance = (anchor - raw).abs();
        if distance < nearest_distance {
            nearest_distance = distance;
            nearest = anchor;
        }
    }

    (nearest.round() as usize).clamp(1, concurrent)
}

/// A limiter whose ceiling follows the normalized load average.
///
/// The ceiling moves within `[1, concurrent]`; the hard cap never moves.
#[derive(Debug)]
pub struct AdaptiveLimiter {
    gate: Arc<Gate>,
    controller: tokio::task::JoinHandle<()>,
}

impl AdaptiveLimiter {
    pub fn new(
        max: usize,
        concurrent: usize,
        adaptive: usize,
        adaptation: Adaptation,
        metrics: AdmissionMetrics,
    ) -> Self {
        let gate = Arc::new(Gate::new(max, concurrent, metrics));

        let controller = {
            let gate = Arc::clone(&gate);
            let Adaptation {
                load,
                settings,
                period,
            } = adaptation;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    let current = load.get();
                    let target = ceiling_for_load(concurrent, adaptive, &settings, current);
                    debug!(load = current, target, "adjusting admission ceiling");
                    gate.set_ceiling(target);
                }
            })
        };

        Self { gate, controller }
    }
}

impl Drop for AdaptiveLimiter {
    fn drop(&mut self) {
        self.controller.abort();
    }
}

#[async_trait]
impl AdmissionLimiter for AdaptiveLimiter {
    async fn enter(
        &self,
        queue_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<AdmissionPermit, AdmissionError> {
        self.gate.enter(queue_timeout, cancel).await
    }

    fn enabled(&self) -> bool {
        true
    }

    fn send_duration(&self, elapsed: Duration) {
        self.gate.metrics().request_queue_duration.record(elapsed);
    }
}
