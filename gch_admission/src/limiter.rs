use std::{fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use gch_metric::{Attributes, DurationHistogram, Registry, U64Counter, U64Gauge};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{
    gate::{Gate, PermitInner},
    Adaptation, AdaptiveLimiter,
};

/// Why an [`enter`](AdmissionLimiter::enter) was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AdmissionError {
    /// The hard in-flight cap is reached; refused without queueing.
    #[error("maximum concurrent queries reached")]
    Overflow,
    /// The queue wait exceeded the allowed time.
    #[error("timeout while waiting in the query queue")]
    Timeout,
    /// The request context ended while waiting.
    #[error("canceled while waiting in the query queue")]
    Canceled,
}

/// Admission to a limited resource class.
///
/// The permit releases its slot when dropped.
#[derive(Debug)]
pub struct AdmissionPermit {
    pub(crate) inner: Option<PermitInner>,
}

impl AdmissionPermit {
    /// A permit that holds nothing, handed out by disabled limiters.
    pub fn unlimited() -> Self {
        Self { inner: None }
    }
}

/// Gate in front of one resource class.
///
/// Leaving is dropping the returned [`AdmissionPermit`].
#[async_trait]
pub trait AdmissionLimiter: Debug + Send + Sync + 'static {
    /// Wait for admission, up to `queue_timeout` or until `cancel` fires.
    async fn enter(
        &self,
        queue_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<AdmissionPermit, AdmissionError>;

    /// False for limiters that never queue; callers can skip queue-time
    /// bookkeeping then.
    fn enabled(&self) -> bool;

    /// Record the total time one request spent waiting for admission.
    fn send_duration(&self, elapsed: Duration);
}

/// Per-limiter instrumentation.
#[derive(Debug)]
pub struct AdmissionMetrics {
    pub(crate) in_flight: U64Gauge,
    pub(crate) pending: U64Gauge,
    pub(crate) overflows: U64Counter,
    pub(crate) timeouts: U64Counter,
    pub(crate) cancelled_while_pending: U64Counter,
    pub(crate) acquire_duration: DurationHistogram,
    pub(crate) request_queue_duration: DurationHistogram,
}

impl AdmissionMetrics {
    /// Register the metric set for one limiter, carrying the given
    /// attributes (e.g. `limiter=render, tier=1`).
    pub fn new(registry: &Registry, attributes: impl Into<Attributes>) -> Self {
        let attributes = attributes.into();
        Self {
            in_flight: registry
                .register_metric::<U64Gauge>(
                    "gch_admission_in_flight",
                    "Number of queries currently admitted",
                )
                .recorder(attributes.clone()),
            pending: registry
                .register_metric::<U64Gauge>(
                    "gch_admission_pending",
                    "Number of queries waiting for admission",
                )
                .recorder(attributes.clone()),
            overflows: registry
                .register_metric::<U64Counter>(
                    "gch_admission_overflow_total",
                    "Number of queries refused at the hard in-flight cap",
                )
                .recorder(attributes.clone()),
            timeouts: registry
                .register_metric::<U64Counter>(
                    "gch_admission_timeout_total",
                    "Number of queries that timed out waiting for admission",
                )
                .recorder(attributes.clone()),
            cancelled_while_pending: registry
                .register_metric::<U64Counter>(
                    "gch_admission_cancelled_while_pending_total",
                    "Number of queries cancelled while waiting for admission",
                )
                .recorder(attributes.clone()),
            acquire_duration: registry
                .register_metric::<DurationHistogram>(
                    "gch_admission_acquire_duration",
                    "Time spent acquiring admission, per attempt",
                )
                .recorder(attributes.clone()),
            request_queue_duration: registry
                .register_metric::<DurationHistogram>(
                    "gch_admission_request_queue_duration",
                    "Total admission queue time, per request",
                )
                .recorder(attributes),
        }
    }

    /// Metrics not linked to any registry, for tests.
    pub fn new_unregistered() -> Self {
        Self {
            in_flight: Default::default(),
            pending: Default::default(),
            overflows: Default::default(),
            timeouts: Default::default(),
            cancelled_while_pending: Default::default(),
            acquire_duration: Default::default(),
            request_queue_duration: Default::default(),
        }
    }
}

/// The do-nothing limiter used when a resource class is unlimited.
///
/// Deliberately holds no state: entering performs no atomic operation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLimiter;

#[async_trait]
impl AdmissionLimiter for NoopLimiter {
    async fn enter(
        &self,
        _queue_timeout: Duration,
        _cancel: &CancellationToken,
    ) -> Result<AdmissionPermit, AdmissionError> {
        Ok(AdmissionPermit::unlimited())
    }

    fn enabled(&self) -> bool {
        false
    }

    fn send_duration(&self, _elapsed: Duration) {}
}

/// A hard cap plus a fixed queueing ceiling.
#[derive(Debug)]
pub struct FixedLimiter {
    gate: Gate,
}

impl FixedLimiter {
    /// `max` is the hard in-flight cap, `concurrent` the ceiling above
    /// which callers queue. `concurrent == 0` leaves only the hard cap.
    pub fn new(max: usize, concurrent: usize, metrics: AdmissionMetrics) -> Self {
        let ceiling = if concurrent == 0 { max } else { concurrent };
        Self {
            gate: Gate::new(max, ceiling, metrics),
        }
    }
}

#[async_trait]
impl AdmissionLimiter for FixedLimiter {
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

/// The `max`/`concurrent`/`adaptive` triple configured per resource class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConcurrencyLimits {
    /// Hard in-flight cap; `0` disables the limiter entirely.
    pub max_queries: usize,
    /// Nominal ceiling; queueing starts above it.
    pub concurrent_queries: usize,
    /// Number of discrete steps the ceiling may degrade over; `0`
    /// disables adaptation.
    pub adaptive_queries: usize,
}

impl ConcurrencyLimits {
    /// Apply the configured-value coercions.
    ///
    /// A ceiling above the hard cap is not honored; the ceiling collapses
    /// to "hard cap only" and the caller is told so it can surface a
    /// warning.
    pub fn normalize(mut self) -> (Self, bool) {
        let coerced = self.max_queries > 0 && self.concurrent_queries > self.max_queries;
        if coerced {
            self.concurrent_queries = 0;
        }
        (self, coerced)
    }
}

/// Build the limiter variant for the given limits.
///
/// `adaptation` supplies the load feedback; without it (or with
/// `adaptive_queries == 0`) the ceiling is fixed.
pub fn build_limiter(
    limits: ConcurrencyLimits,
    attributes: impl Into<Attributes>,
    registry: &Registry,
    adaptation: Option<Adaptation>,
) -> Arc<dyn AdmissionLimiter> {
    let attributes = attributes.into();
    let (limits, coerced) = limits.normalize();
    if coerced {
        warn!(
            limiter = ?attributes,
            max_queries = limits.max_queries,
            "concurrent-queries above max-queries, falling back to the hard cap only",
        );
    }

    if limits.max_queries == 0 {
        return Arc::new(NoopLimiter);
    }

    let metrics = AdmissionMetrics::new(registry, attributes.clone());
    if limits.concurrent_queries == 0 || limits.adaptive_queries == 0 {
        return Arc::new(FixedLimiter::new(
            limits.max_queries,
            limits.concurrent_queries,
            metrics,
        ));
    }

    match adaptation {
        Some(adaptation) => Arc::new(AdaptiveLimiter::new(
            limits.max_queries,
            limits.concurrent_queries,
            limits.adaptive_queries,
            adaptation,
            metrics,
        )),
        None => {
            warn!(
                limiter = ?attributes,
                "adaptive-queries configured but no load sampler is running, keeping a fixed ceiling",
            );
            Arc::new(FixedLimiter::new(
                limits.max_queries,
                limits.concurrent_queries,
                metrics,
            ))
        }
    }
}
