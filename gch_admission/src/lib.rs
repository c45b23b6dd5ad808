//! Adaptive admission limiting for analytic queries.
//!
//! A limiter governs concurrent access to one logical resource class
//! (render at a tier, find, tags, a specific user). Three variants exist:
//!
//! - [`NoopLimiter`]: admits everything, costs nothing.
//! - [`FixedLimiter`]: a hard in-flight cap plus a queueing ceiling.
//! - [`AdaptiveLimiter`]: a [`FixedLimiter`] whose ceiling degrades as the
//!   normalized load average rises.
//!
//! Admission is expressed as an RAII [`AdmissionPermit`]: dropping the
//! permit is the leave operation, so a release happens exactly once on
//! every exit path, including early returns and cancellation.

mod adaptive;
mod gate;
mod limiter;
mod load;

pub use adaptive::{ceiling_for_load, Adaptation, AdaptiveLimiter, DegradedSettings};
pub use limiter::{
    build_limiter, AdmissionError, AdmissionLimiter, AdmissionMetrics, AdmissionPermit,
    ConcurrencyLimits, FixedLimiter, NoopLimiter,
};
pub use load::{LoadSampler, NormalizedLoad};
