use std::{sync::Arc, time::Duration};

use gch_admission::AdmissionLimiter;
use thiserror::Error;
use url::Url;

/// Why a tier table could not be assembled.
#[derive(Debug, Error)]
pub enum TierTableError {
    #[error("tier table needs at least the implicit zero-duration tier")]
    Empty,

    #[error("tier table must start at min-duration 0, got {0:?}")]
    MissingZeroTier(Duration),

    #[error("tier endpoint {0} must be http or https")]
    UnsupportedScheme(Url),

    #[error("tier for {min_duration:?} has no total timeout")]
    MissingTimeout { min_duration: Duration },
}

/// One analytic endpoint class, selected by request window width.
#[derive(Debug, Clone)]
pub struct QueryTier {
    /// Smallest window width this tier serves.
    pub min_duration: Duration,
    /// Back-end URL queries of this tier go to.
    pub endpoint: Url,
    /// Total budget to run the query and read the response.
    pub total_timeout: Duration,
    /// Admission gate for this tier.
    pub limiter: Arc<dyn AdmissionLimiter>,
}

/// The configured tiers, sorted ascending by `min_duration`, starting at
/// the implicit zero tier. Read-only after startup.
#[derive(Debug)]
pub struct TierTable {
    tiers: Vec<QueryTier>,
}

impl TierTable {
    pub fn new(mut tiers: Vec<QueryTier>) -> Result<Self, TierTableError> {
        if tiers.is_empty() {
            return Err(TierTableError::Empty);
        }
        tiers.sort_by_key(|tier| tier.min_duration);
        if !tiers[0].min_duration.is_zero() {
            return Err(TierTableError::MissingZeroTier(tiers[0].min_duration));
        }
        for tier in &tiers {
            match tier.endpoint.scheme() {
                "http" | "https" => {}
                _ => return Err(TierTableError::UnsupportedScheme(tier.endpoint.clone())),
            }
            if tier.total_timeout.is_zero() {
                return Err(TierTableError::MissingTimeout {
                    min_duration: tier.min_duration,
                });
            }
        }
        Ok(Self { tiers })
    }

    /// The tier with the greatest `min_duration` at most `width`.
    ///
    /// Binary descent over the sorted table; the zero tier guarantees a
    /// match for every width.
    pub fn route(&self, width: Duration) -> &QueryTier {
        let mut low = 0;
        let mut high = self.tiers.len();
        while high - low > 1 {
            let mid = (low + high) / 2;
            if self.tiers[mid].min_duration <= width {
                low = mid;
            } else {
                high = mid;
            }
        }
        &self.tiers[low]
    }

    pub fn tiers(&self) -> &[QueryTier] {
        &self.tiers
    }
}
