//! Assembling the duration-tier table from configured values.

use std::time::Duration;

use gch_admission::{Adaptation, ConcurrencyLimits};
use gch_metric::{Attributes, Registry};
use gch_query::{QueryTier, TierTable, TierTableError};
use thiserror::Error;
use url::Url;

/// One configured duration tier. Tier lists come from the configuration
/// file surface rather than flags, so this is a plain struct.
#[derive(Debug, Clone)]
pub struct TierSpec {
    /// Smallest window width this tier serves; must be non-zero (the
    /// zero tier is implicit).
    pub min_duration: Duration,
    /// Endpoint override; the root URL applies when absent.
    pub url: Option<Url>,
    /// Timeout override; the root data timeout applies when absent.
    pub total_timeout: Option<Duration>,
    pub limits: ConcurrencyLimits,
    /// Whether a TLS client config was supplied for this tier.
    pub tls_configured: bool,
}

#[derive(Debug, Error)]
pub enum TierConfigError {
    #[error("tier min-duration must be set")]
    MissingDuration,

    #[error(transparent)]
    Table(#[from] TierTableError),
}

/// Build the routable tier table.
///
/// The root settings become the implicit zero-duration tier; the specs are
/// validated, defaulted and sorted on top of it. Returns the table plus
/// human-readable warnings for the startup log.
#[allow(clippy::too_many_arguments)]
pub fn build_tier_table(
    root_url: &Url,
    root_timeout: Duration,
    root_limits: ConcurrencyLimits,
    root_tls_configured: bool,
    specs: &[TierSpec],
    registry: &Registry,
    adaptation: Option<&Adaptation>,
) -> Result<(TierTable, Vec<String>), TierConfigError> {
    let mut warnings = Vec::new();
    let mut tiers = Vec::with_capacity(specs.len() + 1);

    let implicit = TierSpec {
        min_duration: Duration::ZERO,
        url: None,
        total_timeout: None,
        limits: root_limits,
        tls_configured: root_tls_configured,
    };

    for (index, spec) in std::iter::once(&implicit).chain(specs.iter()).enumerate() {
        if index > 0 && spec.min_duration.is_zero() {
            return Err(TierConfigError::MissingDuration);
        }

        let endpoint = spec.url.clone().unwrap_or_else(|| root_url.clone());
        let total_timeout = spec
            .total_timeout
            .filter(|timeout| !timeout.is_zero())
            .unwrap_or(root_timeout);

        if spec.tls_configured && endpoint.scheme() != "https" {
            warnings.push(format!(
                "tier {index}: TLS configuration is ignored because the endpoint scheme is not HTTPS",
            ));
        }

        let (limits, coerced) = spec.limits.normalize();
        if coerced {
            warnings.push(format!(
                "tier {index}: concurrent-queries above max-queries, falling back to the hard cap only",
            ));
        }

        let mut attributes = Attributes::from([("limiter", "render")]);
        attributes.insert("tier", index.to_string());
        let limiter = gch_admission::build_limiter(limits, attributes, registry, adaptation.cloned());

        tiers.push(QueryTier {
            min_duration: spec.min_duration,
            endpoint,
            total_timeout,
            limiter,
        });
    }

    Ok((TierTable::new(tiers)?, warnings))
}
