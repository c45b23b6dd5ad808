//! CLI config for the finder cache.

use std::{sync::Arc, time::Duration};

use gch_cache::{FinderCache, TtlPolicy};
use gch_metric::Registry;
use gch_query::FindCacheLayer;
use gch_time::TimeProvider;

/// CLI config for the finder cache.
#[derive(Debug, Clone, clap::Parser)]
pub struct FindCacheConfig {
    /// Default finder cache TTL in seconds. 0 disables caching for
    /// windows outside the short regime.
    #[clap(
        long = "find-cache-default-timeout",
        env = "GCH_FIND_CACHE_DEFAULT_TIMEOUT",
        default_value = "0",
        action
    )]
    pub default_timeout: u32,

    /// Finder cache TTL in seconds for small windows ending near now.
    /// 0 disables the short regime.
    #[clap(
        long = "find-cache-short-timeout",
        env = "GCH_FIND_CACHE_SHORT_TIMEOUT",
        default_value = "0",
        action
    )]
    pub short_timeout: u32,

    /// Maximum window width served under the short TTL.
    #[clap(
        long = "find-cache-short-duration",
        env = "GCH_FIND_CACHE_SHORT_DURATION",
        default_value = "3h",
        value_parser = humantime::parse_duration,
        action
    )]
    pub short_duration: Duration,

    /// Maximum distance between now and the window end for the short TTL.
    #[clap(
        long = "find-cache-short-offset",
        env = "GCH_FIND_CACHE_SHORT_OFFSET",
        default_value = "120s",
        value_parser = humantime::parse_duration,
        action
    )]
    pub short_offset: Duration,

    /// How often expired entries are swept out.
    #[clap(
        long = "find-cache-sweep-interval",
        env = "GCH_FIND_CACHE_SWEEP_INTERVAL",
        default_value = "60s",
        value_parser = humantime::parse_duration,
        action
    )]
    pub sweep_interval: Duration,
}

impl FindCacheConfig {
    pub fn policy(&self) -> TtlPolicy {
        TtlPolicy::new(
            self.default_timeout,
            self.short_timeout,
            self.short_duration,
            self.short_offset,
        )
    }

    /// Build the cache layer, or `None` when both TTLs are zero and
    /// caching is off.
    pub fn build(
        &self,
        time_provider: Arc<dyn TimeProvider>,
        registry: &Registry,
    ) -> Option<FindCacheLayer> {
        let policy = self.policy();
        policy.enabled().then(|| FindCacheLayer {
            cache: FinderCache::new(time_provider, registry),
            policy,
        })
    }
}
