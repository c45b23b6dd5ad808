//! CLI config for the admission limiters and the load sampler.

use std::{sync::Arc, time::Duration};

use gch_admission::{
    build_limiter, Adaptation, AdmissionLimiter, ConcurrencyLimits, DegradedSettings, LoadSampler,
};
use gch_metric::Registry;

/// CLI config for the render/find/tags admission limiters.
#[derive(Debug, Clone, clap::Parser)]
pub struct ConcurrencyConfig {
    /// Hard cap on in-flight render queries; 0 disables the limiter.
    #[clap(
        long = "render-max-queries",
        env = "GCH_RENDER_MAX_QUERIES",
        default_value = "0",
        action
    )]
    pub render_max_queries: usize,

    /// Render queries admitted before queueing starts.
    #[clap(
        long = "render-concurrent-queries",
        env = "GCH_RENDER_CONCURRENT_QUERIES",
        default_value = "0",
        action
    )]
    pub render_concurrent_queries: usize,

    /// Steps the render ceiling may degrade over under load; 0 keeps it
    /// fixed.
    #[clap(
        long = "render-adaptive-queries",
        env = "GCH_RENDER_ADAPTIVE_QUERIES",
        default_value = "0",
        action
    )]
    pub render_adaptive_queries: usize,

    /// Hard cap on in-flight find queries; 0 disables the limiter.
    #[clap(
        long = "find-max-queries",
        env = "GCH_FIND_MAX_QUERIES",
        default_value = "0",
        action
    )]
    pub find_max_queries: usize,

    /// Find queries admitted before queueing starts.
    #[clap(
        long = "find-concurrent-queries",
        env = "GCH_FIND_CONCURRENT_QUERIES",
        default_value = "0",
        action
    )]
    pub find_concurrent_queries: usize,

    /// Steps the find ceiling may degrade over under load.
    #[clap(
        long = "find-adaptive-queries",
        env = "GCH_FIND_ADAPTIVE_QUERIES",
        default_value = "0",
        action
    )]
    pub find_adaptive_queries: usize,

    /// Hard cap on in-flight tag-autocomplete queries; 0 disables the
    /// limiter.
    #[clap(
        long = "tags-max-queries",
        env = "GCH_TAGS_MAX_QUERIES",
        default_value = "0",
        action
    )]
    pub tags_max_queries: usize,

    /// Tag queries admitted before queueing starts.
    #[clap(
        long = "tags-concurrent-queries",
        env = "GCH_TAGS_CONCURRENT_QUERIES",
        default_value = "0",
        action
    )]
    pub tags_concurrent_queries: usize,

    /// Steps the tags ceiling may degrade over under load.
    #[clap(
        long = "tags-adaptive-queries",
        env = "GCH_TAGS_ADAPTIVE_QUERIES",
        default_value = "0",
        action
    )]
    pub tags_adaptive_queries: usize,
}

/// The limiters every request handler shares.
#[derive(Debug, Clone)]
pub struct Limiters {
    pub render: Arc<dyn AdmissionLimiter>,
    pub find: Arc<dyn AdmissionLimiter>,
    pub tags: Arc<dyn AdmissionLimiter>,
}

impl ConcurrencyConfig {
    pub fn render_limits(&self) -> ConcurrencyLimits {
        ConcurrencyLimits {
            max_queries: self.render_max_queries,
            concurrent_queries: self.render_concurrent_queries,
            adaptive_queries: self.render_adaptive_queries,
        }
    }

    pub fn find_limits(&self) -> ConcurrencyLimits {
        ConcurrencyLimits {
            max_queries: self.find_max_queries,
            concurrent_queries: self.find_concurrent_queries,
            adaptive_queries: self.find_adaptive_queries,
        }
    }

    pub fn tags_limits(&self) -> ConcurrencyLimits {
        ConcurrencyLimits {
            max_queries: self.tags_max_queries,
            concurrent_queries: self.tags_concurrent_queries,
            adaptive_queries: self.tags_adaptive_queries,
        }
    }

    /// True when any class wants a moving ceiling, i.e. the load sampler
    /// must run.
    pub fn any_adaptive(&self) -> bool {
        [
            self.render_limits(),
            self.find_limits(),
            self.tags_limits(),
        ]
        .iter()
        .any(|limits| limits.max_queries > 0 && limits.adaptive_queries > 0)
    }

    pub fn build(&self, registry: &Registry, adaptation: Option<&Adaptation>) -> Limiters {
        Limiters {
            render: build_limiter(
                self.render_limits(),
                [("limiter", "render")],
                registry,
                adaptation.cloned(),
            ),
            find: build_limiter(
                self.find_limits(),
                [("limiter", "find")],
                registry,
                adaptation.cloned(),
            ),
            tags: build_limiter(
                self.tags_limits(),
                [("limiter", "tags")],
                registry,
                adaptation.cloned(),
            ),
        }
    }
}

/// CLI config for load-driven degradation.
#[derive(Debug, Clone, clap::Parser)]
pub struct LoadControlConfig {
    /// Normalized load average at which ceilings start degrading.
    #[clap(
        long = "degraded-load-avg",
        env = "GCH_DEGRADED_LOAD_AVG",
        default_value = "1.0",
        action
    )]
    pub degraded_load: f64,

    /// Degradation endpoint multiplier: at `degraded-load-avg` times this
    /// value the ceiling reaches its floor.
    #[clap(
        long = "degraded-multiply",
        env = "GCH_DEGRADED_MULTIPLY",
        default_value = "4.0",
        action
    )]
    pub degraded_multiply: f64,

    /// How often the load average is sampled and the ceilings
    /// re-evaluated.
    #[clap(
        long = "load-sample-interval",
        env = "GCH_LOAD_SAMPLE_INTERVAL",
        default_value = "10s",
        value_parser = humantime::parse_duration,
        action
    )]
    pub sample_interval: Duration,
}

impl LoadControlConfig {
    pub fn settings(&self) -> DegradedSettings {
        DegradedSettings {
            degraded_load: self.degraded_load,
            degraded_multiply: self.degraded_multiply,
        }
    }

    /// The sampler to start when [`ConcurrencyConfig::any_adaptive`] says
    /// so; its cell feeds [`Self::adaptation`].
    pub fn sampler(&self, registry: &Registry) -> LoadSampler {
        LoadSampler::new(registry, self.sample_interval)
    }

    pub fn adaptation(&self, sampler: &LoadSampler) -> Adaptation {
        Adaptation {
            load: sampler.cell(),
            settings: self.settings(),
            period: self.sample_interval,
        }
    }
}
