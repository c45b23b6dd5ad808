use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use gch_metric::{Attributes, F64Gauge, Registry};
use sysinfo::{System, SystemExt};
use tracing::debug;

/// The 1-minute load average divided by the CPU count, published by the
/// [`LoadSampler`] and read lock-free by every adaptive limiter.
#[derive(Debug, Clone, Default)]
pub struct NormalizedLoad {
    cell: Arc<AtomicU64>,
}

impl NormalizedLoad {
    pub fn get(&self) -> f64 {
        f64::from_bits(self.cell.load(Ordering::Relaxed))
    }

    pub fn set(&self, value: f64) {
        self.cell.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// Periodically samples the OS load average.
///
/// Started only when something asked for adaptation; an idle gateway runs
/// no sampler at all.
#[derive(Debug)]
pub struct LoadSampler {
    cell: NormalizedLoad,
    period: Duration,
    gauge: F64Gauge,
}

impl LoadSampler {
    pub fn new(registry: &Registry, period: Duration) -> Self {
        let gauge = registry
            .register_metric::<F64Gauge>(
                "gch_normalized_load_avg",
                "One-minute load average divided by the CPU count",
            )
            .recorder(Attributes::default());
        Self {
            cell: NormalizedLoad::default(),
            period,
            gauge,
        }
    }

    /// The cell this sampler publishes into; hand clones of it to the
    /// adaptive limiters.
    pub fn cell(&self) -> NormalizedLoad {
        self.cell.clone()
    }

    /// Spawn the background sampling task.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let system = System::new();
            let cpus = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1) as f64;
            let mut interval = tokio::time::interval(self.period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let load = system.load_average().one;
                let normalized = load / cpus;
                self.cell.set(normalized);
                self.gauge.set(normalized);
                debug!(load, normalized, "sampled load average");
            }
        })
    }
}
