use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;

use crate::{HistogramObservation, MetricKind, MetricObserver, Observation, ObservationBucket};

/// Default bucket bounds, sized for queue waits and back-end round trips:
/// 1 ms up to 1 min in roughly 4x steps, plus a catch-all.
const DEFAULT_BUCKETS: &[Duration] = &[
    Duration::from_millis(1),
    Duration::from_millis(4),
    Duration::from_millis(16),
    Duration::from_millis(64),
    Duration::from_millis(250),
    Duration::from_secs(1),
    Duration::from_secs(4),
    Duration::from_secs(16),
    Duration::from_secs(60),
    Duration::MAX,
];

/// Bucketed observations of [`Duration`]s.
#[derive(Debug, Clone)]
pub struct DurationHistogram {
    shared: Arc<Mutex<HistogramObservation>>,
}

impl Default for DurationHistogram {
    fn default() -> Self {
        Self {
            shared: Arc::new(Mutex::new(HistogramObservation {
                total: Duration::ZERO,
                sample_count: 0,
                buckets: DEFAULT_BUCKETS
                    .iter()
                    .map(|&le| ObservationBucket { le, count: 0 })
                    .collect(),
            })),
        }
    }
}

impl DurationHistogram {
    pub fn record(&self, value: Duration) {
        let mut state = self.shared.lock();
        if let Some(bucket) = state.buckets.iter_mut().find(|bucket| value <= bucket.le) {
            bucket.count = bucket.count.wrapping_add(1);
            state.total = state.total.saturating_add(value);
            state.sample_count = state.sample_count.wrapping_add(1);
        }
    }

    pub fn fetch(&self) -> HistogramObservation {
        self.shared.lock().clone()
    }
}

impl MetricObserver for DurationHistogram {
    fn kind() -> MetricKind {
        MetricKind::DurationHistogram
    }

    fn observe(&self) -> Observation {
        Observation::DurationHistogram(self.fetch())
    }
}
