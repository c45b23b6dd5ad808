//! In-process metric registry for the gateway.
//!
//! Decouples metric recording from metric export: components register
//! instruments against a [`Registry`] and record through cheap cloneable
//! recorders; an exporter (or a test) walks the registry with a
//! [`Reporter`]. Metric names are `&'static str` so every metric can be
//! grepped for in the codebase.

use std::{any::Any, borrow::Cow, collections::BTreeMap, fmt::Debug, time::Duration};

use parking_lot::Mutex;

mod counter;
mod duration;
mod gauge;

pub use counter::U64Counter;
pub use duration::DurationHistogram;
pub use gauge::{F64Gauge, U64Gauge};

/// A `Registry` stores a map of metric names to [`Instrument`]s.
///
/// A `BTreeMap` is used so reports come out in a consistent order.
#[derive(Debug, Default)]
pub struct Registry {
    instruments: Mutex<BTreeMap<&'static str, Box<dyn Instrument>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new [`Metric`] with the provided name and description.
    ///
    /// If a metric with this name is already registered it is returned;
    /// registering the same name with a different observer type panics.
    pub fn register_metric<T: MetricObserver>(
        &self,
        name: &'static str,
        description: &'static str,
    ) -> Metric<T> {
        let mut instruments = self.instruments.lock();
        match instruments.entry(name) {
            std::collections::btree_map::Entry::Occupied(o) => {
                match o.get().as_any().downcast_ref::<Metric<T>>() {
                    Some(metric) => metric.clone(),
                    None => panic!("metric {name} registered with two different types"),
                }
            }
            std::collections::btree_map::Entry::Vacant(v) => {
                let metric = Metric::new(name, description);
                v.insert(Box::new(metric.clone()));
                metric
            }
        }
    }

    /// Returns the already registered [`Metric`] if any.
    ///
    /// Primarily useful for testing.
    pub fn get_instrument<T: MetricObserver>(&self, name: &'static str) -> Option<Metric<T>> {
        self.instruments
            .lock()
            .get(name)
            .map(|instrument| match instrument.as_any().downcast_ref() {
                Some(metric) => Metric::clone(metric),
                None => panic!("metric {name} registered with two different types"),
            })
    }

    /// Record the current state of every metric to the provided [`Reporter`],
    /// in alphabetical name order.
    pub fn report(&self, reporter: &mut dyn Reporter) {
        let instruments = self.instruments.lock();
        for instrument in instruments.values() {
            instrument.report(reporter)
        }
    }
}

/// A type that knows how to write its observations to a [`Reporter`].
pub trait Instrument: Debug + Send + Sync {
    fn report(&self, reporter: &mut dyn Reporter);

    fn as_any(&self) -> &dyn Any;
}

/// Receives the state of every metric within a [`Registry`].
pub trait Reporter {
    fn start_metric(
        &mut self,
        metric_name: &'static str,
        description: &'static str,
        kind: MetricKind,
    );

    /// Must not be called without a prior `start_metric`.
    fn report_observation(&mut self, attributes: &Attributes, observation: Observation);

    fn finish_metric(&mut self);
}

/// Identifies the type of [`Observation`] reported by a [`Metric`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MetricKind {
    U64Counter,
    U64Gauge,
    F64Gauge,
    DurationHistogram,
}

/// A point-in-time value of a single recorder.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    U64Counter(u64),
    U64Gauge(u64),
    F64Gauge(f64),
    DurationHistogram(HistogramObservation),
}

/// A bucketed duration measurement.
///
/// Buckets are not cumulative: `count` is the number of values that fell
/// into this bucket alone.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HistogramObservation {
    /// The sum of all recorded durations.
    pub total: Duration,
    /// The number of recorded durations.
    pub sample_count: u64,
    /// Upper bucket bounds and per-bucket counts.
    pub buckets: Vec<ObservationBucket>,
}

/// A single histogram bucket: values `<= le` and greater than the previous
/// bucket's bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservationBucket {
    pub le: Duration,
    pub count: u64,
}

/// The value side of a [`Metric`]: something that yields an [`Observation`].
pub trait MetricObserver: Debug + Clone + Default + Send + Sync + 'static {
    fn kind() -> MetricKind;

    fn observe(&self) -> Observation;
}

/// A `Metric` maintains one observer per unique set of [`Attributes`] and
/// reports them all under a single name.
#[derive(Debug)]
pub struct Metric<T> {
    name: &'static str,
    description: &'static str,
    shared: std::sync::Arc<Mutex<BTreeMap<Attributes, T>>>,
}

impl<T> Clone for Metric<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            description: self.description,
            shared: std::sync::Arc::clone(&self.shared),
        }
    }
}

impl<T: MetricObserver> Metric<T> {
    fn new(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            shared: Default::default(),
        }
    }

    /// Get the recorder for the given set of attributes, creating it on
    /// first use. The returned value can be cached to avoid repeated
    /// attribute manipulation.
    pub fn recorder(&self, attributes: impl Into<Attributes>) -> T {
        self.shared
            .lock()
            .entry(attributes.into())
            .or_default()
            .clone()
    }
}

impl<T: MetricObserver> Instrument for Metric<T> {
    fn report(&self, reporter: &mut dyn Reporter) {
        reporter.start_metric(self.name, self.description, T::kind());
        for (attributes, observer) in self.shared.lock().iter() {
            reporter.report_observation(attributes, observer.observe());
        }
        reporter.finish_metric();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A set of key-value pairs with unique keys.
#[derive(Debug, Clone, Eq, PartialEq, PartialOrd, Ord, Hash, Default)]
pub struct Attributes(BTreeMap<&'static str, Cow<'static, str>>);

impl Attributes {
    pub fn iter(&self) -> std::collections::btree_map::Iter<'_, &'static str, Cow<'static, str>> {
        self.0.iter()
    }

    /// Set the given key, overriding it if already set.
    pub fn insert(&mut self, key: &'static str, value: impl Into<Cow<'static, str>>) {
        self.0.insert(key, value.into());
    }
}

impl<const N: usize> From<[(&'static str, &'static str); N]> for Attributes {
    fn from(pairs: [(&'static str, &'static str); N]) -> Self {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k, Cow::Borrowed(v)))
                .collect(),
        )
    }
}

impl<const N: usize> From<[(&'static str, Cow<'static, str>); N]> for Attributes {
    fn from(pairs: [(&'static str, Cow<'static, str>); N]) -> Self {
        Self(pairs.into_iter().collect())
    }
}

/// A set of observations collected from one metric.
#[derive(Debug, Clone)]
pub struct ObservationSet {
    pub metric_name: &'static str,
    pub description: &'static str,
    pub kind: MetricKind,
    pub observations: Vec<(Attributes, Observation)>,
}

impl ObservationSet {
    /// Returns the observation for the given attributes, if any.
    pub fn observation(&self, attributes: &Attributes) -> Option<&Observation> {
        self.observations
            .iter()
            .find_map(|(a, o)| (a == attributes).then_some(o))
    }
}

/// A [`Reporter`] that records the raw submitted data, for tests.
#[derive(Debug, Clone, Default)]
pub struct RawReporter {
    completed: Vec<ObservationSet>,
    in_progress: Option<ObservationSet>,
}

impl Reporter for RawReporter {
    fn start_metric(
        &mut self,
        metric_name: &'static str,
        description: &'static str,
        kind: MetricKind,
    ) {
        assert!(self.in_progress.is_none(), "metric already in progress");
        self.in_progress = Some(ObservationSet {
            metric_name,
            description,
            kind,
            observations: Default::default(),
        });
    }

    fn report_observation(&mut self, attributes: &Attributes, observation: Observation) {
        self.in_progress
            .as_mut()
            .expect("metric should be in progress")
            .observations
            .push((attributes.clone(), observation));
    }

    fn finish_metric(&mut self) {
        let metric = self
            .in_progress
            .take()
            .expect("metric should be in progress");
        self.completed.push(metric);
    }
}

impl RawReporter {
    /// Returns the recorded set for the given metric name, if any.
    pub fn metric(&self, metric_name: &str) -> Option<&ObservationSet> {
        assert!(self.in_progress.is_none(), "metric observation in progress");
        self.completed.iter().find(|s| s.metric_name == metric_name)
    }

    /// Returns one [`ObservationSet`] per reported metric.
    pub fn observations(&self) -> &Vec<ObservationSet> {
        assert!(self.in_progress.is_none(), "metric observation in progress");
        &self.completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_reuses_instruments() {
        let registry = Registry::new();
        let c1: Metric<U64Counter> = registry.register_metric("requests", "total requests");
        let c2: Metric<U64Counter> = registry.register_metric("requests", "total requests");

        c1.recorder([("status", "ok")]).inc(3);
        c2.recorder([("status", "ok")]).inc(2);

        assert_eq!(c1.recorder([("status", "ok")]).fetch(), 5);
    }

    #[test]
    #[should_panic(expected = "registered with two different types")]
    fn test_registry_type_mismatch() {
        let registry = Registry::new();
        let _: Metric<U64Counter> = registry.register_metric("requests", "total requests");
        let _: Metric<U64Gauge> = registry.register_metric("requests", "total requests");
    }

    #[test]
    fn test_report() {
        let registry = Registry::new();
        let counter: Metric<U64Counter> = registry.register_metric("zebras", "zebra count");
        let gauge: Metric<U64Gauge> = registry.register_metric("apples", "apple count");

        counter.recorder([("kind", "plains")]).inc(2);
        gauge.recorder([("kind", "gala")]).set(7);

        let mut reporter = RawReporter::default();
        registry.report(&mut reporter);

        // alphabetical order
        let names: Vec<_> = reporter
            .observations()
            .iter()
            .map(|s| s.metric_name)
            .collect();
        assert_eq!(names, vec!["apples", "zebras"]);

        let zebras = reporter.metric("zebras").unwrap();
        assert_eq!(zebras.kind, MetricKind::U64Counter);
        assert_eq!(
            zebras.observation(&Attributes::from([("kind", "plains")])),
            Some(&Observation::U64Counter(2))
        );
    }
}
