use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};

use gch_admission::{AdmissionError, AdmissionLimiter, AdmissionPermit};
use gch_cache::{CacheKey, FinderCache, LookupState, TtlClass, TtlPolicy, TtlSelection};
use gch_metric::{Registry, U64Counter};
use gch_time::{timestamp_truncate, TimeProvider};
use gch_types::{
    AliasedMetricMap, FinderResult, GatewayError, MultiTarget, Result, Target, TimeFrame,
};
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::{Finder, RequestContext};

/// The finder cache plus the policy that picks TTLs for it.
#[derive(Debug, Clone)]
pub struct FindCacheLayer {
    pub cache: FinderCache<FinderResult>,
    pub policy: TtlPolicy,
}

/// What one fan-out produced.
#[derive(Debug, Clone, Default)]
pub struct FanoutOutcome {
    /// Union of finder results, one aliased metric map per window.
    pub metric_maps: BTreeMap<TimeFrame, AliasedMetricMap>,
    /// Targets served from the cache.
    pub cached_targets: usize,
    /// True iff every target in every window came from the cache.
    pub all_cached: bool,
    /// Largest cache TTL involved, for the `X-Cached-Find` header.
    pub max_cache_ttl: Option<String>,
    /// Widest window seen, for downstream fetch routing.
    pub max_window: Duration,
    /// Total time spent waiting for admission.
    pub queue_duration: Duration,
}

impl FanoutOutcome {
    /// No metrics matched anything; the HTTP layer answers 404.
    pub fn is_empty(&self) -> bool {
        self.metric_maps.values().all(AliasedMetricMap::is_empty)
    }

    /// Total number of metrics across all windows.
    pub fn metrics_len(&self) -> usize {
        self.metric_maps.values().map(AliasedMetricMap::len).sum()
    }
}

#[derive(Debug, Clone)]
struct ClassCounters {
    hits: U64Counter,
    misses: U64Counter,
}

/// Splits one multi-target request into per-target finder lookups.
///
/// The planner spawns no throttling of its own; admission throttling is
/// entirely the limiter's business.
#[derive(Debug)]
pub struct FanoutPlanner {
    finder: Arc<dyn Finder>,
    cache: Option<FindCacheLayer>,
    time_provider: Arc<dyn TimeProvider>,
    /// Cap on any single admission wait; there is no reason to queue
    /// longer than the back-end index timeout.
    index_timeout: Duration,
    default_class: ClassCounters,
    short_class: ClassCounters,
}

/// Per-target scratch state for one request.
#[derive(Debug)]
struct TargetSlot {
    frame: TimeFrame,
    target: Target,
    selection: Option<TtlSelection>,
    key: Option<CacheKey>,
    /// Request time floored to the TTL, logged with every cache touch.
    /// The flooring collapses near-simultaneous requests onto one cache
    /// timestamp, which is what keeps the hit rate up under bursts.
    timestamp: i64,
    cached: bool,
}

/// Everything a fetch task needs to publish into the cache.
#[derive(Debug)]
struct SlotCache {
    cache: FinderCache<FinderResult>,
    key: CacheKey,
    selection: TtlSelection,
    counters: ClassCounters,
    timestamp: i64,
}

impl FanoutPlanner {
    pub fn new(
        finder: Arc<dyn Finder>,
        cache: Option<FindCacheLayer>,
        time_provider: Arc<dyn TimeProvider>,
        index_timeout: Duration,
        registry: &Registry,
    ) -> Self {
        let hits = registry.register_metric::<U64Counter>(
            "gch_find_cache_class_hits",
            "Cache hits per TTL class",
        );
        let misses = registry.register_metric::<U64Counter>(
            "gch_find_cache_class_misses",
            "Cache misses per TTL class",
        );
        let class = |class: TtlClass| ClassCounters {
            hits: hits.recorder([("ttl_class", class.name())]),
            misses: misses.recorder([("ttl_class", class.name())]),
        };
        Self {
            finder,
            cache,
            time_provider,
            index_timeout,
            default_class: class(TtlClass::Default),
            short_class: class(TtlClass::Short),
        }
    }

    fn class_counters(&self, class: TtlClass) -> &ClassCounters {
        match class {
            TtlClass::Default => &self.default_class,
            TtlClass::Short => &self.short_class,
        }
    }

    /// Run both passes and merge.
    ///
    /// One finder failure fails the whole request; when several targets
    /// fail the error of the lowest-index target wins, deterministically.
    pub async fn plan(
        &self,
        ctx: &RequestContext,
        multi: &MultiTarget,
        no_cache: bool,
        limiter: &Arc<dyn AdmissionLimiter>,
    ) -> Result<FanoutOutcome> {
        let mut slots: Vec<TargetSlot> = multi
            .iter()
            .flat_map(|(frame, targets)| {
                targets.iter().map(|target| TargetSlot {
                    frame: *frame,
                    target: target.clone(),
                    selection: None,
                    key: None,
                    timestamp: 0,
                    cached: false,
                })
            })
            .collect();

        let maps: Arc<Mutex<BTreeMap<TimeFrame, AliasedMetricMap>>> = Default::default();
        let layer = match (&self.cache, no_cache) {
            (Some(layer), false) if layer.policy.enabled() => Some(layer),
            _ => None,
        };

        let mut max_cache_ttl: Option<TtlSelection> = None;
        if let Some(layer) = layer {
            self.cache_pass(layer, &mut slots, &maps, &mut max_cache_ttl);
        }

        let max_window = slots
            .iter()
            .map(|slot| slot.frame.width())
            .max()
            .unwrap_or_default();

        let queue_duration = self.fetch_pass(ctx, layer, &slots, &maps, limiter).await?;

        let cached_targets = slots.iter().filter(|slot| slot.cached).count();
        let metric_maps = std::mem::take(&mut *maps.lock());
        Ok(FanoutOutcome {
            metric_maps,
            cached_targets,
            all_cached: !slots.is_empty() && cached_targets == slots.len(),
            max_cache_ttl: max_cache_ttl.map(|selection| selection.label),
            max_window,
            queue_duration,
        })
    }

    /// Read-only cache pass: pick TTLs, derive keys and merge whatever is
    /// already published. Never blocks and never reserves.
    fn cache_pass(
        &self,
        layer: &FindCacheLayer,
        slots: &mut [TargetSlot],
        maps: &Mutex<BTreeMap<TimeFrame, AliasedMetricMap>>,
        max_cache_ttl: &mut Option<TtlSelection>,
    ) {
        let now = self.time_provider.now();
        for slot in slots.iter_mut() {
            let selection = layer.policy.select(now, &slot.frame);
            if !selection.enabled() {
                continue;
            }
            let key = CacheKey::new(&slot.frame, &slot.target, &selection.label);
            slot.timestamp = timestamp_truncate(now.timestamp(), selection.ttl());

            if max_cache_ttl
                .as_ref()
                .map(|best| best.seconds < selection.seconds)
                .unwrap_or(true)
            {
                *max_cache_ttl = Some(selection.clone());
            }

            if let Some(result) = layer.cache.peek(&key) {
                self.class_counters(selection.class).hits.inc(1);
                let mut maps = maps.lock();
                let map = maps.entry(slot.frame).or_default();
                map.merge_target(&result, &slot.target);
                info!(
                    get_cache = %key,
                    timestamp_cached = slot.timestamp,
                    ttl = %selection.label,
                    from = slot.frame.from(),
                    until = slot.frame.until(),
                    metrics = map.len(),
                    find_cached = true,
                    "finder"
                );
                slot.cached = true;
            }

            slot.selection = Some(selection);
            slot.key = Some(key);
        }
    }

    /// Fetch pass: admission, finder calls, cache publication.
    async fn fetch_pass(
        &self,
        ctx: &RequestContext,
        layer: Option<&FindCacheLayer>,
        slots: &[TargetSlot],
        maps: &Arc<Mutex<BTreeMap<TimeFrame, AliasedMetricMap>>>,
        limiter: &Arc<dyn AdmissionLimiter>,
    ) -> Result<Duration> {
        let errors: Arc<Mutex<Vec<(usize, GatewayError)>>> = Default::default();
        let mut queue_duration = Duration::ZERO;
        let mut join = JoinSet::new();

        // A refused admission abandons the remaining targets of its own
        // window only; the windows after it are still attempted.
        let mut start = 0;
        while start < slots.len() {
            let frame = slots[start].frame;
            let end = slots[start..]
                .iter()
                .position(|slot| slot.frame != frame)
                .map(|offset| start + offset)
                .unwrap_or(slots.len());

            for index in start..end {
                let slot = &slots[index];
                if slot.cached {
                    continue;
                }

                let permit = if limiter.enabled() {
                    let queued_at = Instant::now();
                    let entered = limiter.enter(self.index_timeout, ctx.cancel()).await;
                    queue_duration += queued_at.elapsed();
                    match entered {
                        Ok(permit) => permit,
                        Err(err) => {
                            errors.lock().push((index, admission_error(err)));
                            break;
                        }
                    }
                } else {
                    AdmissionPermit::unlimited()
                };

                let finder = Arc::clone(&self.finder);
                let ctx = ctx.clone();
                let frame = slot.frame;
                let target = slot.target.clone();
                let cache_slot = match (layer, &slot.selection, &slot.key) {
                    (Some(layer), Some(selection), Some(key)) if selection.enabled() => {
                        Some(SlotCache {
                            cache: layer.cache.clone(),
                            key: key.clone(),
                            selection: selection.clone(),
                            counters: self.class_counters(selection.class).clone(),
                            timestamp: slot.timestamp,
                        })
                    }
                    _ => None,
                };
                let maps = Arc::clone(maps);
                let errors = Arc::clone(&errors);

                join.spawn(async move {
                    let _permit = permit;

                    let reserved = match cache_slot {
                        Some(slot_cache) => {
                            match slot_cache.cache.lookup_or_reserve(slot_cache.key.clone()).await {
                                LookupState::HitReady(result) => {
                                    // a concurrent request published while we
                                    // were queueing; no back-end call needed
                                    slot_cache.counters.hits.inc(1);
                                    let mut maps = maps.lock();
                                    maps.entry(frame).or_default().merge_target(&result, &target);
                                    return;
                                }
                                LookupState::MissReserved(token) => Some((token, slot_cache)),
                            }
                        }
                        None => None,
                    };

                    match finder.find(&ctx, &target, frame).await {
                        Ok((result, stat)) => {
                            let metrics_len = {
                                let mut maps = maps.lock();
                                let map = maps.entry(frame).or_default();
                                map.merge_target(&result, &target);
                                map.len()
                            };
                            if let Some((token, slot_cache)) = reserved {
                                slot_cache.counters.misses.inc(1);
                                info!(
                                    set_cache = %token.key(),
                                    timestamp_cached = slot_cache.timestamp,
                                    ttl = %slot_cache.selection.label,
                                    from = frame.from(),
                                    until = frame.until(),
                                    metrics = metrics_len,
                                    find_cached = false,
                                    "finder"
                                );
                                token.publish(result, slot_cache.selection.ttl());
                            }
                            info!(
                                table = %stat.table,
                                read_rows = stat.read_rows,
                                read_bytes = stat.read_bytes,
                                metrics = metrics_len,
                                "find"
                            );
                        }
                        Err(err) => {
                            // the token, if any, drops here and abandons the
                            // reservation so the next request can retry
                            error!(pattern = %target, error = %err, "find");
                            errors.lock().push((index, err));
                        }
                    }
                });
            }

            start = end;
        }

        while let Some(joined) = join.join_next().await {
            joined.expect("finder fan-out task panicked");
        }

        if limiter.enabled() {
            limiter.send_duration(queue_duration);
        }

        let mut errors = errors.lock();
        errors.sort_by_key(|(index, _)| *index);
        match errors.first() {
            Some((_, err)) => Err(err.clone()),
            None => Ok(queue_duration),
        }
    }
}

fn admission_error(err: AdmissionError) -> GatewayError {
    match err {
        AdmissionError::Overflow => GatewayError::LimiterOverflow,
        AdmissionError::Timeout => GatewayError::LimiterTimeout,
        AdmissionError::Canceled => GatewayError::Canceled,
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use gch_admission::{
        build_limiter, AdmissionMetrics, ConcurrencyLimits, FixedLimiter, NoopLimiter,
    };
    use gch_time::{MockProvider, Time};
    use gch_types::{FinderMatch, FinderStat};
    use tokio_util::sync::CancellationToken;

    use super::*;

    #[derive(Debug, Default)]
    struct MockFinder {
        calls: AtomicUsize,
        delay: Duration,
        results: Mutex<HashMap<String, Result<FinderResult>>>,
    }

    impl MockFinder {
        fn with(self, pattern: &str, result: Result<FinderResult>) -> Self {
            self.results.lock().insert(pattern.to_string(), result);
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Finder for MockFinder {
        async fn find(
            &self,
            _ctx: &RequestContext,
            target: &Target,
            _frame: TimeFrame,
        ) -> Result<(FinderResult, FinderStat)> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let result = self
                .results
                .lock()
                .get(target.pattern())
                .cloned()
                .unwrap_or_else(|| Ok(FinderResult::default()));
            result.map(|r| (r, FinderStat::default()))
        }
    }

    fn leaves(paths: &[&str]) -> FinderResult {
        FinderResult::new(paths.iter().map(|p| FinderMatch::leaf(*p)).collect())
    }

    fn layer_at(ts: i64) -> (FindCacheLayer, Arc<MockProvider>, Registry) {
        let provider = Arc::new(MockProvider::new(Time::from_timestamp(ts)));
        let registry = Registry::new();
        let layer = FindCacheLayer {
            cache: FinderCache::new(Arc::clone(&provider) as _, &registry),
            policy: TtlPolicy::new(60, 0, Duration::ZERO, Duration::ZERO),
        };
        (layer, provider, registry)
    }

    fn planner(
        finder: Arc<dyn Finder>,
        cache: Option<FindCacheLayer>,
        provider: Arc<MockProvider>,
        registry: &Registry,
    ) -> FanoutPlanner {
        FanoutPlanner::new(
            finder,
            cache,
            provider as _,
            Duration::from_secs(60),
            registry,
        )
    }

    fn render_request(targets: &[&str]) -> MultiTarget {
        // 2024-01-01T00:00:00Z .. 2024-01-02T00:00:00Z
        let frame = TimeFrame::new(1704067200, 1704153600).unwrap();
        let mut multi = MultiTarget::new();
        for target in targets {
            multi.push(frame, Target::new(*target));
        }
        multi
    }

    fn noop_limiter() -> Arc<dyn AdmissionLimiter> {
        Arc::new(NoopLimiter)
    }

    #[tokio::test]
    async fn test_cache_hit_answers_without_finder() {
        let (layer, provider, registry) = layer_at(1704200000);

        // pre-populate the entry for `a.b.*` under the 60 s default TTL
        let frame = TimeFrame::new(1704067200, 1704153600).unwrap();
        let key = CacheKey::new(&frame, &Target::new("a.b.*"), "60");
        match layer.cache.lookup_or_reserve(key).await {
            LookupState::MissReserved(token) => {
                token.publish(leaves(&["a.b.x", "a.b.y"]), Duration::from_secs(60))
            }
            other => panic!("expected miss, got {other:?}"),
        }

        let finder = Arc::new(MockFinder::default());
        let planner = planner(
            Arc::clone(&finder) as _,
            Some(layer.clone()),
            provider,
            &registry,
        );

        let ctx = RequestContext::new(None);
        let outcome = planner
            .plan(&ctx, &render_request(&["a.b.*"]), false, &noop_limiter())
            .await
            .unwrap();

        assert_eq!(finder.calls(), 0);
        assert!(outcome.all_cached);
        assert_eq!(outcome.cached_targets, 1);
        assert_eq!(outcome.max_cache_ttl.as_deref(), Some("60"));
        assert_eq!(outcome.metrics_len(), 2);
        let map = outcome.metric_maps.values().next().unwrap();
        assert_eq!(map.metrics().collect::<Vec<_>>(), vec!["a.b.x", "a.b.y"]);
        assert_eq!(layer.cache.hits(), 1);

        let headers = crate::response_headers(&ctx, &outcome);
        assert!(headers.contains(&(crate::CACHED_FIND_HEADER, "60".to_string())));
    }

    #[tokio::test]
    async fn test_fetch_publishes_into_cache() {
        let (layer, provider, registry) = layer_at(1704200000);
        let finder =
            Arc::new(MockFinder::default().with("a.b.*", Ok(leaves(&["a.b.x", "a.b.y"]))));
        let planner = planner(
            Arc::clone(&finder) as _,
            Some(layer.clone()),
            provider,
            &registry,
        );

        let ctx = RequestContext::new(None);
        let outcome = planner
            .plan(&ctx, &render_request(&["a.b.*"]), false, &noop_limiter())
            .await
            .unwrap();

        assert_eq!(finder.calls(), 1);
        assert!(!outcome.all_cached);
        assert_eq!(outcome.metrics_len(), 2);
        assert_eq!(layer.cache.size(), 1);

        // the second identical request is a pure cache hit
        let outcome = planner
            .plan(&ctx, &render_request(&["a.b.*"]), false, &noop_limiter())
            .await
            .unwrap();
        assert_eq!(finder.calls(), 1);
        assert!(outcome.all_cached);
    }

    #[tokio::test]
    async fn test_concurrent_plans_share_one_finder_call() {
        let (layer, provider, registry) = layer_at(1704200000);
        let finder = Arc::new(
            MockFinder {
                delay: Duration::from_millis(50),
                ..Default::default()
            }
            .with("a.b.*", Ok(leaves(&["a.b.x"]))),
        );
        let planner = Arc::new(planner(
            Arc::clone(&finder) as _,
            Some(layer.clone()),
            provider,
            &registry,
        ));

        let plans: Vec<_> = (0..10)
            .map(|_| {
                let planner = Arc::clone(&planner);
                tokio::spawn(async move {
                    let ctx = RequestContext::new(None);
                    planner
                        .plan(&ctx, &render_request(&["a.b.*"]), false, &noop_limiter())
                        .await
                })
            })
            .collect();

        for plan in plans {
            let outcome = plan.await.unwrap().unwrap();
            assert_eq!(outcome.metrics_len(), 1);
        }

        // singleflight: ten concurrent fan-outs, one back-end call
        assert_eq!(finder.calls(), 1);
    }

    #[tokio::test]
    async fn test_first_error_by_target_index_wins() {
        let (layer, provider, registry) = layer_at(1704200000);
        let finder = Arc::new(
            MockFinder::default()
                .with("a.*", Err(GatewayError::backend(500, "Code: 170, boom")))
                .with("b.*", Err(GatewayError::BackendProtocol("bad frame".into()))),
        );
        let planner = planner(Arc::clone(&finder) as _, Some(layer), provider, &registry);

        let ctx = RequestContext::new(None);
        let err = planner
            .plan(&ctx, &render_request(&["a.*", "b.*"]), false, &noop_limiter())
            .await
            .unwrap_err();

        assert_eq!(err, GatewayError::backend(500, "Code: 170, boom"));
    }

    #[tokio::test]
    async fn test_failed_producer_does_not_poison_cache() {
        let (layer, provider, registry) = layer_at(1704200000);
        let finder = Arc::new(
            MockFinder::default().with("a.*", Err(GatewayError::BackendProtocol("boom".into()))),
        );
        let planner = planner(
            Arc::clone(&finder) as _,
            Some(layer.clone()),
            provider,
            &registry,
        );

        let ctx = RequestContext::new(None);
        planner
            .plan(&ctx, &render_request(&["a.*"]), false, &noop_limiter())
            .await
            .unwrap_err();

        // the reservation was abandoned: a retry reserves afresh and a
        // healthy finder result gets cached
        finder.results.lock().insert(
            "a.*".to_string(),
            Ok(leaves(&["a.x"])),
        );
        let outcome = planner
            .plan(&ctx, &render_request(&["a.*"]), false, &noop_limiter())
            .await
            .unwrap();
        assert_eq!(outcome.metrics_len(), 1);
        assert_eq!(layer.cache.size(), 1);
    }

    #[tokio::test]
    async fn test_no_cache_flag_bypasses_cache() {
        let (layer, provider, registry) = layer_at(1704200000);
        let finder = Arc::new(MockFinder::default().with("a.*", Ok(leaves(&["a.x"]))));
        let planner = planner(
            Arc::clone(&finder) as _,
            Some(layer.clone()),
            provider,
            &registry,
        );

        let ctx = RequestContext::new(None);
        let outcome = planner
            .plan(&ctx, &render_request(&["a.*"]), true, &noop_limiter())
            .await
            .unwrap();

        assert_eq!(finder.calls(), 1);
        assert!(!outcome.all_cached);
        assert_eq!(outcome.max_cache_ttl, None);
        // nothing was published
        assert_eq!(layer.cache.size(), 0);
    }

    #[tokio::test]
    async fn test_empty_outcome() {
        let (layer, provider, registry) = layer_at(1704200000);
        let finder = Arc::new(MockFinder::default());
        let planner = planner(Arc::clone(&finder) as _, Some(layer), provider, &registry);

        let ctx = RequestContext::new(None);
        let outcome = planner
            .plan(&ctx, &render_request(&["nothing.here.*"]), false, &noop_limiter())
            .await
            .unwrap();
        assert!(outcome.is_empty());
    }

    #[tokio::test]
    async fn test_limiter_overflow_fails_request() {
        let (layer, provider, registry) = layer_at(1704200000);
        let finder = Arc::new(MockFinder::default().with("a.*", Ok(leaves(&["a.x"]))));
        let planner = planner(Arc::clone(&finder) as _, Some(layer), provider, &registry);

        let limiter: Arc<dyn AdmissionLimiter> =
            Arc::new(FixedLimiter::new(1, 1, AdmissionMetrics::new_unregistered()));

        // saturate the hard cap from outside the request
        let cancel = CancellationToken::new();
        let _held = limiter
            .enter(Duration::from_secs(1), &cancel)
            .await
            .unwrap();

        let ctx = RequestContext::new(None);
        let err = planner
            .plan(&ctx, &render_request(&["a.*"]), false, &limiter)
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::LimiterOverflow);
        assert!(err.is_queue_fail());
    }

    #[tokio::test]
    async fn test_cancellation_aborts_admission() {
        let (layer, provider, registry) = layer_at(1704200000);
        let finder = Arc::new(MockFinder::default().with("a.*", Ok(leaves(&["a.x"]))));
        let planner = planner(Arc::clone(&finder) as _, Some(layer), provider, &registry);

        let registry = Registry::new();
        let limiter = build_limiter(
            ConcurrencyLimits {
                max_queries: 4,
                concurrent_queries: 2,
                adaptive_queries: 0,
            },
            [("limiter", "render")],
            &registry,
            None,
        );

        let ctx = RequestContext::new(None);
        ctx.cancel().cancel();
        let err = planner
            .plan(&ctx, &render_request(&["a.*"]), false, &limiter)
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::Canceled);
    }

    /// Refuses the first `failures` admissions, then admits everything.
    #[derive(Debug)]
    struct FlakyLimiter {
        failures: AtomicUsize,
    }

    #[async_trait]
    impl AdmissionLimiter for FlakyLimiter {
        async fn enter(
            &self,
            _queue_timeout: Duration,
            _cancel: &CancellationToken,
        ) -> Result<AdmissionPermit, AdmissionError> {
            let refused = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refused {
                Err(AdmissionError::Overflow)
            } else {
                Ok(AdmissionPermit::unlimited())
            }
        }

        fn enabled(&self) -> bool {
            true
        }

        fn send_duration(&self, _elapsed: Duration) {}
    }

    #[tokio::test]
    async fn test_admission_failure_skips_only_its_window() {
        let (layer, provider, registry) = layer_at(1704300000);
        let finder = Arc::new(
            MockFinder::default()
                .with("a.*", Ok(leaves(&["a.x"])))
                .with("b.*", Ok(leaves(&["b.x"])))
                .with("c.*", Ok(leaves(&["c.x"]))),
        );
        let planner = planner(
            Arc::clone(&finder) as _,
            Some(layer.clone()),
            provider,
            &registry,
        );

        let frame_a = TimeFrame::new(1704067200, 1704153600).unwrap();
        let frame_b = TimeFrame::new(1704153600, 1704240000).unwrap();
        let mut multi = MultiTarget::new();
        multi.push(frame_a, Target::new("a.*"));
        multi.push(frame_a, Target::new("b.*"));
        multi.push(frame_b, Target::new("c.*"));

        // the first window's first target is refused admission
        let limiter: Arc<dyn AdmissionLimiter> = Arc::new(FlakyLimiter {
            failures: AtomicUsize::new(1),
        });

        let ctx = RequestContext::new(None);
        let err = planner.plan(&ctx, &multi, false, &limiter).await.unwrap_err();
        assert_eq!(err, GatewayError::LimiterOverflow);

        // the refusal abandoned the rest of the first window, but the
        // second window was still fetched and published into the cache
        assert_eq!(finder.calls(), 1);
        let key = CacheKey::new(&frame_b, &Target::new("c.*"), "60");
        assert_eq!(layer.cache.peek(&key), Some(leaves(&["c.x"])));
        let key = CacheKey::new(&frame_a, &Target::new("b.*"), "60");
        assert_eq!(layer.cache.peek(&key), None);
    }

    #[tokio::test]
    async fn test_mixed_cached_and_fetched() {
        let (layer, provider, registry) = layer_at(1704200000);

        let frame = TimeFrame::new(1704067200, 1704153600).unwrap();
        let key = CacheKey::new(&frame, &Target::new("a.*"), "60");
        match layer.cache.lookup_or_reserve(key).await {
            LookupState::MissReserved(token) => {
                token.publish(leaves(&["a.x"]), Duration::from_secs(60))
            }
            other => panic!("expected miss, got {other:?}"),
        }

        let finder = Arc::new(MockFinder::default().with("b.*", Ok(leaves(&["b.y"]))));
        let planner = planner(
            Arc::clone(&finder) as _,
            Some(layer),
            provider,
            &registry,
        );

        let ctx = RequestContext::new(None);
        let outcome = planner
            .plan(&ctx, &render_request(&["a.*", "b.*"]), false, &noop_limiter())
            .await
            .unwrap();

        assert_eq!(finder.calls(), 1);
        assert_eq!(outcome.cached_targets, 1);
        assert!(!outcome.all_cached);
        assert_eq!(outcome.metrics_len(), 2);
    }
}
