use std::{
    collections::HashMap,
    fmt::Debug,
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use gch_metric::{Registry, U64Counter, U64Gauge};
use gch_time::TimeProvider;
use parking_lot::Mutex;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};

use crate::CacheKey;

/// Shard count for the entry map. Lookups of distinct keys only contend
/// when they land on the same stripe.
const SHARDS: usize = 16;

/// State guarded by the per-entry lock.
#[derive(Debug)]
struct EntryState<V> {
    result: Option<V>,
}

/// One cache slot.
///
/// The producer holds the write half of `state` from reservation until
/// publish or abandon; readers take the read half and therefore observe
/// `result` only after the producer released it. `ready` and `expire_at`
/// live outside the lock so the sweeper can inspect entries without
/// touching in-flight producers.
#[derive(Debug)]
struct CacheEntry<V> {
    state: Arc<RwLock<EntryState<V>>>,
    ready: AtomicBool,
    expire_at: AtomicI64,
}

impl<V> CacheEntry<V> {
    fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(EntryState { result: None })),
            ready: AtomicBool::new(false),
            expire_at: AtomicI64::new(0),
        }
    }
}

/// Outcome of [`FinderCache::lookup_or_reserve`].
#[derive(Debug)]
pub enum LookupState<V>
where
    V: Clone + Debug + Send + Sync + 'static,
{
    /// The entry was published and still live; here is the payload.
    HitReady(V),
    /// The key was absent. The caller now holds exclusive write rights
    /// and must either publish or abandon.
    MissReserved(ProducerToken<V>),
}

/// Exclusive write rights for one reserved cache entry.
///
/// Consumed by [`publish`](Self::publish) or [`abandon`](Self::abandon);
/// publishing an already-consumed token is therefore unrepresentable.
/// Dropping the token without consuming it abandons the reservation, so a
/// cancelled producer leaves no reserved, unpublished entry behind.
pub struct ProducerToken<V>
where
    V: Clone + Debug + Send + Sync + 'static,
{
    key: CacheKey,
    entry: Arc<CacheEntry<V>>,
    guard: OwnedRwLockWriteGuard<EntryState<V>>,
    shared: Arc<CacheShared<V>>,
    consumed: bool,
}

impl<V> Debug for ProducerToken<V>
where
    V: Clone + Debug + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerToken")
            .field("key", &self.key)
            .field("consumed", &self.consumed)
            .finish_non_exhaustive()
    }
}

impl<V> ProducerToken<V>
where
    V: Clone + Debug + Send + Sync + 'static,
{
    /// Atomically store the result, mark the entry live for `ttl`, and
    /// wake all waiters.
    pub fn publish(mut self, result: V, ttl: Duration) {
        self.consumed = true;

        let expire_at = self.shared.time_provider.now().timestamp() + ttl.as_secs() as i64;
        self.guard.result = Some(result);
        self.entry.expire_at.store(expire_at, Ordering::Release);
        self.entry.ready.store(true, Ordering::Release);

        // Size accounting only while this entry is still the mapped one;
        // a sweep may already have detached it, in which case waiters on
        // the old entry still get the payload but the map is not touched.
        let shard = self.shared.shard(&self.key);
        let entries = shard.lock();
        if let Some(current) = entries.get(&self.key) {
            if Arc::ptr_eq(current, &self.entry) {
                self.shared.size.inc(1);
            }
        }
        // entry write guard drops here, releasing the waiters
    }

    /// Release the reservation without publishing; the key is removed so
    /// the next caller retries.
    pub fn abandon(mut self) {
        self.consumed = true;
        self.shared.remove_if_current(&self.key, &self.entry);
    }

    /// The key this token reserves, for logging.
    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

impl<V> Drop for ProducerToken<V>
where
    V: Clone + Debug + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if !self.consumed {
            self.shared.remove_if_current(&self.key, &self.entry);
        }
    }
}

type Shard<V> = Mutex<HashMap<CacheKey, Arc<CacheEntry<V>>>>;

#[derive(Debug)]
struct CacheShared<V> {
    shards: Vec<Shard<V>>,
    time_provider: Arc<dyn TimeProvider>,
    hits: U64Counter,
    misses: U64Counter,
    size: U64Gauge,
}

impl<V> CacheShared<V> {
    fn shard(&self, key: &CacheKey) -> &Shard<V> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % SHARDS]
    }

    fn remove_if_current(&self, key: &CacheKey, entry: &Arc<CacheEntry<V>>) {
        let mut entries = self.shard(key).lock();
        if let Some(current) = entries.get(key) {
            if Arc::ptr_eq(current, entry) {
                entries.remove(key);
            }
        }
    }
}

/// Keyed, sharded, TTL-bounded memoizer for finder results.
///
/// Cheaply cloneable; all clones share the same entries.
#[derive(Debug)]
pub struct FinderCache<V>
where
    V: Clone + Debug + Send + Sync + 'static,
{
    shared: Arc<CacheShared<V>>,
}

impl<V> Clone for FinderCache<V>
where
    V: Clone + Debug + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<V> FinderCache<V>
where
    V: Clone + Debug + Send + Sync + 'static,
{
    pub fn new(time_provider: Arc<dyn TimeProvider>, registry: &Registry) -> Self {
        let hits = registry
            .register_metric::<U64Counter>(
                "gch_find_cache_hits",
                "Number of finder lookups answered from the cache",
            )
            .recorder([("cache", "find")]);
        let misses = registry
            .register_metric::<U64Counter>(
                "gch_find_cache_misses",
                "Number of finder lookups that reserved a fresh entry",
            )
            .recorder([("cache", "find")]);
        let size = registry
            .register_metric::<U64Gauge>(
                "gch_find_cache_size",
                "Number of entries in the finder cache",
            )
            .recorder([("cache", "find")]);

        Self {
            shared: Arc::new(CacheShared {
                shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
                time_provider,
                hits,
                misses,
                size,
            }),
        }
    }

    /// Return the published payload for `key`, or reserve the key for the
    /// caller.
    ///
    /// If another caller holds the reservation this blocks on the entry
    /// until it publishes (then returns the payload) or abandons (then
    /// the race for the fresh reservation restarts). Callers are expected
    /// to bound the call with their request deadline.
    pub async fn lookup_or_reserve(&self, key: CacheKey) -> LookupState<V> {
        loop {
            let (entry, reservation) = {
                let mut entries = self.shared.shard(&key).lock();
                match entries.entry(key.clone()) {
                    std::collections::hash_map::Entry::Occupied(occupied) => {
                        (Arc::clone(occupied.get()), None)
                    }
                    std::collections::hash_map::Entry::Vacant(vacant) => {
                        let entry = Arc::new(CacheEntry::new());
                        let guard = Arc::clone(&entry.state)
                            .try_write_owned()
                            .expect("fresh entry lock is uncontended");
                        vacant.insert(Arc::clone(&entry));
                        (entry, Some(guard))
                    }
                }
            };

            if let Some(guard) = reservation {
                self.shared.misses.inc(1);
                return LookupState::MissReserved(ProducerToken {
                    key,
                    entry,
                    guard,
                    shared: Arc::clone(&self.shared),
                    consumed: false,
                });
            }

            // Existing entry: wait for the producer without holding the
            // shard lock.
            let state = entry.state.read().await;
            if entry.ready.load(Ordering::Acquire) {
                if let Some(result) = state.result.as_ref() {
                    self.shared.hits.inc(1);
                    return LookupState::HitReady(result.clone());
                }
            }
            // The producer abandoned; the key was removed. Retry for a
            // fresh reservation.
        }
    }

    /// Non-blocking, read-only lookup.
    ///
    /// Returns the payload only if the entry is published; an absent key
    /// or an in-flight producer yields `None` without reserving anything
    /// and without touching the miss counter. This is what the planner's
    /// read-only cache pass uses, so that pass never blocks a concurrent
    /// request.
    pub fn peek(&self, key: &CacheKey) -> Option<V> {
        let entry = self.shared.shard(key).lock().get(key).map(Arc::clone)?;
        if !entry.ready.load(Ordering::Acquire) {
            return None;
        }
        let state = entry.state.try_read().ok()?;
        let result = state.result.as_ref()?.clone();
        self.shared.hits.inc(1);
        Some(result)
    }

    /// Remove every entry that expired before now. Entries still being
    /// produced are left alone.
    pub fn sweep(&self) {
        let now = self.shared.time_provider.now().timestamp();
        let mut remaining = 0usize;
        for shard in &self.shared.shards {
            let mut entries = shard.lock();
            entries.retain(|_, entry| {
                !(entry.ready.load(Ordering::Acquire)
                    && entry.expire_at.load(Ordering::Acquire) < now)
            });
            remaining += entries.len();
        }
        self.shared.size.set(remaining as u64);
    }

    /// Spawn the periodic sweeper.
    pub fn start_sweeper(&self, period: Duration) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                cache.sweep();
            }
        })
    }

    pub fn hits(&self) -> u64 {
        self.shared.hits.fetch()
    }

    pub fn misses(&self) -> u64 {
        self.shared.misses.fetch()
    }

    /// Number of published entries, as of the last publish/sweep.
    pub fn size(&self) -> u64 {
        self.shared.size.fetch()
    }
}
