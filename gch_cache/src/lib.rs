//! TTL-bounded finder-result cache with per-entry singleflight.
//!
//! Finder queries are heavy; under a thundering herd of identical requests
//! every concurrent caller would otherwise hit the back-end. The cache
//! hands exactly one caller per key a [`ProducerToken`] and parks everyone
//! else on the entry until that producer publishes or abandons.
//!
//! # Concurrency
//!
//! The entry map is sharded; a shard lock is only ever held for map
//! manipulation and is released before blocking on an entry, so lookups of
//! distinct keys never serialize behind a slow producer.
//!
//! # Cancellation
//!
//! Dropping an unused [`ProducerToken`] abandons the reservation: the key
//! is removed and the next caller retries. Producers therefore cannot
//! poison the cache by erroring or being cancelled.

mod cache;
mod key;
mod ttl;

pub use cache::{FinderCache, LookupState, ProducerToken};
pub use key::CacheKey;
pub use ttl::{TtlClass, TtlPolicy, TtlSelection};
