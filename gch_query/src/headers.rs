use crate::{FanoutOutcome, RequestContext};

/// Set when at least one target was served from the finder cache; the
/// value is the largest cache TTL involved, in seconds.
pub const CACHED_FIND_HEADER: &str = "X-Cached-Find";

/// Echoes the request id assigned by the gateway.
pub const REQUEST_ID_HEADER: &str = "X-Gch-Request-Id";

/// The cache-observability headers for one finished fan-out.
pub fn response_headers(
    ctx: &RequestContext,
    outcome: &FanoutOutcome,
) -> Vec<(&'static str, String)> {
    let mut headers = vec![(REQUEST_ID_HEADER, ctx.request_id().to_string())];
    if outcome.cached_targets > 0 {
        if let Some(ttl) = &outcome.max_cache_ttl {
            headers.push((CACHED_FIND_HEADER, ttl.clone()));
        }
    }
    headers
}
