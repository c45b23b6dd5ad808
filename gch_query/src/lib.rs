//! Duration-tier routing and finder fan-out planning.
//!
//! The render path turns one multi-target request into per-target finder
//! lookups: a read-only cache pass first, then a limited fetch pass that
//! goes to the back-end under admission control, merging everything into
//! the per-window aliased metric maps.

mod clickhouse;
mod ctx;
mod finder;
mod headers;
mod planner;
mod route;

pub use clickhouse::{
    ellipsize_sql, format_sql, parse_summary, BackendClient, BackendOptions, BackendResponse,
    QuerySummary, CLICKHOUSE_PROGRESS_HEADER, CLICKHOUSE_QUERY_ID_HEADER,
    CLICKHOUSE_SUMMARY_HEADER,
};
pub use ctx::RequestContext;
pub use finder::Finder;
pub use headers::{response_headers, CACHED_FIND_HEADER, REQUEST_ID_HEADER};
pub use planner::{FanoutOutcome, FanoutPlanner, FindCacheLayer};
pub use route::{QueryTier, TierTable, TierTableError};
