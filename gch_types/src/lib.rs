//! Shared data types for the gateway core.
//!
//! The request-side model (time frames, targets), the finder-side model
//! (matches and per-query stats), the per-request aliased metric map the
//! fan-out planner merges into, and the error taxonomy the HTTP layer maps
//! to response statuses.

mod amm;
mod error;
mod finder;
mod target;
mod timeframe;

pub use amm::{Alias, AliasedMetricMap};
pub use error::{GatewayError, NetworkKind, Result};
pub use finder::{FinderMatch, FinderResult, FinderStat};
pub use target::{MultiTarget, Target, TargetKind};
pub use timeframe::TimeFrame;
