use async_trait::async_trait;

use gch_types::{FinderResult, FinderStat, Result, Target, TimeFrame};

use crate::RequestContext;

/// The external collaborator that resolves a target pattern to concrete
/// metric names.
///
/// Implementations translate the pattern into an index or tagged-table
/// query against the analytic back-end; the planner only cares about the
/// matches and the accounting.
#[async_trait]
pub trait Finder: std::fmt::Debug + Send + Sync + 'static {
    /// Resolve `target` within the window. Implementations must observe
    /// `ctx`'s cancellation.
    async fn find(
        &self,
        ctx: &RequestContext,
        target: &Target,
        frame: TimeFrame,
    ) -> Result<(FinderResult, FinderStat)>;
}
