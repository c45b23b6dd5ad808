/// One metric-namespace node matched by a finder query.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct FinderMatch {
    /// Concrete metric path, e.g. `a.b.x`.
    pub path: String,
    /// Leaf nodes carry series data; branches only have children.
    pub is_leaf: bool,
}

impl FinderMatch {
    pub fn leaf(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            is_leaf: true,
        }
    }

    pub fn branch(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            is_leaf: false,
        }
    }
}

/// The ordered set of matches produced by one finder call.
///
/// Opaque to the cache; the planner merges it into the per-request
/// [`AliasedMetricMap`](crate::AliasedMetricMap).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinderResult {
    matches: Vec<FinderMatch>,
}

impl FinderResult {
    /// Builds a result, sorting by path and dropping duplicates.
    pub fn new(mut matches: Vec<FinderMatch>) -> Self {
        matches.sort();
        matches.dedup_by(|a, b| a.path == b.path);
        Self { matches }
    }

    pub fn matches(&self) -> &[FinderMatch] {
        &self.matches
    }

    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }
}

/// Per-query back-end accounting, used only for metric emission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinderStat {
    /// Back-end table the query ran against.
    pub table: String,
    /// Bytes read by the back-end, `-1` when unreported.
    pub read_bytes: i64,
    /// Rows scanned by the back-end, `-1` when unreported.
    pub read_rows: i64,
}
