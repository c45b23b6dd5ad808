use std::collections::BTreeMap;

use crate::{FinderResult, Target};

/// How a metric is presented back to the client.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Alias {
    /// Name the series is rendered under.
    pub display_name: String,
    /// The target pattern that produced the metric.
    pub target: String,
}

/// The per-request union of finder results, keyed by concrete metric path.
///
/// Each metric carries the aliases under which it was requested; the same
/// metric matched by two targets is stored once with two aliases. Merging
/// is commutative: the map is independent of the order in which parallel
/// finder calls complete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AliasedMetricMap(BTreeMap<String, Vec<Alias>>);

impl AliasedMetricMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge the leaf matches of one finder result under the given target.
    pub fn merge_target(&mut self, result: &FinderResult, target: &Target) {
        for m in result.matches().iter().filter(|m| m.is_leaf) {
            let aliases = self.0.entry(m.path.clone()).or_default();
            let alias = Alias {
                display_name: m.path.clone(),
                target: target.pattern().to_string(),
            };
            if let Err(at) = aliases.binary_search(&alias) {
                aliases.insert(at, alias);
            }
        }
    }

    /// Number of distinct metrics in the map.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn metrics(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn aliases(&self, metric: &str) -> Option<&[Alias]> {
        self.0.get(metric).map(Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use crate::FinderMatch;

    use super::*;

    fn result(paths: &[&str]) -> FinderResult {
        FinderResult::new(paths.iter().map(|p| FinderMatch::leaf(*p)).collect())
    }

    #[test]
    fn test_merge_skips_branches() {
        let mut amm = AliasedMetricMap::new();
        let r = FinderResult::new(vec![FinderMatch::leaf("a.b.x"), FinderMatch::branch("a.b")]);
        amm.merge_target(&r, &Target::new("a.b.*"));
        assert_eq!(amm.metrics().collect::<Vec<_>>(), vec!["a.b.x"]);
    }

    #[test]
    fn test_merge_is_commutative() {
        let r1 = result(&["a.b.x", "a.b.y"]);
        let r2 = result(&["a.b.y", "a.c.z"]);
        let t1 = Target::new("a.b.*");
        let t2 = Target::new("a.{b,c}.*");

        let mut forward = AliasedMetricMap::new();
        forward.merge_target(&r1, &t1);
        forward.merge_target(&r2, &t2);

        let mut backward = AliasedMetricMap::new();
        backward.merge_target(&r2, &t2);
        backward.merge_target(&r1, &t1);

        assert_eq!(forward, backward);
        assert_eq!(forward.len(), 3);
        // shared metric keeps both aliases
        assert_eq!(forward.aliases("a.b.y").unwrap().len(), 2);
    }

    #[test]
    fn test_merge_dedups_repeated_alias() {
        let r = result(&["a.b.x"]);
        let t = Target::new("a.b.*");
        let mut amm = AliasedMetricMap::new();
        amm.merge_target(&r, &t);
        amm.merge_target(&r, &t);
        assert_eq!(amm.aliases("a.b.x").unwrap().len(), 1);
    }
}
