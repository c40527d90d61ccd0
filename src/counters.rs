use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Counter name used for the subscription-wide remaining read operations.
pub const SUBSCRIPTION_READS: &str = "SubIDReads";

/// A named gauge of remaining control-plane requests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitCounter {
    pub name: String,
    pub remaining: u64,
}

/// Remaining-request counters keyed by name. Inserting an existing name
/// replaces its value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CounterSet(BTreeMap<String, u64>);

impl CounterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, remaining: u64) {
        self.0.insert(name.into(), remaining);
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.0.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Overwrites own entries with those of `other`.
    pub fn merge(&mut self, other: CounterSet) {
        self.0.extend(other.0);
    }

    /// Entries in name order.
    pub fn counters(&self) -> impl Iterator<Item = RateLimitCounter> + '_ {
        self.0.iter().map(|(name, remaining)| RateLimitCounter {
            name: name.clone(),
            remaining: *remaining,
        })
    }
}

impl FromIterator<(String, u64)> for CounterSet {
    fn from_iter<I: IntoIterator<Item = (String, u64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Merge per-probe counter sets given in battery order. A later set wins
/// for keys it shares with an earlier one.
pub fn aggregate<I>(sets: I) -> CounterSet
where
    I: IntoIterator<Item = CounterSet>,
{
    sets.into_iter().fold(CounterSet::new(), |mut acc, set| {
        acc.merge(set);
        acc
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(pairs: &[(&str, u64)]) -> CounterSet {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn later_probe_overwrites_shared_keys() {
        let merged = aggregate(vec![set(&[("A", 1), ("B", 2)]), set(&[("B", 3), ("C", 4)])]);
        assert_eq!(merged, set(&[("A", 1), ("B", 3), ("C", 4)]));
    }

    #[test]
    fn aggregate_of_nothing_is_empty() {
        assert!(aggregate(Vec::new()).is_empty());
        assert!(aggregate(vec![CounterSet::new(), CounterSet::new()]).is_empty());
    }

    #[test]
    fn counters_view_matches_entries() {
        let s = set(&[("Microsoft.Compute/LowCostGet3Min", 3989), (SUBSCRIPTION_READS, 11535)]);
        let names: Vec<_> = s.counters().map(|c| c.name).collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&SUBSCRIPTION_READS.to_string()));
        assert_eq!(s.get(SUBSCRIPTION_READS), Some(11535));
    }
}
