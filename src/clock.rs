// Logical clocks per
// Time, Clocks, and the Ordering of Events in a Distributed System
// (Commun. ACM'78) and Mattern's vector time. A scalar clock orders local
// events and carries across messages with `update`; a vector clock captures
// the full causal history a node has observed. Comparison of two vector
// snapshots is a partial order; `compare` reports the four possible
// relations explicitly instead of hiding concurrency behind `None`
use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::message::NodeId;

/// Lamport scalar clock. A bare counter; the owning node serializes access.
#[derive(Debug, Default)]
pub struct LamportClock {
    counter: u64,
}

impl LamportClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> u64 {
        self.counter
    }

    /// Local or send event. Returns the stored new value.
    pub fn tick(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    /// Receive event carrying a remote value. New value is `max(t, r) + 1`.
    pub fn update(&mut self, remote: u64) -> u64 {
        self.counter = self.counter.max(remote) + 1;
        self.counter
    }
}

pub type VectorSnapshot = BTreeMap<NodeId, u64>;

/// Per-node vector clock over a fixed participant set. Entries for
/// participants the owner has not heard from stay zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    owner: NodeId,
    entries: VectorSnapshot,
}

impl VectorClock {
    pub fn new(owner: NodeId, participants: impl IntoIterator<Item = NodeId>) -> Self {
        let mut entries: VectorSnapshot = participants.into_iter().map(|id| (id, 0)).collect();
        entries.entry(owner.clone()).or_insert(0);
        Self { owner, entries }
    }

    pub fn read(&self) -> VectorSnapshot {
        self.entries.clone()
    }

    /// Missing ids read as zero.
    pub fn get(&self, id: &str) -> u64 {
        self.entries.get(id).copied().unwrap_or(0)
    }

    /// Local or send event: the owner entry advances by one.
    pub fn increment(&mut self) -> VectorSnapshot {
        *self.entries.entry(self.owner.clone()).or_insert(0) += 1;
        self.read()
    }

    /// Receive event: pointwise max with the remote snapshot, then the owner
    /// entry advances by one for the merge itself.
    pub fn merge(&mut self, remote: &VectorSnapshot) -> VectorSnapshot {
        for (id, &count) in remote {
            let entry = self.entries.entry(id.clone()).or_insert(0);
            *entry = (*entry).max(count);
        }
        *self.entries.entry(self.owner.clone()).or_insert(0) += 1;
        self.read()
    }
}

/// The four causal relations between two vector snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Causality {
    Equal,
    Before,
    After,
    Concurrent,
}

impl Causality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Causality::Equal => "equal",
            Causality::Before => "before",
            Causality::After => "after",
            Causality::Concurrent => "concurrent",
        }
    }

    pub fn dual(&self) -> Self {
        match self {
            Causality::Before => Causality::After,
            Causality::After => Causality::Before,
            relation => *relation,
        }
    }
}

/// Compare two snapshots over the union of their key sets, missing keys read
/// as zero. Exactly one relation is returned.
pub fn compare(a: &VectorSnapshot, b: &VectorSnapshot) -> Causality {
    let mut less = false;
    let mut greater = false;
    for id in a.keys().chain(b.keys()) {
        let lhs = a.get(id).copied().unwrap_or(0);
        let rhs = b.get(id).copied().unwrap_or(0);
        match lhs.cmp(&rhs) {
            Ordering::Less => less = true,
            Ordering::Greater => greater = true,
            Ordering::Equal => {}
        }
    }
    match (less, greater) {
        (false, false) => Causality::Equal,
        (true, false) => Causality::Before,
        (false, true) => Causality::After,
        (true, true) => Causality::Concurrent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn snapshot(pairs: &[(&str, u64)]) -> VectorSnapshot {
        pairs
            .iter()
            .map(|(id, count)| (id.to_string(), *count))
            .collect()
    }

    #[test]
    fn scalar_update_takes_max_plus_one() {
        let mut clock = LamportClock::new();
        assert_eq!(clock.tick(), 1);
        assert_eq!(clock.update(10), 11);
        assert_eq!(clock.update(3), 12);
        assert_eq!(clock.read(), 12);
    }

    #[test]
    fn vector_merge_is_pointwise_max_plus_owner_step() {
        let mut clock = VectorClock::new("a".into(), ["a".into(), "b".into(), "c".into()]);
        clock.increment();
        let merged = clock.merge(&snapshot(&[("b", 4), ("c", 1)]));
        assert_eq!(merged, snapshot(&[("a", 2), ("b", 4), ("c", 1)]));
    }

    #[test]
    fn missing_entries_read_as_zero() {
        let clock = VectorClock::new("a".into(), ["a".into()]);
        assert_eq!(clock.get("never-seen"), 0);
        assert_eq!(
            compare(&snapshot(&[("a", 0)]), &snapshot(&[])),
            Causality::Equal
        );
    }

    #[test]
    fn comparator_covers_all_relations() {
        let base = snapshot(&[("a", 1), ("b", 2)]);
        assert_eq!(compare(&base, &base), Causality::Equal);
        assert_eq!(
            compare(&base, &snapshot(&[("a", 2), ("b", 2)])),
            Causality::Before
        );
        assert_eq!(
            compare(&snapshot(&[("a", 2), ("b", 2)]), &base),
            Causality::After
        );
        assert_eq!(
            compare(&snapshot(&[("a", 2), ("b", 0)]), &snapshot(&[("a", 0), ("b", 2)])),
            Causality::Concurrent
        );
    }

    fn arbitrary_snapshot() -> impl Strategy<Value = VectorSnapshot> {
        proptest::collection::btree_map("[abc]", 0u64..8, 0..3)
    }

    proptest! {
        #[test]
        fn scalar_values_never_decrease(remotes in proptest::collection::vec(0u64..1000, 1..50)) {
            let mut clock = LamportClock::new();
            let mut previous = clock.read();
            for remote in remotes {
                let observed = if remote % 2 == 0 { clock.tick() } else { clock.update(remote) };
                prop_assert!(observed > previous);
                previous = observed;
            }
        }

        #[test]
        fn vector_entries_never_decrease(merges in proptest::collection::vec(arbitrary_snapshot(), 1..20)) {
            let mut clock = VectorClock::new("a".into(), ["a".into(), "b".into(), "c".into()]);
            let mut previous = clock.read();
            for remote in merges {
                let observed = clock.merge(&remote);
                for (id, count) in &previous {
                    prop_assert!(observed.get(id).copied().unwrap_or(0) >= *count);
                }
                prop_assert_eq!(observed.get("a").copied().unwrap_or(0),
                    previous.get("a").copied().unwrap_or(0) + 1);
                previous = observed;
            }
        }

        #[test]
        fn comparator_is_dual(a in arbitrary_snapshot(), b in arbitrary_snapshot()) {
            prop_assert_eq!(compare(&a, &b), compare(&b, &a).dual());
        }

        #[test]
        fn merge_dominates_both_inputs(a in arbitrary_snapshot(), b in arbitrary_snapshot()) {
            let mut clock = VectorClock::new("a".into(), a.keys().cloned());
            clock.merge(&a);
            let merged = clock.merge(&b);
            for source in [&a, &b] {
                for (id, count) in source {
                    prop_assert!(merged.get(id).copied().unwrap_or(0) >= *count);
                }
            }
        }
    }
}
