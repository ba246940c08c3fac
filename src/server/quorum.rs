//! Threshold collection of messages keyed by (round ID, sender).
//!
//! Tracks sets of messages received from other replicas and reports when a
//! quorum of them has been met for some round.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

use crate::types::ReplicaId;

/// Quorum tracker with a fixed threshold (typically `f`, `f + 1`, or
/// `2f + 1` depending on the message class).
pub struct QuorumSet<K, M> {
    threshold: usize,
    messages: HashMap<K, BTreeMap<ReplicaId, M>>,
}

impl<K: Eq + Hash + Clone, M> QuorumSet<K, M> {
    pub fn new(threshold: usize) -> Self {
        QuorumSet {
            threshold,
            messages: HashMap::new(),
        }
    }

    #[inline]
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Stores `msg` under `(key, replica_id)`; a duplicate submission from
    /// the same replica overwrites (latest wins). Returns the full map for
    /// `key` once it holds at least `threshold` messages.
    pub fn add_and_check(
        &mut self,
        key: K,
        replica_id: ReplicaId,
        msg: M,
    ) -> Option<&BTreeMap<ReplicaId, M>> {
        let round = self.messages.entry(key).or_default();
        round.insert(replica_id, msg);
        if round.len() >= self.threshold {
            Some(round)
        } else {
            None
        }
    }

    /// Inspects a round without inserting.
    pub fn check(&self, key: &K) -> Option<&BTreeMap<ReplicaId, M>> {
        self.messages
            .get(key)
            .filter(|round| round.len() >= self.threshold)
    }

    /// Discards one round.
    pub fn clear(&mut self, key: &K) {
        self.messages.remove(key);
    }

    /// Discards all rounds.
    pub fn clear_all(&mut self) {
        self.messages.clear();
    }
}

#[cfg(test)]
mod quorum_tests {
    use super::*;

    #[test]
    fn reaches_threshold() {
        let mut set = QuorumSet::<u64, &str>::new(2);
        assert!(set.add_and_check(5, 1, "a").is_none());
        assert!(set.check(&5).is_none());

        let round = set.add_and_check(5, 2, "b").unwrap();
        assert_eq!(round.len(), 2);
        assert!(set.check(&5).is_some());

        // other rounds are unaffected
        assert!(set.check(&6).is_none());
    }

    #[test]
    fn duplicates_overwrite() {
        let mut set = QuorumSet::<u64, &str>::new(2);
        assert!(set.add_and_check(5, 1, "old").is_none());
        assert!(set.add_and_check(5, 1, "new").is_none());

        let round = set.add_and_check(5, 2, "b").unwrap();
        assert_eq!(round[&1], "new");
    }

    #[test]
    fn clears_per_round_and_whole() {
        let mut set = QuorumSet::<u64, &str>::new(1);
        set.add_and_check(5, 1, "a");
        set.add_and_check(6, 1, "b");

        set.clear(&5);
        assert!(set.check(&5).is_none());
        assert!(set.check(&6).is_some());

        set.clear_all();
        assert!(set.check(&6).is_none());
    }
}
