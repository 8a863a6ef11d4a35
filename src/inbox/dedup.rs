//! Bounded, per-worker memory of text already routed.
//!
//! Only SHA-256 digests are kept, never the text itself.

use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};

use crate::worker::WorkerId;

type Digest32 = [u8; 32];

/// Hex SHA-256 of `text`.
pub fn signature(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

fn digest(text: &str) -> Digest32 {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(text.as_bytes()));
    out
}

/// Least-recently-seen eviction over a fixed number of signatures.
#[derive(Debug, Clone)]
pub struct SignatureCache {
    capacity: usize,
    order: VecDeque<Digest32>,
    members: HashSet<Digest32>,
}

impl SignatureCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
        }
    }

    /// True the first time `text` is seen while it is cached.
    ///
    /// A repeat refreshes the entry so frequently repeated text stays cached.
    pub fn is_new(&mut self, text: &str) -> bool {
        let d = digest(text);
        if self.members.contains(&d) {
            if let Some(pos) = self.order.iter().position(|x| *x == d) {
                self.order.remove(pos);
            }
            self.order.push_back(d);
            return false;
        }

        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        self.order.push_back(d);
        self.members.insert(d);
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// One [`SignatureCache`] per worker, created on first use.
#[derive(Debug, Clone)]
pub struct Deduplicator {
    capacity: usize,
    caches: HashMap<WorkerId, SignatureCache>,
}

impl Deduplicator {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            caches: HashMap::new(),
        }
    }

    pub fn is_new(&mut self, worker: &WorkerId, text: &str) -> bool {
        let capacity = self.capacity;
        self.caches
            .entry(worker.clone())
            .or_insert_with(|| SignatureCache::new(capacity))
            .is_new(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_is_hex_sha256() {
        assert_eq!(
            signature(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_repeat_rejected_until_evicted() {
        let mut cache = SignatureCache::new(2);
        assert!(cache.is_new("a"));
        assert!(!cache.is_new("a"));
        assert!(cache.is_new("b"));
        assert!(cache.is_new("c"));
        // "a" was evicted by "c".
        assert!(cache.is_new("a"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_hit_refreshes_recency() {
        let mut cache = SignatureCache::new(2);
        cache.is_new("a");
        cache.is_new("b");
        assert!(!cache.is_new("a"));
        cache.is_new("c");
        // "b" was the least recently seen, so it went first.
        assert!(!cache.is_new("a"));
        assert!(cache.is_new("b"));
    }

    #[test]
    fn test_whitespace_differences_are_distinct() {
        let mut cache = SignatureCache::new(10);
        assert!(cache.is_new("Status: done"));
        assert!(cache.is_new("Status: done\n"));
    }

    #[test]
    fn test_workers_have_separate_caches() {
        let mut dedup = Deduplicator::new(10);
        let w1 = WorkerId::new("w1");
        let w2 = WorkerId::new("w2");
        assert!(dedup.is_new(&w1, "Status: done"));
        assert!(dedup.is_new(&w2, "Status: done"));
        assert!(!dedup.is_new(&w1, "Status: done"));
    }
}
