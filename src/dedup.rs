//! At-most-once gate keyed by inbound event id.

use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Result;

/// Records processed event ids for a retention window.
#[async_trait]
pub trait DedupTracker: Send + Sync {
    /// Atomically mark `event_id` as processed. Returns false when it already was.
    async fn claim(&self, event_id: &str) -> Result<bool>;
}

#[derive(Debug)]
pub struct DedupCache {
    ttl: Duration,
    max_entries: usize,
    seen: HashMap<String, Instant>,
    order: VecDeque<(String, Instant)>,
}

impl DedupCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn insert_if_new(&mut self, id: &str, now: Instant) -> bool {
        self.evict(now);
        if self.seen.contains_key(id) {
            return false;
        }

        self.seen.insert(id.to_string(), now);
        self.order.push_back((id.to_string(), now));

        while self.seen.len() > self.max_entries {
            if let Some((old_id, _)) = self.order.pop_front() {
                self.seen.remove(&old_id);
            }
        }

        debug_assert_eq!(
            self.seen.len(),
            self.order.len(),
            "DedupCache: HashMap and VecDeque out of sync"
        );
        true
    }

    fn evict(&mut self, now: Instant) {
        while let Some((id, ts)) = self.order.front().cloned() {
            if now.duration_since(ts) < self.ttl {
                break;
            }
            self.order.pop_front();
            self.seen.remove(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Process-local tracker. The check and the insert happen under one lock, so
/// concurrent deliveries of the same id admit exactly one caller.
#[derive(Debug)]
pub struct MemoryDedupTracker {
    cache: Mutex<DedupCache>,
}

impl MemoryDedupTracker {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            cache: Mutex::new(DedupCache::new(ttl, max_entries)),
        }
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }
}

#[async_trait]
impl DedupTracker for MemoryDedupTracker {
    async fn claim(&self, event_id: &str) -> Result<bool> {
        Ok(self.cache.lock().insert_if_new(event_id, Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Arc,
        time::{Duration, Instant},
    };

    use super::{DedupCache, DedupTracker, MemoryDedupTracker};

    #[test]
    fn drops_duplicates() {
        let mut dedup = DedupCache::new(Duration::from_secs(60), 100);
        let now = Instant::now();
        assert!(dedup.insert_if_new("ev_1", now));
        assert!(!dedup.insert_if_new("ev_1", now + Duration::from_secs(1)));
    }

    #[test]
    fn remains_bounded() {
        let mut dedup = DedupCache::new(Duration::from_secs(60), 2);
        let now = Instant::now();
        dedup.insert_if_new("a", now);
        dedup.insert_if_new("b", now);
        dedup.insert_if_new("c", now);
        assert_eq!(dedup.len(), 2);
    }

    #[test]
    fn re_insert_after_retention_window_succeeds() {
        let mut dedup = DedupCache::new(Duration::from_secs(5), 100);
        let now = Instant::now();
        assert!(dedup.insert_if_new("x", now));
        assert!(!dedup.insert_if_new("x", now + Duration::from_secs(1)));
        assert!(dedup.insert_if_new("x", now + Duration::from_secs(6)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_admit_one_caller() {
        let tracker = Arc::new(MemoryDedupTracker::new(Duration::from_secs(60), 100));
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let tracker = tracker.clone();
            tasks.push(tokio::spawn(async move {
                tracker.claim("ev_dup").await.unwrap()
            }));
        }

        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(tracker.len(), 1);
    }
}
