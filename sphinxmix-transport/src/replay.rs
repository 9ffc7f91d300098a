//! # Replay Cache
//!
//! Records the replay tag of every packet a node has accepted. Test and
//! insert happen under one lock, so two concurrent copies of a packet cannot
//! both be accepted.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use sphinxmix_crypto::REPLAY_TAG_SIZE;

/// Value a hop derives from its shared secret to recognize a packet.
pub type ReplayTag = [u8; REPLAY_TAG_SIZE];

/// Set of replay tags seen by a node.
pub trait ReplayCache: Send + Sync {
    /// Insert `tag`; returns `true` if it was already present (a replay).
    fn contains_and_insert(&self, tag: &ReplayTag) -> bool;

    /// Number of recorded tags.
    fn len(&self) -> usize;

    /// Whether nothing is recorded.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every tag. Only safe together with a key rotation.
    fn flush(&self);
}

/// In-memory replay cache.
///
/// Without a horizon, tags are kept for the lifetime of the cache. With a
/// horizon, a tag older than the horizon no longer counts as seen.
#[derive(Debug, Default)]
pub struct MemoryReplayCache {
    seen: Mutex<HashMap<ReplayTag, Instant>>,
    horizon: Option<Duration>,
}

impl MemoryReplayCache {
    /// Cache that never forgets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache whose entries expire after `horizon`.
    pub fn with_horizon(horizon: Duration) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            horizon: Some(horizon),
        }
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let Some(horizon) = self.horizon else {
            return 0;
        };
        let mut seen = self.lock();
        let before = seen.len();
        seen.retain(|_, inserted| inserted.elapsed() < horizon);
        before - seen.len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ReplayTag, Instant>> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ReplayCache for MemoryReplayCache {
    fn contains_and_insert(&self, tag: &ReplayTag) -> bool {
        let now = Instant::now();
        let mut seen = self.lock();
        match seen.get(tag) {
            Some(inserted) => match self.horizon {
                Some(horizon) if now.duration_since(*inserted) >= horizon => {
                    seen.insert(*tag, now);
                    false
                }
                _ => true,
            },
            None => {
                seen.insert(*tag, now);
                false
            }
        }
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn flush(&self) {
        self.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_second_insert_is_replay() {
        let cache = MemoryReplayCache::new();
        let tag = [7u8; REPLAY_TAG_SIZE];

        assert!(!cache.contains_and_insert(&tag));
        assert!(cache.contains_and_insert(&tag));
        assert!(!cache.contains_and_insert(&[8u8; REPLAY_TAG_SIZE]));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_flush() {
        let cache = MemoryReplayCache::new();
        let tag = [1u8; REPLAY_TAG_SIZE];
        cache.contains_and_insert(&tag);

        cache.flush();
        assert!(cache.is_empty());
        assert!(!cache.contains_and_insert(&tag));
    }

    #[test]
    fn test_horizon_expiry() {
        let cache = MemoryReplayCache::with_horizon(Duration::from_millis(20));
        let tag = [2u8; REPLAY_TAG_SIZE];

        assert!(!cache.contains_and_insert(&tag));
        assert!(cache.contains_and_insert(&tag));

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.purge_expired(), 1);
        assert!(!cache.contains_and_insert(&tag));
    }

    #[test]
    fn test_concurrent_inserts_accept_once() {
        let cache = Arc::new(MemoryReplayCache::new());
        let tag = [9u8; REPLAY_TAG_SIZE];

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || cache.contains_and_insert(&tag))
            })
            .collect();

        let accepted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|replay| !replay)
            .count();
        assert_eq!(accepted, 1);
    }
}
