//! Generation tracker: at most one live generation per conversation
//! thread. Keyed by the full (chat, user, topic) triple so forum topics
//! are served in parallel; in private chats the topic is `None` and the
//! key degenerates to (chat, user).

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use herald_core::types::ThreadKey;

/// Handle for one claimed generation slot. The id distinguishes this
/// holder from a successor that took the slot over.
#[derive(Debug, Clone)]
pub struct Generation {
    pub id: u64,
    pub token: CancellationToken,
}

#[derive(Default)]
pub struct GenerationTracker {
    active: DashMap<ThreadKey, Generation>,
    next_id: AtomicU64,
}

impl GenerationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the generation slot. Any prior holder's token is cancelled —
    /// it is expected to observe cancellation and clean up.
    pub fn start(&self, key: ThreadKey) -> Generation {
        let generation = Generation {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            token: CancellationToken::new(),
        };
        if let Some(prior) = self.active.insert(key, generation.clone()) {
            prior.token.cancel();
        }
        generation
    }

    /// Fire the cancel signal if a generation is active.
    pub fn cancel(&self, key: &ThreadKey) -> bool {
        match self.active.get(key) {
            Some(generation) => {
                generation.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Release the slot, but only if `generation` still owns it — a
    /// successor that already claimed the key is left untouched.
    pub fn clear(&self, key: &ThreadKey, generation: &Generation) {
        self.active
            .remove_if(key, |_, current| current.id == generation.id);
    }

    pub fn is_active(&self, key: &ThreadKey) -> bool {
        self.active.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(user_id: i64) -> ThreadKey {
        ThreadKey::new(1, user_id, None)
    }

    #[test]
    fn start_cancels_prior_generation() {
        let tracker = GenerationTracker::new();
        let first = tracker.start(key(2));
        assert!(!first.token.is_cancelled());
        let second = tracker.start(key(2));
        assert!(first.token.is_cancelled());
        assert!(!second.token.is_cancelled());
    }

    #[test]
    fn cancel_fires_only_when_active() {
        let tracker = GenerationTracker::new();
        assert!(!tracker.cancel(&key(2)));
        let generation = tracker.start(key(2));
        assert!(tracker.cancel(&key(2)));
        assert!(generation.token.is_cancelled());
    }

    #[test]
    fn clear_releases_slot() {
        let tracker = GenerationTracker::new();
        let generation = tracker.start(key(2));
        assert!(tracker.is_active(&key(2)));
        tracker.clear(&key(2), &generation);
        assert!(!tracker.is_active(&key(2)));
    }

    #[test]
    fn stale_clear_leaves_successor_in_place() {
        let tracker = GenerationTracker::new();
        let first = tracker.start(key(2));
        let _second = tracker.start(key(2));
        tracker.clear(&key(2), &first); // first no longer owns the slot
        assert!(tracker.is_active(&key(2)));
    }

    #[test]
    fn threads_are_independent() {
        let tracker = GenerationTracker::new();
        let a = tracker.start(key(2));
        let _b = tracker.start(key(3));
        assert!(!a.token.is_cancelled());
        assert!(tracker.cancel(&key(2)));
        assert!(tracker.is_active(&key(3)));

        // Same chat and user, different forum topics: parallel slots.
        let t1 = tracker.start(ThreadKey::new(9, 9, Some(1)));
        let _t2 = tracker.start(ThreadKey::new(9, 9, Some(2)));
        assert!(!t1.token.is_cancelled());
    }
}
