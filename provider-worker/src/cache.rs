use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time;

use tokio::time::Instant;

/// Tracks which cids had their providers resolved recently.
///
/// An entry older than the freshness window is treated as absent whether or
/// not it is still stored; `sweep` is what reclaims the memory, so physical
/// removal can lag logical expiry by up to one sweep interval.
///
/// All operations take the same lock and none of them does I/O while holding it.
pub struct DedupCache {
    window: time::Duration,
    entries: Mutex<HashMap<String, Instant>>,
}

impl DedupCache {
    pub fn new(window: time::Duration) -> Self {
        Self {
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a resolution for `cid` completed within the freshness window.
    pub fn is_fresh(&self, cid: &str) -> bool {
        let now = Instant::now();
        let entries = self.lock();

        entries
            .get(cid)
            .is_some_and(|found_at| !self.expired(*found_at, now))
    }

    /// Claim the right to persist a resolution of `cid`.
    ///
    /// Returns true, and stamps the entry with the current time, only when no
    /// live entry exists. Concurrent completions for the same cid therefore
    /// yield a single `true` per freshness window.
    pub fn mark_if_stale(&self, cid: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.lock();

        match entries.get_mut(cid) {
            Some(found_at) if !self.expired(*found_at, now) => false,
            Some(found_at) => {
                *found_at = now;
                true
            }
            None => {
                entries.insert(cid.to_owned(), now);
                true
            }
        }
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();

        entries.retain(|_, found_at| !self.expired(*found_at, now));

        before - entries.len()
    }

    /// Number of stored entries, expired or not.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expired(&self, found_at: Instant, now: Instant) -> bool {
        now.saturating_duration_since(found_at) > self.window
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Instant>> {
        // The map holds no invariant a panicking holder could have broken.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: time::Duration = time::Duration::from_secs(24 * 3600);
    const HOUR: time::Duration = time::Duration::from_secs(3600);

    #[tokio::test(start_paused = true)]
    async fn test_unknown_cid_is_not_fresh() {
        let cache = DedupCache::new(DAY);

        assert!(!cache.is_fresh("K0"));
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_if_stale_once_per_window() {
        let cache = DedupCache::new(DAY);

        assert!(cache.mark_if_stale("K1"));
        assert!(cache.is_fresh("K1"));

        tokio::time::advance(time::Duration::from_secs(1)).await;
        assert!(!cache.mark_if_stale("K1"));

        // The refused call must not extend the window.
        tokio::time::advance(DAY - time::Duration::from_secs(1)).await;
        assert!(!cache.mark_if_stale("K1"));

        tokio::time::advance(time::Duration::from_millis(1)).await;
        assert!(cache.mark_if_stale("K1"));
        assert!(!cache.mark_if_stale("K1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_precedes_sweep() {
        let cache = DedupCache::new(DAY);
        assert!(cache.mark_if_stale("K2"));

        tokio::time::advance(DAY).await;
        assert!(cache.is_fresh("K2"));

        tokio::time::advance(time::Duration::from_millis(1)).await;
        assert!(!cache.is_fresh("K2"));
        assert_eq!(cache.len(), 1);

        tokio::time::advance(HOUR).await;
        assert_eq!(cache.sweep(), 1);
        assert!(cache.is_empty());
        assert!(!cache.is_fresh("K2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_keeps_live_entries() {
        let cache = DedupCache::new(DAY);
        assert!(cache.mark_if_stale("old"));

        tokio::time::advance(20 * HOUR).await;
        assert!(cache.mark_if_stale("new"));

        tokio::time::advance(5 * HOUR).await;
        assert_eq!(cache.sweep(), 1);
        assert!(cache.is_fresh("new"));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_marks_yield_one_winner() {
        let cache = std::sync::Arc::new(DedupCache::new(DAY));

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.mark_if_stale("K3") })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.expect("task panicked") {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
