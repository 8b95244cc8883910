//! Cached total/good proxy counts
//!
//! Counting good proxies needs a scan of the whole table, so the counters are
//! cached for a fixed shelf life and recomputed from the store once stale.
//! The write path nudges cached values between refreshes.

use crate::database::ProxyStore;
use crate::error::Result;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// How long cached counts stay valid
pub const COUNT_SHELF_LIFE_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, Default)]
struct CachedCount {
    value: u64,
    /// `None` until the first successful computation
    stale_at: Option<DateTime<Utc>>,
}

impl CachedCount {
    fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.stale_at.map_or(true, |stale_at| now >= stale_at)
    }

    fn set(&mut self, value: u64, stale_at: DateTime<Utc>) {
        self.value = value;
        self.stale_at = Some(stale_at);
    }

    fn adjust(&mut self, delta: i64) {
        if self.stale_at.is_some() {
            self.value = self.value.saturating_add_signed(delta);
        }
    }
}

#[derive(Debug, Default)]
struct Counts {
    total: CachedCount,
    good: CachedCount,
}

/// Exclusive access to the cached counters.
///
/// Held across a store write so a concurrent refresh cannot observe the
/// written row and then have the same change applied again.
pub struct CountsGuard<'a>(MutexGuard<'a, Counts>);

impl CountsGuard<'_> {
    pub fn adjust_total(&mut self, delta: i64) {
        self.0.total.adjust(delta);
    }

    pub fn adjust_good(&mut self, delta: i64) {
        self.0.good.adjust(delta);
    }
}

/// Process-wide cache of the total and good proxy counts
pub struct CountCache {
    counts: Mutex<Counts>,
    shelf_life: Duration,
}

impl Default for CountCache {
    fn default() -> Self {
        Self::new(Duration::hours(COUNT_SHELF_LIFE_HOURS))
    }
}

impl CountCache {
    pub fn new(shelf_life: Duration) -> Self {
        Self {
            counts: Mutex::new(Counts::default()),
            shelf_life,
        }
    }

    pub async fn count(&self, store: &dyn ProxyStore, good_only: bool) -> Result<u64> {
        self.count_at(store, good_only, Utc::now()).await
    }

    /// Return a cached count, recomputing stale counters first.
    ///
    /// The lock is held across the recompute so concurrent readers wait for
    /// one refresh. Total and good are refreshed independently: a failure of
    /// one does not discard the other.
    pub async fn count_at(
        &self,
        store: &dyn ProxyStore,
        good_only: bool,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut counts = self.counts.lock().await;
        let stale_at = now + self.shelf_life;

        let mut total_err = None;
        if counts.total.is_stale(now) {
            match store.count_all().await {
                Ok(n) => counts.total.set(n, stale_at),
                Err(err) => {
                    warn!(%err, "failed to recompute total proxy count");
                    total_err = Some(err);
                }
            }
        }

        let mut good_err = None;
        if counts.good.is_stale(now) {
            match store.count_good().await {
                Ok(n) => counts.good.set(n, stale_at),
                Err(err) => {
                    warn!(%err, "failed to recompute good proxy count");
                    good_err = Some(err);
                }
            }
        }

        let (cached, err) = if good_only {
            (counts.good, good_err)
        } else {
            (counts.total, total_err)
        };

        match (cached.stale_at, err) {
            (None, Some(err)) => Err(err),
            _ => {
                debug!(good_only, count = cached.value, "proxy count");
                Ok(cached.value)
            }
        }
    }

    /// Lock the counters; refreshes wait until the guard is dropped
    pub async fn write(&self) -> CountsGuard<'_> {
        CountsGuard(self.counts.lock().await)
    }

    pub async fn adjust_total(&self, delta: i64) {
        self.write().await.adjust_total(delta);
    }

    pub async fn adjust_good(&self, delta: i64) {
        self.write().await.adjust_good(delta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::proxy::catalog::Sort;
    use crate::proxy::models::{ProxyId, ProxyRecord};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    /// Store that only answers the two count queries
    #[derive(Default)]
    struct CountingStore {
        total: AtomicU64,
        good: AtomicU64,
        fail_good: AtomicBool,
        queries: AtomicU64,
    }

    #[async_trait]
    impl ProxyStore for CountingStore {
        async fn insert(&self, _record: &ProxyRecord) -> Result<bool> {
            Ok(true)
        }

        async fn find(&self, _id: &ProxyId) -> Result<Option<ProxyRecord>> {
            Ok(None)
        }

        async fn find_least_recently_updated(&self) -> Result<Option<ProxyRecord>> {
            Ok(None)
        }

        async fn update_stats(&self, record: &ProxyRecord) -> Result<()> {
            Err(Error::NotFound(record.id))
        }

        async fn list_page(
            &self,
            _good_only: bool,
            _sort: Sort,
            _offset: u64,
            _limit: u64,
        ) -> Result<Vec<ProxyRecord>> {
            Ok(Vec::new())
        }

        async fn count_all(&self) -> Result<u64> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            Ok(self.total.load(Ordering::SeqCst))
        }

        async fn count_good(&self) -> Result<u64> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            if self.fail_good.load(Ordering::SeqCst) {
                return Err(Error::InvalidRow("count unavailable".to_string()));
            }
            Ok(self.good.load(Ordering::SeqCst))
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_counts_are_cached_until_stale() {
        let store = CountingStore::default();
        store.total.store(5, Ordering::SeqCst);
        store.good.store(2, Ordering::SeqCst);
        let cache = CountCache::default();

        assert_eq!(cache.count_at(&store, false, t0()).await.unwrap(), 5);
        assert_eq!(cache.count_at(&store, true, t0()).await.unwrap(), 2);
        assert_eq!(store.queries.load(Ordering::SeqCst), 2);

        store.total.store(9, Ordering::SeqCst);
        let fresh = t0() + Duration::hours(23);
        assert_eq!(cache.count_at(&store, false, fresh).await.unwrap(), 5);

        let stale = t0() + Duration::hours(COUNT_SHELF_LIFE_HOURS);
        assert_eq!(cache.count_at(&store, false, stale).await.unwrap(), 9);
        assert_eq!(store.queries.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_good_failure_keeps_total() {
        let store = CountingStore::default();
        store.total.store(7, Ordering::SeqCst);
        store.fail_good.store(true, Ordering::SeqCst);
        let cache = CountCache::default();

        assert!(cache.count_at(&store, true, t0()).await.is_err());
        assert_eq!(cache.count_at(&store, false, t0()).await.unwrap(), 7);

        // Total stays cached while good is retried
        store.total.store(8, Ordering::SeqCst);
        store.fail_good.store(false, Ordering::SeqCst);
        store.good.store(3, Ordering::SeqCst);
        assert_eq!(cache.count_at(&store, true, t0()).await.unwrap(), 3);
        assert_eq!(cache.count_at(&store, false, t0()).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_adjust_only_after_first_computation() {
        let store = CountingStore::default();
        store.total.store(1, Ordering::SeqCst);
        let cache = CountCache::default();

        cache.adjust_total(10).await;
        assert_eq!(cache.count_at(&store, false, t0()).await.unwrap(), 1);

        cache.adjust_total(1).await;
        cache.adjust_good(1).await;
        cache.adjust_good(-5).await;
        assert_eq!(cache.count_at(&store, false, t0()).await.unwrap(), 2);
        assert_eq!(cache.count_at(&store, true, t0()).await.unwrap(), 0);
    }
}
