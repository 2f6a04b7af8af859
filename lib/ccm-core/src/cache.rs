//! TTL snapshot cache for bulk listings
//!
//! A snapshot is a whole listing taken at one instant. It is served until it
//! is older than the TTL or lacks one of the keys a caller needs; only one
//! refresh runs at a time and concurrent callers reuse its result.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// A listing keyed by id, with the instant it was taken
#[derive(Clone, Debug)]
pub struct Snapshot<T> {
    items: BTreeMap<String, T>,
    taken_at: Instant,
}

impl<T> Snapshot<T> {
    pub fn new(items: BTreeMap<String, T>) -> Self {
        Self {
            items,
            taken_at: Instant::now(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&T> {
        self.items.get(key)
    }

    pub fn contains_all(&self, keys: &[String]) -> bool {
        keys.iter().all(|k| self.items.contains_key(k))
    }

    pub fn age(&self) -> Duration {
        self.taken_at.elapsed()
    }

    pub fn items(&self) -> &BTreeMap<String, T> {
        &self.items
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.items.values()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

pub struct SnapshotCache<T> {
    ttl: Duration,
    current: RwLock<Option<Arc<Snapshot<T>>>>,
    // Held for the whole duration of a refresh
    refresh: Mutex<()>,
}

impl<T> SnapshotCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            current: RwLock::new(None),
            refresh: Mutex::new(()),
        }
    }

    fn usable(&self, snapshot: &Snapshot<T>, must_contain: &[String]) -> bool {
        snapshot.age() < self.ttl && snapshot.contains_all(must_contain)
    }

    async fn fresh(&self, must_contain: &[String]) -> Option<Arc<Snapshot<T>>> {
        let current = self.current.read().await;
        current
            .as_ref()
            .filter(|s| self.usable(s, must_contain))
            .cloned()
    }

    /// Returns a snapshot no older than the TTL containing every key of
    /// `must_contain`, calling `load` when the current one does not qualify.
    ///
    /// A snapshot that still misses keys after a reload is returned as is:
    /// the caller decides what a missing key means.
    pub async fn get_or_refresh<F, Fut, E>(
        &self,
        must_contain: &[String],
        load: F,
    ) -> Result<Arc<Snapshot<T>>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<BTreeMap<String, T>, E>>,
    {
        if let Some(snapshot) = self.fresh(must_contain).await {
            return Ok(snapshot);
        }

        let _gate = self.refresh.lock().await;
        // Another caller may have refreshed while we waited
        if let Some(snapshot) = self.fresh(must_contain).await {
            return Ok(snapshot);
        }

        let snapshot = Arc::new(Snapshot::new(load().await?));
        debug!(items = snapshot.len(), "Refreshed snapshot");
        *self.current.write().await = Some(snapshot.clone());
        Ok(snapshot)
    }

    pub async fn invalidate(&self) {
        *self.current.write().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn listing(keys: &[&str]) -> BTreeMap<String, u32> {
        keys.iter().map(|k| (k.to_string(), 1)).collect()
    }

    async fn load_counted(
        loads: &AtomicUsize,
        keys: &[&str],
    ) -> Result<BTreeMap<String, u32>, String> {
        loads.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        Ok(listing(keys))
    }

    #[tokio::test]
    async fn test_reuses_fresh_snapshot() {
        let cache = SnapshotCache::new(Duration::from_secs(60));
        let loads = AtomicUsize::new(0);

        let first = cache
            .get_or_refresh(&[], || load_counted(&loads, &["i-1"]))
            .await
            .unwrap();
        let second = cache
            .get_or_refresh(&["i-1".to_string()], || load_counted(&loads, &["i-1"]))
            .await
            .unwrap();

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_zero_ttl_always_refreshes() {
        let cache = SnapshotCache::new(Duration::ZERO);
        let loads = AtomicUsize::new(0);
        for _ in 0..3 {
            cache
                .get_or_refresh(&[], || load_counted(&loads, &["i-1"]))
                .await
                .unwrap();
        }
        assert_eq!(loads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_missing_key_forces_refresh() {
        let cache = SnapshotCache::new(Duration::from_secs(60));
        let loads = AtomicUsize::new(0);

        cache
            .get_or_refresh(&[], || load_counted(&loads, &["i-1"]))
            .await
            .unwrap();
        let snapshot = cache
            .get_or_refresh(&["i-2".to_string()], || load_counted(&loads, &["i-1", "i-2"]))
            .await
            .unwrap();

        assert_eq!(loads.load(Ordering::SeqCst), 2);
        assert!(snapshot.get("i-2").is_some());
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_load() {
        let cache = SnapshotCache::new(Duration::from_secs(60));
        let loads = AtomicUsize::new(0);

        let (a, b) = tokio::join!(
            cache.get_or_refresh(&[], || load_counted(&loads, &["i-1"])),
            cache.get_or_refresh(&[], || load_counted(&loads, &["i-1"])),
        );

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
    }

    #[tokio::test]
    async fn test_load_error_keeps_cache_empty() {
        let cache: SnapshotCache<u32> = SnapshotCache::new(Duration::from_secs(60));
        let res = cache
            .get_or_refresh(&[], || async { Err::<BTreeMap<String, u32>, _>("boom") })
            .await;
        assert_eq!(res.unwrap_err(), "boom");

        cache.invalidate().await;
        let loads = AtomicUsize::new(0);
        cache
            .get_or_refresh(&[], || load_counted(&loads, &[]))
            .await
            .unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }
}
