//! Page-lifetime memoization of fetched resources.

use moka::future::Cache;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Result of a cached lookup. Failures collapse to `NotFound` and are not remembered.
#[derive(Debug)]
pub enum Fetched<V> {
    Found(Arc<V>),
    NotFound,
}

impl<V> Clone for Fetched<V> {
    fn clone(&self) -> Self {
        match self {
            Fetched::Found(v) => Fetched::Found(Arc::clone(v)),
            Fetched::NotFound => Fetched::NotFound,
        }
    }
}

impl<V> Fetched<V> {
    pub fn found(self) -> Option<Arc<V>> {
        match self {
            Fetched::Found(v) => Some(v),
            Fetched::NotFound => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Fetched::Found(_))
    }
}

/// Per-id cache: concurrent first requests for an id share one load.
#[derive(Clone)]
pub struct FetchCache<K, V> {
    kind: &'static str,
    inner: Cache<K, Arc<V>>,
}

impl<K, V> FetchCache<K, V>
where
    K: Hash + Eq + Clone + Display + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            inner: Cache::builder().build(),
        }
    }

    pub async fn get<F, Fut, E>(&self, id: K, load: F) -> Fetched<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: Display + Send + Sync + 'static,
    {
        let kind = self.kind;
        let key = id.clone();
        let init = async move {
            debug!(kind, id = %key, "fetching");
            load().await.map(Arc::new)
        };
        match self.inner.try_get_with(id.clone(), init).await {
            Ok(v) => Fetched::Found(v),
            Err(e) => {
                warn!(kind, id = %id, error = %e, "fetch failed");
                Fetched::NotFound
            }
        }
    }

    pub async fn peek(&self, id: &K) -> Option<Arc<V>> {
        self.inner.get(id).await
    }

    pub fn clear(&self) {
        self.inner.invalidate_all();
    }
}

/// Whole-collection memo with an explicit forced reload.
pub struct CollectionCache<T> {
    slot: Mutex<Option<Arc<Vec<T>>>>,
}

impl<T> Default for CollectionCache<T> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }
}

impl<T> CollectionCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached collection unless `force` is set or nothing is cached yet.
    /// Concurrent callers wait on the same load; failures are not cached.
    pub async fn load<F, Fut, E>(&self, force: bool, loader: F) -> Result<Arc<Vec<T>>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<T>, E>>,
    {
        let mut slot = self.slot.lock().await;
        if !force {
            if let Some(items) = slot.as_ref() {
                return Ok(Arc::clone(items));
            }
        }
        let items = Arc::new(loader().await?);
        *slot = Some(Arc::clone(&items));
        Ok(items)
    }

    pub async fn cached(&self) -> Option<Arc<Vec<T>>> {
        self.slot.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_gets_share_one_load() {
        let cache: FetchCache<i64, String> = FetchCache::new("protocol");
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let load = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok::<_, String>("shaping".to_string())
        };
        let (a, b, c) = tokio::join!(cache.get(3, load), cache.get(3, load), cache.get(3, load));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for got in [a, b, c] {
            assert_eq!(got.found().as_deref().map(String::as_str), Some("shaping"));
        }
        assert!(cache.get(3, load).await.is_found());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let cache: FetchCache<i64, String> = FetchCache::new("session");
        let failed = cache
            .get(5, || async { Err::<String, _>("connection refused".to_string()) })
            .await;
        assert!(!failed.is_found());
        assert!(cache.peek(&5).await.is_none());
        let retried = cache.get(5, || async { Ok::<_, String>("ok".to_string()) }).await;
        assert!(retried.is_found());
    }

    #[tokio::test]
    async fn collection_reload_only_when_forced() {
        let cache: CollectionCache<u8> = CollectionCache::new();
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let loader = move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) as u8;
            Ok::<_, String>(vec![n])
        };
        assert_eq!(*cache.load(false, loader).await.expect("first"), vec![0]);
        assert_eq!(*cache.load(false, loader).await.expect("memo"), vec![0]);
        assert_eq!(*cache.load(true, loader).await.expect("forced"), vec![1]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
