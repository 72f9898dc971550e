//! Generic per-key async lock whose entries live until explicitly removed

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::sync::OwnedMutexGuard;

/// A generic per-key async lock manager.
///
/// Concurrent operations on the same key are executed sequentially while
/// operations on different keys proceed in parallel.
///
/// Entries are created lazily on first use and are only dropped through
/// [`KeyedAsyncLock::remove`], so a key that is contended often never pays for
/// re-creating its mutex.
///
/// # Example
///
/// ```rust,ignore
/// let locks = KeyedAsyncLock::<String>::new();
///
/// let guard = locks.lock(&"node-a".to_string()).await;
/// // ... read-modify-write node state ...
/// drop(guard);
///
/// // node deleted from the cluster
/// locks.remove(&"node-a".to_string());
/// ```
pub struct KeyedAsyncLock<K>
where
    K: Hash + Eq + Clone,
{
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K> KeyedAsyncLock<K>
where
    K: Hash + Eq + Clone,
{
    /// Creates a new `KeyedAsyncLock`.
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Acquires the lock for the specified key, creating it if needed.
    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        let mutex = self.get_or_create_lock(key);
        mutex.lock_owned().await
    }

    /// Drops the entry for `key`. Holders of an existing guard keep their mutex;
    /// the next [`KeyedAsyncLock::lock`] call creates a fresh one.
    pub fn remove(&self, key: &K) -> bool {
        self.locks.remove(key).is_some()
    }

    fn get_or_create_lock(&self, key: &K) -> Arc<Mutex<()>> {
        // The entry guard must be dropped before awaiting on the mutex.
        Arc::clone(
            self.locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// Returns the number of keys with a lock entry.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl<K> Default for KeyedAsyncLock<K>
where
    K: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use tokio::time::sleep;

    use super::*;

    #[tokio::test]
    async fn lock_serializes_same_key() {
        let locks = Arc::new(KeyedAsyncLock::<String>::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];

        for _ in 0..10 {
            let locks = Arc::clone(&locks);
            let counter = Arc::clone(&counter);
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(&"node-a".to_string()).await;
                let val = counter.load(Ordering::SeqCst);
                sleep(Duration::from_millis(1)).await;
                counter.store(val + 1, Ordering::SeqCst);
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn different_keys_run_concurrently() {
        let locks = Arc::new(KeyedAsyncLock::<String>::new());
        let start = std::time::Instant::now();

        let mut handles = vec![];
        for i in 0..5 {
            let locks = Arc::clone(&locks);
            let key = format!("node-{i}");
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(&key).await;
                sleep(Duration::from_millis(50)).await;
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        // ~50ms if concurrent, ~250ms if serialized
        assert!(
            start.elapsed() < Duration::from_millis(150),
            "Tasks should run concurrently"
        );
    }

    #[tokio::test]
    async fn entries_persist_until_removed() {
        let locks = KeyedAsyncLock::<String>::new();
        let key = "node-a".to_string();

        {
            let _guard = locks.lock(&key).await;
        }
        assert_eq!(locks.len(), 1);

        assert!(locks.remove(&key));
        assert!(locks.is_empty());
        assert!(!locks.remove(&key));
    }

    #[tokio::test]
    async fn stress_test_lock_contention() {
        let locks = Arc::new(KeyedAsyncLock::<u32>::new());
        let success_count = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for task_id in 0..100u32 {
            let locks = Arc::clone(&locks);
            let success_count = Arc::clone(&success_count);
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(&(task_id % 5)).await;
                tokio::task::yield_now().await;
                success_count.fetch_add(1, Ordering::SeqCst);
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(success_count.load(Ordering::SeqCst), 100);
        assert_eq!(locks.len(), 5);
    }
}
