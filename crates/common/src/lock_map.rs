//! A map of per-key async mutexes: operations on different keys never
//! block each other, while operations on the same key are serialized for
//! as long as the caller holds the returned guard.

use std::{collections::HashMap, hash::Hash, sync::Arc};
use tokio::sync::{Mutex, OwnedMutexGuard, TryLockError};

#[derive(Default)]
pub struct LockMap<K: Hash + Eq> {
    inner: std::sync::Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

pub struct LockMapGuard<'m, K: Hash + Eq> {
    map: &'m LockMap<K>,
    key: K,
    _guard: OwnedMutexGuard<()>,
}

impl<K: Hash + Eq> Drop for LockMapGuard<'_, K> {
    fn drop(&mut self) {
        self.map
            .inner
            .lock()
            .expect("lock map guard")
            .remove(&self.key);
    }
}

impl<K: Hash + Eq + Clone> LockMap<K> {
    fn mutex_by_key(&self, key: K) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().expect("lock map guard");
        map.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    pub async fn lock(&self, key: K) -> LockMapGuard<'_, K> {
        let guard = self.mutex_by_key(key.clone()).lock_owned().await;
        LockMapGuard {
            map: self,
            key,
            _guard: guard,
        }
    }

    pub fn try_lock(&self, key: K) -> Result<LockMapGuard<'_, K>, TryLockError> {
        let guard = self.mutex_by_key(key.clone()).try_lock_owned()?;
        Ok(LockMapGuard {
            map: self,
            key,
            _guard: guard,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_serializes() {
        let map: Arc<LockMap<String>> = Arc::new(LockMap::default());
        let counter = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let map = map.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                let _guard = map.lock("c1".to_string()).await;
                let before = counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1)).await;
                assert_eq!(counter.load(Ordering::SeqCst), before + 1);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let map = LockMap::default();
        let _g1 = map.lock("a".to_string()).await;
        let g2 = map.try_lock("b".to_string());
        assert!(g2.is_ok());
    }

    #[tokio::test]
    async fn guard_drop_clears_entry() {
        let map = LockMap::default();
        {
            let _g = map.lock("a".to_string()).await;
        }
        assert!(map.inner.lock().unwrap().is_empty());
    }
}
