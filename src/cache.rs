//! Process-wide lookup memoization
//!
//! One bounded LRU per operation kind. Each slot holds a `OnceCell`, so
//! concurrent tasks asking for the same key share a single remote call.
//! Failed computations leave the slot empty and the next caller retries.

use crate::config::CacheSection;
use crate::gateway::Operation;
use lru::LruCache;
use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OnceCell;
use tracing::trace;

type Slot<V> = Arc<OnceCell<V>>;

/// Memoizes lookup outcomes per (operation, key)
pub struct LookupCache<V> {
    shards: HashMap<Operation, Mutex<LruCache<String, Slot<V>>>>,
}

impl<V: Clone> LookupCache<V> {
    /// Create a cache with the configured capacity per operation
    pub fn new(capacities: &CacheSection) -> Self {
        let shards = Operation::ALL
            .into_iter()
            .map(|operation| {
                let capacity = capacity_for(capacities, operation);
                (operation, Mutex::new(LruCache::new(capacity)))
            })
            .collect();
        Self { shards }
    }

    /// Create a cache with the same capacity for every operation
    pub fn with_capacity(capacity: usize) -> Self {
        let capacities = CacheSection {
            person_search: capacity,
            service_catalog: capacity,
            test_history: capacity,
            test_report: capacity,
            medical_history: capacity,
            event_pay_type: capacity,
        };
        Self::new(&capacities)
    }

    /// Return the memoized value for `(operation, key)` or compute it once
    pub async fn get_or_try_compute<F, Fut, E>(
        &self,
        operation: Operation,
        key: &str,
        compute: F,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let slot = self.slot(operation, key);
        if slot.initialized() {
            trace!("Cache hit: operation={}, key={}", operation, key);
        }
        slot.get_or_try_init(compute).await.cloned()
    }

    #[cfg(test)]
    fn len(&self, operation: Operation) -> usize {
        self.shards
            .get(&operation)
            .map(|shard| shard.lock().unwrap_or_else(PoisonError::into_inner).len())
            .unwrap_or(0)
    }

    fn slot(&self, operation: Operation, key: &str) -> Slot<V> {
        let Some(shard) = self.shards.get(&operation) else {
            // Every operation gets a shard in `new`
            return Arc::new(OnceCell::new());
        };
        let mut shard = shard.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = shard.get(key) {
            return slot.clone();
        }
        let slot = Arc::new(OnceCell::new());
        shard.put(key.to_string(), slot.clone());
        slot
    }
}

fn capacity_for(capacities: &CacheSection, operation: Operation) -> NonZeroUsize {
    let capacity = match operation {
        Operation::PersonSearch => capacities.person_search,
        Operation::ServiceCatalog => capacities.service_catalog,
        Operation::TestHistory => capacities.test_history,
        Operation::TestReport => capacities.test_report,
        Operation::MedicalHistory => capacities.medical_history,
        Operation::EventPayType => capacities.event_pay_type,
    };
    NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_second_lookup_does_not_recompute() {
        let cache: LookupCache<String> = LookupCache::with_capacity(8);
        let calls = AtomicUsize::new(0);

        let compute = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ()>("value".to_string())
        };

        let first = cache
            .get_or_try_compute(Operation::PersonSearch, "k", compute)
            .await
            .unwrap();
        let second = cache
            .get_or_try_compute(Operation::PersonSearch, "k", compute)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_operations_do_not_share_keys() {
        let cache: LookupCache<u32> = LookupCache::with_capacity(8);

        let a = cache
            .get_or_try_compute(Operation::TestHistory, "42", || async { Ok::<_, ()>(1) })
            .await
            .unwrap();
        let b = cache
            .get_or_try_compute(Operation::MedicalHistory, "42", || async { Ok::<_, ()>(2) })
            .await
            .unwrap();

        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(cache.len(Operation::TestHistory), 1);
        assert_eq!(cache.len(Operation::MedicalHistory), 1);
    }

    #[tokio::test]
    async fn test_failed_compute_is_not_memoized() {
        let cache: LookupCache<u32> = LookupCache::with_capacity(8);

        let failed = cache
            .get_or_try_compute(Operation::TestReport, "e1", || async { Err::<u32, _>("down") })
            .await;
        assert!(failed.is_err());

        let recovered = cache
            .get_or_try_compute(Operation::TestReport, "e1", || async { Ok::<_, &str>(7) })
            .await
            .unwrap();
        assert_eq!(recovered, 7);
    }

    #[tokio::test]
    async fn test_least_recently_used_key_is_evicted() {
        let cache: LookupCache<u32> = LookupCache::with_capacity(2);
        let calls = AtomicUsize::new(0);

        for key in ["a", "b", "a", "c", "a"] {
            cache
                .get_or_try_compute(Operation::ServiceCatalog, key, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ()>(0)
                })
                .await
                .unwrap();
        }

        // "b" was evicted by "c"; "a" stayed hot
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(cache.len(Operation::ServiceCatalog), 2);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_computation() {
        let cache: Arc<LookupCache<u32>> = Arc::new(LookupCache::with_capacity(8));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_try_compute(Operation::PersonSearch, "same", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        Ok::<_, ()>(5)
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 5);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
