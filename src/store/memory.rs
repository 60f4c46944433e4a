use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;

use super::{DeleteCondition, LeaseRecord, LeaseStore, WriteCondition, WriteImage};
use crate::error::StoreError;

#[derive(Debug, Default, Clone)]
struct StoredRecord {
    owner: Option<String>,
    counter: u64,
    extras: HashMap<String, Value>,
}

/// Store backed by a process-local map. Linearizable by construction, which
/// makes it suitable for tests and single-process embedding.
#[derive(Default)]
pub struct InMemoryLeaseStore {
    records: Mutex<HashMap<String, StoredRecord>>,
    transient_faults: AtomicU32,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` store calls fail with a transient error. Lets tests
    /// stand in for throttling and network partitions.
    pub fn inject_transient_faults(&self, n: u32) {
        self.transient_faults.store(n, Ordering::SeqCst);
    }

    fn check_fault(&self) -> Result<(), StoreError> {
        let consumed = self
            .transient_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            return Err(StoreError::Transient("injected fault".to_string()));
        }
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, StoredRecord>>, StoreError> {
        self.records
            .lock()
            .map_err(|_| StoreError::Rejected("lease store lock poisoned".to_string()))
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn ensure_table(&self, _read_cap: u64, _write_cap: u64) -> Result<(), StoreError> {
        self.check_fault()
    }

    async fn scan(&self) -> Result<Vec<LeaseRecord>, StoreError> {
        self.check_fault()?;
        let guard = self.lock()?;
        Ok(guard
            .iter()
            .map(|(key, rec)| LeaseRecord {
                key: key.clone(),
                owner: rec.owner.clone(),
                counter: rec.counter,
                extras: rec.extras.clone(),
            })
            .collect())
    }

    async fn ensure_key(&self, key: &str) -> Result<LeaseRecord, StoreError> {
        self.check_fault()?;
        let mut guard = self.lock()?;
        let rec = guard.entry(key.to_string()).or_default();
        Ok(LeaseRecord {
            key: key.to_string(),
            owner: rec.owner.clone(),
            counter: rec.counter,
            extras: rec.extras.clone(),
        })
    }

    async fn write(
        &self,
        key: &str,
        image: &WriteImage,
        cond: &WriteCondition,
    ) -> Result<(), StoreError> {
        self.check_fault()?;
        let mut guard = self.lock()?;
        match guard.get_mut(key) {
            Some(rec) => {
                let counter_holds = cond.counter.map_or(true, |c| c == rec.counter);
                let owner_holds = cond.owner.as_ref().map_or(true, |o| {
                    rec.owner.as_deref() == Some(o.as_str())
                });
                if !counter_holds || !owner_holds {
                    return Err(StoreError::ConditionFailed);
                }
                rec.owner = image.owner.clone();
                rec.counter = image.counter;
                if let Some(extras) = &image.extras {
                    rec.extras.extend(extras.clone());
                }
                Ok(())
            }
            None if cond.is_empty() => {
                guard.insert(
                    key.to_string(),
                    StoredRecord {
                        owner: image.owner.clone(),
                        counter: image.counter,
                        extras: image.extras.clone().unwrap_or_default(),
                    },
                );
                Ok(())
            }
            None => Err(StoreError::ConditionFailed),
        }
    }

    async fn remove(&self, key: &str, cond: &DeleteCondition) -> Result<(), StoreError> {
        self.check_fault()?;
        let mut guard = self.lock()?;
        match guard.get(key) {
            None => Ok(()),
            Some(rec) if rec.counter == cond.counter && rec.owner == cond.owner => {
                guard.remove(key);
                Ok(())
            }
            Some(_) => Err(StoreError::ConditionFailed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(owner: Option<&str>, counter: u64) -> WriteImage {
        WriteImage {
            owner: owner.map(str::to_string),
            counter,
            extras: None,
        }
    }

    fn cond(counter: Option<u64>, owner: Option<&str>) -> WriteCondition {
        WriteCondition {
            counter,
            owner: owner.map(str::to_string),
        }
    }

    async fn record(store: &InMemoryLeaseStore, key: &str) -> LeaseRecord {
        store
            .scan()
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.key == key)
            .expect("record present")
    }

    #[tokio::test]
    async fn unconditional_write_upserts() {
        let store = InMemoryLeaseStore::new();
        store
            .write("a", &image(Some("w1"), 1), &WriteCondition::default())
            .await
            .unwrap();
        let rec = record(&store, "a").await;
        assert_eq!(rec.owner.as_deref(), Some("w1"));
        assert_eq!(rec.counter, 1);
    }

    #[tokio::test]
    async fn stale_counter_is_refused_and_record_untouched() {
        let store = InMemoryLeaseStore::new();
        store.ensure_key("a").await.unwrap();
        store
            .write("a", &image(Some("w1"), 1), &WriteCondition::default())
            .await
            .unwrap();

        let err = store
            .write("a", &image(Some("w2"), 5), &cond(Some(4), None))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConditionFailed));

        let rec = record(&store, "a").await;
        assert_eq!(rec.owner.as_deref(), Some("w1"));
        assert_eq!(rec.counter, 1);
    }

    #[tokio::test]
    async fn owner_predicate_is_refused_on_mismatch() {
        let store = InMemoryLeaseStore::new();
        store
            .write("a", &image(Some("w1"), 1), &WriteCondition::default())
            .await
            .unwrap();
        let err = store
            .write("a", &image(Some("w2"), 2), &cond(Some(1), Some("w3")))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConditionFailed));
    }

    #[tokio::test]
    async fn conditioned_write_on_missing_record_fails() {
        let store = InMemoryLeaseStore::new();
        let err = store
            .write("ghost", &image(Some("w1"), 2), &cond(Some(1), None))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConditionFailed));
    }

    #[tokio::test]
    async fn ensure_key_leaves_existing_record_alone() {
        let store = InMemoryLeaseStore::new();
        store
            .write("a", &image(Some("w1"), 3), &WriteCondition::default())
            .await
            .unwrap();
        let returned = store.ensure_key("a").await.unwrap();
        assert_eq!(returned.owner.as_deref(), Some("w1"));
        assert_eq!(returned.counter, 3);

        let rec = record(&store, "a").await;
        assert_eq!(rec.owner.as_deref(), Some("w1"));
        assert_eq!(rec.counter, 3);
    }

    #[tokio::test]
    async fn remove_of_absent_record_succeeds() {
        let store = InMemoryLeaseStore::new();
        store
            .remove(
                "ghost",
                &DeleteCondition {
                    counter: 0,
                    owner: None,
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn remove_with_stale_counter_keeps_record() {
        let store = InMemoryLeaseStore::new();
        store
            .write("a", &image(Some("w1"), 6), &WriteCondition::default())
            .await
            .unwrap();
        let err = store
            .remove(
                "a",
                &DeleteCondition {
                    counter: 5,
                    owner: Some("w1".to_string()),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConditionFailed));
        assert_eq!(store.scan().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn write_merges_extras_without_dropping_old_ones() {
        let store = InMemoryLeaseStore::new();
        let mut first = HashMap::new();
        first.insert("checkpoint".to_string(), Value::from("0001"));
        store
            .write(
                "a",
                &WriteImage {
                    owner: Some("w1".to_string()),
                    counter: 1,
                    extras: Some(first),
                },
                &WriteCondition::default(),
            )
            .await
            .unwrap();

        // A plain owner/counter write must not strip caller attributes.
        store
            .write("a", &image(Some("w1"), 2), &cond(Some(1), Some("w1")))
            .await
            .unwrap();
        let rec = record(&store, "a").await;
        assert_eq!(rec.extras.get("checkpoint"), Some(&Value::from("0001")));
    }

    #[tokio::test]
    async fn injected_faults_are_transient_and_bounded() {
        let store = InMemoryLeaseStore::new();
        store.inject_transient_faults(1);
        assert!(matches!(
            store.scan().await.unwrap_err(),
            StoreError::Transient(_)
        ));
        assert!(store.scan().await.is_ok());
    }
}
