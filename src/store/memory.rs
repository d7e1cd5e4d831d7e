use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Clock, KvStore, StoreError, SystemClock, expiry, is_live};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at_ms: Option<u64>,
}

/// Process-local store. Expired entries are dropped lazily on access.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if is_live(entry.expires_at_ms, now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl_ms: Option<u64>) -> Result<(), StoreError> {
        let expires_at_ms = expiry(self.clock.now_millis(), ttl_ms);
        self.entries.lock().await.insert(
            key.to_string(),
            Entry {
                value,
                expires_at_ms,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = self.clock.now_millis();
        let removed = self.entries.lock().await.remove(key);
        Ok(removed.is_some_and(|entry| is_live(entry.expires_at_ms, now)))
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| is_live(entry.expires_at_ms, now));
        Ok(entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::store::ManualClock;

    #[tokio::test]
    async fn values_expire_after_ttl() {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = MemoryStore::with_clock(clock.clone());

        store.set("a", "1".to_string(), Some(500)).await.unwrap();
        store.set("b", "2".to_string(), None).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));

        clock.advance(Duration::from_millis(500));
        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(store.get("b").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn scan_filters_prefix_and_expired_keys() {
        let clock = Arc::new(ManualClock::new(0));
        let store = MemoryStore::with_clock(clock.clone());
        store.set("auth:meta:a", "{}".into(), None).await.unwrap();
        store.set("auth:meta:b", "{}".into(), Some(10)).await.unwrap();
        store.set("auth:token:a", "t".into(), None).await.unwrap();

        clock.advance(Duration::from_millis(20));
        let keys = store.scan("auth:meta:").await.unwrap();
        assert_eq!(keys, vec!["auth:meta:a".to_string()]);
    }

    #[tokio::test]
    async fn delete_reports_whether_a_value_existed() {
        let store = MemoryStore::new();
        store.set("k", "v".into(), None).await.unwrap();
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    }
}
