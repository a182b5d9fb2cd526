pub mod coalescing;
pub mod store;

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cravewise_schema::UserRecord;
use tokio::sync::RwLock;

pub use coalescing::CoalescingStore;
pub use store::SqliteRecordStore;

/// Key-value persistence for user records and small scalar values.
///
/// Implementors only provide raw string storage; records are encoded as JSON.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_raw(&self, key: &str) -> Result<Option<String>>;
    async fn put_raw(&self, key: &str, value: String) -> Result<()>;

    /// Write `value` so that it is on durable storage when this returns.
    /// Stores that buffer writes must bypass the buffer here.
    async fn put_raw_durable(&self, key: &str, value: String) -> Result<()> {
        self.put_raw(key, value).await
    }

    async fn get(&self, user_key: &str) -> Result<Option<UserRecord>> {
        match self.get_raw(user_key).await? {
            Some(raw) => {
                let record = serde_json::from_str(&raw)
                    .with_context(|| format!("corrupt user record under key {user_key}"))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, user_key: &str, record: &UserRecord) -> Result<()> {
        let raw = serde_json::to_string(record)?;
        self.put_raw(user_key, raw).await
    }

    async fn put_durable(&self, user_key: &str, record: &UserRecord) -> Result<()> {
        let raw = serde_json::to_string(record)?;
        self.put_raw_durable(user_key, raw).await
    }
}

/// Volatile store for tests and one-shot runs.
#[derive(Default)]
pub struct InMemoryRecordStore {
    entries: RwLock<HashMap<String, String>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn get_raw(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put_raw(&self, key: &str, value: String) -> Result<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cravewise_schema::find_substance;

    #[tokio::test]
    async fn missing_record_is_none() {
        let store = InMemoryRecordStore::new();
        assert!(store.get("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn record_roundtrips_through_json() {
        let store = InMemoryRecordStore::new();
        let record = UserRecord::default().with_substance(find_substance("kofeina").unwrap());
        store.put("u1", &record).await.unwrap();

        let loaded = store.get("u1").await.unwrap().unwrap();
        assert_eq!(loaded, record);
        let raw = store.get_raw("u1").await.unwrap().unwrap();
        assert!(raw.contains("selectedSubstance"));
    }

    #[tokio::test]
    async fn corrupt_record_is_an_error() {
        let store = InMemoryRecordStore::new();
        store.put_raw("u1", "{not json".into()).await.unwrap();
        let err = store.get("u1").await.unwrap_err();
        assert!(err.to_string().contains("corrupt user record"));
    }
}
