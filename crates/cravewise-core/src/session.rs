use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use cravewise_memory::RecordStore;
use cravewise_schema::{Substance, UserInfo, UserRecord};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::analytics::ANONYMOUS_ID_KEY;

/// Held while a load-modify-save of one user's record is in progress.
pub type RecordGuard = OwnedMutexGuard<()>;

/// Loads and saves whole user records. Records are values: every change
/// produces a new record that is written back under the same key.
///
/// Read-modify-write sequences must run under [`SessionStore::lock`] so two
/// updates of the same record cannot overwrite each other.
#[derive(Clone)]
pub struct SessionStore {
    store: Arc<dyn RecordStore>,
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl SessionStore {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Exclusive access to one user's record until the guard is dropped.
    pub async fn lock(&self, user_key: &str) -> RecordGuard {
        let slot = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(user_key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        slot.lock_owned().await
    }

    pub fn backend(&self) -> &dyn RecordStore {
        self.store.as_ref()
    }

    fn check_key(user_key: &str) -> Result<()> {
        if user_key.trim().is_empty() || user_key == ANONYMOUS_ID_KEY {
            return Err(anyhow!("invalid user key: {user_key:?}"));
        }
        Ok(())
    }

    pub async fn load(&self, user_key: &str) -> Result<UserRecord> {
        Self::check_key(user_key)?;
        Ok(self.store.get(user_key).await?.unwrap_or_default())
    }

    pub async fn save(&self, user_key: &str, record: &UserRecord) -> Result<()> {
        Self::check_key(user_key)?;
        self.store.put(user_key, record).await
    }

    /// Like [`SessionStore::save`], but returns only once the record is on durable storage.
    pub async fn save_durable(&self, user_key: &str, record: &UserRecord) -> Result<()> {
        Self::check_key(user_key)?;
        self.store.put_durable(user_key, record).await
    }

    /// Select the tracked substance. Picking a different one starts over.
    pub async fn select_substance(&self, user_key: &str, substance: Substance) -> Result<UserRecord> {
        let _guard = self.lock(user_key).await;
        let current = self.load(user_key).await?;
        let switching = current
            .selected_substance
            .as_ref()
            .is_some_and(|s| s.id != substance.id);
        if switching {
            tracing::info!(user_key, substance = %substance.id, "substance changed, resetting progress");
        }
        let next = current.with_substance(substance);
        self.save(user_key, &next).await?;
        Ok(next)
    }

    /// Set the profile. Requires a selected substance; resets the feedback memory.
    pub async fn set_profile(
        &self,
        user_key: &str,
        info: UserInfo,
        now: DateTime<Utc>,
    ) -> Result<UserRecord> {
        let _guard = self.lock(user_key).await;
        let current = self.load(user_key).await?;
        if current.selected_substance.is_none() {
            return Err(anyhow!("select a substance before setting up the profile"));
        }
        let next = current.with_profile(info, now);
        self.save(user_key, &next).await?;
        Ok(next)
    }
}
