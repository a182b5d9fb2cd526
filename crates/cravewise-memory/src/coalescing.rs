//! Write-coalescing wrapper around a [`RecordStore`].
//!
//! Writes are buffered per key and reach the inner store only after the key
//! has been quiet for the configured period, on [`CoalescingStore::flush`],
//! or on [`CoalescingStore::shutdown`]. Reads see buffered values first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::RecordStore;

struct PendingWrite {
    value: String,
    stamped: Instant,
}

struct Shared<S> {
    inner: S,
    pending: Mutex<HashMap<String, PendingWrite>>,
    /// Serializes writes to `inner` so an older value never lands after a newer one.
    flush_lock: Mutex<()>,
    quiescence: Duration,
    closed: AtomicBool,
}

pub struct CoalescingStore<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for CoalescingStore<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: RecordStore + 'static> CoalescingStore<S> {
    pub fn new(inner: S, quiescence: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner,
                pending: Mutex::new(HashMap::new()),
                flush_lock: Mutex::new(()),
                quiescence,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn inner(&self) -> &S {
        &self.shared.inner
    }

    pub async fn pending_len(&self) -> usize {
        self.shared.pending.lock().await.len()
    }

    /// Write every buffered value now, regardless of quiescence.
    pub async fn flush(&self) -> Result<()> {
        self.shared.write_pending(|_| true).await
    }

    /// Flush and switch to write-through. Later writes bypass the buffer.
    pub async fn shutdown(&self) -> Result<()> {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.flush().await
    }
}

impl<S: RecordStore + 'static> Shared<S> {
    /// Take the entries selected by `ready` and write them to the inner store.
    /// Failed entries go back into the buffer unless a newer value replaced them.
    async fn write_pending(&self, ready: impl Fn(&PendingWrite) -> bool) -> Result<()> {
        let _guard = self.flush_lock.lock().await;

        let batch: Vec<(String, PendingWrite)> = {
            let mut pending = self.pending.lock().await;
            let keys: Vec<String> = pending
                .iter()
                .filter(|(_, write)| ready(write))
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| pending.remove(&key).map(|write| (key, write)))
                .collect()
        };

        let mut first_error = None;
        for (key, write) in batch {
            if let Err(e) = self.inner.put_raw(&key, write.value.clone()).await {
                tracing::error!(key = %key, error = %e, "buffered write failed, will retry");
                let mut pending = self.pending.lock().await;
                pending.entry(key).or_insert(PendingWrite {
                    value: write.value,
                    stamped: Instant::now(),
                });
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn flush_quiet(self: Arc<Self>) {
        let quiescence = self.quiescence;
        let now = Instant::now();
        let result = self
            .write_pending(|write| now.duration_since(write.stamped) >= quiescence)
            .await;
        if result.is_err() && !self.pending.lock().await.is_empty() {
            // Re-arm so failed keys get another attempt after a quiet period.
            Shared::schedule(self);
        }
    }

    fn schedule(shared: Arc<Self>) {
        tokio::spawn(async move {
            tokio::time::sleep(shared.quiescence).await;
            shared.flush_quiet().await;
        });
    }
}

#[async_trait]
impl<S: RecordStore + 'static> RecordStore for CoalescingStore<S> {
    async fn get_raw(&self, key: &str) -> Result<Option<String>> {
        if let Some(write) = self.shared.pending.lock().await.get(key) {
            return Ok(Some(write.value.clone()));
        }
        self.shared.inner.get_raw(key).await
    }

    async fn put_raw(&self, key: &str, value: String) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return self.shared.inner.put_raw(key, value).await;
        }
        self.shared.pending.lock().await.insert(
            key.to_string(),
            PendingWrite {
                value,
                stamped: Instant::now(),
            },
        );
        Shared::schedule(Arc::clone(&self.shared));
        Ok(())
    }

    async fn put_raw_durable(&self, key: &str, value: String) -> Result<()> {
        let _guard = self.shared.flush_lock.lock().await;
        // Any buffered value for this key is older than `value`.
        self.shared.pending.lock().await.remove(key);
        if let Err(e) = self.shared.inner.put_raw(key, value.clone()).await {
            self.shared
                .pending
                .lock()
                .await
                .entry(key.to_string())
                .or_insert(PendingWrite {
                    value,
                    stamped: Instant::now(),
                });
            Shared::schedule(Arc::clone(&self.shared));
            return Err(e);
        }
        Ok(())
    }
}
