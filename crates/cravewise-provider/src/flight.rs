//! Per-session single-flight tracking for model invocations.
//!
//! At most one invocation per session may be pending. A second reservation
//! while one is held is rejected rather than queued.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

#[derive(Clone, Default)]
pub struct FlightTracker {
    slots: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
}

impl FlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the session's single slot without waiting.
    /// Returns None if an invocation is already in flight for this session.
    pub async fn try_reserve(&self, session_key: &str) -> Option<FlightPermit> {
        // Acquire under the map lock so cleanup never drops a slot between
        // lookup and acquisition.
        let mut slots = self.slots.lock().await;
        let slot = slots
            .entry(session_key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone();

        match slot.try_acquire_owned() {
            Ok(permit) => Some(FlightPermit {
                session_key: session_key.to_string(),
                _permit: permit,
            }),
            Err(_) => None,
        }
    }

    pub async fn is_in_flight(&self, session_key: &str) -> bool {
        let slots = self.slots.lock().await;
        slots
            .get(session_key)
            .is_some_and(|slot| slot.available_permits() == 0)
    }

    /// Drop slots for sessions with nothing in flight.
    pub async fn cleanup_unused(&self) {
        let mut slots = self.slots.lock().await;
        slots.retain(|_, slot| slot.available_permits() < 1);
    }

    pub async fn tracked_sessions(&self) -> usize {
        self.slots.lock().await.len()
    }
}

/// Proof that the holder owns the session's in-flight slot. Released on drop.
#[derive(Debug)]
pub struct FlightPermit {
    session_key: String,
    _permit: OwnedSemaphorePermit,
}

impl FlightPermit {
    pub fn session_key(&self) -> &str {
        &self.session_key
    }
}
