//! Anti-forgery state management for the authorization flow.
//!
//! Each `/start` mints an opaque single-use state token bound to the
//! requesting user and provider. The callback consumes it exactly once;
//! replay or use after expiry is rejected.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// What a state token was minted for.
#[derive(Clone, Debug)]
pub struct StateEntry {
    pub provider: String,
    pub user_id: String,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// State token manager with automatic expiration.
#[derive(Clone)]
pub struct StateManager {
    states: Arc<Mutex<HashMap<String, StateEntry>>>,
    expiry_duration: Duration,
}

impl StateManager {
    /// `expiry_seconds` — how long a minted state stays valid (default 600).
    pub fn new(expiry_seconds: i64) -> Self {
        Self {
            states: Arc::new(Mutex::new(HashMap::new())),
            expiry_duration: Duration::seconds(expiry_seconds),
        }
    }

    /// Mints a new state token bound to `(user_id, provider)`.
    pub fn create_state(
        &self,
        provider: &str,
        user_id: &str,
        display_name: Option<&str>,
    ) -> String {
        let state = Uuid::new_v4().to_string();
        let entry = StateEntry {
            provider: provider.to_string(),
            user_id: user_id.to_string(),
            display_name: display_name.map(|s| s.to_string()),
            created_at: Utc::now(),
        };

        let mut states = self.states.lock().unwrap();
        states.insert(state.clone(), entry);

        state
    }

    /// Validates and consumes a state token (single-use).
    ///
    /// Returns the entry if it exists and has not expired, `None`
    /// otherwise. The token is removed either way.
    pub fn validate_and_consume(&self, state: &str) -> Option<StateEntry> {
        let mut states = self.states.lock().unwrap();

        let entry = states.remove(state)?;

        if Utc::now() - entry.created_at > self.expiry_duration {
            return None;
        }

        Some(entry)
    }

    /// Removes expired states. Called periodically by the cleanup task.
    pub fn cleanup_expired(&self) {
        let mut states = self.states.lock().unwrap();
        let now = Utc::now();

        states.retain(|_, entry| now - entry.created_at <= self.expiry_duration);
    }

    /// Count of live states (for monitoring).
    pub fn count(&self) -> usize {
        self.states.lock().unwrap().len()
    }
}

/// Background task that periodically sweeps expired states.
pub async fn run_state_cleanup(manager: StateManager, interval_seconds: u64) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds));

    loop {
        interval.tick().await;
        manager.cleanup_expired();
        tracing::debug!(remaining = manager.count(), "OAuth state cleanup complete");
    }
}
