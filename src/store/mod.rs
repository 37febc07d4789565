//! Credential token store.
//!
//! Records are keyed by `(user_id, provider)` and carry an encrypted token
//! blob plus the bookkeeping the refresh coordinator needs: access-token
//! expiry, a housekeeping TTL, a monotonic version, and the
//! claim-with-deadline field marking an in-flight refresh.
//!
//! All writes to an existing record go through `compare_and_swap` — the
//! trait deliberately has no plain overwrite, so concurrent refreshers
//! cannot lose updates. TTL expungement is a store-level guarantee:
//! records past their TTL read as `NotFound` and a background purge task
//! deletes the rows.

use chrono::Utc;
use serde::{Deserialize, Serialize};

mod sqlite;

pub use sqlite::{run_ttl_purge, SqliteTokenStore};

/// Composite record key: one credential per user per provider.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CredentialKey {
    pub user_id: String,
    pub provider: String,
}

impl CredentialKey {
    pub fn new(user_id: &str, provider: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            provider: provider.to_string(),
        }
    }
}

impl std::fmt::Display for CredentialKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.user_id, self.provider)
    }
}

/// Stored credential record.
///
/// `version` is stamped by the store: `put_new` writes version 1, and a
/// successful `compare_and_swap` writes `expected_version + 1`. Callers
/// read it but never choose it.
#[derive(Clone, Debug)]
pub struct CredentialRecord {
    /// Envelope ciphertext of the serialized [`TokenMaterial`]
    pub encrypted_blob: String,
    /// Access-token expiry (epoch seconds)
    pub expires_at: i64,
    /// Housekeeping bound (epoch seconds) — past this the record reads as
    /// `NotFound` and is eligible for purge
    pub ttl: i64,
    /// Monotonic counter for optimistic concurrency
    pub version: i64,
    /// Deadline of an in-flight refresh claim, if any (epoch seconds).
    /// A claim past its deadline is reclaimable.
    pub refresh_claim_expires_at: Option<i64>,
}

/// Plaintext content of the encrypted blob.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenMaterial {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
    /// When these tokens were issued (epoch seconds)
    pub issued_at: i64,
}

/// Store operation errors.
#[derive(Debug)]
pub enum StoreError {
    /// No record for the key (or the record is past its TTL)
    NotFound,
    /// `put_new` hit an existing record
    AlreadyExists,
    /// `compare_and_swap` expected a different version
    VersionConflict,
    /// The backing store is unreachable or failed
    Backend(anyhow::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound => write!(f, "record not found"),
            StoreError::AlreadyExists => write!(f, "record already exists"),
            StoreError::VersionConflict => write!(f, "record version conflict"),
            StoreError::Backend(e) => write!(f, "store backend error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

/// Key-value credential store with optimistic concurrency.
///
/// Implementations must guarantee that readers never observe a partially
/// written record and that `compare_and_swap` is atomic per key.
pub trait TokenStore: Send + Sync {
    /// Read a record. Records past their TTL return `NotFound`.
    fn get(&self, key: &CredentialKey) -> Result<CredentialRecord, StoreError>;

    /// Create a record that must not already exist. Stamps version 1.
    fn put_new(&self, key: &CredentialKey, record: &CredentialRecord) -> Result<(), StoreError>;

    /// Replace a record iff its current version equals `expected_version`.
    /// Stamps `expected_version + 1`.
    fn compare_and_swap(
        &self,
        key: &CredentialKey,
        expected_version: i64,
        record: &CredentialRecord,
    ) -> Result<(), StoreError>;

    /// Delete a record. Deleting a missing record is not an error.
    fn delete(&self, key: &CredentialKey) -> Result<(), StoreError>;
}

/// Current wall-clock in epoch seconds.
pub(crate) fn epoch_now() -> i64 {
    Utc::now().timestamp()
}
