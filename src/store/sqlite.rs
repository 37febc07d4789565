//! SQLite-backed token store.
//!
//! # Schema
//! ```sql
//! CREATE TABLE credentials (
//!     user_id TEXT NOT NULL,
//!     provider TEXT NOT NULL,
//!     encrypted_blob TEXT NOT NULL,
//!     expires_at INTEGER NOT NULL,          -- epoch seconds
//!     ttl INTEGER NOT NULL,                 -- epoch seconds
//!     version INTEGER NOT NULL,
//!     refresh_claim_expires_at INTEGER,     -- epoch seconds, NULL = no claim
//!     created_at INTEGER NOT NULL,
//!     updated_at INTEGER NOT NULL,
//!     PRIMARY KEY (user_id, provider)
//! );
//! ```
//!
//! # Concurrency
//! - Connection is wrapped in a Mutex; SQLite row writes are atomic, so
//!   readers never see a torn record
//! - `compare_and_swap` is a single conditional UPDATE checking `version`,
//!   which is what makes the refresh claim race safe

use super::{epoch_now, CredentialKey, CredentialRecord, StoreError};
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

pub struct SqliteTokenStore {
    conn: Mutex<Connection>,
}

impl SqliteTokenStore {
    /// Opens or creates the store at `db_path` (`:memory:` for tests).
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open credentials database")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                user_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                encrypted_blob TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                ttl INTEGER NOT NULL,
                version INTEGER NOT NULL,
                refresh_claim_expires_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, provider)
            )
            "#,
            [],
        )
        .context("Failed to create credentials table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Deletes all records past their TTL. Returns the number removed.
    pub fn purge_expired(&self) -> Result<usize> {
        let removed = self
            .conn
            .lock()
            .unwrap()
            .execute(
                "DELETE FROM credentials WHERE ttl <= ?1",
                params![epoch_now()],
            )
            .context("Failed to purge expired credentials")?;
        Ok(removed)
    }
}

impl super::TokenStore for SqliteTokenStore {
    fn get(&self, key: &CredentialKey) -> Result<CredentialRecord, StoreError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                r#"
                SELECT encrypted_blob, expires_at, ttl, version, refresh_claim_expires_at
                FROM credentials
                WHERE user_id = ?1 AND provider = ?2
                "#,
                params![key.user_id, key.provider],
                |row| {
                    Ok(CredentialRecord {
                        encrypted_blob: row.get(0)?,
                        expires_at: row.get(1)?,
                        ttl: row.get(2)?,
                        version: row.get(3)?,
                        refresh_claim_expires_at: row.get(4)?,
                    })
                },
            )
            .optional()
            .map_err(|e| StoreError::Backend(e.into()))?;

        match row {
            // Past-TTL rows read as missing; the purge task removes them
            Some(record) if record.ttl <= epoch_now() => Err(StoreError::NotFound),
            Some(record) => Ok(record),
            None => Err(StoreError::NotFound),
        }
    }

    fn put_new(&self, key: &CredentialKey, record: &CredentialRecord) -> Result<(), StoreError> {
        let now = epoch_now();
        let result = self.conn.lock().unwrap().execute(
            r#"
            INSERT INTO credentials (
                user_id, provider, encrypted_blob, expires_at, ttl,
                version, refresh_claim_expires_at, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7, ?7)
            "#,
            params![
                key.user_id,
                key.provider,
                record.encrypted_blob,
                record.expires_at,
                record.ttl,
                record.refresh_claim_expires_at,
                now,
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::AlreadyExists)
            }
            Err(e) => Err(StoreError::Backend(e.into())),
        }
    }

    fn compare_and_swap(
        &self,
        key: &CredentialKey,
        expected_version: i64,
        record: &CredentialRecord,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                r#"
                UPDATE credentials SET
                    encrypted_blob = ?1,
                    expires_at = ?2,
                    ttl = ?3,
                    version = version + 1,
                    refresh_claim_expires_at = ?4,
                    updated_at = ?5
                WHERE user_id = ?6 AND provider = ?7 AND version = ?8
                "#,
                params![
                    record.encrypted_blob,
                    record.expires_at,
                    record.ttl,
                    record.refresh_claim_expires_at,
                    epoch_now(),
                    key.user_id,
                    key.provider,
                    expected_version,
                ],
            )
            .map_err(|e| StoreError::Backend(e.into()))?;

        if changed > 0 {
            return Ok(());
        }

        // Nothing matched: distinguish a missing record from a version race
        let exists: Option<i64> = conn
            .query_row(
                "SELECT version FROM credentials WHERE user_id = ?1 AND provider = ?2",
                params![key.user_id, key.provider],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::Backend(e.into()))?;

        match exists {
            Some(_) => Err(StoreError::VersionConflict),
            None => Err(StoreError::NotFound),
        }
    }

    fn delete(&self, key: &CredentialKey) -> Result<(), StoreError> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                "DELETE FROM credentials WHERE user_id = ?1 AND provider = ?2",
                params![key.user_id, key.provider],
            )
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }
}

/// Background task that periodically purges past-TTL records.
pub async fn run_ttl_purge(store: Arc<SqliteTokenStore>, interval_seconds: u64) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds));

    loop {
        interval.tick().await;
        match store.purge_expired() {
            Ok(removed) if removed > 0 => {
                debug!(removed, "TTL purge removed expired credential records")
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "TTL purge failed"),
        }
    }
}
