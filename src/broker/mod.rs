//! Token refresh coordinator.
//!
//! `acquire_token` is what the agent calls at tool-call time. It serves
//! decrypted access tokens from the store, refreshing them behind a
//! per-key claim so that at most one refresh is in flight per
//! `(user_id, provider)` at any time. Racing callers either serve the
//! stale-but-valid token while the winner refreshes, or poll with
//! bounded jittered backoff until the winner's write lands.
//!
//! Exclusivity is not an optimization: rotating-refresh providers
//! invalidate the old refresh token on every use, so two concurrent
//! refreshes destroy the credential.

pub mod api;

use crate::crypto::EnvelopeCipher;
use crate::oauth::{self, ProviderConfig, ProviderRegistry, RefreshError};
use crate::store::{CredentialKey, CredentialRecord, StoreError, TokenMaterial, TokenStore};
use anyhow::anyhow;
use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Tuning knobs for the coordinator. Deployment-specific values, exposed
/// as configuration rather than hard-coded.
#[derive(Clone, Debug)]
pub struct BrokerTuning {
    /// Refresh-ahead margin: tokens expiring within this window are
    /// refreshed rather than served (seconds)
    pub refresh_margin_seconds: i64,
    /// How long a refresh claim is honored before it is considered
    /// abandoned and reclaimable (seconds)
    pub claim_seconds: i64,
    /// Base backoff between race-loser polls (milliseconds)
    pub poll_backoff_ms: u64,
    /// Random jitter added to each poll backoff (milliseconds)
    pub poll_backoff_jitter_ms: u64,
    /// Bounded polling: how many reads a loser attempts before giving up
    pub max_poll_attempts: u32,
    /// Housekeeping TTL stamped on refreshed records (seconds)
    pub record_ttl_seconds: i64,
    /// Expiry of portal links embedded in AuthRequired results (seconds)
    pub portal_token_expiry_seconds: i64,
}

impl Default for BrokerTuning {
    fn default() -> Self {
        Self {
            refresh_margin_seconds: 60,
            claim_seconds: 30,
            poll_backoff_ms: 250,
            poll_backoff_jitter_ms: 250,
            max_poll_attempts: 20,
            record_ttl_seconds: 90 * 86_400,
            portal_token_expiry_seconds: 600,
        }
    }
}

/// Result of a successful `acquire_token` call.
#[derive(Clone, Debug)]
pub enum TokenOutcome {
    /// A valid bearer token and its absolute expiry (epoch seconds)
    Token {
        access_token: String,
        expires_at: i64,
    },
    /// No usable credential — the user must (re)authorize via the link
    AuthRequired { authorize_url: String },
}

/// Coordinator failures. `AuthRequired` is not here — needing to
/// authorize is an outcome, not a fault.
#[derive(Debug)]
pub enum AcquireError {
    /// The requested provider is not configured
    UnknownProvider(String),
    /// Encryption backend failure — fails closed, never serves plaintext
    Crypto(anyhow::Error),
    /// Token store failure
    Store(StoreError),
    /// Provider unreachable, or a refresh stayed in flight past the
    /// bounded polling window. Transient; caller may retry with backoff.
    Upstream(anyhow::Error),
}

impl std::fmt::Display for AcquireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AcquireError::UnknownProvider(name) => {
                write!(f, "provider '{}' is not configured", name)
            }
            AcquireError::Crypto(e) => write!(f, "crypto failure: {}", e),
            AcquireError::Store(e) => write!(f, "store failure: {}", e),
            AcquireError::Upstream(e) => write!(f, "upstream failure: {}", e),
        }
    }
}

impl std::error::Error for AcquireError {}

/// Per-user token broker. Cheap to clone behind an Arc; all state lives
/// in the store.
pub struct TokenBroker {
    store: Arc<dyn TokenStore>,
    cipher: Arc<EnvelopeCipher>,
    providers: Arc<ProviderRegistry>,
    portal_signing_secret: String,
    public_base_url: String,
    tuning: BrokerTuning,
}

impl TokenBroker {
    pub fn new(
        store: Arc<dyn TokenStore>,
        cipher: Arc<EnvelopeCipher>,
        providers: Arc<ProviderRegistry>,
        portal_signing_secret: String,
        public_base_url: String,
        tuning: BrokerTuning,
    ) -> Self {
        Self {
            store,
            cipher,
            providers,
            portal_signing_secret,
            public_base_url,
            tuning,
        }
    }

    /// Returns a valid access token for `(user_id, provider)`, refreshing
    /// it if needed, or an AuthRequired outcome carrying the portal link.
    pub async fn acquire_token(
        &self,
        user_id: &str,
        provider_name: &str,
    ) -> Result<TokenOutcome, AcquireError> {
        let provider = self
            .providers
            .get(provider_name)
            .ok_or_else(|| AcquireError::UnknownProvider(provider_name.to_string()))?;

        let key = CredentialKey::new(user_id, provider_name);

        for attempt in 0..self.tuning.max_poll_attempts {
            let record = match self.store.get(&key) {
                Ok(record) => record,
                Err(StoreError::NotFound) => {
                    debug!(key = %key, "No credential record — authorization required");
                    return Ok(self.auth_required(user_id, provider_name));
                }
                Err(e) => return Err(AcquireError::Store(e)),
            };

            let now = Utc::now().timestamp();

            // Fresh enough: serve directly, no refresh
            if record.expires_at - now > self.tuning.refresh_margin_seconds {
                return self.serve(&record);
            }

            // Inside the margin. Is someone already refreshing?
            if let Some(claim) = record.refresh_claim_expires_at {
                if claim > now {
                    if record.expires_at > now {
                        // Stale but valid — serve it while the winner works
                        debug!(key = %key, "Serving stale-but-valid token during refresh");
                        return self.serve(&record);
                    }
                    // Expired and claimed: wait for the winner's write
                    debug!(key = %key, attempt, "Refresh in flight — backing off");
                    self.backoff().await;
                    continue;
                }
                // Claim past its deadline: the refresher crashed or stalled.
                // Fall through and try to reclaim the slot.
                warn!(key = %key, "Reclaiming abandoned refresh claim");
            }

            let mut claimed = record.clone();
            claimed.refresh_claim_expires_at = Some(now + self.tuning.claim_seconds);

            match self
                .store
                .compare_and_swap(&key, record.version, &claimed)
            {
                Ok(()) => {
                    // We own the slot; version is now record.version + 1
                    return self
                        .perform_refresh(&key, provider, record.version + 1, &claimed)
                        .await;
                }
                Err(StoreError::VersionConflict) => {
                    // Lost the race — converge on the winner's result
                    self.backoff().await;
                    continue;
                }
                Err(StoreError::NotFound) => {
                    // Deleted under us (revocation or invalid_grant)
                    return Ok(self.auth_required(user_id, provider_name));
                }
                Err(e) => return Err(AcquireError::Store(e)),
            }
        }

        Err(AcquireError::Upstream(anyhow!(
            "refresh for {} still in flight after {} polls",
            key,
            self.tuning.max_poll_attempts
        )))
    }

    /// The winner's path: call the provider, write the result back with
    /// the expected version, clear the claim.
    async fn perform_refresh(
        &self,
        key: &CredentialKey,
        provider: &ProviderConfig,
        claimed_version: i64,
        claimed: &CredentialRecord,
    ) -> Result<TokenOutcome, AcquireError> {
        let material = match self.open_material(claimed) {
            Ok(material) => material,
            Err(e) => {
                // Fail closed, but do not wedge the slot
                self.clear_claim(key, claimed_version, claimed);
                return Err(e);
            }
        };

        let refresh_token = match material.refresh_token {
            Some(ref token) => token.clone(),
            None => {
                // Nothing to refresh with — the credential is dead
                info!(key = %key, "No refresh token stored — deleting record");
                if let Err(e) = self.store.delete(key) {
                    return Err(AcquireError::Store(e));
                }
                return Ok(self.auth_required(&key.user_id, &key.provider));
            }
        };

        info!(key = %key, "Refreshing access token");
        match oauth::refresh_grant(
            &provider.token_url,
            &refresh_token,
            &provider.client_id,
            &provider.client_secret,
        )
        .await
        {
            Ok(grant) => {
                let now = Utc::now().timestamp();
                let new_material = TokenMaterial {
                    access_token: grant.access_token.clone(),
                    // Rotating providers send a replacement; keep the old
                    // one only when they don't
                    refresh_token: grant.refresh_token.or(Some(refresh_token)),
                    scope: grant.scope.or(material.scope),
                    issued_at: now,
                };

                let blob = self
                    .cipher
                    .seal(&serde_json::to_string(&new_material).map_err(|e| {
                        AcquireError::Crypto(anyhow!(e).context("encode token material"))
                    })?)
                    .map_err(AcquireError::Crypto)?;

                let updated = CredentialRecord {
                    encrypted_blob: blob,
                    expires_at: grant.expires_at,
                    ttl: now + self.tuning.record_ttl_seconds,
                    version: 0,
                    refresh_claim_expires_at: None,
                };

                match self.store.compare_and_swap(key, claimed_version, &updated) {
                    Ok(()) => {
                        info!(key = %key, expires_at = grant.expires_at, "Token refreshed");
                        Ok(TokenOutcome::Token {
                            access_token: grant.access_token,
                            expires_at: grant.expires_at,
                        })
                    }
                    Err(e) => {
                        // Our claim outlived its deadline and someone
                        // reclaimed it — their refresh superseded ours
                        error!(key = %key, error = %e, "Refresh write lost its claim");
                        Err(AcquireError::Store(e))
                    }
                }
            }
            Err(RefreshError::InvalidGrant) => {
                // Dead credential: delete and send the user back through
                // the authorization flow
                info!(key = %key, "Provider rejected refresh token — deleting record");
                if let Err(e) = self.store.delete(key) {
                    return Err(AcquireError::Store(e));
                }
                Ok(self.auth_required(&key.user_id, &key.provider))
            }
            Err(RefreshError::Provider(e)) => {
                warn!(key = %key, error = %e, "Refresh failed — releasing claim");
                self.clear_claim(key, claimed_version, claimed);
                Err(AcquireError::Upstream(e))
            }
        }
    }

    /// Decrypts a record and returns its access token.
    fn serve(&self, record: &CredentialRecord) -> Result<TokenOutcome, AcquireError> {
        let material = self.open_material(record)?;
        Ok(TokenOutcome::Token {
            access_token: material.access_token,
            expires_at: record.expires_at,
        })
    }

    fn open_material(&self, record: &CredentialRecord) -> Result<TokenMaterial, AcquireError> {
        let plaintext = self
            .cipher
            .open(&record.encrypted_blob)
            .map_err(AcquireError::Crypto)?;
        serde_json::from_str(&plaintext)
            .map_err(|e| AcquireError::Crypto(anyhow!(e).context("decode token material")))
    }

    /// Best-effort release of a claim we own. A failure here only delays
    /// the next refresher until the claim deadline passes.
    fn clear_claim(&self, key: &CredentialKey, claimed_version: i64, claimed: &CredentialRecord) {
        let mut released = claimed.clone();
        released.refresh_claim_expires_at = None;
        if let Err(e) = self.store.compare_and_swap(key, claimed_version, &released) {
            warn!(key = %key, error = %e, "Failed to release refresh claim");
        }
    }

    fn auth_required(&self, user_id: &str, provider_name: &str) -> TokenOutcome {
        TokenOutcome::AuthRequired {
            authorize_url: oauth::authorize_link(
                &self.public_base_url,
                provider_name,
                &self.portal_signing_secret,
                user_id,
                None,
                self.tuning.portal_token_expiry_seconds,
            ),
        }
    }

    async fn backoff(&self) {
        let jitter = if self.tuning.poll_backoff_jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.tuning.poll_backoff_jitter_ms)
        } else {
            0
        };
        tokio::time::sleep(std::time::Duration::from_millis(
            self.tuning.poll_backoff_ms + jitter,
        ))
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{EnvelopeCipher, LocalMasterKey};
    use crate::store::SqliteTokenStore;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

    fn test_cipher() -> Arc<EnvelopeCipher> {
        let key = BASE64.encode([1u8; 32]);
        Arc::new(EnvelopeCipher::new(Arc::new(
            LocalMasterKey::from_base64(&key).unwrap(),
        )))
    }

    fn test_provider(token_url: &str) -> ProviderConfig {
        ProviderConfig {
            auth_url: "https://provider.test/authorize".to_string(),
            token_url: token_url.to_string(),
            scopes: vec!["read".to_string()],
            extra_authorize_params: vec![],
            rotates_refresh_tokens: true,
            client_id: "cid".to_string(),
            client_secret: "csecret".to_string(),
        }
    }

    fn test_broker(
        store: Arc<SqliteTokenStore>,
        cipher: Arc<EnvelopeCipher>,
        token_url: &str,
        tuning: BrokerTuning,
    ) -> TokenBroker {
        let mut providers = ProviderRegistry::default();
        providers.insert("atlassian", test_provider(token_url));
        TokenBroker::new(
            store,
            cipher,
            Arc::new(providers),
            "portal-secret".to_string(),
            "https://conduit.test".to_string(),
            tuning,
        )
    }

    fn seed_record(
        store: &SqliteTokenStore,
        cipher: &EnvelopeCipher,
        key: &CredentialKey,
        expires_in: i64,
        claim_offset: Option<i64>,
    ) {
        let now = Utc::now().timestamp();
        let material = TokenMaterial {
            access_token: "old-access".to_string(),
            refresh_token: Some("old-refresh".to_string()),
            scope: Some("read".to_string()),
            issued_at: now,
        };
        let blob = cipher
            .seal(&serde_json::to_string(&material).unwrap())
            .unwrap();
        crate::store::TokenStore::put_new(
            store,
            key,
            &CredentialRecord {
                encrypted_blob: blob,
                expires_at: now + expires_in,
                ttl: now + 86_400,
                version: 0,
                refresh_claim_expires_at: claim_offset.map(|o| now + o),
            },
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_missing_record_is_auth_required() {
        let store = Arc::new(SqliteTokenStore::new(":memory:").unwrap());
        let broker = test_broker(
            store,
            test_cipher(),
            "http://127.0.0.1:1/token",
            BrokerTuning::default(),
        );

        let outcome = broker.acquire_token("U1", "atlassian").await.unwrap();
        match outcome {
            TokenOutcome::AuthRequired { authorize_url } => {
                assert!(authorize_url.starts_with("https://conduit.test/auth/atlassian/start?"));
            }
            other => panic!("expected AuthRequired, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let store = Arc::new(SqliteTokenStore::new(":memory:").unwrap());
        let broker = test_broker(
            store,
            test_cipher(),
            "http://127.0.0.1:1/token",
            BrokerTuning::default(),
        );

        let result = broker.acquire_token("U1", "nonexistent").await;
        assert!(matches!(result, Err(AcquireError::UnknownProvider(_))));
    }

    #[tokio::test]
    async fn test_fresh_token_served_without_refresh() {
        let store = Arc::new(SqliteTokenStore::new(":memory:").unwrap());
        let cipher = test_cipher();
        let key = CredentialKey::new("U1", "atlassian");
        seed_record(&store, &cipher, &key, 3600, None);

        // token_url is unroutable — any refresh attempt would error
        let broker = test_broker(
            Arc::clone(&store),
            cipher,
            "http://127.0.0.1:1/token",
            BrokerTuning::default(),
        );

        match broker.acquire_token("U1", "atlassian").await.unwrap() {
            TokenOutcome::Token { access_token, .. } => assert_eq!(access_token, "old-access"),
            other => panic!("expected Token, got {:?}", other),
        }

        // No version bump: no claim was taken
        let record = crate::store::TokenStore::get(store.as_ref(), &key).unwrap();
        assert_eq!(record.version, 1);
    }

    #[tokio::test]
    async fn test_stale_but_valid_served_while_claimed() {
        let store = Arc::new(SqliteTokenStore::new(":memory:").unwrap());
        let cipher = test_cipher();
        let key = CredentialKey::new("U1", "atlassian");
        // Expires in 30s (inside the 60s margin), active claim held by
        // someone else for another 20s
        seed_record(&store, &cipher, &key, 30, Some(20));

        let broker = test_broker(
            store,
            cipher,
            "http://127.0.0.1:1/token",
            BrokerTuning::default(),
        );

        match broker.acquire_token("U1", "atlassian").await.unwrap() {
            TokenOutcome::Token { access_token, .. } => assert_eq!(access_token, "old-access"),
            other => panic!("expected stale token, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_expired_and_claimed_gives_up_after_bounded_polls() {
        let store = Arc::new(SqliteTokenStore::new(":memory:").unwrap());
        let cipher = test_cipher();
        let key = CredentialKey::new("U1", "atlassian");
        // Already expired, claim active well past the test horizon
        seed_record(&store, &cipher, &key, -10, Some(3600));

        let tuning = BrokerTuning {
            poll_backoff_ms: 5,
            poll_backoff_jitter_ms: 0,
            max_poll_attempts: 3,
            ..BrokerTuning::default()
        };
        let broker = test_broker(store, cipher, "http://127.0.0.1:1/token", tuning);

        let result = broker.acquire_token("U1", "atlassian").await;
        assert!(matches!(result, Err(AcquireError::Upstream(_))));
    }

    #[tokio::test]
    async fn test_missing_refresh_token_deletes_record() {
        let store = Arc::new(SqliteTokenStore::new(":memory:").unwrap());
        let cipher = test_cipher();
        let key = CredentialKey::new("U1", "atlassian");

        // Record with no refresh token, already inside the margin
        let now = Utc::now().timestamp();
        let material = TokenMaterial {
            access_token: "old-access".to_string(),
            refresh_token: None,
            scope: None,
            issued_at: now,
        };
        let blob = cipher
            .seal(&serde_json::to_string(&material).unwrap())
            .unwrap();
        crate::store::TokenStore::put_new(
            store.as_ref(),
            &key,
            &CredentialRecord {
                encrypted_blob: blob,
                expires_at: now + 10,
                ttl: now + 86_400,
                version: 0,
                refresh_claim_expires_at: None,
            },
        )
        .unwrap();

        let broker = test_broker(
            Arc::clone(&store),
            cipher,
            "http://127.0.0.1:1/token",
            BrokerTuning::default(),
        );

        match broker.acquire_token("U1", "atlassian").await.unwrap() {
            TokenOutcome::AuthRequired { .. } => {}
            other => panic!("expected AuthRequired, got {:?}", other),
        }

        assert!(matches!(
            crate::store::TokenStore::get(store.as_ref(), &key),
            Err(StoreError::NotFound)
        ));
    }
}
