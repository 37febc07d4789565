//! Machine-to-machine gateway token cache.
//!
//! The agent authenticates to the multi-tool routing gateway with a
//! client-credentials JWT. One client identity per deployment, so the
//! cache is a single in-memory entry — a machine credential does not
//! need database-backed revocation, only provider-side invalidation.
//!
//! Refresh follows the same claim-with-deadline discipline as the
//! per-user coordinator: one fetch in flight, stale-but-valid tokens
//! served to racing callers, bounded backoff when no valid token exists.

use crate::oauth::client_credentials_grant;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::Deserialize;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Gateway auth configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct GatewayConfig {
    /// OIDC issuer; the token endpoint is resolved from its discovery
    /// document when `token_url` is not set directly
    #[serde(default)]
    pub issuer: Option<String>,
    /// Direct token endpoint override
    #[serde(default)]
    pub token_url: Option<String>,
    /// OAuth scope for gateway access
    #[serde(default)]
    pub scope: String,
    /// Refresh-ahead margin (seconds)
    #[serde(default = "default_refresh_margin")]
    pub refresh_margin_seconds: i64,
}

fn default_refresh_margin() -> i64 {
    300
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            issuer: None,
            token_url: None,
            scope: String::new(),
            refresh_margin_seconds: default_refresh_margin(),
        }
    }
}

/// Relevant subset of an OIDC discovery document.
#[derive(Deserialize)]
struct DiscoveryDocument {
    token_endpoint: String,
}

#[derive(Clone, Debug)]
struct CacheState {
    token: Option<CachedToken>,
    /// Deadline of an in-flight fetch claim (epoch seconds)
    fetch_claim_expires_at: Option<i64>,
    version: u64,
}

#[derive(Clone, Debug)]
struct CachedToken {
    access_token: String,
    expires_at: i64,
}

/// Client-credentials token cache for the routing gateway.
pub struct GatewayTokenCache {
    config: GatewayConfig,
    client_id: String,
    client_secret: String,
    state: RwLock<CacheState>,
    resolved_token_url: RwLock<Option<String>>,
}

/// How long a fetch claim is honored before it is reclaimable (seconds).
const FETCH_CLAIM_SECONDS: i64 = 30;

/// Base backoff while waiting on another caller's fetch (milliseconds).
const POLL_BACKOFF_MS: u64 = 200;

/// Bounded polling before giving up on a wedged fetch.
const MAX_POLL_ATTEMPTS: u32 = 25;

impl GatewayTokenCache {
    pub fn new(config: GatewayConfig, client_id: String, client_secret: String) -> Self {
        Self {
            config,
            client_id,
            client_secret,
            state: RwLock::new(CacheState {
                token: None,
                fetch_claim_expires_at: None,
                version: 0,
            }),
            resolved_token_url: RwLock::new(None),
        }
    }

    /// Returns a valid gateway bearer token and its expiry.
    pub async fn get_token(&self) -> Result<(String, i64)> {
        for _ in 0..MAX_POLL_ATTEMPTS {
            let now = Utc::now().timestamp();

            // Fast path under the read lock
            {
                let state = self.state.read().unwrap();
                if let Some(ref token) = state.token {
                    if token.expires_at - now > self.config.refresh_margin_seconds {
                        return Ok((token.access_token.clone(), token.expires_at));
                    }
                }
            }

            // Needs a fetch: try to take the claim under the write lock
            let claim = {
                let mut state = self.state.write().unwrap();

                // Re-check: another task may have finished while we waited
                if let Some(ref token) = state.token {
                    if token.expires_at - now > self.config.refresh_margin_seconds {
                        return Ok((token.access_token.clone(), token.expires_at));
                    }
                }

                match state.fetch_claim_expires_at {
                    Some(deadline) if deadline > now => {
                        // Someone else is fetching
                        if let Some(ref token) = state.token {
                            if token.expires_at > now {
                                // Stale but valid — serve it
                                debug!("Serving stale gateway token during refresh");
                                return Ok((token.access_token.clone(), token.expires_at));
                            }
                        }
                        None
                    }
                    _ => {
                        // Free (or abandoned) — claim it
                        state.fetch_claim_expires_at = Some(now + FETCH_CLAIM_SECONDS);
                        state.version += 1;
                        Some(state.version)
                    }
                }
            };

            let Some(claimed_version) = claim else {
                tokio::time::sleep(std::time::Duration::from_millis(POLL_BACKOFF_MS)).await;
                continue;
            };

            // We own the claim: fetch outside any lock
            match self.fetch_token().await {
                Ok((access_token, expires_at)) => {
                    let mut state = self.state.write().unwrap();
                    state.token = Some(CachedToken {
                        access_token: access_token.clone(),
                        expires_at,
                    });
                    state.fetch_claim_expires_at = None;
                    state.version += 1;
                    info!(expires_at, "Gateway token refreshed");
                    return Ok((access_token, expires_at));
                }
                Err(e) => {
                    let mut state = self.state.write().unwrap();
                    // Only release the claim if it is still ours
                    if state.version == claimed_version {
                        state.fetch_claim_expires_at = None;
                    }
                    warn!(error = %e, "Gateway token fetch failed");
                    return Err(e);
                }
            }
        }

        Err(anyhow!(
            "gateway token fetch still in flight after {} polls",
            MAX_POLL_ATTEMPTS
        ))
    }

    async fn fetch_token(&self) -> Result<(String, i64)> {
        let token_url = self.token_endpoint().await?;
        let grant = client_credentials_grant(
            &token_url,
            &self.client_id,
            &self.client_secret,
            &self.config.scope,
        )
        .await
        .context("client-credentials grant failed")?;
        Ok((grant.access_token, grant.expires_at))
    }

    /// Resolves the token endpoint: direct config override, else the
    /// issuer's discovery document (fetched once per process).
    async fn token_endpoint(&self) -> Result<String> {
        if let Some(ref url) = self.config.token_url {
            return Ok(url.clone());
        }

        if let Some(url) = self.resolved_token_url.read().unwrap().clone() {
            return Ok(url);
        }

        let issuer = self
            .config
            .issuer
            .as_ref()
            .ok_or_else(|| anyhow!("gateway config needs either token_url or issuer"))?;
        let discovery_url = format!(
            "{}/.well-known/openid-configuration",
            issuer.trim_end_matches('/')
        );

        debug!(discovery_url = %discovery_url, "Resolving gateway token endpoint");
        let document: DiscoveryDocument = reqwest::Client::new()
            .get(&discovery_url)
            .send()
            .await
            .context("Failed to fetch discovery document")?
            .error_for_status()
            .context("Discovery endpoint returned an error status")?
            .json()
            .await
            .context("Failed to parse discovery document")?;

        *self.resolved_token_url.write().unwrap() = Some(document.token_endpoint.clone());
        Ok(document.token_endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cache(token_url: &str) -> GatewayTokenCache {
        GatewayTokenCache::new(
            GatewayConfig {
                issuer: None,
                token_url: Some(token_url.to_string()),
                scope: "gateway/invoke".to_string(),
                refresh_margin_seconds: 300,
            },
            "client-id".to_string(),
            "client-secret".to_string(),
        )
    }

    #[tokio::test]
    async fn test_cached_token_served_within_margin() {
        let cache = test_cache("http://127.0.0.1:1/token");
        let now = Utc::now().timestamp();
        {
            let mut state = cache.state.write().unwrap();
            state.token = Some(CachedToken {
                access_token: "cached-jwt".to_string(),
                expires_at: now + 3600,
            });
        }

        // Unroutable token_url: any fetch would fail, so success proves
        // the cache was served
        let (token, expires_at) = cache.get_token().await.unwrap();
        assert_eq!(token, "cached-jwt");
        assert_eq!(expires_at, now + 3600);
    }

    #[tokio::test]
    async fn test_stale_token_served_while_claimed() {
        let cache = test_cache("http://127.0.0.1:1/token");
        let now = Utc::now().timestamp();
        {
            let mut state = cache.state.write().unwrap();
            state.token = Some(CachedToken {
                access_token: "stale-jwt".to_string(),
                // Inside the 300s margin but not yet expired
                expires_at: now + 60,
            });
            state.fetch_claim_expires_at = Some(now + 20);
        }

        let (token, _) = cache.get_token().await.unwrap();
        assert_eq!(token, "stale-jwt");
    }

    #[tokio::test]
    async fn test_fetch_error_releases_claim() {
        let cache = test_cache("http://127.0.0.1:1/token");

        // No token cached: the call claims, fails to fetch, and errors
        assert!(cache.get_token().await.is_err());

        // Claim released for the next caller
        assert!(cache
            .state
            .read()
            .unwrap()
            .fetch_claim_expires_at
            .is_none());
    }

    #[test]
    fn test_token_endpoint_requires_config() {
        let cache = GatewayTokenCache::new(
            GatewayConfig::default(),
            "id".to_string(),
            "secret".to_string(),
        );
        let result = tokio::runtime::Runtime::new()
            .unwrap()
            .block_on(cache.token_endpoint());
        assert!(result.is_err());
    }
}
