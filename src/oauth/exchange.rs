//! Token endpoint calls: authorization-code, refresh-token, and
//! client-credentials grants.

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;

/// Standard OAuth 2.0 token response.
#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

/// Error body many providers return with a 4xx status.
#[derive(Deserialize, Debug)]
struct TokenErrorResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// Outcome of a successful grant.
#[derive(Clone, Debug)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
    /// Absolute expiry (epoch seconds), computed from `expires_in`
    pub expires_at: i64,
}

/// Refresh failure, split so the coordinator can tell a dead grant from a
/// flaky provider.
#[derive(Debug)]
pub enum RefreshError {
    /// The provider rejected the refresh token (`invalid_grant`) — the
    /// credential is dead and must be deleted
    InvalidGrant,
    /// Anything else: network failure, 5xx, malformed response
    Provider(anyhow::Error),
}

impl std::fmt::Display for RefreshError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefreshError::InvalidGrant => write!(f, "provider rejected refresh token"),
            RefreshError::Provider(e) => write!(f, "token refresh failed: {}", e),
        }
    }
}

impl std::error::Error for RefreshError {}

/// Default token lifetime when the provider omits `expires_in`.
const DEFAULT_EXPIRES_IN: i64 = 3600;

/// Exchanges an authorization code for tokens.
pub async fn exchange_code(
    token_url: &str,
    code: &str,
    redirect_uri: &str,
    client_id: &str,
    client_secret: &str,
) -> Result<TokenGrant> {
    let mut form_data = HashMap::new();
    form_data.insert("grant_type", "authorization_code");
    form_data.insert("code", code);
    form_data.insert("redirect_uri", redirect_uri);
    form_data.insert("client_id", client_id);
    form_data.insert("client_secret", client_secret);

    tracing::debug!(token_url, "Exchanging authorization code for tokens");

    let response = reqwest::Client::new()
        .post(token_url)
        .header("Accept", "application/json")
        .form(&form_data)
        .send()
        .await
        .context("Failed to send token exchange request")?;

    parse_grant(response).await
}

/// Exchanges a refresh token for a new access token.
///
/// Rotating-refresh providers return a new refresh token here; the caller
/// must persist it in the same write as the access token, because the old
/// one is already invalid.
pub async fn refresh_grant(
    token_url: &str,
    refresh_token: &str,
    client_id: &str,
    client_secret: &str,
) -> Result<TokenGrant, RefreshError> {
    let mut form_data = HashMap::new();
    form_data.insert("grant_type", "refresh_token");
    form_data.insert("refresh_token", refresh_token);
    form_data.insert("client_id", client_id);
    form_data.insert("client_secret", client_secret);

    tracing::debug!(token_url, "Refreshing access token");

    let response = reqwest::Client::new()
        .post(token_url)
        .header("Accept", "application/json")
        .form(&form_data)
        .send()
        .await
        .map_err(|e| RefreshError::Provider(anyhow!(e).context("refresh request failed")))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if is_invalid_grant(&body) {
            return Err(RefreshError::InvalidGrant);
        }
        return Err(RefreshError::Provider(anyhow!(
            "token endpoint returned {}: {}",
            status,
            truncate(&body, 200)
        )));
    }

    let token_response: TokenResponse = response
        .json()
        .await
        .map_err(|e| RefreshError::Provider(anyhow!(e).context("malformed token response")))?;

    Ok(grant_from_response(token_response))
}

/// Client-credentials grant for machine identities.
///
/// Credentials go in a Basic auth header, per the gateway's token
/// endpoint convention.
pub async fn client_credentials_grant(
    token_url: &str,
    client_id: &str,
    client_secret: &str,
    scope: &str,
) -> Result<TokenGrant> {
    let auth_header = BASE64.encode(format!("{}:{}", client_id, client_secret));

    let mut form_data = HashMap::new();
    form_data.insert("grant_type", "client_credentials");
    form_data.insert("scope", scope);

    tracing::debug!(token_url, "Requesting client-credentials token");

    let response = reqwest::Client::new()
        .post(token_url)
        .header("Authorization", format!("Basic {}", auth_header))
        .header("Accept", "application/json")
        .form(&form_data)
        .send()
        .await
        .context("Failed to send client-credentials request")?;

    parse_grant(response).await
}

async fn parse_grant(response: reqwest::Response) -> Result<TokenGrant> {
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(anyhow!(
            "token endpoint returned {}: {}",
            status,
            truncate(&body, 200)
        ));
    }

    let token_response: TokenResponse = response
        .json()
        .await
        .context("Failed to parse token response")?;

    Ok(grant_from_response(token_response))
}

fn grant_from_response(response: TokenResponse) -> TokenGrant {
    let expires_in = response.expires_in.unwrap_or(DEFAULT_EXPIRES_IN);
    TokenGrant {
        access_token: response.access_token,
        refresh_token: response.refresh_token,
        scope: response.scope,
        expires_at: Utc::now().timestamp() + expires_in,
    }
}

fn is_invalid_grant(body: &str) -> bool {
    serde_json::from_str::<TokenErrorResponse>(body)
        .ok()
        .and_then(|e| e.error)
        .map(|e| e == "invalid_grant")
        .unwrap_or(false)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
