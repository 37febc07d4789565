//! OAuth 2.0 authorization flow for per-user provider connections.
//!
//! Implements the authorization code flow:
//! 1. Agent hands the user a signed portal link (minted by the broker)
//! 2. GET /auth/:provider/start?token=… → Redirect to provider
//! 3. User authorizes on the provider's site
//! 4. Provider redirects to /auth/:provider/callback?code=…&state=…
//! 5. Exchange code for tokens, seal them, write the credential record
//! 6. The next `acquire_token` for this user serves the access token
//!
//! `POST /auth/:provider/revoke` deletes the stored credential.

mod exchange;
pub mod portal;
mod provider;
mod state_manager;

pub use exchange::{client_credentials_grant, refresh_grant, RefreshError, TokenGrant};
pub use provider::{ProviderConfig, ProviderRegistry};
pub use state_manager::{run_state_cleanup, StateManager};

use crate::crypto::EnvelopeCipher;
use crate::store::{CredentialKey, CredentialRecord, StoreError, TokenMaterial, TokenStore};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Redirect, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Application error types for the authorization endpoints
enum AppError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    ServerError(String),
    BadGateway(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::ServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            AppError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
        };

        let body = Json(ErrorResponse {
            error: error_message,
        });

        (status, body).into_response()
    }
}

/// Shared application state for the authorization flow
#[derive(Clone)]
pub struct OAuthAppState {
    pub store: Arc<dyn TokenStore>,
    pub cipher: Arc<EnvelopeCipher>,
    pub providers: Arc<ProviderRegistry>,
    pub state_manager: StateManager,
    pub portal_signing_secret: String,
    /// Public base URL of this service (redirect URIs, portal links)
    pub public_base_url: String,
    /// Housekeeping TTL stamped on new records (seconds)
    pub record_ttl_seconds: i64,
}

impl OAuthAppState {
    fn redirect_uri(&self, provider: &str) -> String {
        format!("{}/auth/{}/callback", self.public_base_url, provider)
    }
}

/// Query parameters for `/start` and `/revoke`: the signed portal token
#[derive(Deserialize)]
pub struct PortalQuery {
    token: Option<String>,
}

/// OAuth callback query parameters
#[derive(Deserialize)]
pub struct OAuthCallback {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Success response for callback and revoke
#[derive(Serialize)]
pub struct OAuthSuccessResponse {
    success: bool,
    message: String,
    provider: String,
}

/// Create the authorization flow router
pub fn create_oauth_router(state: OAuthAppState) -> Router {
    Router::new()
        .route("/auth/:provider/start", get(oauth_start))
        .route("/auth/:provider/callback", get(oauth_callback))
        .route("/auth/:provider/revoke", post(oauth_revoke))
        .with_state(Arc::new(state))
}

/// Builds the portal link handed to a user who needs to (re)authorize.
pub fn authorize_link(
    public_base_url: &str,
    provider: &str,
    signing_secret: &str,
    user_id: &str,
    display_name: Option<&str>,
    expiry_seconds: i64,
) -> String {
    let token = portal::mint(
        signing_secret,
        &portal::PortalClaims {
            user_id: user_id.to_string(),
            display_name: display_name.map(|s| s.to_string()),
            exp: Utc::now().timestamp() + expiry_seconds,
        },
    );
    format!(
        "{}/auth/{}/start?token={}",
        public_base_url,
        provider,
        urlencoding::encode(&token)
    )
}

/// GET /auth/:provider/start
///
/// Validates the signed portal token, mints an anti-forgery state bound
/// to the user, and redirects to the provider's authorization page.
async fn oauth_start(
    State(state): State<Arc<OAuthAppState>>,
    Path(provider_name): Path<String>,
    Query(query): Query<PortalQuery>,
) -> Result<Redirect, AppError> {
    debug!(provider = %provider_name, "Authorization start requested");

    let provider = state.providers.get(&provider_name).ok_or_else(|| {
        warn!(provider = %provider_name, "Unknown or unconfigured provider");
        AppError::NotFound(format!("Provider '{}' is not configured", provider_name))
    })?;

    let token = query
        .token
        .ok_or_else(|| AppError::Unauthorized("Missing portal token".to_string()))?;
    let claims = portal::verify(&state.portal_signing_secret, &token, Utc::now().timestamp())
        .map_err(|e| {
            warn!(provider = %provider_name, error = %e, "Portal token rejected");
            AppError::Unauthorized(format!("Invalid portal token: {}", e))
        })?;

    let csrf_state = state.state_manager.create_state(
        &provider_name,
        &claims.user_id,
        claims.display_name.as_deref(),
    );

    let auth_url = provider.build_auth_url(&csrf_state, &state.redirect_uri(&provider_name));

    info!(
        provider = %provider_name,
        user_id = %claims.user_id,
        "Redirecting to provider authorization page"
    );

    Ok(Redirect::temporary(&auth_url))
}

/// GET /auth/:provider/callback
///
/// Validates and consumes the anti-forgery state (single-use), exchanges
/// the authorization code, and writes the encrypted credential record.
///
/// A `put_new` collision means the user re-authorized while a record
/// still existed — treated as success and converted to a
/// compare-and-swap against the current version.
async fn oauth_callback(
    State(state): State<Arc<OAuthAppState>>,
    Path(provider_name): Path<String>,
    Query(callback): Query<OAuthCallback>,
) -> Result<Response, AppError> {
    debug!(provider = %provider_name, "Authorization callback received");

    if let Some(error) = callback.error {
        let description = callback
            .error_description
            .unwrap_or_else(|| "Unknown error".to_string());
        warn!(
            provider = %provider_name,
            error = %error,
            description = %description,
            "Provider reported authorization failure"
        );
        return Err(AppError::BadRequest(format!(
            "Authorization failed: {} - {}",
            error, description
        )));
    }

    let code = callback
        .code
        .ok_or_else(|| AppError::BadRequest("Missing 'code' parameter".to_string()))?;
    let csrf_state = callback
        .state
        .ok_or_else(|| AppError::BadRequest("Missing 'state' parameter".to_string()))?;

    // Validate and consume the state (single-use, expiry checked)
    let state_entry = state
        .state_manager
        .validate_and_consume(&csrf_state)
        .ok_or_else(|| {
            warn!(provider = %provider_name, "Invalid or expired state parameter");
            AppError::Unauthorized(
                "Invalid or expired state (possible forged callback)".to_string(),
            )
        })?;

    if state_entry.provider != provider_name {
        error!(
            expected = %state_entry.provider,
            actual = %provider_name,
            "Provider mismatch in callback"
        );
        return Err(AppError::BadRequest("Provider mismatch".to_string()));
    }

    let user_id = state_entry.user_id;
    let provider = state.providers.get(&provider_name).ok_or_else(|| {
        AppError::NotFound(format!("Provider '{}' is not configured", provider_name))
    })?;

    debug!(provider = %provider_name, user_id = %user_id, "Exchanging authorization code");
    let grant = exchange::exchange_code(
        &provider.token_url,
        &code,
        &state.redirect_uri(&provider_name),
        &provider.client_id,
        &provider.client_secret,
    )
    .await
    .map_err(|e| {
        error!(provider = %provider_name, error = %e, "Code exchange failed");
        AppError::BadGateway(format!("Failed to exchange authorization code: {}", e))
    })?;

    let now = Utc::now().timestamp();
    let material = TokenMaterial {
        access_token: grant.access_token,
        refresh_token: grant.refresh_token,
        scope: grant.scope,
        issued_at: now,
    };
    let blob = state.cipher.seal(
        &serde_json::to_string(&material)
            .map_err(|e| AppError::ServerError(format!("Failed to encode tokens: {}", e)))?,
    )
    .map_err(|e| {
        error!(provider = %provider_name, error = %e, "Failed to seal tokens");
        AppError::ServerError("Failed to encrypt tokens".to_string())
    })?;

    let key = CredentialKey::new(&user_id, &provider_name);
    let record = CredentialRecord {
        encrypted_blob: blob,
        expires_at: grant.expires_at,
        ttl: now + state.record_ttl_seconds,
        version: 0,
        refresh_claim_expires_at: None,
    };

    store_record(state.store.as_ref(), &key, &record).map_err(|e| {
        error!(key = %key, error = %e, "Failed to store credential record");
        AppError::ServerError("Failed to store credentials".to_string())
    })?;

    info!(
        provider = %provider_name,
        user_id = %user_id,
        has_refresh_token = material.refresh_token.is_some(),
        "Authorization flow completed"
    );

    Ok(Json(OAuthSuccessResponse {
        success: true,
        message: format!("Successfully connected {}", provider_name),
        provider: provider_name,
    })
    .into_response())
}

/// Writes a fresh credential record, converting a `put_new` collision
/// into a CAS re-authentication. One retry covers a refresh racing the
/// re-auth; a second conflict is surfaced.
fn store_record(
    store: &dyn TokenStore,
    key: &CredentialKey,
    record: &CredentialRecord,
) -> Result<(), StoreError> {
    match store.put_new(key, record) {
        Err(StoreError::AlreadyExists) => {}
        other => return other,
    }

    for _ in 0..2 {
        let current = match store.get(key) {
            Ok(current) => current,
            // Deleted between attempts — recreate
            Err(StoreError::NotFound) => match store.put_new(key, record) {
                Err(StoreError::AlreadyExists) => continue,
                other => return other,
            },
            Err(e) => return Err(e),
        };
        match store.compare_and_swap(key, current.version, record) {
            Err(StoreError::VersionConflict) => continue,
            other => return other,
        }
    }
    Err(StoreError::VersionConflict)
}

/// POST /auth/:provider/revoke
///
/// Deletes the stored credential for the authenticated user. The next
/// `acquire_token` returns AuthRequired.
async fn oauth_revoke(
    State(state): State<Arc<OAuthAppState>>,
    Path(provider_name): Path<String>,
    Query(query): Query<PortalQuery>,
) -> Result<Json<OAuthSuccessResponse>, AppError> {
    let token = query
        .token
        .ok_or_else(|| AppError::Unauthorized("Missing portal token".to_string()))?;
    let claims = portal::verify(&state.portal_signing_secret, &token, Utc::now().timestamp())
        .map_err(|e| AppError::Unauthorized(format!("Invalid portal token: {}", e)))?;

    if !state.providers.contains(&provider_name) {
        return Err(AppError::NotFound(format!(
            "Provider '{}' is not configured",
            provider_name
        )));
    }

    let key = CredentialKey::new(&claims.user_id, &provider_name);
    state.store.delete(&key).map_err(|e| {
        error!(key = %key, error = %e, "Failed to delete credential record");
        AppError::ServerError("Failed to revoke authorization".to_string())
    })?;

    info!(provider = %provider_name, user_id = %claims.user_id, "Authorization revoked");

    Ok(Json(OAuthSuccessResponse {
        success: true,
        message: format!("Disconnected {}", provider_name),
        provider: provider_name,
    }))
}
