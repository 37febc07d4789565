//! Agent-facing token API.
//!
//! The agent runtime calls these endpoints at tool-call time:
//! - `POST /api/token` — per-user provider token (or an AuthRequired
//!   result carrying the portal link to show the user)
//! - `GET /api/gateway-token` — the machine-identity gateway token
//!
//! Both are gated by the internal bearer token shared with the agent
//! deployment; they are never exposed to end users.

use super::{AcquireError, TokenBroker, TokenOutcome};
use crate::auth::extract_bearer_token;
use crate::gateway::GatewayTokenCache;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, warn};

/// Shared state for the token API handlers.
#[derive(Clone)]
pub struct BrokerAppState {
    pub broker: Arc<TokenBroker>,
    pub gateway: Option<Arc<GatewayTokenCache>>,
    pub internal_token: String,
}

/// Request body for `POST /api/token`.
#[derive(Deserialize)]
pub struct TokenRequest {
    pub user_id: String,
    pub provider: String,
}

/// Response for `POST /api/token`.
///
/// `status` is `"ok"` (token present) or `"auth_required"` (authorize_url
/// present). Needing authorization is a normal outcome, not an error —
/// the agent relays the link instead of aborting the conversation.
#[derive(Serialize)]
pub struct TokenResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorize_url: Option<String>,
}

/// Response for `GET /api/gateway-token`.
#[derive(Serialize)]
pub struct GatewayTokenResponse {
    pub access_token: String,
    pub expires_at: i64,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

enum AppError {
    Unauthorized(String),
    ServerError(String),
    Unavailable(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::ServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
        };
        let body = Json(ErrorResponse {
            error: error_message,
        });
        (status, body).into_response()
    }
}

/// Create the token API router
pub fn create_broker_router(state: BrokerAppState) -> Router {
    Router::new()
        .route("/api/token", post(acquire_token))
        .route("/api/gateway-token", get(gateway_token))
        .with_state(Arc::new(state))
}

fn authorize(state: &BrokerAppState, headers: &HeaderMap) -> Result<(), AppError> {
    let token = extract_bearer_token(headers)
        .map_err(|e| AppError::Unauthorized(format!("Invalid token: {}", e)))?;
    if token != state.internal_token {
        return Err(AppError::Unauthorized("Invalid token".to_string()));
    }
    Ok(())
}

/// POST /api/token
async fn acquire_token(
    State(state): State<Arc<BrokerAppState>>,
    headers: HeaderMap,
    Json(request): Json<TokenRequest>,
) -> Result<Json<TokenResponse>, AppError> {
    authorize(&state, &headers)?;

    match state
        .broker
        .acquire_token(&request.user_id, &request.provider)
        .await
    {
        Ok(TokenOutcome::Token {
            access_token,
            expires_at,
        }) => Ok(Json(TokenResponse {
            status: "ok",
            access_token: Some(access_token),
            expires_at: Some(expires_at),
            authorize_url: None,
        })),
        Ok(TokenOutcome::AuthRequired { authorize_url }) => Ok(Json(TokenResponse {
            status: "auth_required",
            access_token: None,
            expires_at: None,
            authorize_url: Some(authorize_url),
        })),
        Err(AcquireError::UnknownProvider(name)) => Err(AppError::ServerError(format!(
            "Provider '{}' is not configured",
            name
        ))),
        Err(e @ AcquireError::Upstream(_)) => {
            warn!(user_id = %request.user_id, provider = %request.provider, error = %e,
                "Token acquisition hit a transient failure");
            Err(AppError::Unavailable(format!("{}", e)))
        }
        Err(e) => {
            error!(user_id = %request.user_id, provider = %request.provider, error = %e,
                "Token acquisition failed");
            Err(AppError::ServerError("Token acquisition failed".to_string()))
        }
    }
}

/// GET /api/gateway-token
async fn gateway_token(
    State(state): State<Arc<BrokerAppState>>,
    headers: HeaderMap,
) -> Result<Json<GatewayTokenResponse>, AppError> {
    authorize(&state, &headers)?;

    let gateway = state
        .gateway
        .as_ref()
        .ok_or_else(|| AppError::Unavailable("Gateway auth is not configured".to_string()))?;

    let (access_token, expires_at) = gateway.get_token().await.map_err(|e| {
        warn!(error = %e, "Gateway token fetch failed");
        AppError::Unavailable(format!("Gateway token unavailable: {}", e))
    })?;

    Ok(Json(GatewayTokenResponse {
        access_token,
        expires_at,
    }))
}
