//! Ingress receiver for platform webhooks.
//!
//! The public-facing edge of the system. Verifies the request signature,
//! answers the URL-verification handshake, filters events that should
//! never reach the agent (our own bot's messages, edits, deletions),
//! dedups redeliveries, and hands surviving events to the dispatcher
//! without waiting on it — the platform expects an answer in seconds,
//! the agent can take minutes.
//!
//! This process holds no agent credentials. The only privileged thing it
//! knows is the dispatcher's internal endpoint and bearer token.

pub mod dedup;
pub mod signature;

pub use dedup::{run_dedup_sweep, DedupWindow};

use crate::dispatch::DispatchRequest;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Event subtypes that never reach the agent.
const IGNORED_EVENT_SUBTYPES: &[&str] = &["message_changed", "message_deleted"];

/// Shared application state for the ingress receiver
#[derive(Clone)]
pub struct IngressAppState {
    pub signing_secret: String,
    /// Timestamp tolerance for replay mitigation (seconds)
    pub tolerance_seconds: i64,
    /// Our own bot id — events it produced are discarded
    pub bot_id: Option<String>,
    pub dedup: Arc<DedupWindow>,
    pub forwarder: Arc<DispatchForwarder>,
}

/// Fire-and-forget client for the dispatcher's private endpoint.
pub struct DispatchForwarder {
    http: reqwest::Client,
    dispatch_url: String,
    internal_token: String,
}

impl DispatchForwarder {
    pub fn new(dispatch_url: String, internal_token: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            dispatch_url,
            internal_token,
        }
    }

    /// Posts a dispatch request. Called from a spawned task; failures are
    /// logged, not surfaced — the webhook was already acknowledged.
    pub async fn forward(&self, request: DispatchRequest) {
        let result = self
            .http
            .post(&self.dispatch_url)
            .bearer_auth(&self.internal_token)
            .json(&request)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                debug!(event_id = %request.event_id, "Dispatch request forwarded");
            }
            Ok(response) => {
                warn!(
                    event_id = %request.event_id,
                    status = %response.status(),
                    "Dispatcher rejected request"
                );
            }
            Err(e) => {
                warn!(event_id = %request.event_id, error = %e, "Failed to reach dispatcher");
            }
        }
    }
}

/// Response for accepted requests
#[derive(Serialize)]
struct IngressResponse {
    status: &'static str,
    /// Whether a dispatch was actually triggered (false for handshakes,
    /// filtered events, and duplicates)
    dispatched: bool,
}

/// Response for the URL-verification handshake
#[derive(Serialize)]
struct ChallengeResponse {
    challenge: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Application error types
enum AppError {
    Rejected(String),
    BadRequest(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Rejected(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
        };
        let body = Json(ErrorResponse {
            error: error_message,
        });
        (status, body).into_response()
    }
}

/// Create the ingress router
pub fn create_ingress_router(state: IngressAppState) -> Router {
    Router::new()
        .route("/events", post(receive_event))
        .with_state(Arc::new(state))
}

/// POST /events — platform webhook endpoint
async fn receive_event(
    State(state): State<Arc<IngressAppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    // Signature first: nothing below runs for unauthenticated requests
    let timestamp = header_str(&headers, signature::TIMESTAMP_HEADER);
    let sig = header_str(&headers, signature::SIGNATURE_HEADER);
    signature::verify(
        &state.signing_secret,
        timestamp,
        sig,
        &body,
        state.tolerance_seconds,
        Utc::now().timestamp(),
    )
    .map_err(|e| {
        warn!(error = %e, "Rejected unsigned or stale request");
        AppError::Rejected(format!("Signature verification failed: {}", e))
    })?;

    let envelope: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("Invalid JSON body: {}", e)))?;

    // URL-verification handshake: echo the challenge
    if envelope.get("type").and_then(|v| v.as_str()) == Some("url_verification") {
        let challenge = envelope
            .get("challenge")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        debug!("Answering URL verification handshake");
        return Ok(Json(ChallengeResponse { challenge }).into_response());
    }

    // Only event callbacks carry work; acknowledge everything else
    if envelope.get("type").and_then(|v| v.as_str()) != Some("event_callback") {
        return Ok(accepted(false));
    }

    let event = envelope.get("event").cloned().unwrap_or_default();
    let event_type = event
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let event_subtype = event
        .get("subtype")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    if let Some(reason) = discard_reason(&state, &event, event_subtype.as_deref()) {
        debug!(reason, "Discarding event");
        return Ok(accepted(false));
    }

    let event_id = envelope
        .get("event_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::BadRequest("Missing event_id".to_string()))?
        .to_string();

    // Redeliveries are acknowledged but not re-dispatched
    if !state.dedup.check_and_record(&event_id) {
        info!(event_id = %event_id, "Duplicate delivery acknowledged");
        return Ok(accepted(false));
    }

    let request = DispatchRequest {
        event_id: event_id.clone(),
        payload: envelope,
        received_at: Utc::now(),
        event_type,
        event_subtype,
        channel: event
            .get("channel")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        thread: event
            .get("thread_ts")
            .or_else(|| event.get("ts"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
    };

    info!(event_id = %event_id, "Accepting event for dispatch");

    // Never block the webhook on the dispatcher
    let forwarder = Arc::clone(&state.forwarder);
    tokio::spawn(async move {
        forwarder.forward(request).await;
    });

    Ok(accepted(true))
}

fn accepted(dispatched: bool) -> Response {
    Json(IngressResponse {
        status: "accepted",
        dispatched,
    })
    .into_response()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Returns why an event should be discarded, if it should.
fn discard_reason(
    state: &IngressAppState,
    event: &serde_json::Value,
    event_subtype: Option<&str>,
) -> Option<&'static str> {
    if let Some(subtype) = event_subtype {
        if IGNORED_EVENT_SUBTYPES.contains(&subtype) {
            return Some("ignored event subtype");
        }
    }

    if event.get("edited").is_some() {
        return Some("edited message");
    }

    // Our own bot's messages would loop forever
    if let (Some(bot_id), Some(event_bot)) = (
        state.bot_id.as_deref(),
        event.get("bot_id").and_then(|v| v.as_str()),
    ) {
        if bot_id == event_bot {
            return Some("own bot message");
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state(bot_id: Option<&str>) -> IngressAppState {
        IngressAppState {
            signing_secret: "secret".to_string(),
            tolerance_seconds: 300,
            bot_id: bot_id.map(|s| s.to_string()),
            dedup: Arc::new(DedupWindow::new(300)),
            forwarder: Arc::new(DispatchForwarder::new(
                "http://127.0.0.1:1/dispatch".to_string(),
                "internal".to_string(),
            )),
        }
    }

    #[test]
    fn test_discard_ignored_subtypes() {
        let state = test_state(None);
        let event = serde_json::json!({"type": "message"});

        assert!(discard_reason(&state, &event, Some("message_changed")).is_some());
        assert!(discard_reason(&state, &event, Some("message_deleted")).is_some());
        assert!(discard_reason(&state, &event, Some("file_share")).is_none());
        assert!(discard_reason(&state, &event, None).is_none());
    }

    #[test]
    fn test_discard_edited_message() {
        let state = test_state(None);
        let event = serde_json::json!({"type": "message", "edited": {"ts": "1.0"}});
        assert_eq!(discard_reason(&state, &event, None), Some("edited message"));
    }

    #[test]
    fn test_discard_own_bot_message() {
        let state = test_state(Some("B999"));

        let own = serde_json::json!({"type": "message", "bot_id": "B999"});
        assert_eq!(discard_reason(&state, &own, None), Some("own bot message"));

        // Other bots are fine
        let other = serde_json::json!({"type": "message", "bot_id": "B111"});
        assert!(discard_reason(&state, &other, None).is_none());

        // Without a configured bot id, nothing is filtered on bot_id
        let state = test_state(None);
        assert!(discard_reason(&state, &own, None).is_none());
    }
}
