//! Private dispatch endpoint.
//!
//! `POST /dispatch` accepts a `DispatchRequest` from the ingress
//! receiver, acknowledges immediately, and runs the agent invocation in
//! a background task — the receiver never waits on the agent. Gated by
//! the internal bearer token; the endpoint binds to loopback by default
//! and is never reachable from the platform.

use crate::runner::DispatchRunner;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use conduit::auth::extract_bearer_token;
use conduit::dispatch::DispatchRequest;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Shared state for the dispatch endpoint.
#[derive(Clone)]
pub struct DispatcherAppState {
    pub runner: Arc<DispatchRunner>,
    pub internal_token: String,
}

#[derive(Serialize)]
struct AcceptedResponse {
    status: &'static str,
    event_id: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

enum AppError {
    Unauthorized(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let AppError::Unauthorized(msg) = self;
        let body = Json(ErrorResponse { error: msg });
        (StatusCode::UNAUTHORIZED, body).into_response()
    }
}

/// Create the dispatcher router
pub fn create_dispatcher_router(state: DispatcherAppState) -> Router {
    Router::new()
        .route("/dispatch", post(accept_dispatch))
        .with_state(Arc::new(state))
}

/// POST /dispatch
async fn accept_dispatch(
    State(state): State<Arc<DispatcherAppState>>,
    headers: HeaderMap,
    Json(request): Json<DispatchRequest>,
) -> Result<(StatusCode, Json<AcceptedResponse>), AppError> {
    let token = extract_bearer_token(&headers)
        .map_err(|e| AppError::Unauthorized(format!("Invalid token: {}", e)))?;
    if token != state.internal_token {
        return Err(AppError::Unauthorized("Invalid token".to_string()));
    }

    let event_id = request.event_id.clone();
    info!(event_id = %event_id, "Dispatch accepted");

    // Run the (minutes-scale) invocation off the request path
    let runner = Arc::clone(&state.runner);
    tokio::spawn(async move {
        runner.dispatch(&request).await;
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            status: "accepted",
            event_id,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{AgentRuntime, FailureNotifier, LogFailureNotifier};
    use anyhow::Result;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tower::ServiceExt;

    struct CountingRuntime {
        invocations: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl AgentRuntime for CountingRuntime {
        async fn invoke(&self, _session_id: &str, _payload: &serde_json::Value) -> Result<()> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn test_app(invocations: Arc<AtomicUsize>) -> Router {
        let runner = Arc::new(DispatchRunner::new(
            Arc::new(CountingRuntime { invocations }),
            Arc::new(LogFailureNotifier) as Arc<dyn FailureNotifier>,
            Duration::from_secs(5),
        ));
        create_dispatcher_router(DispatcherAppState {
            runner,
            internal_token: "internal-token".to_string(),
        })
    }

    fn dispatch_body() -> String {
        serde_json::json!({
            "event_id": "Ev1",
            "payload": {"event": {"text": "hi"}},
            "received_at": chrono::Utc::now().to_rfc3339(),
            "event_type": "message"
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_dispatch_requires_internal_token() {
        let app = test_app(Arc::new(AtomicUsize::new(0)));

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/dispatch")
                    .header("content-type", "application/json")
                    .body(Body::from(dispatch_body()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_dispatch_accepted_and_invoked() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let app = test_app(Arc::clone(&invocations));

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/dispatch")
                    .header("content-type", "application/json")
                    .header("authorization", "Bearer internal-token")
                    .body(Body::from(dispatch_body()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);

        // The invocation runs in a spawned task; give it a beat
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wrong_token_rejected() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let app = test_app(Arc::clone(&invocations));

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/dispatch")
                    .header("content-type", "application/json")
                    .header("authorization", "Bearer wrong")
                    .body(Body::from(dispatch_body()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(invocations.load(Ordering::SeqCst), 0);
    }
}
