//! Agent runtime invocation.
//!
//! The dispatcher is the only component allowed to reach the agent
//! runtime — the ingress receiver validates untrusted input and cannot.
//! Each dispatch invokes the runtime under a bounded timeout with a
//! fresh session id (isolated execution per event). A timeout cancels
//! our wait, not the agent: runtime-side cleanup is the runtime's job.
//!
//! Failures are posted back to the originating channel rather than
//! silently dropped, and never retried automatically — agent invocations
//! are not idempotent.

use anyhow::{Context, Result};
use async_trait::async_trait;
use conduit::dispatch::DispatchRequest;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Outcome of one dispatch.
#[derive(Clone, Debug, PartialEq)]
pub enum DispatchOutcome {
    Completed,
    /// The invocation exceeded the configured timeout
    TimedOut,
    /// The runtime returned an error
    Failed(String),
}

/// The long-running agent process. The HTTP implementation posts the
/// event payload to the runtime's invocation endpoint and waits for it
/// to finish (minutes-scale).
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn invoke(&self, session_id: &str, payload: &serde_json::Value) -> Result<()>;
}

/// Reports dispatch failures to the originating conversation.
#[async_trait]
pub trait FailureNotifier: Send + Sync {
    async fn notify_failure(&self, request: &DispatchRequest, message: &str);
}

/// HTTP agent runtime client.
pub struct HttpAgentRuntime {
    http: reqwest::Client,
    runtime_url: String,
}

impl HttpAgentRuntime {
    pub fn new(runtime_url: String) -> Self {
        Self {
            // No client-level timeout: the runner's own timeout bounds the
            // wait, and it is configured in minutes
            http: reqwest::Client::new(),
            runtime_url,
        }
    }
}

#[async_trait]
impl AgentRuntime for HttpAgentRuntime {
    async fn invoke(&self, session_id: &str, payload: &serde_json::Value) -> Result<()> {
        let response = self
            .http
            .post(&self.runtime_url)
            .header("X-Session-Id", session_id)
            .json(payload)
            .send()
            .await
            .context("Failed to reach agent runtime")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("agent runtime returned {}: {}", status, body);
        }

        Ok(())
    }
}

/// Posts failure messages to a relay endpoint that forwards them to the
/// originating channel/thread.
pub struct WebhookFailureNotifier {
    http: reqwest::Client,
    notify_url: String,
}

impl WebhookFailureNotifier {
    pub fn new(notify_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            notify_url,
        }
    }
}

#[async_trait]
impl FailureNotifier for WebhookFailureNotifier {
    async fn notify_failure(&self, request: &DispatchRequest, message: &str) {
        let body = serde_json::json!({
            "channel": request.channel,
            "thread": request.thread,
            "text": message,
        });

        if let Err(e) = self.http.post(&self.notify_url).json(&body).send().await {
            error!(event_id = %request.event_id, error = %e, "Failed to deliver failure notification");
        }
    }
}

/// Notifier of last resort when no relay endpoint is configured.
pub struct LogFailureNotifier;

#[async_trait]
impl FailureNotifier for LogFailureNotifier {
    async fn notify_failure(&self, request: &DispatchRequest, message: &str) {
        error!(event_id = %request.event_id, message, "Dispatch failed (no notify endpoint configured)");
    }
}

/// Runs dispatches against the agent runtime.
pub struct DispatchRunner {
    runtime: Arc<dyn AgentRuntime>,
    notifier: Arc<dyn FailureNotifier>,
    timeout: Duration,
}

impl DispatchRunner {
    pub fn new(
        runtime: Arc<dyn AgentRuntime>,
        notifier: Arc<dyn FailureNotifier>,
        timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            notifier,
            timeout,
        }
    }

    /// Invokes the agent for one dispatch request.
    pub async fn dispatch(&self, request: &DispatchRequest) -> DispatchOutcome {
        // Fresh session per invocation — isolated agent execution
        let session_id = Uuid::new_v4().to_string();

        info!(
            event_id = %request.event_id,
            session_id = %session_id,
            event_type = %request.event_type,
            "Invoking agent runtime"
        );

        match tokio::time::timeout(
            self.timeout,
            self.runtime.invoke(&session_id, &request.payload),
        )
        .await
        {
            Ok(Ok(())) => {
                info!(event_id = %request.event_id, session_id = %session_id, "Agent invocation complete");
                DispatchOutcome::Completed
            }
            Ok(Err(e)) => {
                warn!(event_id = %request.event_id, error = %e, "Agent invocation failed");
                self.notifier
                    .notify_failure(
                        request,
                        "The agent hit an unexpected error while handling your request. Please try again.",
                    )
                    .await;
                DispatchOutcome::Failed(e.to_string())
            }
            Err(_) => {
                warn!(
                    event_id = %request.event_id,
                    timeout_secs = self.timeout.as_secs(),
                    "Agent invocation timed out"
                );
                self.notifier
                    .notify_failure(
                        request,
                        "The agent took too long to handle your request and was cut off. Please try again.",
                    )
                    .await;
                DispatchOutcome::TimedOut
            }
        }
    }
}
