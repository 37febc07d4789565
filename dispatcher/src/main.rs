use anyhow::{Context, Result};
use dispatcher::api::{create_dispatcher_router, DispatcherAppState};
use dispatcher::runner::{
    DispatchRunner, FailureNotifier, HttpAgentRuntime, LogFailureNotifier, WebhookFailureNotifier,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dispatcher=info".into()),
        )
        .init();

    info!("Dispatcher starting...");

    // Read configuration from environment. This process is the privileged
    // side of the trust boundary: it alone knows the agent runtime URL.
    let runtime_url = std::env::var("DISPATCHER_AGENT_RUNTIME_URL")
        .context("DISPATCHER_AGENT_RUNTIME_URL is required")?;

    let internal_token = std::env::var("CONDUIT_INTERNAL_TOKEN")
        .context("CONDUIT_INTERNAL_TOKEN is required")?;

    let notify_url = std::env::var("DISPATCHER_NOTIFY_URL").ok();

    let timeout_seconds: u64 = std::env::var("DISPATCHER_TIMEOUT_SECONDS")
        .unwrap_or_else(|_| "900".to_string())
        .parse()
        .context("DISPATCHER_TIMEOUT_SECONDS must be a number")?;

    // Loopback by default — the dispatch endpoint is not public
    let bind_addr = std::env::var("DISPATCHER_BIND_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:3100".to_string());

    info!(
        runtime_url = %runtime_url,
        bind_addr = %bind_addr,
        timeout_seconds,
        has_notify_url = notify_url.is_some(),
        "Configuration loaded"
    );

    let notifier: Arc<dyn FailureNotifier> = match notify_url {
        Some(url) => Arc::new(WebhookFailureNotifier::new(url)),
        None => Arc::new(LogFailureNotifier),
    };

    let runner = Arc::new(DispatchRunner::new(
        Arc::new(HttpAgentRuntime::new(runtime_url)),
        notifier,
        Duration::from_secs(timeout_seconds),
    ));

    let router = create_dispatcher_router(DispatcherAppState {
        runner,
        internal_token,
    });

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .context("Failed to bind dispatcher port")?;
    info!(bind_addr = %bind_addr, "Dispatcher listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .context("Server error")?;

    info!("Dispatcher stopped");
    Ok(())
}
