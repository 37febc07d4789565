use anyhow::{Context, Result};
use conduit::broker::{api::BrokerAppState, BrokerTuning, TokenBroker};
use conduit::config::{load_config, ConduitConfig, Secrets};
use conduit::crypto::{EnvelopeCipher, LocalMasterKey};
use conduit::gateway::GatewayTokenCache;
use conduit::ingress::{DedupWindow, DispatchForwarder, IngressAppState};
use conduit::oauth::{OAuthAppState, ProviderRegistry, StateManager};
use conduit::store::SqliteTokenStore;
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conduit=info".into()),
        )
        .init();

    info!("Conduit starting...");

    // Configuration: TOML file (optional) + environment secrets
    let config_path =
        std::env::var("CONDUIT_CONFIG").unwrap_or_else(|_| "conduit.toml".to_string());
    let config: ConduitConfig = match load_config(&config_path) {
        Ok(config) => config,
        Err(e) => {
            warn!(path = %config_path, error = %e, "Config file not loaded — using defaults");
            ConduitConfig::default()
        }
    };
    let secrets = Secrets::from_env()
        .map_err(|e| anyhow::anyhow!("{}", e))
        .context("Missing required environment secrets")?;

    info!(
        port = config.server.port,
        public_base_url = %config.server.public_base_url,
        db_path = %config.store.db_path,
        dispatcher_url = %config.dispatch.dispatcher_url,
        "Configuration loaded"
    );

    // Envelope cipher over the local master key
    let master_key = LocalMasterKey::from_base64(&secrets.master_key)
        .context("CONDUIT_MASTER_KEY is invalid (base64-encoded 32-byte key)")?;
    let cipher = Arc::new(EnvelopeCipher::new(Arc::new(master_key)));

    // Credential store
    let store = Arc::new(
        SqliteTokenStore::new(&config.store.db_path)
            .context("Failed to initialize credential store")?,
    );
    info!("Credential store initialized");

    // OAuth providers from environment
    let providers = Arc::new(ProviderRegistry::from_env());

    // Anti-forgery state manager
    let state_manager = StateManager::new(config.tuning.state_expiry_seconds);

    // Token refresh coordinator
    let broker = Arc::new(TokenBroker::new(
        Arc::clone(&store) as Arc<dyn conduit::store::TokenStore>,
        Arc::clone(&cipher),
        Arc::clone(&providers),
        secrets.portal_signing_secret.clone(),
        config.server.public_base_url.clone(),
        BrokerTuning {
            refresh_margin_seconds: config.tuning.refresh_margin_seconds,
            claim_seconds: config.tuning.claim_seconds,
            record_ttl_seconds: config.tuning.record_ttl_seconds,
            portal_token_expiry_seconds: config.tuning.portal_token_expiry_seconds,
            ..BrokerTuning::default()
        },
    ));

    // Gateway token cache (optional)
    let gateway = match (
        config.gateway.clone(),
        secrets.gateway_client_id.clone(),
        secrets.gateway_client_secret.clone(),
    ) {
        (Some(gateway_config), Some(client_id), Some(client_secret)) => {
            info!("Gateway auth configured");
            Some(Arc::new(GatewayTokenCache::new(
                gateway_config,
                client_id,
                client_secret,
            )))
        }
        (Some(_), _, _) => {
            warn!("Gateway section present but client credentials missing — gateway auth disabled");
            None
        }
        _ => None,
    };

    // Ingress dedup window and dispatcher forwarder
    let dedup = Arc::new(DedupWindow::new(config.tuning.dedup_window_seconds));
    let forwarder = Arc::new(DispatchForwarder::new(
        config.dispatch.dispatcher_url.clone(),
        secrets.internal_token.clone(),
    ));

    // Background housekeeping
    tokio::spawn(conduit::oauth::run_state_cleanup(
        state_manager.clone(),
        config.tuning.cleanup_interval_seconds,
    ));
    tokio::spawn(conduit::store::run_ttl_purge(
        Arc::clone(&store),
        config.tuning.cleanup_interval_seconds,
    ));
    tokio::spawn(conduit::ingress::run_dedup_sweep(
        Arc::clone(&dedup),
        config.tuning.cleanup_interval_seconds,
    ));

    // Assemble routers
    let ingress_router = conduit::ingress::create_ingress_router(IngressAppState {
        signing_secret: secrets.signing_secret.clone(),
        tolerance_seconds: config.tuning.signature_tolerance_seconds,
        bot_id: secrets.bot_id.clone(),
        dedup,
        forwarder,
    });

    let oauth_router = conduit::oauth::create_oauth_router(OAuthAppState {
        store: Arc::clone(&store) as Arc<dyn conduit::store::TokenStore>,
        cipher,
        providers,
        state_manager,
        portal_signing_secret: secrets.portal_signing_secret.clone(),
        public_base_url: config.server.public_base_url.clone(),
        record_ttl_seconds: config.tuning.record_ttl_seconds,
    });

    let broker_router = conduit::broker::api::create_broker_router(BrokerAppState {
        broker,
        gateway,
        internal_token: secrets.internal_token.clone(),
    });

    let app = ingress_router.merge(oauth_router).merge(broker_router);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.server.port))
        .await
        .context("Failed to bind server port")?;
    info!(port = config.server.port, "Conduit listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .context("Server error")?;

    info!("Conduit stopped");
    Ok(())
}
