use serde::Deserialize;

// Re-export gateway config so deployments configure everything here
pub use crate::gateway::GatewayConfig;

/// Complete Conduit configuration, loaded from a TOML file. Secrets are
/// never in the file — they come from the environment (see
/// [`Secrets::from_env`]).
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConduitConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub gateway: Option<GatewayConfig>,
    #[serde(default)]
    pub tuning: Tuning,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Public base URL of this service (redirect URIs, portal links)
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
}

fn default_port() -> u16 {
    3000
}

fn default_public_base_url() -> String {
    "http://localhost:3000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            public_base_url: default_public_base_url(),
        }
    }
}

/// Credential store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String {
    "credentials.db".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// Where the ingress receiver forwards accepted events
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_dispatch_url")]
    pub dispatcher_url: String,
}

fn default_dispatch_url() -> String {
    "http://127.0.0.1:3100/dispatch".to_string()
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            dispatcher_url: default_dispatch_url(),
        }
    }
}

/// Deployment tuning values. Operational knobs, not structural
/// requirements; override per environment as needed.
#[derive(Debug, Clone, Deserialize)]
pub struct Tuning {
    /// Refresh-ahead margin for user tokens (seconds)
    #[serde(default = "default_refresh_margin")]
    pub refresh_margin_seconds: i64,
    /// Refresh claim lifetime before it is reclaimable (seconds)
    #[serde(default = "default_claim_seconds")]
    pub claim_seconds: i64,
    /// Ingress dedup window (seconds)
    #[serde(default = "default_dedup_window")]
    pub dedup_window_seconds: u64,
    /// Ingress timestamp tolerance (seconds)
    #[serde(default = "default_tolerance")]
    pub signature_tolerance_seconds: i64,
    /// Anti-forgery state expiry (seconds)
    #[serde(default = "default_state_expiry")]
    pub state_expiry_seconds: i64,
    /// Portal link token expiry (seconds)
    #[serde(default = "default_portal_expiry")]
    pub portal_token_expiry_seconds: i64,
    /// Credential record housekeeping TTL (seconds)
    #[serde(default = "default_record_ttl")]
    pub record_ttl_seconds: i64,
    /// Interval for the state-cleanup / TTL-purge / dedup-sweep tasks
    /// (seconds)
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
}

fn default_refresh_margin() -> i64 {
    60
}

fn default_claim_seconds() -> i64 {
    30
}

fn default_dedup_window() -> u64 {
    300
}

fn default_tolerance() -> i64 {
    300
}

fn default_state_expiry() -> i64 {
    600
}

fn default_portal_expiry() -> i64 {
    600
}

fn default_record_ttl() -> i64 {
    90 * 86_400
}

fn default_cleanup_interval() -> u64 {
    60
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            refresh_margin_seconds: default_refresh_margin(),
            claim_seconds: default_claim_seconds(),
            dedup_window_seconds: default_dedup_window(),
            signature_tolerance_seconds: default_tolerance(),
            state_expiry_seconds: default_state_expiry(),
            portal_token_expiry_seconds: default_portal_expiry(),
            record_ttl_seconds: default_record_ttl(),
            cleanup_interval_seconds: default_cleanup_interval(),
        }
    }
}

/// Secrets, environment-only.
#[derive(Clone)]
pub struct Secrets {
    /// Base64-encoded 32-byte master key for the envelope cipher
    pub master_key: String,
    /// Shared secret for ingress signature verification
    pub signing_secret: String,
    /// Signing secret for portal link tokens
    pub portal_signing_secret: String,
    /// Bearer token gating the broker API and dispatcher endpoint
    pub internal_token: String,
    /// Gateway client credentials (when gateway auth is configured)
    pub gateway_client_id: Option<String>,
    pub gateway_client_secret: Option<String>,
    /// Our own bot id, for ingress self-filtering
    pub bot_id: Option<String>,
}

impl Secrets {
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self {
            master_key: require("CONDUIT_MASTER_KEY")?,
            signing_secret: require("CONDUIT_SIGNING_SECRET")?,
            portal_signing_secret: require("CONDUIT_PORTAL_SIGNING_SECRET")?,
            internal_token: require("CONDUIT_INTERNAL_TOKEN")?,
            gateway_client_id: std::env::var("CONDUIT_GATEWAY_CLIENT_ID").ok(),
            gateway_client_secret: std::env::var("CONDUIT_GATEWAY_CLIENT_SECRET").ok(),
            bot_id: std::env::var("CONDUIT_BOT_ID").ok(),
        })
    }
}

fn require(name: &str) -> Result<String, Box<dyn std::error::Error>> {
    std::env::var(name).map_err(|_| format!("{} is required", name).into())
}

/// Load configuration from a TOML file
pub fn load_config(path: &str) -> Result<ConduitConfig, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: ConduitConfig = toml::from_str(&contents)?;
    Ok(config)
}
