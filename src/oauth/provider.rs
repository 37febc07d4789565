//! OAuth provider registry.
//!
//! Client credentials come from `CONDUIT_OAUTH_{PROVIDER}_CLIENT_ID` /
//! `_CLIENT_SECRET`; endpoint URLs can be overridden per provider with
//! `_AUTH_URL` / `_TOKEN_URL` (staging environments, tests).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// OAuth 2.0 configuration for one provider.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Authorization endpoint URL
    pub auth_url: String,

    /// Token exchange endpoint URL
    pub token_url: String,

    /// Requested scopes
    pub scopes: Vec<String>,

    /// Extra query parameters on the authorize URL (e.g. Atlassian's
    /// `audience` and `prompt`)
    pub extra_authorize_params: Vec<(String, String)>,

    /// Whether the provider rotates refresh tokens on every use. When
    /// true, losing a refresh response loses the credential — refresh
    /// exclusivity is mandatory.
    pub rotates_refresh_tokens: bool,

    pub client_id: String,
    pub client_secret: String,
}

impl ProviderConfig {
    /// Builds the authorization URL with state and redirect_uri.
    pub fn build_auth_url(&self, state: &str, redirect_uri: &str) -> String {
        let scopes = self.scopes.join(" ");
        let mut url = format!(
            "{}?client_id={}&redirect_uri={}&scope={}&state={}&response_type=code",
            self.auth_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(&scopes),
            urlencoding::encode(state)
        );
        for (name, value) in &self.extra_authorize_params {
            url.push('&');
            url.push_str(name);
            url.push('=');
            url.push_str(&urlencoding::encode(value));
        }
        url
    }
}

/// Known providers, resolved once at startup.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, ProviderConfig>,
}

impl ProviderRegistry {
    /// Loads every known provider whose client credentials are present in
    /// the environment. Providers without credentials are skipped.
    pub fn from_env() -> Self {
        let mut registry = Self::default();
        for name in KNOWN_PROVIDERS {
            if let Some(config) = provider_from_env(name) {
                registry.providers.insert(name.to_string(), config);
            }
        }
        registry
    }

    /// Registers or replaces a provider (tests, custom deployments).
    pub fn insert(&mut self, name: &str, config: ProviderConfig) {
        self.providers.insert(name.to_string(), config);
    }

    pub fn get(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }
}

const KNOWN_PROVIDERS: &[&str] = &["atlassian", "github"];

fn provider_from_env(name: &str) -> Option<ProviderConfig> {
    let env_prefix = name.to_uppercase();
    let client_id = std::env::var(format!("CONDUIT_OAUTH_{}_CLIENT_ID", env_prefix)).ok()?;
    let client_secret =
        std::env::var(format!("CONDUIT_OAUTH_{}_CLIENT_SECRET", env_prefix)).ok()?;

    let (auth_url, token_url, scopes, extra, rotates) = match name {
        "atlassian" => (
            "https://auth.atlassian.com/authorize",
            "https://auth.atlassian.com/oauth/token",
            vec![
                "read:jira-work",
                "write:jira-work",
                "read:jira-user",
                "read:confluence-content.all",
                "write:confluence-content",
                "offline_access",
            ],
            vec![
                ("audience".to_string(), "api.atlassian.com".to_string()),
                ("prompt".to_string(), "consent".to_string()),
            ],
            true,
        ),
        "github" => (
            "https://github.com/login/oauth/authorize",
            "https://github.com/login/oauth/access_token",
            vec!["repo", "read:user"],
            vec![],
            false,
        ),
        _ => return None,
    };

    let auth_url = std::env::var(format!("CONDUIT_OAUTH_{}_AUTH_URL", env_prefix))
        .unwrap_or_else(|_| auth_url.to_string());
    let token_url = std::env::var(format!("CONDUIT_OAUTH_{}_TOKEN_URL", env_prefix))
        .unwrap_or_else(|_| token_url.to_string());

    Some(ProviderConfig {
        auth_url,
        token_url,
        scopes: scopes.into_iter().map(|s| s.to_string()).collect(),
        extra_authorize_params: extra,
        rotates_refresh_tokens: rotates,
        client_id,
        client_secret,
    })
}
