// End-to-end authorization flow tests: portal link → start → provider
// redirect → callback → credential record → token served.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use conduit::broker::{BrokerTuning, TokenBroker, TokenOutcome};
use conduit::crypto::{EnvelopeCipher, LocalMasterKey};
use conduit::oauth::{
    create_oauth_router, OAuthAppState, ProviderConfig, ProviderRegistry, StateManager,
};
use conduit::store::{SqliteTokenStore, TokenStore};
use std::sync::Arc;
use tower::ServiceExt;

const PORTAL_SECRET: &str = "portal-test-secret";
const PUBLIC_BASE_URL: &str = "http://conduit.test";

struct Harness {
    app: Router,
    broker: TokenBroker,
    store: Arc<SqliteTokenStore>,
    state_manager: StateManager,
}

fn test_provider(token_url: &str) -> ProviderConfig {
    ProviderConfig {
        auth_url: "https://provider.test/authorize".to_string(),
        token_url: token_url.to_string(),
        scopes: vec!["read:jira-work".to_string(), "offline_access".to_string()],
        extra_authorize_params: vec![("audience".to_string(), "api.provider.test".to_string())],
        rotates_refresh_tokens: true,
        client_id: "client-id".to_string(),
        client_secret: "client-secret".to_string(),
    }
}

fn harness(token_url: &str) -> Harness {
    let key = BASE64.encode([3u8; 32]);
    let cipher = Arc::new(EnvelopeCipher::new(Arc::new(
        LocalMasterKey::from_base64(&key).unwrap(),
    )));
    let store = Arc::new(SqliteTokenStore::new(":memory:").unwrap());
    let mut providers = ProviderRegistry::default();
    providers.insert("atlassian", test_provider(token_url));
    let providers = Arc::new(providers);
    let state_manager = StateManager::new(600);

    let app = create_oauth_router(OAuthAppState {
        store: Arc::clone(&store) as Arc<dyn TokenStore>,
        cipher: Arc::clone(&cipher),
        providers: Arc::clone(&providers),
        state_manager: state_manager.clone(),
        portal_signing_secret: PORTAL_SECRET.to_string(),
        public_base_url: PUBLIC_BASE_URL.to_string(),
        record_ttl_seconds: 90 * 86_400,
    });

    let broker = TokenBroker::new(
        Arc::clone(&store) as Arc<dyn TokenStore>,
        cipher,
        providers,
        PORTAL_SECRET.to_string(),
        PUBLIC_BASE_URL.to_string(),
        BrokerTuning::default(),
    );

    Harness {
        app,
        broker,
        store,
        state_manager,
    }
}

/// Extracts a query parameter from a URL.
fn query_param(url: &str, name: &str) -> Option<String> {
    let query = url.split('?').nth(1)?;
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        if parts.next() == Some(name) {
            return parts
                .next()
                .map(|v| urlencoding::decode(v).unwrap().into_owned());
        }
    }
    None
}

fn token_response_body(access: &str, refresh: &str) -> String {
    serde_json::json!({
        "access_token": access,
        "refresh_token": refresh,
        "expires_in": 3600,
        "scope": "read:jira-work offline_access",
        "token_type": "Bearer"
    })
    .to_string()
}

#[tokio::test]
async fn test_full_authorization_flow() {
    let mut server = mockito::Server::new_async().await;
    let exchange_mock = server
        .mock("POST", "/oauth/token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(token_response_body("fresh-access", "fresh-refresh"))
        .expect(1)
        .create_async()
        .await;

    let h = harness(&format!("{}/oauth/token", server.url()));

    // 1. No credential yet: acquire_token returns AuthRequired + link
    let outcome = h.broker.acquire_token("U123", "atlassian").await.unwrap();
    let authorize_url = match outcome {
        TokenOutcome::AuthRequired { authorize_url } => authorize_url,
        other => panic!("expected AuthRequired, got {:?}", other),
    };
    assert!(authorize_url.starts_with(&format!("{}/auth/atlassian/start?", PUBLIC_BASE_URL)));

    // 2. User follows the link: /start redirects to the provider
    let path = authorize_url.strip_prefix(PUBLIC_BASE_URL).unwrap();
    let response = h
        .app
        .clone()
        .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);

    let location = response
        .headers()
        .get("location")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(location.starts_with("https://provider.test/authorize?"));
    assert!(location.contains("audience=api.provider.test"));
    let state = query_param(&location, "state").expect("state in authorize URL");

    // 3. Provider redirects back with a code: callback exchanges and stores
    let callback_uri = format!("/auth/atlassian/callback?code=authcode-1&state={}", state);
    let response = h
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri(&callback_uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    exchange_mock.assert_async().await;

    // 4. Credential record exists, bound to the portal-link user
    let record = h
        .store
        .get(&conduit::store::CredentialKey::new("U123", "atlassian"))
        .unwrap();
    assert_eq!(record.version, 1);
    assert!(record.refresh_claim_expires_at.is_none());

    // 5. acquire_token now serves the access token with no further
    //    network call (the exchange mock is exhausted at expect(1))
    match h.broker.acquire_token("U123", "atlassian").await.unwrap() {
        TokenOutcome::Token {
            access_token,
            expires_at,
        } => {
            assert_eq!(access_token, "fresh-access");
            assert!(expires_at > chrono::Utc::now().timestamp());
        }
        other => panic!("expected Token, got {:?}", other),
    }
}

#[tokio::test]
async fn test_replayed_state_rejected() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/oauth/token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(token_response_body("a", "r"))
        .create_async()
        .await;

    let h = harness(&format!("{}/oauth/token", server.url()));
    let state = h.state_manager.create_state("atlassian", "U123", None);

    // First use succeeds
    let callback_uri = format!("/auth/atlassian/callback?code=c1&state={}", state);
    let response = h
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri(&callback_uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Replay is rejected
    let response = h
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri(&callback_uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_expired_state_rejected() {
    let h = harness("http://127.0.0.1:1/token");

    // Zero-lifetime states expire immediately
    let manager = StateManager::new(0);
    let app = {
        let key = BASE64.encode([3u8; 32]);
        let cipher = Arc::new(EnvelopeCipher::new(Arc::new(
            LocalMasterKey::from_base64(&key).unwrap(),
        )));
        let mut providers = ProviderRegistry::default();
        providers.insert("atlassian", test_provider("http://127.0.0.1:1/token"));
        create_oauth_router(OAuthAppState {
            store: Arc::clone(&h.store) as Arc<dyn TokenStore>,
            cipher,
            providers: Arc::new(providers),
            state_manager: manager.clone(),
            portal_signing_secret: PORTAL_SECRET.to_string(),
            public_base_url: PUBLIC_BASE_URL.to_string(),
            record_ttl_seconds: 90 * 86_400,
        })
    };

    let state = manager.create_state("atlassian", "U123", None);
    std::thread::sleep(std::time::Duration::from_millis(1100));

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/auth/atlassian/callback?code=c1&state={}", state))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_start_without_portal_token_rejected() {
    let h = harness("http://127.0.0.1:1/token");

    let response = h
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/auth/atlassian/start")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_unknown_provider_is_not_found() {
    let h = harness("http://127.0.0.1:1/token");

    let response = h
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/auth/doesnotexist/start?token=whatever")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_provider_error_callback_is_bad_request() {
    let h = harness("http://127.0.0.1:1/token");

    let response = h
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/auth/atlassian/callback?error=access_denied&error_description=nope")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_revoke_deletes_credential() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/oauth/token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(token_response_body("a", "r"))
        .create_async()
        .await;

    let h = harness(&format!("{}/oauth/token", server.url()));

    // Authorize via callback
    let state = h.state_manager.create_state("atlassian", "U123", None);
    let response = h
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/auth/atlassian/callback?code=c1&state={}", state))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Revoke with a portal token for the same user
    let portal_token = conduit::oauth::portal::mint(
        PORTAL_SECRET,
        &conduit::oauth::portal::PortalClaims {
            user_id: "U123".to_string(),
            display_name: None,
            exp: chrono::Utc::now().timestamp() + 600,
        },
    );
    let response = h
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!(
                    "/auth/atlassian/revoke?token={}",
                    urlencoding::encode(&portal_token)
                ))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Record gone: next acquire is AuthRequired
    match h.broker.acquire_token("U123", "atlassian").await.unwrap() {
        TokenOutcome::AuthRequired { .. } => {}
        other => panic!("expected AuthRequired after revoke, got {:?}", other),
    }
}
