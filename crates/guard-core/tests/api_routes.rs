//! REST endpoints over a real listener.

use std::sync::Arc;

use guard_common::Platform;
use guard_core::api::{build_app, ApiServerConfig};
use guard_core::collaborators::memory::{
    FixedBalanceProvider, MemoryVault, StaticIdentityProvider, TracingExecutionSink,
};
use guard_core::{Collaborators, GuardConfig, TradingGuard};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::net::TcpListener;

struct TestServer {
    base: String,
    http: reqwest::Client,
    identity: Arc<StaticIdentityProvider>,
}

impl TestServer {
    async fn start() -> Self {
        let identity = Arc::new(StaticIdentityProvider::new());
        let mut config = GuardConfig::default();
        config.admin_key = Some("ops-key".to_string());
        let collaborators = Collaborators {
            identity: identity.clone(),
            vault: Arc::new(MemoryVault::new()),
            balances: vec![Arc::new(FixedBalanceProvider::new(Platform::Kalshi))],
            execution: Arc::new(TracingExecutionSink),
            journal: None,
        };
        let guard = Arc::new(TradingGuard::new(config, collaborators));
        let app = build_app(&ApiServerConfig::default(), guard);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        Self {
            base: format!("http://{}", addr),
            http: reqwest::Client::new(),
            identity,
        }
    }

    async fn call(
        &self,
        method: reqwest::Method,
        path: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut req = self.http.request(method, format!("{}{}", self.base, path));
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await.unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap())
    }

    async fn get(&self, path: &str, token: &str) -> (StatusCode, Value) {
        self.call(reqwest::Method::GET, path, Some(token), None).await
    }

    async fn post(&self, path: &str, token: &str, body: Value) -> (StatusCode, Value) {
        self.call(reqwest::Method::POST, path, Some(token), Some(body)).await
    }
}

#[tokio::test]
async fn test_health() {
    let server = TestServer::start().await;
    let (status, body) = server
        .call(reqwest::Method::GET, "/api/health", None, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
}

#[tokio::test]
async fn test_protected_routes_require_completed_onboarding() {
    let server = TestServer::start().await;
    server.identity.insert_token("new-user", "nina", 2);

    let (status, body) = server
        .call(reqwest::Method::GET, "/api/mode", None, None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["ok"], false);
    assert_eq!(body["errorKind"], "auth");

    let (status, body) = server.get("/api/mode", "new-user").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["errorKind"], "onboarding_incomplete");

    let (_, body) = server.get("/api/session", "new-user").await;
    assert_eq!(body["decision"]["decision"], "redirect_onboarding");
    assert_eq!(body["decision"]["step"], 2);

    // Steps must be completed in order.
    let (status, body) = server
        .post("/api/onboarding/steps", "new-user", json!({ "step": 4 }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errorKind"], "validation");

    for step in 3..=5 {
        let (status, body) = server
            .post("/api/onboarding/steps", "new-user", json!({ "step": step }))
            .await;
        assert_eq!(status, StatusCode::OK, "step {}: {}", step, body);
    }

    let (status, body) = server.get("/api/mode", "new-user").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["mode"]["phase"], "paper");
}

#[tokio::test]
async fn test_account_lifecycle_with_warning() {
    let server = TestServer::start().await;
    server.identity.insert_token("t", "olga", 5);

    let (status, body) = server
        .post(
            "/api/accounts",
            "t",
            json!({ "label": "Main", "platform": "kalshi", "allocationPct": "60" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["account"]["isPrimary"], true);
    assert_eq!(body["warning"]["sum"], "60");
    let first = body["account"]["id"].as_str().unwrap().to_string();

    let (_, body) = server
        .post(
            "/api/accounts",
            "t",
            json!({ "label": "Alt", "platform": "kalshi", "allocationPct": "40" }),
        )
        .await;
    assert!(body["warning"].is_null());
    let second = body["account"]["id"].as_str().unwrap().to_string();

    let (status, body) = server
        .call(
            reqwest::Method::DELETE,
            &format!("/api/accounts/{}", first),
            Some("t"),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["errorKind"], "conflict");

    let (status, body) = server
        .call(
            reqwest::Method::PUT,
            "/api/allocations",
            Some("t"),
            Some(json!({ "allocations": [
                { "accountId": first, "allocationPct": "70" },
                { "accountId": second, "allocationPct": "50" }
            ]})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["allocation"]["valid"], false);
    assert_eq!(body["warning"]["sum"], "120");

    let (status, body) = server.get("/api/accounts", "t").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accounts"].as_array().unwrap().len(), 2);
    assert_eq!(body["valid"], false);
}

#[tokio::test]
async fn test_invalid_fields_are_validation_errors() {
    let server = TestServer::start().await;
    server.identity.insert_token("t", "pia", 5);

    let (status, body) = server
        .post(
            "/api/accounts",
            "t",
            json!({ "label": "Main", "platform": "kalshi", "allocationPct": "150" }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errorKind"], "validation");

    let (status, body) = server
        .post("/api/accounts", "t", json!({ "label": "Main" }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errorKind"], "validation");
}

#[tokio::test]
async fn test_go_live_handshake_and_kill_switch() {
    let server = TestServer::start().await;
    server.identity.insert_token("t", "quinn", 5);

    // Live needs a valid allocation first.
    let (status, _) = server.post("/api/mode/live", "t", json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);

    server
        .post(
            "/api/accounts",
            "t",
            json!({ "label": "Main", "platform": "kalshi", "allocationPct": "100" }),
        )
        .await;

    let (status, body) = server.post("/api/mode/live", "t", json!({})).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    let token_id = body["confirmation"]["id"].as_str().unwrap().to_string();

    let (status, body) = server
        .post(
            "/api/mode/confirm",
            "t",
            json!({ "tokenId": token_id, "acknowledged": true }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["mode"]["phase"], "live");

    for expected_repeat in [false, true] {
        let (status, body) = server
            .post("/api/mode/emergency-stop", "t", json!({}))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["phase"], "killed");
        assert_eq!(body["alreadyKilled"], expected_repeat);
    }

    let (status, _) = server.post("/api/mode/paper", "t", json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_emergency_stop_allowed_during_onboarding() {
    let server = TestServer::start().await;
    server.identity.insert_token("t", "rae", 1);

    let (status, body) = server
        .post("/api/mode/emergency-stop", "t", json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["phase"], "killed");
}

#[tokio::test]
async fn test_admin_clear_requires_key() {
    let server = TestServer::start().await;
    server.identity.insert_token("t", "sam", 5);
    server
        .post("/api/mode/emergency-stop", "t", json!({}))
        .await;

    let (status, body) = server
        .call(
            reqwest::Method::POST,
            "/api/admin/users/sam/mode/clear",
            None,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["errorKind"], "auth");

    let resp = server
        .http
        .post(format!("{}/api/admin/users/sam/mode/clear", server.base))
        .header("x-admin-key", "ops-key")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["mode"]["phase"], "paper");
}

#[tokio::test]
async fn test_emergency_stop_survives_identity_outage() {
    let server = TestServer::start().await;
    server.identity.insert_token("tok", "dave", 5);
    server.identity.insert_token("cold", "ezra", 5);

    let (status, _) = server.get("/api/mode", "tok").await;
    assert_eq!(status, StatusCode::OK);

    server.identity.fail_next(50);

    // Other routes still need the identity service.
    let (status, body) = server.get("/api/mode", "tok").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["errorKind"], "external_provider");

    let (status, body) = server
        .post("/api/mode/emergency-stop", "tok", json!({}))
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["phase"], "killed");
    assert_eq!(body["alreadyKilled"], false);

    // A token never seen before cannot be vouched for.
    let (status, body) = server
        .post("/api/mode/emergency-stop", "cold", json!({}))
        .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["errorKind"], "external_provider");
}
