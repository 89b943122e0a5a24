#![allow(clippy::unwrap_used)]
// Integration tests for `Gateway` (authenticated requests, 401 handling, verify)
// using wiremock.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use reqwest::Method;
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use pairlink_core::api::VERIFY_PATH;
use pairlink_core::{
    ApiError, AuthState, Credential, CredentialStore, FailureReason, Gateway, PairingClient,
    PairingMachine,
};

// ── Helpers ─────────────────────────────────────────────────────────

async fn setup() -> (MockServer, Gateway) {
    let server = MockServer::start().await;
    let store = Arc::new(CredentialStore::in_memory());
    store
        .store(&Credential::new("dev-1", "rt-1", server.uri()))
        .unwrap();
    (server, Gateway::new(store))
}

fn machine_for(gateway: Gateway) -> PairingMachine {
    PairingMachine::new(PairingClient::new().unwrap(), gateway, "Test Device")
}

// ── Authenticated requests ──────────────────────────────────────────

#[tokio::test]
async fn test_send_attaches_credentials() {
    let (server, gateway) = setup().await;

    Mock::given(method("GET"))
        .and(path("/api/orders"))
        .and(header("x-device-id", "dev-1"))
        .and(header("authorization", "Bearer rt-1"))
        .and(header("content-type", "application/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 1}])))
        .expect(1)
        .mount(&server)
        .await;

    let response = gateway.send(Method::GET, "/api/orders", None).await.unwrap();
    assert_eq!(response.status(), 200);
    assert!(gateway.store().has_credentials());
}

#[tokio::test]
async fn test_send_with_body() {
    let (server, gateway) = setup().await;

    Mock::given(method("POST"))
        .and(path("/api/picks"))
        .and(body_json(json!({"sku": "A-1", "qty": 2})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let body = json!({"sku": "A-1", "qty": 2});
    let response = gateway
        .send(Method::POST, "/api/picks", Some(&body))
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
}

#[tokio::test]
async fn test_non_401_errors_keep_credentials() {
    let (server, gateway) = setup().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let response = gateway.send(Method::GET, "/api/admin", None).await.unwrap();
    assert_eq!(response.status(), 403);
    assert!(gateway.store().has_credentials());
}

#[tokio::test]
async fn test_401_logs_device_out() {
    let (server, gateway) = setup().await;

    Mock::given(method("GET"))
        .and(path("/api/orders"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": "revoked"})))
        .mount(&server)
        .await;

    gateway.get_client().unwrap();
    let result = gateway.send(Method::GET, "/api/orders", None).await;

    assert!(matches!(result, Err(ApiError::Unauthorized)));
    assert_eq!(gateway.store().load().unwrap(), None);
    assert!(matches!(gateway.get_client(), Err(ApiError::NotAuthenticated)));
}

#[tokio::test]
async fn test_send_without_credentials() {
    let gateway = Gateway::new(Arc::new(CredentialStore::in_memory()));
    let result = gateway.send(Method::GET, "/api/orders", None).await;
    assert!(matches!(result, Err(ApiError::NotAuthenticated)));
}

// ── Verify ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_verify_without_rotation() {
    let (server, gateway) = setup().await;

    Mock::given(method("POST"))
        .and(path(VERIFY_PATH))
        .and(body_json(json!({"refreshToken": "rt-1", "deviceId": "dev-1"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"valid": true})))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = gateway.verify().await.unwrap();
    assert!(!outcome.rotated);
    assert_eq!(outcome.credential, Credential::new("dev-1", "rt-1", server.uri()));
    assert_eq!(outcome.details.get("valid"), Some(&json!(true)));
}

#[tokio::test]
async fn test_verify_rotation_is_used_by_next_verify() {
    let (server, gateway) = setup().await;

    Mock::given(method("POST"))
        .and(path(VERIFY_PATH))
        .and(header("authorization", "Bearer rt-1"))
        .and(body_json(json!({"refreshToken": "rt-1", "deviceId": "dev-1"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"refreshToken": "rt-2"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(VERIFY_PATH))
        .and(header("authorization", "Bearer rt-2"))
        .and(body_json(json!({"refreshToken": "rt-2", "deviceId": "dev-1"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let first = gateway.verify().await.unwrap();
    assert!(first.rotated);
    assert_eq!(
        gateway.store().load().unwrap(),
        Some(Credential::new("dev-1", "rt-2", server.uri()))
    );

    let second = gateway.verify().await.unwrap();
    assert!(!second.rotated);
    assert_eq!(second.credential.refresh_token, "rt-2");
    assert_eq!(second.credential.device_id, "dev-1");
    assert_eq!(second.credential.api_url, server.uri());
}

#[tokio::test]
async fn test_verify_invalid_json_wins_over_status() {
    let (server, gateway) = setup().await;

    Mock::given(method("POST"))
        .and(path(VERIFY_PATH))
        .respond_with(ResponseTemplate::new(503).set_body_string("Service Unavailable"))
        .mount(&server)
        .await;

    let err = gateway.verify().await.unwrap_err();
    assert!(matches!(
        err,
        ApiError::InvalidResponseBody { status: 503, ref preview } if preview == "Service Unavailable"
    ));
    assert!(gateway.store().has_credentials());
}

// ── Verify through the state machine ────────────────────────────────

#[tokio::test]
async fn test_machine_verify_merges_rotated_token() {
    let (server, gateway) = setup().await;

    Mock::given(method("POST"))
        .and(path(VERIFY_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"refreshToken": "rt-2", "expiresIn": 3600})),
        )
        .mount(&server)
        .await;

    let mut machine = machine_for(gateway);
    let state = machine.verify().await.clone();

    let expected = Credential::new("dev-1", "rt-2", server.uri());
    assert_eq!(state, AuthState::Authenticated(expected.clone()));
    assert_eq!(machine.gateway().store().load().unwrap(), Some(expected));
    assert_eq!(machine.details().get("expiresIn"), Some(&json!(3600)));
}

#[tokio::test]
async fn test_machine_verify_failure_keeps_credentials() {
    let (server, gateway) = setup().await;

    Mock::given(method("POST"))
        .and(path(VERIFY_PATH))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({"message": "token expired"})))
        .mount(&server)
        .await;

    let mut machine = machine_for(gateway);
    let state = machine.verify().await.clone();

    assert_eq!(
        state,
        AuthState::Failed(FailureReason::VerifyFailed("token expired".to_string()))
    );
    assert_eq!(
        machine.gateway().store().load().unwrap(),
        Some(Credential::new("dev-1", "rt-1", server.uri()))
    );
}

#[tokio::test]
async fn test_machine_verify_401_logs_out() {
    let (server, gateway) = setup().await;

    Mock::given(method("POST"))
        .and(path(VERIFY_PATH))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": "unknown device"})))
        .mount(&server)
        .await;

    let mut machine = machine_for(gateway);
    let state = machine.verify().await.clone();

    assert!(matches!(
        state,
        AuthState::Failed(FailureReason::VerifyFailed(_))
    ));
    assert!(!machine.gateway().store().has_credentials());

    assert!(machine.reset());
    assert_eq!(machine.state(), &AuthState::Idle);
}

#[tokio::test]
async fn test_machine_send_401_returns_to_idle() {
    let (server, gateway) = setup().await;

    Mock::given(method("GET"))
        .and(path("/api/orders"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let mut machine = machine_for(gateway);
    assert!(machine.is_authenticated());

    let result = machine.send(Method::GET, "/api/orders", None).await;

    assert!(matches!(result, Err(ApiError::Unauthorized)));
    assert_eq!(machine.state(), &AuthState::Idle);
    assert!(!machine.is_authenticated());
    assert!(!machine.gateway().store().has_credentials());
    assert!(machine.start());
}

#[tokio::test]
async fn test_machine_send_error_status_stays_authenticated() {
    let (server, gateway) = setup().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let mut machine = machine_for(gateway);
    let response = machine.send(Method::GET, "/api/orders", None).await.unwrap();

    assert_eq!(response.status(), 500);
    assert!(machine.is_authenticated());
}
