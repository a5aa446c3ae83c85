//! HTTP backend tests against a mock GraphQL endpoint
//!
//! Tests the request/response handling of [`HttpBackend`]:
//! - Two-step bind (refresh token, then access token) and expiry parsing
//! - GraphQL errors joined into one message, non-2xx statuses surfaced
//! - Bearer header on authorized calls and client-mutation-id echo checks


use mqtt_bridge::backend::{BackendApi, BackendError, CompletionReport, HttpBackendConfig};
use mqtt_bridge::state::{Credential, TokenStore};
use mqtt_bridge::HttpBackend;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::test_jwt;
use url::Url;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Answers a mutation by echoing the client mutation id it was sent
struct EchoMutation(&'static str);

impl Respond for EchoMutation {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).unwrap();
        let mut data = Map::new();
        data.insert(
            self.0.to_string(),
            json!({ "clientMutationId": body["variables"]["clientMutationId"] }),
        );
        ResponseTemplate::new(200).set_body_json(json!({ "data": data }))
    }
}

fn data(body: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "data": body }))
}

fn backend(server: &MockServer, tokens: Arc<TokenStore>) -> HttpBackend {
    let config = HttpBackendConfig {
        endpoint: Url::parse(&format!("{}/graphql", server.uri())).unwrap(),
        username: "bridge".to_string(),
        password: "secret".to_string(),
        token_ttl_mins: 5,
        profile_tags: vec!["bridge".to_string()],
        timeout: Duration::from_secs(5),
    };
    HttpBackend::new(config, tokens).unwrap()
}

fn bound_tokens(session_token: &str) -> Arc<TokenStore> {
    let tokens = Arc::new(TokenStore::new());
    tokens.replace(Credential {
        session_token: session_token.to_string(),
        expires_at: 4_000_000_000,
        refresh_token: "refresh-abc".to_string(),
        token_id: "token-1".to_string(),
    });
    tokens
}

#[tokio::test]
async fn test_bind_exchanges_refresh_token_for_session_token() {
    // Arrange
    let server = MockServer::start().await;
    let jwt = test_jwt(1_900_000_000);
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_string_contains("AuthRefreshToken"))
        .and(body_string_contains(r#""login":"bridge""#))
        .respond_with(data(json!({
            "authRefreshToken": {"refreshToken": {"token": "refresh-abc", "id": "token-1"}}
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("AuthAccessToken"))
        .and(body_string_contains(r#""token":"refresh-abc""#))
        .respond_with(data(json!({"authAccessToken": {"jwtToken": jwt}})))
        .expect(1)
        .mount(&server)
        .await;
    let backend = backend(&server, Arc::new(TokenStore::new()));

    // Act
    let credential = backend.bind().await.expect("Bind should succeed");

    // Assert
    assert_eq!(credential.session_token, jwt);
    assert_eq!(credential.expires_at, 1_900_000_000);
    assert_eq!(credential.refresh_token, "refresh-abc");
    assert_eq!(credential.token_id, "token-1");
}

#[tokio::test]
async fn test_bind_rejects_empty_refresh_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("AuthRefreshToken"))
        .respond_with(data(json!({
            "authRefreshToken": {"refreshToken": {"token": "", "id": "token-1"}}
        })))
        .mount(&server)
        .await;
    let backend = backend(&server, Arc::new(TokenStore::new()));

    let result = backend.bind().await;

    assert!(matches!(result, Err(BackendError::Token(_))));
}

#[tokio::test]
async fn test_refresh_keeps_refresh_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("AuthAccessToken"))
        .respond_with(data(json!({"authAccessToken": {"jwtToken": test_jwt(1_950_000_000)}})))
        .expect(1)
        .mount(&server)
        .await;
    let tokens = bound_tokens("old");
    let backend = backend(&server, tokens.clone());
    let current = tokens.snapshot().unwrap();

    let refreshed = backend.refresh_access_token(&current).await.unwrap();

    assert_eq!(refreshed.expires_at, 1_950_000_000);
    assert_eq!(refreshed.refresh_token, "refresh-abc");
    assert_eq!(refreshed.token_id, "token-1");
}

#[tokio::test]
async fn test_graphql_errors_are_joined() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": null,
            "errors": [{"message": "permission denied"}, {"message": "row not found"}]
        })))
        .mount(&server)
        .await;
    let backend = backend(&server, bound_tokens("session"));

    let result = backend.user_id().await;

    match result {
        Err(BackendError::Api { message }) => assert_eq!(message, "permission denied; row not found"),
        other => panic!("Expected API error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_non_success_status_is_surfaced() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .mount(&server)
        .await;
    let backend = backend(&server, bound_tokens("session"));

    let result = backend.profile_object_id().await;

    match result {
        Err(e @ BackendError::Status { .. }) => {
            assert!(e.is_transport());
            assert!(e.to_string().contains("502"));
        }
        other => panic!("Expected status error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_ack_sends_bearer_and_checks_echo() {
    // Arrange
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("authorization", "Bearer session-xyz"))
        .and(body_string_contains("UpdateControlExecutionAck"))
        .and(body_string_contains(r#""controlsExecutionId":7"#))
        .respond_with(EchoMutation("updateControlExecutionAck"))
        .expect(1)
        .mount(&server)
        .await;
    let backend = backend(&server, bound_tokens("session-xyz"));

    // Act / Assert
    backend.ack_control(7).await.expect("Ack should succeed");
}

#[tokio::test]
async fn test_mismatched_echo_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(data(json!({
            "updateControlExecutionAck": {"clientMutationId": "someone-else"}
        })))
        .mount(&server)
        .await;
    let backend = backend(&server, bound_tokens("session"));

    let result = backend.ack_control(7).await;

    assert!(matches!(result, Err(BackendError::MutationMismatch { .. })));
}

#[tokio::test]
async fn test_report_for_synthetic_control_sends_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(EchoMutation("createControlExecutionReport"))
        .expect(0)
        .mount(&server)
        .await;
    let backend = backend(&server, bound_tokens("session"));

    let report = CompletionReport {
        control_id: -1,
        error: false,
        done: true,
        report: String::new(),
    };
    backend.report_control(&report).await.unwrap();
}

#[tokio::test]
async fn test_report_carries_completion_fields() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("CreateControlExecutionReport"))
        .and(body_string_contains(r#""linkedControlId":42"#))
        .and(body_string_contains(r#""done":true"#))
        .and(body_string_contains(r#""report":"""#))
        .respond_with(EchoMutation("createControlExecutionReport"))
        .expect(1)
        .mount(&server)
        .await;
    let backend = backend(&server, bound_tokens("session"));

    let report = CompletionReport {
        control_id: 42,
        error: false,
        done: true,
        report: String::new(),
    };
    backend.report_control(&report).await.unwrap();
}

#[tokio::test]
async fn test_update_property_looks_up_row_then_patches() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("GetObjectPropertyValue"))
        .respond_with(data(json!({
            "objectProperties": [{"id": "prop-9", "objectId": "bridge-obj", "value": "old", "groupName": "Credentials"}]
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("UpdateObjectProperty"))
        .and(body_string_contains(r#""id":"prop-9""#))
        .and(body_string_contains(r#""value":"tcp://new:1883""#))
        .respond_with(EchoMutation("updateObjectProperty"))
        .expect(1)
        .mount(&server)
        .await;
    let backend = backend(&server, bound_tokens("session"));

    backend
        .update_property("bridge-obj", "BrokerURL", "tcp://new:1883")
        .await
        .expect("Update should succeed");
}

#[tokio::test]
async fn test_property_values_are_textual() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("GetObjectPropertyValue"))
        .respond_with(data(json!({
            "objectProperties": [{"id": "prop-3", "objectId": "bridge-obj", "value": true, "groupName": "Settings"}]
        })))
        .mount(&server)
        .await;
    let backend = backend(&server, bound_tokens("session"));

    let value = backend
        .get_property_value("bridge-obj", "AUTO_PROVISION")
        .await
        .unwrap();

    assert_eq!(value, "true");
}

#[tokio::test]
async fn test_missing_property_row() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(data(json!({"objectProperties": []})))
        .mount(&server)
        .await;
    let backend = backend(&server, bound_tokens("session"));

    let result = backend.get_property_value("bridge-obj", "Topics").await;

    assert!(matches!(result, Err(BackendError::MissingData(_))));
}
