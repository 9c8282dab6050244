//! E2E tests for signed inbound requests

mod common;

use axum::http::StatusCode;
use chrono::{DateTime, Duration, Utc};
use common::{TestServer, generate_keypair};
use fedicourier::federation::sign_request;
use serde_json::{Value, json};

const REMOTE_ACTOR: &str = "https://remote.example/users/bob";

fn follow_from(actor: &str) -> Value {
    json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": format!("{}/follows/1", actor),
        "type": "Follow",
        "actor": actor,
        "object": format!("https://{}/users/alice", common::TEST_DOMAIN)
    })
}

/// POST `body` to `path`, signed as `actor` with `private_key_pem` at `at`.
async fn post_signed(
    server: &TestServer,
    path: &str,
    actor: &str,
    private_key_pem: &str,
    body: &Value,
    at: DateTime<Utc>,
) -> reqwest::Response {
    let host = server.addr.trim_start_matches("http://");
    let signed = sign_request(private_key_pem, actor, "POST", path, host, at).unwrap();

    server
        .client
        .post(server.url(path))
        .header("host", signed.host)
        .header("date", signed.date)
        .header("signature", signed.signature)
        .header("content-type", "application/activity+json")
        .body(body.to_string())
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_health_check() {
    let server = TestServer::new().await;

    let response = server.client.get(server.url("/health")).send().await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn test_signed_activity_is_accepted_by_shared_inbox() {
    let server = TestServer::new().await;
    let (private_pem, public_pem) = generate_keypair();
    server.keys.insert(REMOTE_ACTOR, &public_pem);

    let response = post_signed(
        &server,
        "/inbox",
        REMOTE_ACTOR,
        &private_pem,
        &follow_from(REMOTE_ACTOR),
        Utc::now(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_personal_inbox_requires_known_local_actor() {
    let server = TestServer::new().await;
    server.create_local_actor("alice").await;
    let (private_pem, public_pem) = generate_keypair();
    server.keys.insert(REMOTE_ACTOR, &public_pem);
    let body = follow_from(REMOTE_ACTOR);

    let response = post_signed(
        &server,
        "/users/alice/inbox",
        REMOTE_ACTOR,
        &private_pem,
        &body,
        Utc::now(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = post_signed(
        &server,
        "/users/nobody/inbox",
        REMOTE_ACTOR,
        &private_pem,
        &body,
        Utc::now(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unsigned_request_is_rejected() {
    let server = TestServer::new().await;

    let response = server
        .client
        .post(server.url("/inbox"))
        .header("content-type", "application/activity+json")
        .body(follow_from(REMOTE_ACTOR).to_string())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_stale_date_is_rejected() {
    let server = TestServer::new().await;
    let (private_pem, public_pem) = generate_keypair();
    server.keys.insert(REMOTE_ACTOR, &public_pem);

    let response = post_signed(
        &server,
        "/inbox",
        REMOTE_ACTOR,
        &private_pem,
        &follow_from(REMOTE_ACTOR),
        Utc::now() - Duration::seconds(120),
    )
    .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["type"], "signature_expired");
}

#[tokio::test]
async fn test_signature_from_wrong_key_is_rejected() {
    let server = TestServer::new().await;
    let (_, public_pem) = generate_keypair();
    let (other_private_pem, _) = generate_keypair();
    server.keys.insert(REMOTE_ACTOR, &public_pem);

    let response = post_signed(
        &server,
        "/inbox",
        REMOTE_ACTOR,
        &other_private_pem,
        &follow_from(REMOTE_ACTOR),
        Utc::now(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["type"], "invalid_signature");
}

#[tokio::test]
async fn test_unknown_signer_is_rejected() {
    let server = TestServer::new().await;
    let (private_pem, _) = generate_keypair();

    let response = post_signed(
        &server,
        "/inbox",
        REMOTE_ACTOR,
        &private_pem,
        &follow_from(REMOTE_ACTOR),
        Utc::now(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_signer_must_be_activity_actor() {
    let server = TestServer::new().await;
    let (private_pem, public_pem) = generate_keypair();
    server.keys.insert(REMOTE_ACTOR, &public_pem);

    let response = post_signed(
        &server,
        "/inbox",
        REMOTE_ACTOR,
        &private_pem,
        &follow_from("https://remote.example/users/mallory"),
        Utc::now(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["type"], "unauthorized");
}

#[tokio::test]
async fn test_metrics_endpoint_is_served() {
    let server = TestServer::new().await;

    let response = server.client.get(server.url("/metrics")).send().await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}
