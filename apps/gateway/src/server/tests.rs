use std::sync::Arc;

use anyhow::Result;
use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode},
};
use ed25519_dalek::{Signer, SigningKey};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;
use valheim_compute_control::{
    CreateBehavior, InMemoryControlPlane, InstanceDescriptor, InstanceState,
};

use super::{AppState, build_router, panic_response};
use crate::{
    assemble_gateway,
    config::{Config, ControlPlaneBackend},
    lifecycle::StartOutcome,
    notify::MemoryNotifier,
    secrets::StaticSecretProvider,
    signature::{SIGNATURE_HEADER, TIMESTAMP_HEADER},
    supervisor::TaskOutcome,
};

const RESOURCE: &str = "valheim-server";
const TIMESTAMP: &str = "1760000000";

struct TestGateway {
    router: Router,
    state: AppState,
    plane: Arc<InMemoryControlPlane>,
    notifier: Arc<MemoryNotifier>,
    key: SigningKey,
}

fn test_config() -> Config {
    let mut config = Config::from_lookup(|_| None).expect("default config");
    config.service_name = "gateway-test".to_string();
    config.build_sha = "test".to_string();
    config.control_plane = ControlPlaneBackend::Memory;
    config
}

fn signing_key() -> SigningKey {
    SigningKey::from_bytes(&[7u8; 32])
}

fn default_secrets(key: &SigningKey) -> StaticSecretProvider {
    StaticSecretProvider::new([
        (
            "DISCORD-PUBLIC-KEY".to_string(),
            hex::encode(key.verifying_key().to_bytes()),
        ),
        (
            "VALHEIM-SERVER-PASSWORD".to_string(),
            "hunter22".to_string(),
        ),
    ])
}

fn test_gateway_with(
    plane: InMemoryControlPlane,
    secrets: StaticSecretProvider,
    mutate_config: impl FnOnce(&mut Config),
) -> TestGateway {
    let mut config = test_config();
    mutate_config(&mut config);
    let plane = Arc::new(plane);
    let notifier = Arc::new(MemoryNotifier::new());
    let gateway = assemble_gateway(config, plane.clone(), Arc::new(secrets), notifier.clone());
    TestGateway {
        router: build_router(gateway.state.clone()),
        state: gateway.state,
        plane,
        notifier,
        key: signing_key(),
    }
}

fn test_gateway(plane: InMemoryControlPlane) -> TestGateway {
    test_gateway_with(plane, default_secrets(&signing_key()), |_| {})
}

fn command_body(name: &str, subcommand: Option<&str>) -> String {
    let options = subcommand
        .map(|subcommand| json!([{ "name": subcommand, "type": 1 }]))
        .unwrap_or_else(|| json!([]));
    json!({
        "type": 2,
        "token": "interaction-token",
        "application_id": "1234",
        "data": { "name": name, "options": options },
    })
    .to_string()
}

fn signed_request(key: &SigningKey, body: &str) -> Result<Request<Body>> {
    let signature = key.sign(format!("{TIMESTAMP}{body}").as_bytes());
    Ok(Request::builder()
        .method(Method::POST)
        .uri("/api/interactions")
        .header("content-type", "application/json")
        .header(SIGNATURE_HEADER, hex::encode(signature.to_bytes()))
        .header(TIMESTAMP_HEADER, TIMESTAMP)
        .body(Body::from(body.to_string()))?)
}

fn unsigned_request(body: &str) -> Result<Request<Body>> {
    Ok(Request::builder()
        .method(Method::POST)
        .uri("/api/interactions")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))?)
}

async fn send(router: &Router, request: Request<Body>) -> Result<(StatusCode, Value)> {
    let response = router.clone().oneshot(request).await?;
    let status = response.status();
    let bytes = response.into_body().collect().await?.to_bytes();
    Ok((status, serde_json::from_slice(&bytes)?))
}

fn content(body: &Value) -> &str {
    body.pointer("/data/content")
        .and_then(Value::as_str)
        .unwrap_or_default()
}

#[tokio::test]
async fn signed_ping_is_acknowledged() -> Result<()> {
    let gateway = test_gateway(InMemoryControlPlane::new());
    let (status, body) = send(&gateway.router, signed_request(&gateway.key, r#"{"type":1}"#)?).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "type": 1 }));
    Ok(())
}

#[tokio::test]
async fn ping_is_acknowledged_even_without_a_valid_signature() -> Result<()> {
    let gateway = test_gateway(InMemoryControlPlane::new());

    let (status, body) = send(&gateway.router, unsigned_request(r#"{"type":1}"#)?).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "type": 1 }));

    let wrong_key = SigningKey::from_bytes(&[9u8; 32]);
    let (status, body) = send(&gateway.router, signed_request(&wrong_key, r#"{"type":1}"#)?).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "type": 1 }));
    Ok(())
}

#[tokio::test]
async fn commands_with_bad_signatures_are_unauthorized() -> Result<()> {
    let gateway = test_gateway(InMemoryControlPlane::new());
    let body = command_body("valheim", Some("status"));

    let (status, response) = send(&gateway.router, unsigned_request(&body)?).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(response["error"], "unauthorized");

    let wrong_key = SigningKey::from_bytes(&[9u8; 32]);
    let (status, _) = send(&gateway.router, signed_request(&wrong_key, &body)?).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(gateway.plane.get_calls().await, 0);
    Ok(())
}

#[tokio::test]
async fn malformed_body_is_a_bad_request() -> Result<()> {
    let gateway = test_gateway(InMemoryControlPlane::new());
    let (status, body) = send(&gateway.router, signed_request(&gateway.key, "{not json")?).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_request");
    Ok(())
}

#[tokio::test]
async fn status_without_instance_reports_stopped() -> Result<()> {
    let gateway = test_gateway(InMemoryControlPlane::new());
    let body = command_body("valheim", Some("status"));

    let (status, response) = send(&gateway.router, signed_request(&gateway.key, &body)?).await?;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["type"], 4);
    assert!(content(&response).contains("STOPPED"));
    Ok(())
}

#[tokio::test]
async fn unknown_command_and_missing_subcommand_are_ephemeral_messages() -> Result<()> {
    let gateway = test_gateway(InMemoryControlPlane::new());

    let body = command_body("minecraft", Some("start"));
    let (status, response) = send(&gateway.router, signed_request(&gateway.key, &body)?).await?;
    assert_eq!(status, StatusCode::OK);
    assert!(content(&response).contains("Unknown command"));
    assert_eq!(response["data"]["flags"], 64);

    let body = command_body("valheim", None);
    let (_, response) = send(&gateway.router, signed_request(&gateway.key, &body)?).await?;
    assert!(content(&response).contains("No subcommand"));
    assert_eq!(response["data"]["flags"], 64);

    let body = command_body("valheim", Some("reboot"));
    let (_, response) = send(&gateway.router, signed_request(&gateway.key, &body)?).await?;
    assert!(content(&response).contains("Unknown subcommand"));

    assert_eq!(gateway.plane.create_calls().await, 0);
    Ok(())
}

#[tokio::test]
async fn json_without_a_type_needs_a_signature_like_any_other_kind() -> Result<()> {
    let gateway = test_gateway(InMemoryControlPlane::new());

    let (status, body) = send(&gateway.router, unsigned_request(r#"{"data":{}}"#)?).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");

    let (status, body) = send(
        &gateway.router,
        signed_request(&gateway.key, r#"{"data":{}}"#)?,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert!(content(&body).contains("Unsupported interaction type"));
    assert_eq!(body["data"]["flags"], 64);
    Ok(())
}

#[tokio::test]
async fn commands_without_a_token_still_get_replies() -> Result<()> {
    let gateway = test_gateway(InMemoryControlPlane::new());
    let tokenless = |subcommand: &str| {
        json!({
            "type": 2,
            "application_id": "1234",
            "data": { "name": "valheim", "options": [{ "name": subcommand }] },
        })
        .to_string()
    };

    let (status, body) = send(
        &gateway.router,
        signed_request(&gateway.key, &tokenless("status"))?,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["type"], 4);
    assert!(content(&body).contains("STOPPED"));

    let (status, body) = send(
        &gateway.router,
        signed_request(&gateway.key, &tokenless("stop"))?,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert!(content(&body).contains("not running"));

    let (status, body) = send(
        &gateway.router,
        signed_request(&gateway.key, &tokenless("start"))?,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["type"], 4);
    assert_eq!(body["data"]["flags"], 64);
    assert!(content(&body).contains("no interaction token"));
    assert!(!gateway.state.supervisor().is_in_flight(RESOURCE).await);
    assert_eq!(gateway.plane.create_calls().await, 0);

    let (status, _) = send(&gateway.router, unsigned_request(&tokenless("status"))?).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn unsupported_interaction_types_get_a_message() -> Result<()> {
    let gateway = test_gateway(InMemoryControlPlane::new());
    let body = r#"{"type":3,"token":"t","application_id":"a"}"#;
    let (status, response) = send(&gateway.router, signed_request(&gateway.key, body)?).await?;
    assert_eq!(status, StatusCode::OK);
    assert!(content(&response).contains("Unsupported interaction type"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn start_defers_then_notifies_starting_and_ready() -> Result<()> {
    let gateway = test_gateway(InMemoryControlPlane::with_behavior(CreateBehavior::ReadyAfter(3)));
    let body = command_body("valheim", Some("start"));

    let (status, response) = send(&gateway.router, signed_request(&gateway.key, &body)?).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response, json!({ "type": 5 }));

    let record = gateway
        .state
        .supervisor()
        .wait(RESOURCE)
        .await
        .expect("task record");
    assert!(matches!(
        record.outcome,
        TaskOutcome::Completed(StartOutcome::Ready { .. })
    ));

    let followups = gateway.notifier.sent().await;
    assert_eq!(followups.len(), 2);
    assert!(followups.iter().all(|followup| followup.application_id == "1234"));
    assert!(followups[0].content.contains("Starting"));
    assert!(followups[1].content.contains("203.0.113.10:2456"));

    let body = command_body("valheim", Some("status"));
    let (_, response) = send(&gateway.router, signed_request(&gateway.key, &body)?).await?;
    assert!(content(&response).contains("RUNNING"));
    assert!(content(&response).contains("Auto-shutdown in"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn start_times_out_with_a_followup() -> Result<()> {
    let gateway = test_gateway_with(
        InMemoryControlPlane::with_behavior(CreateBehavior::NeverReady),
        default_secrets(&signing_key()),
        |config| config.start_poll_budget = std::time::Duration::from_secs(60),
    );
    let body = command_body("valheim", Some("start"));
    let (_, response) = send(&gateway.router, signed_request(&gateway.key, &body)?).await?;
    assert_eq!(response, json!({ "type": 5 }));

    let record = gateway.state.supervisor().wait(RESOURCE).await.expect("record");
    assert_eq!(
        record.outcome,
        TaskOutcome::Completed(StartOutcome::TimedOut { waited_seconds: 60 })
    );
    let contents = gateway.notifier.contents().await;
    assert!(contents.last().is_some_and(|last| last.contains("/valheim status")));
    Ok(())
}

#[tokio::test]
async fn second_start_while_in_flight_is_rejected() -> Result<()> {
    let gateway = test_gateway(InMemoryControlPlane::with_behavior(CreateBehavior::NeverReady));
    let body = command_body("valheim", Some("start"));

    let (_, first) = send(&gateway.router, signed_request(&gateway.key, &body)?).await?;
    let (_, second) = send(&gateway.router, signed_request(&gateway.key, &body)?).await?;

    assert_eq!(first, json!({ "type": 5 }));
    assert_eq!(second["type"], 4);
    assert!(content(&second).contains("already in progress"));
    assert_eq!(second["data"]["flags"], 64);
    Ok(())
}

#[tokio::test]
async fn stop_deletes_a_running_instance_and_is_idempotent() -> Result<()> {
    let gateway = test_gateway(InMemoryControlPlane::new());
    let mut running = InstanceDescriptor::new(RESOURCE, InstanceState::Running);
    running.started_at = Some(chrono::Utc::now());
    gateway.plane.insert(running).await;
    let body = command_body("valheim", Some("stop"));

    let (status, response) = send(&gateway.router, signed_request(&gateway.key, &body)?).await?;
    assert_eq!(status, StatusCode::OK);
    assert!(content(&response).contains("Stopping"));
    assert_eq!(gateway.plane.delete_calls().await, 1);

    let (_, response) = send(&gateway.router, signed_request(&gateway.key, &body)?).await?;
    assert!(content(&response).contains("not running"));
    assert_eq!(gateway.plane.delete_calls().await, 1);
    Ok(())
}

#[tokio::test]
async fn missing_public_key_denies_commands_unless_explicitly_allowed() -> Result<()> {
    let secrets = || StaticSecretProvider::new([("VALHEIM-SERVER-PASSWORD", "hunter22")]);
    let body = command_body("valheim", Some("status"));

    let strict = test_gateway_with(InMemoryControlPlane::new(), secrets(), |_| {});
    let (status, _) = send(&strict.router, unsigned_request(&body)?).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let permissive = test_gateway_with(InMemoryControlPlane::new(), secrets(), |config| {
        config.allow_unverified_requests = true;
    });
    let (status, response) = send(&permissive.router, unsigned_request(&body)?).await?;
    assert_eq!(status, StatusCode::OK);
    assert!(content(&response).contains("STOPPED"));
    Ok(())
}

#[tokio::test]
async fn custom_interactions_path_is_routed() -> Result<()> {
    let gateway = test_gateway_with(
        InMemoryControlPlane::new(),
        default_secrets(&signing_key()),
        |config| config.interactions_path = "/discord".to_string(),
    );
    let signature = gateway.key.sign(format!("{TIMESTAMP}{{\"type\":1}}").as_bytes());
    let request = Request::builder()
        .method(Method::POST)
        .uri("/discord")
        .header(SIGNATURE_HEADER, hex::encode(signature.to_bytes()))
        .header(TIMESTAMP_HEADER, TIMESTAMP)
        .body(Body::from(r#"{"type":1}"#))?;
    let (status, body) = send(&gateway.router, request).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "type": 1 }));
    Ok(())
}

#[tokio::test]
async fn health_and_readiness_report_backend_state() -> Result<()> {
    let gateway = test_gateway(InMemoryControlPlane::new());
    let (status, health) = send(
        &gateway.router,
        Request::builder().uri("/healthz").body(Body::empty())?,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "ok");
    assert_eq!(health["service"], "gateway-test");
    assert_eq!(health["control_plane"], "memory");

    let (status, _) = send(
        &gateway.router,
        Request::builder().uri("/readyz").body(Body::empty())?,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);

    let degraded = build_router(
        gateway
            .state
            .clone()
            .with_control_plane_issue(Some("AZURE_SUBSCRIPTION_ID is required".to_string())),
    );
    let (status, body) = send(
        &degraded,
        Request::builder().uri("/readyz").body(Body::empty())?,
    )
    .await?;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["reason"], "AZURE_SUBSCRIPTION_ID is required");
    Ok(())
}

#[tokio::test]
async fn panics_render_generic_json_errors() -> Result<()> {
    let response = panic_response(Box::new("boom"));
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let bytes = response.into_body().collect().await?.to_bytes();
    let body: Value = serde_json::from_slice(&bytes)?;
    assert_eq!(body["error"], "internal_error");
    assert!(!body.to_string().contains("boom"));
    Ok(())
}
