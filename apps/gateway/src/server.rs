use std::any::Any;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};

use crate::{
    config::Config,
    dispatch::{Subcommand, route},
    interaction::{ClassifyError, CommandInvocation, Interaction, InteractionResponse, classify},
    lifecycle::Lifecycle,
    signature::SignatureVerifier,
    supervisor::{LaunchError, StartSupervisor},
};

#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    verifier: SignatureVerifier,
    lifecycle: Arc<Lifecycle>,
    supervisor: StartSupervisor,
    control_plane_issue: Option<String>,
    started_at: DateTime<Utc>,
}

impl AppState {
    #[must_use]
    pub fn new(
        config: Config,
        verifier: SignatureVerifier,
        lifecycle: Arc<Lifecycle>,
        supervisor: StartSupervisor,
    ) -> Self {
        Self {
            config: Arc::new(config),
            verifier,
            lifecycle,
            supervisor,
            control_plane_issue: None,
            started_at: Utc::now(),
        }
    }

    /// Marks the control plane as misconfigured; `/readyz` reports the reason.
    #[must_use]
    pub fn with_control_plane_issue(mut self, issue: Option<String>) -> Self {
        self.control_plane_issue = issue;
        self
    }

    #[must_use]
    pub fn supervisor(&self) -> &StartSupervisor {
        &self.supervisor
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: String,
    build_sha: String,
    uptime_seconds: i64,
    control_plane: &'static str,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

pub fn build_router(state: AppState) -> Router {
    let interactions_path = state.config.interactions_path.clone();
    Router::new()
        .route("/healthz", get(health))
        .route("/readyz", get(readiness))
        .route(&interactions_path, post(interactions))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: state.config.service_name.clone(),
        build_sha: state.config.build_sha.clone(),
        uptime_seconds: (Utc::now() - state.started_at).num_seconds(),
        control_plane: state.config.control_plane.as_str(),
    })
}

async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    let (status, body) = match &state.control_plane_issue {
        None => (
            StatusCode::OK,
            ReadinessResponse {
                status: "ready",
                reason: None,
            },
        ),
        Some(issue) => (
            StatusCode::SERVICE_UNAVAILABLE,
            ReadinessResponse {
                status: "not_ready",
                reason: Some(issue.clone()),
            },
        ),
    };
    (status, Json(body))
}

async fn interactions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<InteractionResponse, ApiError> {
    let interaction = classify(&body).map_err(ApiError::InvalidPayload)?;
    let verified = state.verifier.verify(&headers, &body).await;

    if interaction.is_ping() {
        if let Err(error) = &verified {
            tracing::info!(reason = %error, "answering ping without a valid signature");
        }
        return Ok(InteractionResponse::Pong);
    }
    if let Err(error) = verified {
        tracing::warn!(
            kind = interaction.kind_label(),
            reason = %error,
            "rejected interaction with invalid signature"
        );
        return Err(ApiError::Unauthorized);
    }

    match interaction {
        Interaction::Ping => Ok(InteractionResponse::Pong),
        Interaction::Command(command) => Ok(dispatch_command(&state, command).await),
        Interaction::Other { kind } => Ok(InteractionResponse::ephemeral(match kind {
            Some(kind) => format!("Unsupported interaction type: {kind}"),
            None => "Unsupported interaction type".to_string(),
        })),
    }
}

async fn dispatch_command(state: &AppState, command: CommandInvocation) -> InteractionResponse {
    let subcommand = match route(&state.config.command_name, &command) {
        Ok(subcommand) => subcommand,
        Err(rejection) => {
            tracing::info!(command = %command.name, ?rejection, "command rejected");
            return InteractionResponse::ephemeral(rejection.message());
        }
    };
    tracing::info!(
        subcommand = subcommand.as_str(),
        application_id = command.followup.as_ref().map(|target| target.application_id.as_str()),
        "dispatching command"
    );

    match subcommand {
        Subcommand::Start => launch_start(state, command).await,
        Subcommand::Stop => {
            let report = state.lifecycle.stop().await;
            if report.ok {
                InteractionResponse::message(report.message)
            } else {
                InteractionResponse::ephemeral(report.message)
            }
        }
        Subcommand::Status => {
            InteractionResponse::message(state.lifecycle.status(Utc::now()).await.render())
        }
    }
}

async fn launch_start(state: &AppState, command: CommandInvocation) -> InteractionResponse {
    let Some(followup) = command.followup else {
        tracing::warn!("start requested without a followup token");
        return InteractionResponse::ephemeral(
            "Cannot start the server from this request: it carries no interaction token for the progress messages.",
        );
    };
    let lifecycle = state.lifecycle.clone();
    let resource = lifecycle.resource_name().to_string();
    let launched = state
        .supervisor
        .launch(&resource, async move { lifecycle.run_start(followup).await })
        .await;

    match launched {
        Ok(task_id) => {
            tracing::info!(resource = %resource, task_id, "start deferred to background task");
            InteractionResponse::Deferred
        }
        Err(LaunchError::AlreadyInFlight(_)) => InteractionResponse::ephemeral(format!(
            "A start is already in progress. You will get a message when it finishes, or run `/{} status`.",
            state.config.command_name
        )),
        Err(LaunchError::ShuttingDown) => InteractionResponse::ephemeral(
            "The gateway is restarting. Try again in a minute.",
        ),
    }
}

#[derive(Debug)]
enum ApiError {
    InvalidPayload(ClassifyError),
    Unauthorized,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::InvalidPayload(error) => (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": "invalid_request",
                    "message": error.to_string(),
                })),
            )
                .into_response(),
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Json(json!({
                    "error": "unauthorized",
                    "message": "invalid request signature",
                })),
            )
                .into_response(),
        }
    }
}

fn panic_response(payload: Box<dyn Any + Send + 'static>) -> Response {
    let detail = payload
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| payload.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    tracing::error!(panic = %detail, "request handler panicked");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "error": "internal_error",
            "message": "internal server error",
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests;
