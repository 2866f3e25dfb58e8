#![forbid(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use valheim_compute_control::{
    ComputeControlPlane, InMemoryControlPlane, UnavailableControlPlane,
    azure::{
        AzureContainerConfig, AzureContainerInstances, ManagedIdentityCredential, StaticToken,
        TokenSource,
    },
};

use crate::{
    config::{Config, ControlPlaneBackend, SecretsBackend},
    lifecycle::{Lifecycle, LifecycleSettings},
    notify::{FollowupNotifier, WebhookNotifier},
    secrets::{EnvSecretProvider, KeyVaultSecretProvider, SecretCache, SecretProvider},
    server::{AppState, build_router},
    signature::SignatureVerifier,
    status::StatusStore,
    supervisor::StartSupervisor,
    sweeper::{SweepOutcome, Sweeper},
};

pub mod config;
pub mod dispatch;
pub mod interaction;
pub mod lifecycle;
pub mod notify;
pub mod poll;
pub mod secrets;
pub mod server;
pub mod signature;
pub mod status;
pub mod supervisor;
pub mod sweeper;

/// Shared services behind the router and the sweeper.
pub struct Gateway {
    pub state: AppState,
    pub sweeper: Arc<Sweeper>,
}

/// Wires a gateway from already-built backends.
pub fn assemble_gateway(
    config: Config,
    control_plane: Arc<dyn ComputeControlPlane>,
    secret_provider: Arc<dyn SecretProvider>,
    notifier: Arc<dyn FollowupNotifier>,
) -> Gateway {
    let store = StatusStore::shared();
    let secrets = Arc::new(SecretCache::new(secret_provider));
    let settings = LifecycleSettings::from_config(&config);
    let sweeper = Arc::new(Sweeper::new(
        control_plane.clone(),
        store.clone(),
        settings.resource_name.clone(),
        settings.auto_shutdown,
    ));
    let lifecycle = Arc::new(Lifecycle::new(
        control_plane,
        store,
        secrets.clone(),
        notifier,
        settings,
    ));
    let verifier = SignatureVerifier::new(
        secrets,
        config.public_key_secret.clone(),
        config.allow_unverified_requests,
    );
    let supervisor = StartSupervisor::new(config.start_task_max_lifetime);
    Gateway {
        state: AppState::new(config, verifier, lifecycle, supervisor),
        sweeper,
    }
}

pub fn build_gateway(config: Config) -> Gateway {
    let tokens = build_token_source(&config);
    let (control_plane, issue) = build_control_plane(&config, tokens.clone());
    let secret_provider = build_secret_provider(&config, tokens);
    let notifier: Arc<dyn FollowupNotifier> = Arc::new(WebhookNotifier::new(
        config.followup_base_url.clone(),
        config.followup_timeout_ms,
    ));
    info!(
        control_plane = control_plane.backend(),
        secrets = secret_provider.backend(),
        resource = %config.resource_name,
        "gateway backends configured"
    );
    let mut gateway = assemble_gateway(config, control_plane, secret_provider, notifier);
    gateway.state = gateway.state.with_control_plane_issue(issue);
    gateway
}

fn build_token_source(config: &Config) -> Arc<dyn TokenSource> {
    match config.azure.access_token.as_deref() {
        Some(token) => Arc::new(StaticToken::new(token)),
        None => Arc::new(ManagedIdentityCredential::from_env()),
    }
}

fn build_control_plane(
    config: &Config,
    tokens: Arc<dyn TokenSource>,
) -> (Arc<dyn ComputeControlPlane>, Option<String>) {
    match config.control_plane {
        ControlPlaneBackend::Memory => {
            warn!("memory control plane selected: no real compute is started");
            let plane: Arc<dyn ComputeControlPlane> = Arc::new(InMemoryControlPlane::new());
            (plane, None)
        }
        ControlPlaneBackend::Azure => {
            let azure = AzureContainerConfig::new(
                config.azure.subscription_id.clone().unwrap_or_default(),
                config.azure.resource_group.clone().unwrap_or_default(),
                config.azure.location.clone().unwrap_or_default(),
            );
            match AzureContainerInstances::new(azure, tokens) {
                Ok(plane) => {
                    let plane: Arc<dyn ComputeControlPlane> = Arc::new(plane);
                    (plane, None)
                }
                Err(error) => {
                    warn!(reason = %error, "azure control plane unavailable; commands will report it");
                    let reason = error.to_string();
                    let plane: Arc<dyn ComputeControlPlane> =
                        Arc::new(UnavailableControlPlane::new("azure", reason.clone()));
                    (plane, Some(reason))
                }
            }
        }
    }
}

fn build_secret_provider(config: &Config, tokens: Arc<dyn TokenSource>) -> Arc<dyn SecretProvider> {
    match &config.secrets_backend {
        SecretsBackend::Env => Arc::new(EnvSecretProvider),
        SecretsBackend::KeyVault { vault_url } => {
            Arc::new(KeyVaultSecretProvider::new(vault_url.clone(), tokens))
        }
    }
}

pub async fn serve(config: Config) -> Result<()> {
    let listener = TcpListener::bind(config.bind_addr).await?;
    info!(
        service = %config.service_name,
        bind_addr = %config.bind_addr,
        interactions_path = %config.interactions_path,
        "gateway listening"
    );
    let sweep_enabled = config.sweep_enabled;
    let sweep_interval = config.sweep_interval;
    let shutdown_grace = config.shutdown_grace;
    let gateway = build_gateway(config);
    let supervisor = gateway.state.supervisor().clone();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = if sweep_enabled {
        Some(gateway.sweeper.clone().spawn(sweep_interval, shutdown_rx))
    } else {
        info!("auto-shutdown sweeper disabled");
        None
    };

    axum::serve(listener, build_router(gateway.state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    if let Some(sweeper) = sweeper {
        if let Err(error) = sweeper.await {
            warn!(reason = %error, "sweeper task ended abnormally");
        }
    }
    let aborted = supervisor.drain(shutdown_grace).await;
    info!(aborted_start_tasks = aborted, "gateway stopped");
    Ok(())
}

/// One sweep against the configured backends, for external schedulers.
pub async fn run_sweep_once(config: Config) -> Result<SweepOutcome> {
    let gateway = build_gateway(config);
    let outcome = gateway.sweeper.sweep_once(chrono::Utc::now()).await;
    info!(outcome = outcome.label(), ?outcome, "sweep complete");
    Ok(outcome)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(reason = %error, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!(reason = %error, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received ctrl-c"),
        () = terminate => info!("received SIGTERM"),
    }
}
