//! Start, stop and status handlers over the compute control plane.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use valheim_compute_control::{
    ComputeControlPlane, ControlPlaneError, EnvVar, InstanceSpec, PortSpec, VolumeMount,
};

use crate::config::{Config, InstanceTemplate};
use crate::interaction::FollowupTarget;
use crate::notify::FollowupNotifier;
use crate::secrets::{SecretCache, SecretError};
use crate::status::StatusStore;

mod start;
mod status;
mod stop;

pub use start::StartOutcome;
pub use status::StatusReport;
pub use stop::StopReport;

#[derive(Debug, Error)]
pub enum StartError {
    #[error("{setting} is not configured: {reason}")]
    Configuration { setting: String, reason: String },
    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),
}

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub resource_name: String,
    pub command_name: String,
    pub auto_shutdown: chrono::Duration,
    pub poll_interval: Duration,
    pub poll_budget: Duration,
    pub server_password_secret: String,
    pub storage_key_secret: String,
    pub instance: InstanceTemplate,
}

impl LifecycleSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            resource_name: config.resource_name.clone(),
            command_name: config.command_name.clone(),
            auto_shutdown: chrono::Duration::minutes(config.auto_shutdown_minutes),
            poll_interval: config.start_poll_interval,
            poll_budget: config.start_poll_budget,
            server_password_secret: config.server_password_secret.clone(),
            storage_key_secret: config.storage_key_secret.clone(),
            instance: config.instance.clone(),
        }
    }
}

pub struct Lifecycle {
    control_plane: Arc<dyn ComputeControlPlane>,
    store: Arc<StatusStore>,
    secrets: Arc<SecretCache>,
    notifier: Arc<dyn FollowupNotifier>,
    settings: LifecycleSettings,
}

impl Lifecycle {
    pub fn new(
        control_plane: Arc<dyn ComputeControlPlane>,
        store: Arc<StatusStore>,
        secrets: Arc<SecretCache>,
        notifier: Arc<dyn FollowupNotifier>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            control_plane,
            store,
            secrets,
            notifier,
            settings,
        }
    }

    #[must_use]
    pub fn resource_name(&self) -> &str {
        &self.settings.resource_name
    }

    fn primary_port(&self) -> u16 {
        self.settings
            .instance
            .ports
            .first()
            .copied()
            .unwrap_or(2456)
    }

    async fn required_secret(&self, name: &str) -> Result<String, StartError> {
        self.secrets.get(name).await.map_err(|error| match error {
            SecretError::NotFound(setting) => StartError::Configuration {
                setting,
                reason: "secret is missing".to_string(),
            },
            SecretError::Unavailable(reason) => StartError::Configuration {
                setting: name.to_string(),
                reason,
            },
        })
    }

    /// Builds the container definition, reading the secrets it needs.
    pub async fn instance_spec(&self) -> Result<InstanceSpec, StartError> {
        let template = &self.settings.instance;
        let password = self
            .required_secret(&self.settings.server_password_secret)
            .await?;

        let volume = match template.storage_account.as_deref() {
            Some(account) => Some(VolumeMount {
                name: "valheim-data".to_string(),
                mount_path: template.mount_path.clone(),
                share_name: template.storage_share.clone(),
                storage_account_name: account.to_string(),
                storage_account_key: self
                    .required_secret(&self.settings.storage_key_secret)
                    .await?,
            }),
            None => None,
        };

        Ok(InstanceSpec {
            image: template.image.clone(),
            cpu_cores: template.cpu_cores,
            memory_gb: template.memory_gb,
            environment: vec![
                EnvVar::plain("SERVER_NAME", template.server_name.clone()),
                EnvVar::plain("WORLD_NAME", template.world_name.clone()),
                EnvVar::plain("SERVER_PUBLIC", "true"),
                EnvVar::secure("SERVER_PASS", password),
            ],
            ports: template.ports.iter().copied().map(PortSpec::udp).collect(),
            volume,
            dns_name_label: template.dns_name_label.clone(),
        })
    }

    async fn notify(&self, target: &FollowupTarget, content: &str) {
        if let Err(error) = self.notifier.send(target, content).await {
            tracing::warn!(
                resource = %self.settings.resource_name,
                reason = %error,
                "followup delivery failed; message dropped"
            );
        }
    }
}
