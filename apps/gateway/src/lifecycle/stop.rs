use std::time::Duration;

use valheim_compute_control::WaitPolicy;

use super::Lifecycle;
use crate::status::ResourceStatus;

/// How long `stop` waits for a concurrent start to release the resource.
const LOCK_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReport {
    pub ok: bool,
    pub message: String,
}

impl StopReport {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

impl Lifecycle {
    /// Requests deletion without waiting for it to finish.
    pub async fn stop(&self) -> StopReport {
        let resource = self.settings.resource_name.as_str();
        let Ok(_guard) = tokio::time::timeout(LOCK_WAIT, self.store.lock(resource)).await else {
            tracing::info!(resource, "stop gave up waiting for an in-progress start");
            return StopReport::failed(format!(
                "A start is in progress; try `/{} stop` again shortly.",
                self.settings.command_name
            ));
        };

        let current = match self.control_plane.get(resource).await {
            Ok(current) => current,
            Err(error) => {
                tracing::warn!(resource, reason = %error, "stop could not read instance state");
                return StopReport::failed(format!(
                    "Could not check the Valheim server before stopping it: {error}"
                ));
            }
        };

        match current {
            None => {
                self.store.set(resource, ResourceStatus::stopped()).await;
                StopReport::ok("The Valheim server is not running.")
            }
            Some(descriptor) if descriptor.state.is_stopped() => {
                self.store.set(resource, ResourceStatus::stopped()).await;
                StopReport::ok("The Valheim server is already stopped.")
            }
            Some(descriptor) => {
                if let Err(error) = self.control_plane.delete(resource, WaitPolicy::NoWait).await {
                    tracing::warn!(resource, reason = %error, "stop delete failed");
                    return StopReport::failed(format!(
                        "Failed to stop the Valheim server: {error}"
                    ));
                }
                self.store.set(resource, ResourceStatus::stopped()).await;
                tracing::info!(resource, previous_state = %descriptor.state, "instance delete requested");
                StopReport::ok("Stopping the Valheim server. The world is saved to persistent storage.")
            }
        }
    }
}
