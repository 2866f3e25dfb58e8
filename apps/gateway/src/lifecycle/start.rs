use chrono::{DateTime, Utc};
use valheim_compute_control::{InstanceDescriptor, InstanceState, WaitPolicy};

use super::{Lifecycle, StartError};
use crate::interaction::FollowupTarget;
use crate::poll::{PollOutcome, poll_until};
use crate::status::ResourceStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    AlreadyRunning {
        address: Option<String>,
    },
    Ready {
        address: Option<String>,
        auto_shutdown_at: DateTime<Utc>,
    },
    Failed {
        reason: String,
    },
    TimedOut {
        waited_seconds: u64,
    },
}

impl StartOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::AlreadyRunning { .. } | Self::Ready { .. })
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::AlreadyRunning { .. } => "already_running",
            Self::Ready { .. } => "ready",
            Self::Failed { .. } => "failed",
            Self::TimedOut { .. } => "timed_out",
        }
    }

    /// Follow-up text for the caller.
    #[must_use]
    pub fn message(&self, command_name: &str) -> String {
        match self {
            Self::AlreadyRunning { address: Some(address) } => {
                format!("The Valheim server is already running. Connect to `{address}`.")
            }
            Self::AlreadyRunning { address: None } => {
                "The Valheim server is already running.".to_string()
            }
            Self::Ready {
                address,
                auto_shutdown_at,
            } => {
                let shutdown = auto_shutdown_at.format("%H:%M UTC");
                match address {
                    Some(address) => format!(
                        "The Valheim server is ready! Connect to `{address}`. It shuts down automatically at {shutdown}."
                    ),
                    None => format!(
                        "The Valheim server is ready, but no public address was reported yet. Run `/{command_name} status` for details. It shuts down automatically at {shutdown}."
                    ),
                }
            }
            Self::Failed { reason } => format!("Failed to start the Valheim server: {reason}"),
            Self::TimedOut { waited_seconds } => format!(
                "The Valheim server is still starting after {} minutes. Check `/{command_name} status` again in a few minutes.",
                waited_seconds.div_ceil(60)
            ),
        }
    }
}

enum Settled {
    Running(InstanceDescriptor),
    Ended(Option<InstanceState>),
}

impl Lifecycle {
    /// Background half of `start`: notifies, starts, waits, notifies again.
    /// Never fails; every error ends up in the returned outcome and the final
    /// follow-up.
    pub async fn run_start(&self, target: FollowupTarget) -> StartOutcome {
        let resource = self.settings.resource_name.as_str();
        self.notify(
            &target,
            "Starting the Valheim server. This usually takes a few minutes.",
        )
        .await;

        let outcome = match self.start_and_wait().await {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::error!(resource, reason = %error, "start failed");
                StartOutcome::Failed {
                    reason: error.to_string(),
                }
            }
        };
        tracing::info!(resource, outcome = outcome.label(), "start finished");

        self.notify(&target, &outcome.message(&self.settings.command_name))
            .await;
        outcome
    }

    pub async fn start_and_wait(&self) -> Result<StartOutcome, StartError> {
        let resource = self.settings.resource_name.as_str();
        {
            let _guard = self.store.lock(resource).await;
            let current = self.control_plane.get(resource).await?;
            match current {
                Some(descriptor) if descriptor.state == InstanceState::Running => {
                    let started_at = descriptor.started_at.unwrap_or_else(Utc::now);
                    self.store
                        .set(
                            resource,
                            ResourceStatus::running(started_at, self.settings.auto_shutdown),
                        )
                        .await;
                    tracing::info!(resource, "instance already running; nothing to create");
                    return Ok(StartOutcome::AlreadyRunning {
                        address: descriptor.connect_address(self.primary_port()),
                    });
                }
                Some(descriptor) if descriptor.state.is_in_progress() => {
                    tracing::info!(
                        resource,
                        state = %descriptor.state,
                        "instance already starting; waiting for it"
                    );
                }
                Some(descriptor) => {
                    tracing::info!(
                        resource,
                        state = %descriptor.state,
                        "removing stale instance before recreating"
                    );
                    if let Err(error) = self.control_plane.delete(resource, WaitPolicy::NoWait).await
                    {
                        tracing::warn!(resource, reason = %error, "stale instance delete failed");
                    }
                    self.create(resource).await?;
                }
                None => self.create(resource).await?,
            }
        }
        self.wait_until_settled(resource).await
    }

    async fn create(&self, resource: &str) -> Result<(), StartError> {
        let spec = self.instance_spec().await?;
        let instance_id = self.control_plane.create_or_replace(resource, &spec).await?;
        self.store
            .set(
                resource,
                ResourceStatus::starting(Utc::now(), self.settings.auto_shutdown),
            )
            .await;
        tracing::info!(resource, instance_id = %instance_id, "instance create accepted");
        Ok(())
    }

    async fn wait_until_settled(&self, resource: &str) -> Result<StartOutcome, StartError> {
        let control_plane = self.control_plane.as_ref();
        let polled = poll_until(
            self.settings.poll_interval,
            self.settings.poll_budget,
            move || async move {
                let settled = match control_plane.get(resource).await? {
                    Some(descriptor) if descriptor.state == InstanceState::Running => {
                        Some(Settled::Running(descriptor))
                    }
                    Some(descriptor)
                        if descriptor.state.is_stopped()
                            || descriptor.state == InstanceState::Failed =>
                    {
                        Some(Settled::Ended(Some(descriptor.state)))
                    }
                    Some(_) => None,
                    None => Some(Settled::Ended(None)),
                };
                Ok::<_, StartError>(settled)
            },
        )
        .await?;

        match polled {
            PollOutcome::Ready(Settled::Running(descriptor)) => {
                let status = ResourceStatus::running(Utc::now(), self.settings.auto_shutdown);
                let auto_shutdown_at = status.auto_shutdown_at.unwrap_or_else(Utc::now);
                self.store.set(resource, status).await;
                Ok(StartOutcome::Ready {
                    address: descriptor.connect_address(self.primary_port()),
                    auto_shutdown_at,
                })
            }
            PollOutcome::Ready(Settled::Ended(state)) => {
                self.store.set(resource, ResourceStatus::failed()).await;
                let reason = match state {
                    Some(state) => format!("the instance reported {state} while starting"),
                    None => "the instance disappeared while starting".to_string(),
                };
                Ok(StartOutcome::Failed { reason })
            }
            PollOutcome::TimedOut { attempts } => {
                tracing::warn!(resource, attempts, "instance not running within the poll budget");
                Ok(StartOutcome::TimedOut {
                    waited_seconds: self.settings.poll_budget.as_secs(),
                })
            }
        }
    }
}
