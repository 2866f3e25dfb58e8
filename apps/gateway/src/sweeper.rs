//! Auto-shutdown reconciliation.
//!
//! Each sweep compares the control plane's own start time against the running
//! budget. The in-process cache is never consulted for the decision because it
//! is empty after a restart.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use valheim_compute_control::{ComputeControlPlane, InstanceState, WaitPolicy};

use crate::status::{ResourceStatus, StatusStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepOutcome {
    NotRunning,
    WithinBudget { remaining: chrono::Duration },
    Deleted { running_for: chrono::Duration },
    Skipped { reason: String },
}

impl SweepOutcome {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::NotRunning => "not_running",
            Self::WithinBudget { .. } => "within_budget",
            Self::Deleted { .. } => "deleted",
            Self::Skipped { .. } => "skipped",
        }
    }
}

pub struct Sweeper {
    control_plane: Arc<dyn ComputeControlPlane>,
    store: Arc<StatusStore>,
    resource_name: String,
    budget: chrono::Duration,
}

impl Sweeper {
    pub fn new(
        control_plane: Arc<dyn ComputeControlPlane>,
        store: Arc<StatusStore>,
        resource_name: impl Into<String>,
        budget: chrono::Duration,
    ) -> Self {
        Self {
            control_plane,
            store,
            resource_name: resource_name.into(),
            budget,
        }
    }

    pub async fn sweep_once(&self, now: DateTime<Utc>) -> SweepOutcome {
        let resource = self.resource_name.as_str();
        let _guard = self.store.lock(resource).await;

        let descriptor = match self.control_plane.get(resource).await {
            Ok(Some(descriptor)) => descriptor,
            Ok(None) => return SweepOutcome::NotRunning,
            Err(error) => {
                tracing::warn!(
                    resource,
                    reason = %error,
                    code = error.code(),
                    transient = error.is_transient(),
                    "sweep could not read instance state; skipping tick"
                );
                return SweepOutcome::Skipped {
                    reason: error.to_string(),
                };
            }
        };
        if descriptor.state != InstanceState::Running {
            return SweepOutcome::NotRunning;
        }
        let Some(started_at) = descriptor.started_at else {
            tracing::warn!(resource, "running instance reports no start time; skipping tick");
            return SweepOutcome::Skipped {
                reason: "no start time reported".to_string(),
            };
        };

        let deadline = started_at + self.budget;
        if now < deadline {
            return SweepOutcome::WithinBudget {
                remaining: deadline - now,
            };
        }

        let running_for = now - started_at;
        if let Err(error) = self.control_plane.delete(resource, WaitPolicy::NoWait).await {
            tracing::warn!(resource, reason = %error, "auto-shutdown delete failed; retrying next tick");
            return SweepOutcome::Skipped {
                reason: error.to_string(),
            };
        }
        self.store.set(resource, ResourceStatus::stopped()).await;
        tracing::info!(
            resource,
            running_minutes = running_for.num_minutes(),
            "auto-shutdown deleted instance"
        );
        SweepOutcome::Deleted { running_for }
    }

    /// Sweeps every `interval` until `shutdown` flips to true. The first sweep
    /// runs immediately.
    pub fn spawn(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(
                resource = %self.resource_name,
                interval_secs = interval.as_secs(),
                "auto-shutdown sweeper started"
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let outcome = self.sweep_once(Utc::now()).await;
                        tracing::debug!(resource = %self.resource_name, outcome = outcome.label(), "sweep finished");
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!(resource = %self.resource_name, "auto-shutdown sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use valheim_compute_control::{InMemoryControlPlane, InstanceDescriptor};

    use super::*;
    use crate::status::Phase;

    const RESOURCE: &str = "valheim-server";

    fn sweeper(plane: Arc<InMemoryControlPlane>, store: Arc<StatusStore>) -> Sweeper {
        Sweeper::new(plane, store, RESOURCE, chrono::Duration::minutes(120))
    }

    async fn running_since(plane: &InMemoryControlPlane, started_at: DateTime<Utc>) {
        let mut descriptor = InstanceDescriptor::new(RESOURCE, InstanceState::Running);
        descriptor.started_at = Some(started_at);
        plane.insert(descriptor).await;
    }

    #[tokio::test]
    async fn never_deletes_below_the_budget() {
        let plane = Arc::new(InMemoryControlPlane::new());
        let now = Utc::now();
        running_since(&plane, now - chrono::Duration::minutes(119)).await;
        let sweeper = sweeper(plane.clone(), StatusStore::shared());

        let outcome = sweeper.sweep_once(now).await;

        assert_eq!(
            outcome,
            SweepOutcome::WithinBudget {
                remaining: chrono::Duration::minutes(1)
            }
        );
        assert_eq!(plane.delete_calls().await, 0);
    }

    #[tokio::test]
    async fn deletes_at_the_budget_and_marks_stopped() {
        let plane = Arc::new(InMemoryControlPlane::new());
        let store = StatusStore::shared();
        let now = Utc::now();
        running_since(&plane, now - chrono::Duration::minutes(120)).await;
        store
            .set(
                RESOURCE,
                ResourceStatus::running(now - chrono::Duration::minutes(120), chrono::Duration::minutes(120)),
            )
            .await;
        let sweeper = sweeper(plane.clone(), store.clone());

        let outcome = sweeper.sweep_once(now).await;

        assert_eq!(
            outcome,
            SweepOutcome::Deleted {
                running_for: chrono::Duration::minutes(120)
            }
        );
        assert_eq!(plane.delete_calls().await, 1);
        assert_eq!(
            store.get(RESOURCE).await.map(|status| status.phase),
            Some(Phase::Stopped)
        );
    }

    #[tokio::test]
    async fn uses_control_plane_start_time_not_cache() {
        let plane = Arc::new(InMemoryControlPlane::new());
        let store = StatusStore::shared();
        let now = Utc::now();
        running_since(&plane, now - chrono::Duration::minutes(300)).await;
        // a fresh cache entry must not extend the instance's life
        store
            .set(RESOURCE, ResourceStatus::running(now, chrono::Duration::minutes(120)))
            .await;

        let outcome = sweeper(plane.clone(), store).sweep_once(now).await;

        assert!(matches!(outcome, SweepOutcome::Deleted { .. }));
    }

    #[tokio::test]
    async fn non_running_missing_and_failing_instances_are_no_ops() {
        let plane = Arc::new(InMemoryControlPlane::new());
        let sweeper = sweeper(plane.clone(), StatusStore::shared());
        let now = Utc::now();

        assert_eq!(sweeper.sweep_once(now).await, SweepOutcome::NotRunning);

        plane
            .insert(InstanceDescriptor::new(RESOURCE, InstanceState::Stopped))
            .await;
        assert_eq!(sweeper.sweep_once(now).await, SweepOutcome::NotRunning);

        plane
            .insert(InstanceDescriptor::new(RESOURCE, InstanceState::Running))
            .await;
        assert!(matches!(
            sweeper.sweep_once(now).await,
            SweepOutcome::Skipped { .. }
        ));

        plane.fail_next_gets(1).await;
        assert!(matches!(
            sweeper.sweep_once(now).await,
            SweepOutcome::Skipped { .. }
        ));
        assert_eq!(plane.delete_calls().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_loop_sweeps_until_shutdown() {
        let plane = Arc::new(InMemoryControlPlane::new());
        let sweeper = Arc::new(sweeper(plane.clone(), StatusStore::shared()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = sweeper.spawn(Duration::from_secs(300), shutdown_rx);
        tokio::time::sleep(Duration::from_secs(650)).await;
        let _ = shutdown_tx.send(true);
        handle.await.expect("sweeper exits");

        // ticks at 0, 300 and 600 seconds
        assert_eq!(plane.get_calls().await, 3);
    }
}
