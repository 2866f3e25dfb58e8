//! Supervision of background start tasks.
//!
//! One task per resource name at a time. Each task runs under a lifetime bound
//! and its end (completion, panic, abort) is recorded so callers and tests can
//! observe it. On shutdown in-flight tasks get a grace period, then are aborted.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::task::AbortHandle;

use crate::lifecycle::StartOutcome;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed(StartOutcome),
    Panicked(String),
    /// Aborted at the lifetime bound or during shutdown.
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    pub task_id: u64,
    pub resource: String,
    pub outcome: TaskOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LaunchError {
    #[error("a start for {0} is already in progress")]
    AlreadyInFlight(String),
    #[error("the gateway is shutting down")]
    ShuttingDown,
}

struct InFlight {
    task_id: u64,
    abort: AbortHandle,
}

#[derive(Default)]
struct SupervisorInner {
    next_task_id: u64,
    shutting_down: bool,
    in_flight: HashMap<String, InFlight>,
    last: HashMap<String, TaskRecord>,
}

#[derive(Clone)]
pub struct StartSupervisor {
    max_lifetime: Duration,
    inner: Arc<Mutex<SupervisorInner>>,
    finished: Arc<Notify>,
}

impl StartSupervisor {
    #[must_use]
    pub fn new(max_lifetime: Duration) -> Self {
        Self {
            max_lifetime,
            inner: Arc::new(Mutex::new(SupervisorInner::default())),
            finished: Arc::new(Notify::new()),
        }
    }

    /// Spawns `task` for `resource` unless one is already running for it.
    pub async fn launch<F>(&self, resource: &str, task: F) -> Result<u64, LaunchError>
    where
        F: Future<Output = StartOutcome> + Send + 'static,
    {
        let mut inner = self.inner.lock().await;
        if inner.shutting_down {
            return Err(LaunchError::ShuttingDown);
        }
        if inner.in_flight.contains_key(resource) {
            return Err(LaunchError::AlreadyInFlight(resource.to_string()));
        }
        inner.next_task_id += 1;
        let task_id = inner.next_task_id;
        let started_at = Utc::now();

        let work = tokio::spawn(task);
        let abort = work.abort_handle();
        inner.in_flight.insert(
            resource.to_string(),
            InFlight {
                task_id,
                abort: abort.clone(),
            },
        );
        drop(inner);

        let supervisor = self.clone();
        let resource = resource.to_string();
        let max_lifetime = self.max_lifetime;
        tokio::spawn(async move {
            let outcome = match tokio::time::timeout(max_lifetime, work).await {
                Ok(Ok(outcome)) => TaskOutcome::Completed(outcome),
                Ok(Err(error)) if error.is_panic() => {
                    let message = panic_message(error.into_panic());
                    tracing::error!(resource = %resource, task_id, panic = %message, "start task panicked");
                    TaskOutcome::Panicked(message)
                }
                Ok(Err(_)) => TaskOutcome::Abandoned,
                Err(_) => {
                    abort.abort();
                    tracing::warn!(
                        resource = %resource,
                        task_id,
                        max_lifetime_secs = max_lifetime.as_secs(),
                        "start task exceeded its lifetime and was aborted"
                    );
                    TaskOutcome::Abandoned
                }
            };
            supervisor
                .finish(resource, task_id, started_at, outcome)
                .await;
        });

        tracing::debug!(task_id, "start task launched");
        Ok(task_id)
    }

    async fn finish(
        &self,
        resource: String,
        task_id: u64,
        started_at: DateTime<Utc>,
        outcome: TaskOutcome,
    ) {
        {
            let mut inner = self.inner.lock().await;
            if inner
                .in_flight
                .get(&resource)
                .is_some_and(|entry| entry.task_id == task_id)
            {
                inner.in_flight.remove(&resource);
            }
            inner.last.insert(
                resource.clone(),
                TaskRecord {
                    task_id,
                    resource,
                    outcome,
                    started_at,
                    finished_at: Utc::now(),
                },
            );
        }
        self.finished.notify_waiters();
    }

    pub async fn is_in_flight(&self, resource: &str) -> bool {
        self.inner.lock().await.in_flight.contains_key(resource)
    }

    pub async fn last_record(&self, resource: &str) -> Option<TaskRecord> {
        self.inner.lock().await.last.get(resource).cloned()
    }

    /// Waits for the in-flight task for `resource`, if any, and returns the
    /// latest record.
    pub async fn wait(&self, resource: &str) -> Option<TaskRecord> {
        loop {
            let finished = self.finished.notified();
            {
                let inner = self.inner.lock().await;
                if !inner.in_flight.contains_key(resource) {
                    return inner.last.get(resource).cloned();
                }
            }
            finished.await;
        }
    }

    async fn wait_all(&self) {
        loop {
            let finished = self.finished.notified();
            if self.inner.lock().await.in_flight.is_empty() {
                return;
            }
            finished.await;
        }
    }

    /// Refuses new launches, waits up to `grace` for in-flight tasks, then
    /// aborts the rest. Returns how many were aborted.
    pub async fn drain(&self, grace: Duration) -> usize {
        let pending = {
            let mut inner = self.inner.lock().await;
            inner.shutting_down = true;
            inner.in_flight.len()
        };
        if pending == 0 {
            return 0;
        }
        tracing::info!(pending, grace_secs = grace.as_secs(), "draining start tasks");
        if tokio::time::timeout(grace, self.wait_all()).await.is_ok() {
            return 0;
        }

        let aborted = {
            let inner = self.inner.lock().await;
            for entry in inner.in_flight.values() {
                entry.abort.abort();
            }
            inner.in_flight.len()
        };
        tracing::warn!(aborted, "start tasks aborted at shutdown; their followups are lost");
        let _ = tokio::time::timeout(Duration::from_secs(1), self.wait_all()).await;
        aborted
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "start task panicked".to_string()
}
