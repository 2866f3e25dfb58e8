//! Process-local lifecycle hints keyed by resource name.
//!
//! The control plane stays authoritative. Entries here only carry what the
//! control plane cannot tell us, i.e. the deadline this process promised the
//! caller, and are lost on restart.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Stopped,
    Starting,
    Running,
    Failed,
}

impl Phase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "STOPPED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceStatus {
    pub phase: Phase,
    pub started_at: Option<DateTime<Utc>>,
    pub auto_shutdown_at: Option<DateTime<Utc>>,
}

impl ResourceStatus {
    #[must_use]
    pub fn starting(now: DateTime<Utc>, timeout: Duration) -> Self {
        Self {
            phase: Phase::Starting,
            started_at: Some(now),
            auto_shutdown_at: Some(now + timeout),
        }
    }

    #[must_use]
    pub fn running(started_at: DateTime<Utc>, timeout: Duration) -> Self {
        Self {
            phase: Phase::Running,
            started_at: Some(started_at),
            auto_shutdown_at: Some(started_at + timeout),
        }
    }

    #[must_use]
    pub fn stopped() -> Self {
        Self {
            phase: Phase::Stopped,
            started_at: None,
            auto_shutdown_at: None,
        }
    }

    #[must_use]
    pub fn failed() -> Self {
        Self {
            phase: Phase::Failed,
            started_at: None,
            auto_shutdown_at: None,
        }
    }

    /// Time left until the auto-shutdown deadline, clamped at zero.
    #[must_use]
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.auto_shutdown_at
            .map(|deadline| (deadline - now).max(Duration::zero()))
    }
}

#[derive(Debug, Default)]
pub struct StatusStore {
    entries: RwLock<HashMap<String, ResourceStatus>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl StatusStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub async fn get(&self, resource: &str) -> Option<ResourceStatus> {
        self.entries.read().await.get(resource).cloned()
    }

    pub async fn set(&self, resource: &str, status: ResourceStatus) {
        tracing::debug!(resource, phase = status.phase.as_str(), "status cache updated");
        self.entries
            .write()
            .await
            .insert(resource.to_string(), status);
    }

    /// Serializes control-plane mutations for one resource name. Hold the guard
    /// across the read-then-create or read-then-delete sequence.
    pub async fn lock(&self, resource: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(resource.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}
