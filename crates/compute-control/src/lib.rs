#![forbid(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

//! Compute control plane seam for the on-demand game server.
//!
//! The gateway only ever talks to a [`ComputeControlPlane`]: create-or-replace a
//! named instance, inspect it, delete it. Backends live in [`memory`] (scripted,
//! used by tests and local runs) and [`azure`] (Azure Container Instances).

use async_trait::async_trait;

pub mod azure;
pub mod memory;
mod types;

pub use memory::{CreateBehavior, InMemoryControlPlane};
pub use types::{
    EnvVar, InstanceDescriptor, InstanceSpec, InstanceState, PortProtocol, PortSpec, VolumeMount,
};

#[derive(Debug, thiserror::Error)]
pub enum ControlPlaneError {
    #[error("instance not found: {0}")]
    NotFound(String),
    #[error("control plane request failed: {0}")]
    Request(String),
    #[error("control plane returned http {status}: {body}")]
    Http { status: u16, body: String },
    #[error("control plane response decode failed: {0}")]
    Decode(String),
    #[error("control plane credential unavailable: {0}")]
    Credential(String),
    #[error("invalid control plane config: {0}")]
    InvalidConfig(String),
}

impl ControlPlaneError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Request(_) => "request_failed",
            Self::Http { .. } => "http_error",
            Self::Decode(_) => "decode_failed",
            Self::Credential(_) => "credential_unavailable",
            Self::InvalidConfig(_) => "invalid_config",
        }
    }

    /// Errors worth retrying on the next tick rather than surfacing as a setup problem.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NotFound(_) | Self::Request(_) => true,
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            Self::Decode(_) | Self::Credential(_) | Self::InvalidConfig(_) => false,
        }
    }
}

/// How long a delete call should block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
    /// Return as soon as the control plane accepted the delete.
    NoWait,
    /// Block until the instance is gone (bounded by the backend).
    WaitForCompletion,
}

#[async_trait]
pub trait ComputeControlPlane: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Creates the instance, replacing any definition stored under the same name.
    /// Returns the control plane's identifier for the instance.
    async fn create_or_replace(
        &self,
        name: &str,
        spec: &InstanceSpec,
    ) -> Result<String, ControlPlaneError>;

    /// `Ok(None)` when no instance exists under `name`.
    async fn get(&self, name: &str) -> Result<Option<InstanceDescriptor>, ControlPlaneError>;

    /// Deleting an absent instance is not an error.
    async fn delete(&self, name: &str, wait: WaitPolicy) -> Result<(), ControlPlaneError>;
}

/// Stand-in used when the configured backend cannot be built; every call reports
/// the missing setting instead of crashing the process.
#[derive(Debug)]
pub struct UnavailableControlPlane {
    backend: &'static str,
    reason: String,
}

impl UnavailableControlPlane {
    pub fn new(backend: &'static str, reason: impl Into<String>) -> Self {
        Self {
            backend,
            reason: reason.into(),
        }
    }

    fn error(&self) -> ControlPlaneError {
        ControlPlaneError::InvalidConfig(self.reason.clone())
    }
}

#[async_trait]
impl ComputeControlPlane for UnavailableControlPlane {
    fn backend(&self) -> &'static str {
        self.backend
    }

    async fn create_or_replace(
        &self,
        _name: &str,
        _spec: &InstanceSpec,
    ) -> Result<String, ControlPlaneError> {
        Err(self.error())
    }

    async fn get(&self, _name: &str) -> Result<Option<InstanceDescriptor>, ControlPlaneError> {
        Err(self.error())
    }

    async fn delete(&self, _name: &str, _wait: WaitPolicy) -> Result<(), ControlPlaneError> {
        Err(self.error())
    }
}
