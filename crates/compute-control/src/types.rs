use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Unknown,
    Waiting,
    Starting,
    Running,
    Stopped,
    Terminated,
    Failed,
}

impl InstanceState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Waiting => "WAITING",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
            Self::Terminated => "TERMINATED",
            Self::Failed => "FAILED",
        }
    }

    /// Maps the state strings reported by container platforms onto our states.
    #[must_use]
    pub fn from_provider(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "running" => Self::Running,
            "waiting" | "pending" | "creating" | "accepted" => Self::Waiting,
            "starting" | "repairing" => Self::Starting,
            "stopped" | "succeeded" => Self::Stopped,
            "terminated" | "deleting" => Self::Terminated,
            "failed" | "canceled" => Self::Failed,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped | Self::Terminated)
    }

    /// A create was accepted and the instance has not settled yet.
    #[must_use]
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::Waiting | Self::Starting | Self::Unknown)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDescriptor {
    pub name: String,
    pub state: InstanceState,
    pub public_address: Option<String>,
    pub fqdn: Option<String>,
    /// Start time from the control plane's own instance view.
    pub started_at: Option<DateTime<Utc>>,
}

impl InstanceDescriptor {
    #[must_use]
    pub fn new(name: impl Into<String>, state: InstanceState) -> Self {
        Self {
            name: name.into(),
            state,
            public_address: None,
            fqdn: None,
            started_at: None,
        }
    }

    /// Host players connect to, FQDN preferred over the bare IP.
    #[must_use]
    pub fn connect_host(&self) -> Option<&str> {
        self.fqdn
            .as_deref()
            .filter(|value| !value.is_empty())
            .or_else(|| self.public_address.as_deref().filter(|value| !value.is_empty()))
    }

    #[must_use]
    pub fn connect_address(&self, port: u16) -> Option<String> {
        self.connect_host().map(|host| format!("{host}:{port}"))
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
    pub secure: bool,
}

impl EnvVar {
    pub fn plain(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            secure: false,
        }
    }

    pub fn secure(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            secure: true,
        }
    }
}

impl fmt::Debug for EnvVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = if self.secure {
            "<redacted>"
        } else {
            self.value.as_str()
        };
        f.debug_struct("EnvVar")
            .field("name", &self.name)
            .field("value", &value)
            .field("secure", &self.secure)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortProtocol {
    Udp,
}

impl PortProtocol {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Udp => "UDP",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSpec {
    pub port: u16,
    pub protocol: PortProtocol,
}

impl PortSpec {
    #[must_use]
    pub fn udp(port: u16) -> Self {
        Self {
            port,
            protocol: PortProtocol::Udp,
        }
    }
}

/// Persistent file share mounted into the container (world saves live here).
#[derive(Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
    pub share_name: String,
    pub storage_account_name: String,
    pub storage_account_key: String,
}

impl fmt::Debug for VolumeMount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VolumeMount")
            .field("name", &self.name)
            .field("mount_path", &self.mount_path)
            .field("share_name", &self.share_name)
            .field("storage_account_name", &self.storage_account_name)
            .field("storage_account_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceSpec {
    pub image: String,
    pub cpu_cores: f64,
    pub memory_gb: f64,
    pub environment: Vec<EnvVar>,
    pub ports: Vec<PortSpec>,
    pub volume: Option<VolumeMount>,
    pub dns_name_label: Option<String>,
}
