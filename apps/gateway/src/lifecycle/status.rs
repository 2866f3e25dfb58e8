use chrono::{DateTime, Duration, Utc};
use valheim_compute_control::InstanceState;

use super::Lifecycle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    /// Upper-case state label, `STOPPED` when no instance exists and `UNKNOWN`
    /// when the control plane could not be queried.
    pub label: String,
    pub state: Option<InstanceState>,
    pub address: Option<String>,
    pub remaining: Option<Duration>,
}

impl StatusReport {
    #[must_use]
    pub fn render(&self) -> String {
        let mut content = format!("Valheim server status: **{}**", self.label);
        if let Some(address) = &self.address {
            content.push_str(&format!("\nAddress: `{address}`"));
        }
        if let Some(remaining) = self.remaining {
            content.push_str(&format!(
                "\nAuto-shutdown in {}",
                format_remaining(remaining)
            ));
        }
        content
    }
}

fn format_remaining(remaining: Duration) -> String {
    let minutes = remaining.num_minutes().max(0);
    match (minutes / 60, minutes % 60) {
        (0, minutes) => format!("{minutes}m"),
        (hours, minutes) => format!("{hours}h {minutes}m"),
    }
}

impl Lifecycle {
    /// Always asks the control plane; the cache only contributes the deadline.
    pub async fn status(&self, now: DateTime<Utc>) -> StatusReport {
        let resource = self.settings.resource_name.as_str();
        let descriptor = match self.control_plane.get(resource).await {
            Ok(descriptor) => descriptor,
            Err(error) => {
                tracing::warn!(resource, reason = %error, "status query failed");
                return StatusReport {
                    label: InstanceState::Unknown.as_str().to_string(),
                    state: None,
                    address: None,
                    remaining: None,
                };
            }
        };

        let Some(descriptor) = descriptor else {
            return StatusReport {
                label: InstanceState::Stopped.as_str().to_string(),
                state: None,
                address: None,
                remaining: None,
            };
        };

        let running = descriptor.state == InstanceState::Running;
        let remaining = if running {
            self.store
                .get(resource)
                .await
                .and_then(|status| status.remaining(now))
        } else {
            None
        };
        StatusReport {
            label: descriptor.state.as_str().to_string(),
            state: Some(descriptor.state),
            address: if running {
                descriptor.connect_address(self.primary_port())
            } else {
                None
            },
            remaining,
        }
    }
}
