//! Azure Container Instances backend (ARM REST API).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::{
    ComputeControlPlane, ControlPlaneError, InstanceDescriptor, InstanceSpec, InstanceState,
    WaitPolicy,
};

pub mod credential;

pub use credential::{
    KEY_VAULT_RESOURCE, MANAGEMENT_RESOURCE, ManagedIdentityCredential, StaticToken, TokenSource,
};

pub const DEFAULT_API_VERSION: &str = "2023-05-01";
pub const DEFAULT_MANAGEMENT_URL: &str = "https://management.azure.com";
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct AzureContainerConfig {
    pub subscription_id: String,
    pub resource_group: String,
    pub location: String,
    pub management_url: String,
    pub api_version: String,
    pub timeout_ms: u64,
    pub delete_wait_interval: Duration,
    pub delete_wait_budget: Duration,
}

impl AzureContainerConfig {
    #[must_use]
    pub fn new(
        subscription_id: impl Into<String>,
        resource_group: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            resource_group: resource_group.into(),
            location: location.into(),
            management_url: DEFAULT_MANAGEMENT_URL.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            delete_wait_interval: Duration::from_secs(5),
            delete_wait_budget: Duration::from_secs(120),
        }
    }
}

pub struct AzureContainerInstances {
    config: AzureContainerConfig,
    management_url: String,
    timeout: Duration,
    http: reqwest::Client,
    credential: Arc<dyn TokenSource>,
}

impl AzureContainerInstances {
    pub fn new(
        config: AzureContainerConfig,
        credential: Arc<dyn TokenSource>,
    ) -> Result<Self, ControlPlaneError> {
        for (setting, value) in [
            ("AZURE_SUBSCRIPTION_ID", config.subscription_id.as_str()),
            ("AZURE_RESOURCE_GROUP", config.resource_group.as_str()),
            ("AZURE_LOCATION", config.location.as_str()),
        ] {
            if value.trim().is_empty() {
                return Err(ControlPlaneError::InvalidConfig(format!(
                    "{setting} is required for the azure control plane"
                )));
            }
        }
        let management_url = config.management_url.trim().trim_end_matches('/').to_string();
        if management_url.is_empty() {
            return Err(ControlPlaneError::InvalidConfig(
                "management url cannot be empty".to_string(),
            ));
        }
        Ok(Self {
            timeout: Duration::from_millis(config.timeout_ms.max(250)),
            management_url,
            config,
            http: reqwest::Client::new(),
            credential,
        })
    }

    #[must_use]
    pub fn container_group_url(&self, name: &str) -> String {
        format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.ContainerInstance/containerGroups/{}?api-version={}",
            self.management_url,
            self.config.subscription_id.trim(),
            self.config.resource_group.trim(),
            name.trim(),
            self.config.api_version
        )
    }

    async fn send(
        &self,
        method: Method,
        name: &str,
        body: Option<&Value>,
    ) -> Result<(StatusCode, Vec<u8>), ControlPlaneError> {
        let token = self.credential.token(MANAGEMENT_RESOURCE).await?;
        let mut request = self
            .http
            .request(method, self.container_group_url(name))
            .bearer_auth(token)
            .header("x-ms-client-request-id", Uuid::new_v4().to_string())
            .timeout(self.timeout);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|error| ControlPlaneError::Request(error.to_string()))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|error| ControlPlaneError::Request(error.to_string()))?;
        Ok((status, bytes.to_vec()))
    }

    async fn wait_until_gone(&self, name: &str) -> Result<(), ControlPlaneError> {
        let deadline = tokio::time::Instant::now() + self.config.delete_wait_budget;
        loop {
            if self.get(name).await?.is_none() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    instance = name,
                    "container group still present after delete wait budget"
                );
                return Ok(());
            }
            tokio::time::sleep(self.config.delete_wait_interval).await;
        }
    }
}

#[async_trait]
impl ComputeControlPlane for AzureContainerInstances {
    fn backend(&self) -> &'static str {
        "azure"
    }

    async fn create_or_replace(
        &self,
        name: &str,
        spec: &InstanceSpec,
    ) -> Result<String, ControlPlaneError> {
        let body = container_group_body(&self.config.location, name, spec);
        let (status, bytes) = self.send(Method::PUT, name, Some(&body)).await?;
        if !status.is_success() {
            return Err(http_error(status, &bytes));
        }
        let created = serde_json::from_slice::<Value>(&bytes)
            .map_err(|error| ControlPlaneError::Decode(error.to_string()))?;
        let id = created
            .get("id")
            .and_then(Value::as_str)
            .map_or_else(|| name.to_string(), str::to_string);
        tracing::info!(instance = name, id = %id, "container group create accepted");
        Ok(id)
    }

    async fn get(&self, name: &str) -> Result<Option<InstanceDescriptor>, ControlPlaneError> {
        let (status, bytes) = self.send(Method::GET, name, None).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(http_error(status, &bytes));
        }
        let group = serde_json::from_slice::<Value>(&bytes)
            .map_err(|error| ControlPlaneError::Decode(error.to_string()))?;
        Ok(Some(descriptor_from_container_group(name, &group)))
    }

    async fn delete(&self, name: &str, wait: WaitPolicy) -> Result<(), ControlPlaneError> {
        let (status, bytes) = self.send(Method::DELETE, name, None).await?;
        if status == StatusCode::NOT_FOUND || status == StatusCode::NO_CONTENT {
            return Ok(());
        }
        if !status.is_success() {
            return Err(http_error(status, &bytes));
        }
        match wait {
            WaitPolicy::NoWait => Ok(()),
            WaitPolicy::WaitForCompletion => self.wait_until_gone(name).await,
        }
    }
}

/// ARM request body for a container group hosting a single container.
#[must_use]
pub fn container_group_body(location: &str, name: &str, spec: &InstanceSpec) -> Value {
    let ports = spec
        .ports
        .iter()
        .map(|port| json!({ "port": port.port, "protocol": port.protocol.as_str() }))
        .collect::<Vec<_>>();
    let environment = spec
        .environment
        .iter()
        .map(|var| {
            if var.secure {
                json!({ "name": var.name, "secureValue": var.value })
            } else {
                json!({ "name": var.name, "value": var.value })
            }
        })
        .collect::<Vec<_>>();

    let mut container = json!({
        "name": name,
        "properties": {
            "image": spec.image,
            "resources": {
                "requests": {
                    "cpu": spec.cpu_cores,
                    "memoryInGB": spec.memory_gb,
                }
            },
            "ports": ports,
            "environmentVariables": environment,
        }
    });
    let mut ip_address = json!({
        "type": "Public",
        "ports": ports,
    });
    if let Some(label) = spec.dns_name_label.as_deref() {
        ip_address["dnsNameLabel"] = json!(label);
    }

    let mut properties = json!({
        "containers": [],
        "osType": "Linux",
        "restartPolicy": "OnFailure",
        "ipAddress": ip_address,
    });
    if let Some(volume) = spec.volume.as_ref() {
        container["properties"]["volumeMounts"] = json!([{
            "name": volume.name,
            "mountPath": volume.mount_path,
        }]);
        properties["volumes"] = json!([{
            "name": volume.name,
            "azureFile": {
                "shareName": volume.share_name,
                "storageAccountName": volume.storage_account_name,
                "storageAccountKey": volume.storage_account_key,
            }
        }]);
    }
    properties["containers"] = json!([container]);

    json!({
        "location": location,
        "properties": properties,
    })
}

/// Reads the state, address and start time out of an ARM container group document.
#[must_use]
pub fn descriptor_from_container_group(name: &str, group: &Value) -> InstanceDescriptor {
    let properties = &group["properties"];
    let container_state = &properties["containers"][0]["properties"]["instanceView"]["currentState"];

    let provisioning = properties["provisioningState"].as_str().unwrap_or_default();
    let state = if provisioning.eq_ignore_ascii_case("failed") {
        InstanceState::Failed
    } else if let Some(raw) = container_state["state"].as_str() {
        InstanceState::from_provider(raw)
    } else if let Some(raw) = properties["instanceView"]["state"].as_str() {
        InstanceState::from_provider(raw)
    } else if provisioning.eq_ignore_ascii_case("creating")
        || provisioning.eq_ignore_ascii_case("pending")
    {
        InstanceState::Waiting
    } else {
        InstanceState::Unknown
    };

    let started_at = container_state["startTime"]
        .as_str()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|value| value.with_timezone(&Utc));

    InstanceDescriptor {
        name: name.to_string(),
        state,
        public_address: properties["ipAddress"]["ip"].as_str().map(str::to_string),
        fqdn: properties["ipAddress"]["fqdn"].as_str().map(str::to_string),
        started_at,
    }
}

fn http_error(status: StatusCode, body: &[u8]) -> ControlPlaneError {
    let body = String::from_utf8_lossy(body).trim().to_string();
    ControlPlaneError::Http {
        status: status.as_u16(),
        body: if body.is_empty() {
            "<empty>".to_string()
        } else {
            body
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;
    use axum::{
        Json, Router,
        extract::{Path, State},
        http::{HeaderMap, StatusCode as AxumStatus},
        response::IntoResponse,
        routing::put,
    };
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;

    use super::*;
    use crate::{EnvVar, PortSpec, VolumeMount};

    fn spec() -> InstanceSpec {
        InstanceSpec {
            image: "lloesche/valheim-server:latest".to_string(),
            cpu_cores: 2.0,
            memory_gb: 4.0,
            environment: vec![
                EnvVar::plain("SERVER_NAME", "Valheim"),
                EnvVar::secure("SERVER_PASS", "hunter22"),
            ],
            ports: vec![PortSpec::udp(2456), PortSpec::udp(2457)],
            volume: Some(VolumeMount {
                name: "valheim-data".to_string(),
                mount_path: "/config".to_string(),
                share_name: "valheim-data".to_string(),
                storage_account_name: "valheimstore".to_string(),
                storage_account_key: "c2VjcmV0".to_string(),
            }),
            dns_name_label: Some("vh-test".to_string()),
        }
    }

    #[test]
    fn body_marks_secrets_secure_and_mounts_share() {
        let body = container_group_body("westeurope", "valheim-server", &spec());
        assert_eq!(body["location"], "westeurope");

        let container = &body["properties"]["containers"][0]["properties"];
        assert_eq!(container["resources"]["requests"]["cpu"], 2.0);
        assert_eq!(container["resources"]["requests"]["memoryInGB"], 4.0);
        let env = container["environmentVariables"]
            .as_array()
            .expect("env array");
        assert_eq!(env[0]["value"], "Valheim");
        assert_eq!(env[1]["secureValue"], "hunter22");
        assert!(env[1].get("value").is_none());
        assert_eq!(container["volumeMounts"][0]["mountPath"], "/config");

        let ip = &body["properties"]["ipAddress"];
        assert_eq!(ip["dnsNameLabel"], "vh-test");
        assert_eq!(ip["ports"][1]["port"], 2457);
        assert_eq!(ip["ports"][1]["protocol"], "UDP");
        assert_eq!(
            body["properties"]["volumes"][0]["azureFile"]["shareName"],
            "valheim-data"
        );
    }

    #[test]
    fn descriptor_prefers_container_state_and_reads_start_time() {
        let group = json!({
            "properties": {
                "provisioningState": "Succeeded",
                "instanceView": { "state": "Running" },
                "ipAddress": { "ip": "20.1.2.3", "fqdn": "vh.westeurope.azurecontainer.io" },
                "containers": [{
                    "properties": {
                        "instanceView": {
                            "currentState": {
                                "state": "Running",
                                "startTime": "2026-10-16T09:30:00Z"
                            }
                        }
                    }
                }]
            }
        });
        let descriptor = descriptor_from_container_group("valheim-server", &group);
        assert_eq!(descriptor.state, InstanceState::Running);
        assert_eq!(descriptor.public_address.as_deref(), Some("20.1.2.3"));
        assert_eq!(
            descriptor.started_at.map(|at| at.to_rfc3339()),
            Some("2026-10-16T09:30:00+00:00".to_string())
        );
    }

    #[test]
    fn descriptor_falls_back_through_group_and_provisioning_states() {
        let stopped = json!({ "properties": { "instanceView": { "state": "Stopped" } } });
        assert_eq!(
            descriptor_from_container_group("x", &stopped).state,
            InstanceState::Stopped
        );

        let creating = json!({ "properties": { "provisioningState": "Creating" } });
        assert_eq!(
            descriptor_from_container_group("x", &creating).state,
            InstanceState::Waiting
        );

        let failed = json!({
            "properties": {
                "provisioningState": "Failed",
                "instanceView": { "state": "Running" }
            }
        });
        assert_eq!(
            descriptor_from_container_group("x", &failed).state,
            InstanceState::Failed
        );
        assert_eq!(
            descriptor_from_container_group("x", &json!({})).state,
            InstanceState::Unknown
        );
    }

    #[test]
    fn missing_settings_are_reported_by_name() {
        let result = AzureContainerInstances::new(
            AzureContainerConfig::new("", "rg", "westeurope"),
            Arc::new(StaticToken::new("t")),
        );
        match result {
            Err(ControlPlaneError::InvalidConfig(message)) => {
                assert!(message.contains("AZURE_SUBSCRIPTION_ID"));
            }
            _ => panic!("expected invalid config"),
        }
    }

    #[derive(Clone, Default)]
    struct StubArm {
        group: Arc<Mutex<Option<Value>>>,
    }

    async fn put_group(
        State(stub): State<StubArm>,
        Path((_sub, _rg, name)): Path<(String, String, String)>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> impl IntoResponse {
        assert_eq!(
            headers
                .get("authorization")
                .and_then(|value| value.to_str().ok()),
            Some("Bearer arm-token")
        );
        let mut stored = body.clone();
        stored["id"] = json!(format!("/containerGroups/{name}"));
        stored["properties"]["instanceView"] = json!({ "state": "Pending" });
        *stub.group.lock().await = Some(stored.clone());
        (AxumStatus::CREATED, Json(stored))
    }

    async fn get_group(State(stub): State<StubArm>) -> impl IntoResponse {
        match stub.group.lock().await.clone() {
            Some(group) => (AxumStatus::OK, Json(group)).into_response(),
            None => (
                AxumStatus::NOT_FOUND,
                Json(json!({ "error": { "code": "ResourceNotFound" } })),
            )
                .into_response(),
        }
    }

    async fn delete_group(State(stub): State<StubArm>) -> AxumStatus {
        if stub.group.lock().await.take().is_some() {
            AxumStatus::OK
        } else {
            AxumStatus::NO_CONTENT
        }
    }

    #[tokio::test]
    async fn create_get_delete_round_trip_against_stub() -> Result<()> {
        let stub = StubArm::default();
        let app = Router::new()
            .route(
                "/subscriptions/:sub/resourceGroups/:rg/providers/Microsoft.ContainerInstance/containerGroups/:name",
                put(put_group).get(get_group).delete(delete_group),
            )
            .with_state(stub.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let mut config = AzureContainerConfig::new("sub-1", "rg-valheim", "westeurope");
        config.management_url = format!("http://{addr}/");
        let plane = AzureContainerInstances::new(config, Arc::new(StaticToken::new("arm-token")))?;

        assert!(plane.get("valheim-server").await?.is_none());

        let id = plane.create_or_replace("valheim-server", &spec()).await?;
        assert_eq!(id, "/containerGroups/valheim-server");

        let descriptor = plane.get("valheim-server").await?.expect("group exists");
        assert_eq!(descriptor.state, InstanceState::Waiting);

        plane
            .delete("valheim-server", WaitPolicy::WaitForCompletion)
            .await?;
        assert!(stub.group.lock().await.is_none());
        plane.delete("valheim-server", WaitPolicy::NoWait).await?;
        Ok(())
    }
}
