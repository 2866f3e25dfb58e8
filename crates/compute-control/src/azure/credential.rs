use std::collections::HashMap;
use std::env;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::ControlPlaneError;

pub const MANAGEMENT_RESOURCE: &str = "https://management.azure.com/";
pub const KEY_VAULT_RESOURCE: &str = "https://vault.azure.net";

const IMDS_TOKEN_URL: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const TOKEN_REFRESH_MARGIN_SECONDS: i64 = 300;
const DEFAULT_TOKEN_LIFETIME_SECONDS: i64 = 600;

/// Bearer tokens for Azure REST calls, one per audience.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self, resource: &str) -> Result<String, ControlPlaneError>;
}

/// Fixed token, e.g. from `az account get-access-token` during local runs.
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticToken(<redacted>)")
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self, _resource: &str) -> Result<String, ControlPlaneError> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Clone)]
enum IdentityEndpoint {
    /// App Service / Functions style endpoint guarded by a per-process header.
    Hosted { url: String, header: String },
    /// VM / container instance metadata service.
    InstanceMetadata { url: String },
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_on: Option<Value>,
    #[serde(default)]
    expires_in: Option<Value>,
}

#[derive(Debug)]
pub struct ManagedIdentityCredential {
    http: reqwest::Client,
    endpoint: IdentityEndpoint,
    client_id: Option<String>,
    timeout: Duration,
    cache: Mutex<HashMap<String, CachedToken>>,
}

impl ManagedIdentityCredential {
    /// Uses `IDENTITY_ENDPOINT` + `IDENTITY_HEADER` when the host provides them,
    /// otherwise the instance metadata service. `AZURE_CLIENT_ID` selects a
    /// user-assigned identity.
    #[must_use]
    pub fn from_env() -> Self {
        let endpoint = match (
            non_empty_env("IDENTITY_ENDPOINT"),
            non_empty_env("IDENTITY_HEADER"),
        ) {
            (Some(url), Some(header)) => IdentityEndpoint::Hosted { url, header },
            _ => IdentityEndpoint::InstanceMetadata {
                url: IMDS_TOKEN_URL.to_string(),
            },
        };
        Self::with_endpoint(endpoint, non_empty_env("AZURE_CLIENT_ID"))
    }

    #[must_use]
    pub fn hosted(url: impl Into<String>, header: impl Into<String>) -> Self {
        Self::with_endpoint(
            IdentityEndpoint::Hosted {
                url: url.into(),
                header: header.into(),
            },
            None,
        )
    }

    fn with_endpoint(endpoint: IdentityEndpoint, client_id: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
            client_id,
            timeout: Duration::from_secs(5),
            cache: Mutex::new(HashMap::new()),
        }
    }

    async fn fetch(&self, resource: &str) -> Result<CachedToken, ControlPlaneError> {
        let mut request = match &self.endpoint {
            IdentityEndpoint::Hosted { url, header } => self
                .http
                .get(url.as_str())
                .query(&[("resource", resource), ("api-version", "2019-08-01")])
                .header("X-IDENTITY-HEADER", header.as_str()),
            IdentityEndpoint::InstanceMetadata { url } => self
                .http
                .get(url.as_str())
                .query(&[("resource", resource), ("api-version", "2018-02-01")])
                .header("Metadata", "true"),
        };
        if let Some(client_id) = self.client_id.as_deref() {
            request = request.query(&[("client_id", client_id)]);
        }

        let response = request
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|error| ControlPlaneError::Credential(error.to_string()))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|error| ControlPlaneError::Credential(error.to_string()))?;
        if !status.is_success() {
            return Err(ControlPlaneError::Credential(format!(
                "token endpoint returned http {}: {}",
                status.as_u16(),
                String::from_utf8_lossy(&bytes).trim()
            )));
        }
        let parsed = serde_json::from_slice::<TokenResponse>(&bytes)
            .map_err(|error| ControlPlaneError::Credential(error.to_string()))?;
        let expires_at = token_expiry(&parsed, Utc::now());
        Ok(CachedToken {
            access_token: parsed.access_token,
            expires_at,
        })
    }
}

#[async_trait]
impl TokenSource for ManagedIdentityCredential {
    async fn token(&self, resource: &str) -> Result<String, ControlPlaneError> {
        let now = Utc::now();
        {
            let cache = self.cache.lock().await;
            if let Some(cached) = cache.get(resource) {
                if cached.expires_at - chrono::Duration::seconds(TOKEN_REFRESH_MARGIN_SECONDS)
                    > now
                {
                    return Ok(cached.access_token.clone());
                }
            }
        }

        let fresh = self.fetch(resource).await?;
        tracing::debug!(resource, expires_at = %fresh.expires_at, "managed identity token refreshed");
        let token = fresh.access_token.clone();
        self.cache.lock().await.insert(resource.to_string(), fresh);
        Ok(token)
    }
}

fn token_expiry(response: &TokenResponse, now: DateTime<Utc>) -> DateTime<Utc> {
    if let Some(expires_on) = response.expires_on.as_ref().and_then(value_as_i64) {
        if let Some(at) = DateTime::<Utc>::from_timestamp(expires_on, 0) {
            return at;
        }
    }
    let lifetime = response
        .expires_in
        .as_ref()
        .and_then(value_as_i64)
        .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECONDS);
    now + chrono::Duration::seconds(lifetime)
}

// Identity endpoints disagree on whether numbers are sent as JSON numbers or strings.
fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(raw) => raw.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
