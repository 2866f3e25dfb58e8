//! Secret provider seam plus the per-process secret cache.

use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::Mutex;
use valheim_compute_control::azure::{KEY_VAULT_RESOURCE, TokenSource};

const KEY_VAULT_API_VERSION: &str = "7.4";

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SecretError {
    #[error("secret {0} is not set")]
    NotFound(String),
    #[error("secret store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait SecretProvider: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn get_secret(&self, name: &str) -> Result<String, SecretError>;
}

/// Reads `DISCORD-PUBLIC-KEY` from `DISCORD_PUBLIC_KEY`.
#[derive(Debug, Default)]
pub struct EnvSecretProvider;

impl EnvSecretProvider {
    #[must_use]
    pub fn variable_name(secret: &str) -> String {
        secret.trim().replace(['-', '.'], "_").to_ascii_uppercase()
    }
}

#[async_trait]
impl SecretProvider for EnvSecretProvider {
    fn backend(&self) -> &'static str {
        "env"
    }

    async fn get_secret(&self, name: &str) -> Result<String, SecretError> {
        env::var(Self::variable_name(name))
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| SecretError::NotFound(name.to_string()))
    }
}

/// Fixed secrets, for tests and local runs.
#[derive(Debug, Default)]
pub struct StaticSecretProvider {
    values: HashMap<String, String>,
}

impl StaticSecretProvider {
    pub fn new<K, V>(values: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: values
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }
}

#[async_trait]
impl SecretProvider for StaticSecretProvider {
    fn backend(&self) -> &'static str {
        "static"
    }

    async fn get_secret(&self, name: &str) -> Result<String, SecretError> {
        self.values
            .get(name)
            .cloned()
            .ok_or_else(|| SecretError::NotFound(name.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct KeyVaultSecretBundle {
    value: String,
}

pub struct KeyVaultSecretProvider {
    vault_url: String,
    http: reqwest::Client,
    credential: Arc<dyn TokenSource>,
    timeout: Duration,
}

impl KeyVaultSecretProvider {
    pub fn new(vault_url: impl Into<String>, credential: Arc<dyn TokenSource>) -> Self {
        Self {
            vault_url: vault_url.into().trim().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            credential,
            timeout: Duration::from_secs(5),
        }
    }

    #[must_use]
    pub fn secret_url(&self, name: &str) -> String {
        format!(
            "{}/secrets/{}?api-version={KEY_VAULT_API_VERSION}",
            self.vault_url,
            name.trim()
        )
    }
}

#[async_trait]
impl SecretProvider for KeyVaultSecretProvider {
    fn backend(&self) -> &'static str {
        "keyvault"
    }

    async fn get_secret(&self, name: &str) -> Result<String, SecretError> {
        let token = self
            .credential
            .token(KEY_VAULT_RESOURCE)
            .await
            .map_err(|error| SecretError::Unavailable(error.to_string()))?;
        let response = self
            .http
            .get(self.secret_url(name))
            .bearer_auth(token)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|error| SecretError::Unavailable(error.to_string()))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(SecretError::NotFound(name.to_string()));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|error| SecretError::Unavailable(error.to_string()))?;
        if !status.is_success() {
            return Err(SecretError::Unavailable(format!(
                "key vault returned http {}",
                status.as_u16()
            )));
        }
        let bundle = serde_json::from_slice::<KeyVaultSecretBundle>(&bytes)
            .map_err(|error| SecretError::Unavailable(error.to_string()))?;
        if bundle.value.trim().is_empty() {
            return Err(SecretError::NotFound(name.to_string()));
        }
        Ok(bundle.value)
    }
}

/// Secrets are read-only for the life of the process: the first successful read
/// of each name is kept, failures are not.
pub struct SecretCache {
    provider: Arc<dyn SecretProvider>,
    values: Mutex<HashMap<String, String>>,
}

impl SecretCache {
    pub fn new(provider: Arc<dyn SecretProvider>) -> Self {
        Self {
            provider,
            values: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, name: &str) -> Result<String, SecretError> {
        if let Some(value) = self.values.lock().await.get(name) {
            return Ok(value.clone());
        }
        let value = self.provider.get_secret(name).await?;
        self.values
            .lock()
            .await
            .insert(name.to_string(), value.clone());
        Ok(value)
    }
}
