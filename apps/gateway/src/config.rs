use std::{
    env,
    fmt,
    net::{AddrParseError, SocketAddr},
    time::Duration,
};

use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlPlaneBackend {
    Memory,
    Azure,
}

impl ControlPlaneBackend {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Azure => "azure",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SecretsBackend {
    Env,
    KeyVault { vault_url: String },
}

impl SecretsBackend {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Env => "env",
            Self::KeyVault { .. } => "keyvault",
        }
    }
}

#[derive(Clone, Default)]
pub struct AzureSettings {
    pub subscription_id: Option<String>,
    pub resource_group: Option<String>,
    pub location: Option<String>,
    pub access_token: Option<String>,
}

impl fmt::Debug for AzureSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureSettings")
            .field("subscription_id", &self.subscription_id)
            .field("resource_group", &self.resource_group)
            .field("location", &self.location)
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Shape of the game server container created on `start`.
#[derive(Clone, Debug, PartialEq)]
pub struct InstanceTemplate {
    pub image: String,
    pub cpu_cores: f64,
    pub memory_gb: f64,
    pub ports: Vec<u16>,
    pub server_name: String,
    pub world_name: String,
    pub dns_name_label: Option<String>,
    pub storage_account: Option<String>,
    pub storage_share: String,
    pub mount_path: String,
}

impl Default for InstanceTemplate {
    fn default() -> Self {
        Self {
            image: "lloesche/valheim-server:latest".to_string(),
            cpu_cores: 2.0,
            memory_gb: 4.0,
            ports: vec![2456, 2457, 2458],
            server_name: "Valheim".to_string(),
            world_name: "Dedicated".to_string(),
            dns_name_label: None,
            storage_account: None,
            storage_share: "valheim-data".to_string(),
            mount_path: "/config".to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub service_name: String,
    pub bind_addr: SocketAddr,
    pub build_sha: String,
    pub interactions_path: String,
    pub command_name: String,
    pub resource_name: String,
    pub auto_shutdown_minutes: i64,
    pub start_poll_interval: Duration,
    pub start_poll_budget: Duration,
    pub start_task_max_lifetime: Duration,
    pub sweep_enabled: bool,
    pub sweep_interval: Duration,
    pub shutdown_grace: Duration,
    pub allow_unverified_requests: bool,
    pub followup_base_url: String,
    pub followup_timeout_ms: u64,
    pub log_json: bool,
    pub control_plane: ControlPlaneBackend,
    pub azure: AzureSettings,
    pub secrets_backend: SecretsBackend,
    pub public_key_secret: String,
    pub server_password_secret: String,
    pub storage_key_secret: String,
    pub instance: InstanceTemplate,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid GATEWAY_BIND_ADDR: {0}")]
    BindAddrParse(#[from] AddrParseError),
    #[error("invalid {key}: {reason}")]
    InvalidNumber { key: String, reason: String },
    #[error("invalid {key}: expected a boolean, got {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid GATEWAY_INTERACTIONS_PATH: {0}")]
    InvalidInteractionsPath(String),
    #[error("invalid GATEWAY_CONTROL_PLANE: {0}")]
    InvalidControlPlane(String),
    #[error("invalid GATEWAY_SECRETS_BACKEND: {0}")]
    InvalidSecretsBackend(String),
    #[error("GATEWAY_KEYVAULT_URL is required when GATEWAY_SECRETS_BACKEND=keyvault")]
    MissingKeyVaultUrl,
    #[error("invalid VALHEIM_PORTS: {0}")]
    InvalidPorts(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let lookup = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let bind_addr = lookup("GATEWAY_BIND_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8080".to_string())
            .parse::<SocketAddr>()?;
        let service_name =
            lookup("GATEWAY_SERVICE_NAME").unwrap_or_else(|| "valheim-gateway".to_string());
        let build_sha = lookup("GATEWAY_BUILD_SHA").unwrap_or_else(|| "dev".to_string());
        let interactions_path = lookup("GATEWAY_INTERACTIONS_PATH")
            .unwrap_or_else(|| "/api/interactions".to_string());
        if !interactions_path.starts_with('/') || interactions_path.contains(':') {
            return Err(ConfigError::InvalidInteractionsPath(interactions_path));
        }
        let command_name = lookup("GATEWAY_COMMAND_NAME")
            .unwrap_or_else(|| "valheim".to_string())
            .to_ascii_lowercase();
        let resource_name =
            lookup("GATEWAY_RESOURCE_NAME").unwrap_or_else(|| "valheim-server".to_string());

        let auto_shutdown_minutes =
            parse_u64_lookup(&lookup, "GATEWAY_AUTO_SHUTDOWN_MINUTES", 120, 1, 7 * 24 * 60)?
                as i64;
        let start_poll_interval = Duration::from_secs(parse_u64_lookup(
            &lookup,
            "GATEWAY_START_POLL_INTERVAL_SECONDS",
            10,
            1,
            300,
        )?);
        let start_poll_budget = Duration::from_secs(parse_u64_lookup(
            &lookup,
            "GATEWAY_START_POLL_BUDGET_SECONDS",
            300,
            1,
            3_600,
        )?);
        let start_task_max_lifetime = Duration::from_secs(parse_u64_lookup(
            &lookup,
            "GATEWAY_START_TASK_MAX_LIFETIME_SECONDS",
            start_poll_budget.as_secs() + 60,
            start_poll_budget.as_secs() + 1,
            7_200,
        )?);
        let sweep_enabled = parse_bool_lookup(&lookup, "GATEWAY_SWEEP_ENABLED", true)?;
        let sweep_interval = Duration::from_secs(parse_u64_lookup(
            &lookup,
            "GATEWAY_SWEEP_INTERVAL_SECONDS",
            300,
            10,
            86_400,
        )?);
        let shutdown_grace = Duration::from_secs(parse_u64_lookup(
            &lookup,
            "GATEWAY_SHUTDOWN_GRACE_SECONDS",
            15,
            0,
            600,
        )?);
        let allow_unverified_requests =
            parse_bool_lookup(&lookup, "GATEWAY_ALLOW_UNVERIFIED_REQUESTS", false)?;
        let followup_base_url = lookup("GATEWAY_FOLLOWUP_BASE_URL")
            .unwrap_or_else(|| "https://discord.com/api/v10".to_string())
            .trim_end_matches('/')
            .to_string();
        let followup_timeout_ms =
            parse_u64_lookup(&lookup, "GATEWAY_FOLLOWUP_TIMEOUT_MS", 5_000, 250, 60_000)?;
        let log_json = parse_bool_lookup(&lookup, "GATEWAY_LOG_JSON", false)?;

        let control_plane = parse_control_plane(
            lookup("GATEWAY_CONTROL_PLANE")
                .unwrap_or_else(|| "azure".to_string())
                .as_str(),
        )?;
        let azure = AzureSettings {
            subscription_id: lookup("AZURE_SUBSCRIPTION_ID"),
            resource_group: lookup("AZURE_RESOURCE_GROUP"),
            location: lookup("AZURE_LOCATION"),
            access_token: lookup("AZURE_ACCESS_TOKEN"),
        };
        let secrets_backend = match lookup("GATEWAY_SECRETS_BACKEND")
            .unwrap_or_else(|| "env".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "env" => SecretsBackend::Env,
            "keyvault" | "key_vault" => SecretsBackend::KeyVault {
                vault_url: lookup("GATEWAY_KEYVAULT_URL")
                    .ok_or(ConfigError::MissingKeyVaultUrl)?
                    .trim_end_matches('/')
                    .to_string(),
            },
            other => return Err(ConfigError::InvalidSecretsBackend(other.to_string())),
        };
        let public_key_secret =
            lookup("GATEWAY_PUBLIC_KEY_SECRET").unwrap_or_else(|| "DISCORD-PUBLIC-KEY".to_string());
        let server_password_secret = lookup("GATEWAY_SERVER_PASSWORD_SECRET")
            .unwrap_or_else(|| "VALHEIM-SERVER-PASSWORD".to_string());
        let storage_key_secret = lookup("GATEWAY_STORAGE_KEY_SECRET")
            .unwrap_or_else(|| "STORAGE-ACCOUNT-KEY".to_string());

        let instance = parse_instance_template(&lookup)?;

        Ok(Self {
            service_name,
            bind_addr,
            build_sha,
            interactions_path,
            command_name,
            resource_name,
            auto_shutdown_minutes,
            start_poll_interval,
            start_poll_budget,
            start_task_max_lifetime,
            sweep_enabled,
            sweep_interval,
            shutdown_grace,
            allow_unverified_requests,
            followup_base_url,
            followup_timeout_ms,
            log_json,
            control_plane,
            azure,
            secrets_backend,
            public_key_secret,
            server_password_secret,
            storage_key_secret,
            instance,
        })
    }
}

fn parse_instance_template(
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<InstanceTemplate, ConfigError> {
    let defaults = InstanceTemplate::default();
    let ports = match lookup("VALHEIM_PORTS") {
        Some(raw) => parse_ports(&raw)?,
        None => defaults.ports,
    };
    Ok(InstanceTemplate {
        image: lookup("VALHEIM_IMAGE").unwrap_or(defaults.image),
        cpu_cores: parse_f64_lookup(lookup, "VALHEIM_CPU_CORES", defaults.cpu_cores, 0.5, 4.0)?,
        memory_gb: parse_f64_lookup(lookup, "VALHEIM_MEMORY_GB", defaults.memory_gb, 1.0, 16.0)?,
        ports,
        server_name: lookup("VALHEIM_SERVER_NAME").unwrap_or(defaults.server_name),
        world_name: lookup("VALHEIM_WORLD_NAME").unwrap_or(defaults.world_name),
        dns_name_label: lookup("VALHEIM_DNS_LABEL"),
        storage_account: lookup("VALHEIM_STORAGE_ACCOUNT"),
        storage_share: lookup("VALHEIM_STORAGE_SHARE").unwrap_or(defaults.storage_share),
        mount_path: defaults.mount_path,
    })
}

fn parse_ports(raw: &str) -> Result<Vec<u16>, ConfigError> {
    let mut ports = Vec::new();
    for token in raw.split(',').map(str::trim).filter(|token| !token.is_empty()) {
        let port = token
            .parse::<u16>()
            .map_err(|error| ConfigError::InvalidPorts(format!("{token}: {error}")))?;
        if port == 0 {
            return Err(ConfigError::InvalidPorts("port 0 is not allowed".to_string()));
        }
        if !ports.contains(&port) {
            ports.push(port);
        }
    }
    if ports.is_empty() {
        return Err(ConfigError::InvalidPorts(
            "at least one port is required".to_string(),
        ));
    }
    Ok(ports)
}

fn parse_control_plane(raw: &str) -> Result<ControlPlaneBackend, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "memory" => Ok(ControlPlaneBackend::Memory),
        "azure" | "aci" => Ok(ControlPlaneBackend::Azure),
        other => Err(ConfigError::InvalidControlPlane(other.to_string())),
    }
}

fn parse_u64_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u64,
    min: u64,
    max: u64,
) -> Result<u64, ConfigError> {
    parse_with_lookup(lookup, key, default, |raw| {
        let value = raw.parse::<u64>().map_err(|error| ConfigError::InvalidNumber {
            key: key.to_string(),
            reason: error.to_string(),
        })?;
        if (min..=max).contains(&value) {
            Ok(value)
        } else {
            Err(out_of_range(key, &raw, min, max))
        }
    })
}

fn parse_f64_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: f64,
    min: f64,
    max: f64,
) -> Result<f64, ConfigError> {
    parse_with_lookup(lookup, key, default, |raw| {
        let value = raw.parse::<f64>().map_err(|error| ConfigError::InvalidNumber {
            key: key.to_string(),
            reason: error.to_string(),
        })?;
        // NaN fails the range check too
        if (min..=max).contains(&value) {
            Ok(value)
        } else {
            Err(out_of_range(key, &raw, min, max))
        }
    })
}

fn out_of_range(key: &str, raw: &str, min: impl fmt::Display, max: impl fmt::Display) -> ConfigError {
    ConfigError::InvalidNumber {
        key: key.to_string(),
        reason: format!("{raw} is outside {min}..={max}"),
    }
}

fn parse_bool_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    parse_with_lookup(lookup, key, default, |raw| {
        match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: raw,
            }),
        }
    })
}

fn parse_with_lookup<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
    parser: impl FnOnce(String) -> Result<T, ConfigError>,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) => parser(raw),
        None => Ok(default),
    }
}
