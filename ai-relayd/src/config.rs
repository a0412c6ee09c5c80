use std::collections::HashMap;
use std::path::Path;
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::protocol::AI_SERVICE_TYPE;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    pub api: ApiConfig,
    pub advertise: Option<AdvertiseConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_service_types")]
    pub service_types: Vec<String>,
    /// Restrict mDNS to a single interface; all interfaces when unset
    pub interface: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Evict services not seen for this long. No eviction when unset.
    pub stale_after_secs: Option<u64>,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_secs: u64,
    /// Environment variable holding the upstream bearer credential.
    /// Requests go out without an Authorization header when unset.
    pub credential_env: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Who may call the relay. Required: there is no client authentication,
    /// so exposing the relay to the network has to be an explicit choice.
    pub client_access: ClientAccess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientAccess {
    /// Any peer that can reach the listen address
    Open,
    /// Only peers connecting from a loopback address
    Loopback,
}

/// Announce a local inference backend on the network
#[derive(Debug, Clone, Deserialize)]
pub struct AdvertiseConfig {
    pub instance: String,
    pub port: u16,
    /// Address to announce; detected from the interfaces when unset
    pub address: Option<String>,
    #[serde(default = "default_advertise_type")]
    pub service_type: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

fn default_service_types() -> Vec<String> {
    vec![AI_SERVICE_TYPE.to_string()]
}

fn default_advertise_type() -> String {
    AI_SERVICE_TYPE.to_string()
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_upstream_timeout() -> u64 {
    60
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_types: default_service_types(),
            interface: None,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: None,
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            upstream_timeout_secs: default_upstream_timeout(),
            credential_env: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;

        if config.discovery.service_types.is_empty() {
            anyhow::bail!("discovery.service_types must name at least one service type");
        }
        if config.registry.sweep_interval_secs == 0 {
            anyhow::bail!("registry.sweep_interval_secs must be greater than zero");
        }

        Ok(config)
    }
}
