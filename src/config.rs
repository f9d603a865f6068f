//! Configuration management for Inkgate.
//!
//! Settings come from an optional YAML file, overlaid by environment
//! variables prefixed with `INKGATE_` (nested keys joined by `__`, e.g.
//! `INKGATE_STORE__URL`).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{InkgateError, Result};
use crate::ratelimit::{default_policies, Policy, PolicyConfig};
use crate::store::RedisStoreConfig;

/// Main configuration for the Inkgate service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InkgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limit policies by name
    #[serde(default = "default_policies")]
    pub policies: BTreeMap<String, PolicyConfig>,
}

impl Default for InkgateConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            store: StoreConfig::default(),
            policies: default_policies(),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Identifier of this process in logs
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            instance_id: default_instance_id(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_instance_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Prefix applied to every bucket key in the store
    #[serde(default = "default_key_namespace")]
    pub key_namespace: String,

    /// Bound on one admission round trip in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Bound on establishing the connection in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            key_namespace: default_key_namespace(),
            timeout_ms: default_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

fn default_store_url() -> String {
    "redis://localhost:6379/0".to_string()
}

fn default_key_namespace() -> String {
    "rate_limit:".to_string()
}

fn default_timeout_ms() -> u64 {
    250
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn redis_config(&self) -> RedisStoreConfig {
        RedisStoreConfig {
            key_namespace: self.key_namespace.clone(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }
}

impl InkgateConfig {
    /// Load configuration from an optional file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(InkgateError::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Yaml));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("INKGATE")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| InkgateError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Validate every configured policy. Any invalid policy is an error.
    pub fn build_policies(&self) -> Result<Vec<Policy>> {
        self.policies
            .iter()
            .map(|(name, policy)| policy.build(name))
            .collect()
    }
}
