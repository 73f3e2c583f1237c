//! Agent configuration.

use anyhow::{bail, Context, Result};
use devpoll_core::{DeviceSettings, PointId};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Gateway configuration
    pub gateway: GatewayConfig,

    /// Persistence configuration
    pub persistence: PersistenceConfig,

    /// Devices to create on startup if not already persisted
    pub devices: Vec<DeviceSeed>,

    /// Capacity of the point update channel
    pub update_buffer: usize,
}

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Gateway base URL
    pub url: String,

    /// Bearer token for authentication
    pub bearer_token: Option<String>,

    /// Request timeout
    pub timeout: Duration,

    /// Custom CA certificate (PEM)
    pub ca_cert_path: Option<PathBuf>,

    /// Client certificate for mTLS (PEM)
    pub client_cert_path: Option<PathBuf>,

    /// Client key for mTLS (PEM)
    pub client_key_path: Option<PathBuf>,

    /// Consecutive transport failures after which the gateway is deemed lost
    pub max_transport_failures: u32,
}

/// Persistence configuration.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Persistence type: "sqlite" or "memory"
    pub store_type: String,

    /// Database path (for SQLite)
    pub db_path: PathBuf,
}

/// A device declared in configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceSeed {
    /// Device settings
    #[serde(flatten)]
    pub settings: DeviceSettings,

    /// Points to register under the device
    #[serde(default)]
    pub points: Vec<PointId>,

    /// Points to subscribe to once the device is up
    #[serde(default)]
    pub subscribe: Vec<PointId>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig {
                url: "http://localhost:8090/api".to_string(),
                bearer_token: None,
                timeout: Duration::from_secs(10),
                ca_cert_path: None,
                client_cert_path: None,
                client_key_path: None,
                max_transport_failures: 5,
            },
            persistence: PersistenceConfig {
                store_type: "sqlite".to_string(),
                db_path: PathBuf::from("./devpoll.db"),
            },
            devices: Vec::new(),
            update_buffer: 1024,
        }
    }
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `DEVPOLL_GATEWAY_URL`: Gateway base URL
    /// - `DEVPOLL_BEARER_TOKEN`: Bearer token
    /// - `DEVPOLL_REQUEST_TIMEOUT_SECS`: Gateway request timeout
    /// - `DEVPOLL_CA_CERT`, `DEVPOLL_CLIENT_CERT`, `DEVPOLL_CLIENT_KEY`: TLS files
    /// - `DEVPOLL_MAX_TRANSPORT_FAILURES`: Failures before the gateway is deemed lost
    /// - `DEVPOLL_STORE`: "sqlite" or "memory"
    /// - `DEVPOLL_DB_PATH`: SQLite database path
    /// - `DEVPOLL_UPDATE_BUFFER`: Point update channel capacity
    /// - `DEVPOLL_DEVICES`: JSON array of device seeds
    ///
    /// # Errors
    ///
    /// Returns error if a variable is present but malformed.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns error if a variable is present but malformed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(url) = lookup("DEVPOLL_GATEWAY_URL") {
            config.gateway.url = url;
        }

        if let Some(token) = lookup("DEVPOLL_BEARER_TOKEN") {
            config.gateway.bearer_token = Some(token);
        }

        if let Some(secs) = lookup("DEVPOLL_REQUEST_TIMEOUT_SECS") {
            let secs: u64 = secs
                .parse()
                .context("Invalid DEVPOLL_REQUEST_TIMEOUT_SECS")?;
            config.gateway.timeout = Duration::from_secs(secs);
        }

        config.gateway.ca_cert_path = lookup("DEVPOLL_CA_CERT").map(PathBuf::from);
        config.gateway.client_cert_path = lookup("DEVPOLL_CLIENT_CERT").map(PathBuf::from);
        config.gateway.client_key_path = lookup("DEVPOLL_CLIENT_KEY").map(PathBuf::from);

        if let Some(max) = lookup("DEVPOLL_MAX_TRANSPORT_FAILURES") {
            config.gateway.max_transport_failures = max
                .parse()
                .context("Invalid DEVPOLL_MAX_TRANSPORT_FAILURES")?;
            if config.gateway.max_transport_failures == 0 {
                bail!("DEVPOLL_MAX_TRANSPORT_FAILURES must be positive");
            }
        }

        if let Some(store_type) = lookup("DEVPOLL_STORE") {
            match store_type.as_str() {
                "sqlite" | "memory" => config.persistence.store_type = store_type,
                other => bail!("Invalid DEVPOLL_STORE: {other} (expected sqlite or memory)"),
            }
        }

        if let Some(db_path) = lookup("DEVPOLL_DB_PATH") {
            config.persistence.db_path = PathBuf::from(db_path);
        }

        if let Some(buffer) = lookup("DEVPOLL_UPDATE_BUFFER") {
            config.update_buffer = buffer.parse().context("Invalid DEVPOLL_UPDATE_BUFFER")?;
            if config.update_buffer == 0 {
                bail!("DEVPOLL_UPDATE_BUFFER must be positive");
            }
        }

        // Parse device seeds from JSON env var
        if let Some(devices_json) = lookup("DEVPOLL_DEVICES") {
            config.devices =
                serde_json::from_str(&devices_json).context("Invalid DEVPOLL_DEVICES JSON")?;
        }

        Ok(config)
    }
}
