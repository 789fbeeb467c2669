//! On-disk application configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn, Level};

use crate::mqtt::{
    ConnectionOptions, ConnectionType, EndpointMessage, QualityOfService, RetryPolicy,
    TagSubscription,
};

const CONFIG_DIR: &str = "servicehub";
const CONFIG_FILE: &str = "config.toml";
/// Overrides the config file location
pub const CONFIG_ENV: &str = "SERVICEHUB_CONFIG";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Registry name under which inbound broker messages are recorded
    pub service_name: String,
    pub log_level: String,
    pub broker: BrokerProfile,
    pub retry: RetryPolicy,
    pub subscriptions: Vec<TagSubscription>,
    pub endpoints: Vec<EndpointMessage>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            service_name: "mqtt".into(),
            log_level: "info".into(),
            broker: BrokerProfile::default(),
            retry: RetryPolicy::default(),
            subscriptions: Vec::new(),
            endpoints: Vec::new(),
        }
    }
}

/// Broker settings as stored on disk; certificates are referenced by path.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct BrokerProfile {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub connection_type: ConnectionType,
    pub use_tls: bool,
    pub ca_certificate_path: Option<PathBuf>,
    pub client_certificate_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
    pub keep_alive_secs: u16,
    pub clean_session: bool,
    pub will_topic: Option<String>,
    pub will_payload: Option<String>,
    pub will_qos: QualityOfService,
    pub will_retain: bool,
    pub reconnect_delay_secs: Option<u64>,
}

impl Default for BrokerProfile {
    fn default() -> Self {
        let options = ConnectionOptions::default();
        Self {
            host: options.host,
            port: options.port,
            client_id: options.client_id,
            username: None,
            password: None,
            connection_type: options.connection_type,
            use_tls: options.use_tls,
            ca_certificate_path: None,
            client_certificate_path: None,
            client_key_path: None,
            keep_alive_secs: options.keep_alive_secs,
            clean_session: options.clean_session,
            will_topic: None,
            will_payload: None,
            will_qos: options.will_qos,
            will_retain: options.will_retain,
            reconnect_delay_secs: Some(5),
        }
    }
}

impl BrokerProfile {
    /// Builds the connect options, reading any referenced certificate files.
    pub async fn to_options(&self) -> Result<ConnectionOptions> {
        Ok(ConnectionOptions {
            host: self.host.clone(),
            port: self.port,
            client_id: self.client_id.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            connection_type: self.connection_type,
            use_tls: self.use_tls,
            ca_certificate: read_optional(self.ca_certificate_path.as_deref(), "CA certificate")
                .await?,
            client_certificate: read_optional(
                self.client_certificate_path.as_deref(),
                "client certificate",
            )
            .await?,
            client_key: read_optional(self.client_key_path.as_deref(), "client key").await?,
            keep_alive_secs: self.keep_alive_secs,
            clean_session: self.clean_session,
            will_topic: self.will_topic.clone(),
            will_payload: self.will_payload.clone(),
            will_qos: self.will_qos,
            will_retain: self.will_retain,
            reconnect_delay: self.reconnect_delay_secs.map(Duration::from_secs),
        })
    }
}

async fn read_optional(path: Option<&Path>, what: &str) -> Result<Option<Vec<u8>>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| eyre!("Failed to read {} {}: {}", what, path.display(), e))?;
    debug!("Loaded {} from {}", what, path.display());
    Ok(Some(bytes))
}

impl AppConfig {
    /// `$SERVICEHUB_CONFIG`, or `servicehub/config.toml` in the user's config directory.
    pub fn default_path() -> PathBuf {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return PathBuf::from(path);
        }
        let mut path = dirs::config_dir().unwrap_or_else(|| {
            warn!("Could not determine config directory, using current directory");
            PathBuf::from(".")
        });
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| eyre!("Failed to serialize config: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write config file {}: {}", path.display(), e))
    }

    /// Loads the file at `path`, writing the defaults there first if it does not exist.
    pub async fn load_or_create(path: &Path) -> Result<Self> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?;
        if exists {
            return Self::load(path).await;
        }

        info!("No config at {}, writing defaults", path.display());
        let config = Self::default();
        config.save(path).await?;
        Ok(config)
    }

    /// Configured log level, falling back to `INFO` for unknown names.
    pub fn tracing_level(&self) -> Level {
        self.log_level.parse().unwrap_or(Level::INFO)
    }
}
