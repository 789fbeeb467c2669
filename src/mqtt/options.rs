//! Connection option snapshot and its translation into a [`ConnectRequest`].
//!
//! Front-ends are expected to validate user input before building a
//! [`ConnectionOptions`], but the manager re-validates at connect time and reports
//! anything out of range as [`MqttError::InvalidArgument`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::client::{ConnectRequest, Credentials, QualityOfService, TlsSettings, WillMessage};
use super::error::MqttError;

/// Longest reconnect delay accepted, in seconds.
pub const MAX_RECONNECT_DELAY_SECS: u64 = 3600;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    #[default]
    Plain,
    Tls,
}

/// Immutable per-call snapshot of everything needed to establish a broker session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub connection_type: ConnectionType,
    pub use_tls: bool,
    pub ca_certificate: Option<Vec<u8>>,
    /// Only used when TLS is requested
    pub client_certificate: Option<Vec<u8>>,
    pub client_key: Option<Vec<u8>>,
    pub keep_alive_secs: u16,
    pub clean_session: bool,
    pub will_topic: Option<String>,
    pub will_payload: Option<String>,
    pub will_qos: QualityOfService,
    pub will_retain: bool,
    /// Present: failed connects are retried. Absent: a single attempt.
    pub reconnect_delay: Option<Duration>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: "client1".into(),
            username: None,
            password: None,
            connection_type: ConnectionType::Plain,
            use_tls: false,
            ca_certificate: None,
            client_certificate: None,
            client_key: None,
            keep_alive_secs: 60,
            clean_session: true,
            will_topic: None,
            will_payload: None,
            will_qos: QualityOfService::AtMostOnce,
            will_retain: false,
            reconnect_delay: None,
        }
    }
}

impl ConnectionOptions {
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            ..Default::default()
        }
    }

    pub fn with_will(
        mut self,
        topic: impl Into<String>,
        payload: impl Into<String>,
        qos: QualityOfService,
        retain: bool,
    ) -> Self {
        self.will_topic = Some(topic.into());
        self.will_payload = Some(payload.into());
        self.will_qos = qos;
        self.will_retain = retain;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = Some(delay);
        self
    }

    /// Whether the session runs over TLS, by either switch.
    pub fn tls_requested(&self) -> bool {
        self.use_tls || self.connection_type == ConnectionType::Tls
    }

    pub fn validate(&self) -> Result<(), MqttError> {
        if self.host.trim().is_empty() {
            return Err(invalid("Host cannot be empty or whitespace"));
        }
        if self.port == 0 {
            return Err(invalid("Port must be between 1 and 65535"));
        }
        if self.client_id.trim().is_empty() {
            return Err(invalid("Client id cannot be empty or whitespace"));
        }
        if self.password.is_some() && !has_text(&self.username) {
            return Err(invalid("A password requires a username"));
        }

        if let Some(topic) = &self.will_topic {
            if topic.trim().is_empty() {
                return Err(invalid("Will topic cannot be empty or whitespace"));
            }
            if topic.contains(&['+', '#'][..]) {
                return Err(invalid("Will topic cannot contain wildcards"));
            }
        }

        if self.tls_requested() && self.client_certificate.is_some() {
            if self.client_key.is_none() {
                return Err(invalid("A client certificate requires a client key"));
            }
            if self.ca_certificate.is_none() {
                return Err(invalid(
                    "Client certificate authentication requires a CA certificate",
                ));
            }
        }

        if let Some(delay) = self.reconnect_delay {
            if delay > Duration::from_secs(MAX_RECONNECT_DELAY_SECS) {
                return Err(invalid(format!(
                    "Reconnect delay must be at most {} seconds",
                    MAX_RECONNECT_DELAY_SECS
                )));
            }
        }

        Ok(())
    }

    /// Validates the options and builds the request handed to the broker client.
    pub fn connect_request(&self) -> Result<ConnectRequest, MqttError> {
        self.validate()?;

        let credentials = self
            .username
            .as_ref()
            .filter(|user| !user.is_empty())
            .map(|user| Credentials {
                username: user.clone(),
                password: self.password.clone().unwrap_or_default(),
            });

        let tls = if self.tls_requested() {
            Some(TlsSettings {
                ca_certificate: self.ca_certificate.clone(),
                client_certificate: self.client_certificate.clone(),
                client_key: self.client_key.clone(),
            })
        } else {
            if self.client_certificate.is_some() {
                debug!("Client certificate ignored, TLS not requested");
            }
            None
        };

        let last_will = self.will_topic.as_ref().map(|topic| WillMessage {
            topic: topic.clone(),
            payload: self.will_payload.clone().unwrap_or_default(),
            qos: self.will_qos,
            retain: self.will_retain,
        });

        Ok(ConnectRequest {
            host: self.host.trim().to_string(),
            port: self.port,
            client_id: self.client_id.trim().to_string(),
            credentials,
            tls,
            keep_alive: Duration::from_secs(u64::from(self.keep_alive_secs)),
            clean_session: self.clean_session,
            last_will,
        })
    }
}

fn has_text(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

fn invalid(msg: impl Into<String>) -> MqttError {
    MqttError::InvalidArgument(msg.into())
}
