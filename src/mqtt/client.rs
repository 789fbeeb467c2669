//! Broker client collaborator contract.
//!
//! The connectivity manager never speaks MQTT itself. It hands a fully prepared
//! [`ConnectRequest`] to a [`BrokerClient`] and forwards publish/subscribe calls to it.
//! [`super::broker::RumqttcClient`] is the production implementation; tests plug in
//! scripted clients.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::MqttError;

/// Boxed, sendable future returned by [`BrokerClient`] operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// MQTT delivery guarantee.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityOfService {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QualityOfService {
    pub fn level(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for QualityOfService {
    type Error = MqttError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QualityOfService::AtMostOnce),
            1 => Ok(QualityOfService::AtLeastOnce),
            2 => Ok(QualityOfService::ExactlyOnce),
            other => Err(MqttError::InvalidArgument(format!(
                "QoS must be between 0 and 2, got {}",
                other
            ))),
        }
    }
}

impl From<QualityOfService> for rumqttc::QoS {
    fn from(qos: QualityOfService) -> Self {
        match qos {
            QualityOfService::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QualityOfService::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QualityOfService::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

impl fmt::Display for QualityOfService {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "QoS{}", self.level())
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

// Keeps passwords out of logs
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Certificate material attached to a TLS session.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct TlsSettings {
    /// CA certificate (PEM) used to verify the broker; platform roots when absent
    pub ca_certificate: Option<Vec<u8>>,
    /// Client certificate (PEM) for mutual TLS
    pub client_certificate: Option<Vec<u8>>,
    /// Private key (PEM) matching `client_certificate`
    pub client_key: Option<Vec<u8>>,
}

impl fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TlsSettings")
            .field("ca_certificate", &self.ca_certificate.as_ref().map(Vec::len))
            .field(
                "client_certificate",
                &self.client_certificate.as_ref().map(Vec::len),
            )
            .field("client_key", &self.client_key.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Last will the broker publishes when the session ends unexpectedly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WillMessage {
    pub topic: String,
    pub payload: String,
    pub qos: QualityOfService,
    pub retain: bool,
}

/// Everything the broker client needs for one connect attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub credentials: Option<Credentials>,
    pub tls: Option<TlsSettings>,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub last_will: Option<WillMessage>,
}

/// Wire-level primitives the connectivity manager relies on.
///
/// Implementations own the actual network session. `connect` must either establish a
/// session and return `Ok`, or fail with one of `AuthenticationRejected`,
/// `NetworkUnreachable` or `ProtocolError`. Dropping a pending `connect` future must
/// leave the client without a session.
///
/// `publish` and `subscribe` hand the request to the session and return; they must fail
/// rather than wait when the session cannot take it.
pub trait BrokerClient: Send {
    fn connect<'a>(&'a mut self, request: &'a ConnectRequest) -> BoxFuture<'a, Result<(), MqttError>>;

    /// Closes the current session, if any.
    fn disconnect(&mut self) -> BoxFuture<'_, Result<(), MqttError>>;

    fn publish<'a>(
        &'a mut self,
        topic: &'a str,
        payload: String,
        qos: QualityOfService,
        retain: bool,
    ) -> BoxFuture<'a, Result<(), MqttError>>;

    fn subscribe<'a>(
        &'a mut self,
        topic: &'a str,
        qos: QualityOfService,
    ) -> BoxFuture<'a, Result<(), MqttError>>;

    /// Resolves once an established session has been lost without a `disconnect` call.
    ///
    /// Pending forever while no session exists.
    fn session_lost(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(std::future::pending())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_from_level() {
        assert_eq!(
            QualityOfService::try_from(2).unwrap(),
            QualityOfService::ExactlyOnce
        );
        assert!(matches!(
            QualityOfService::try_from(3),
            Err(MqttError::InvalidArgument(_))
        ));
    }

    #[test]
    fn qos_maps_onto_rumqttc() {
        assert_eq!(
            rumqttc::QoS::from(QualityOfService::AtLeastOnce),
            rumqttc::QoS::AtLeastOnce
        );
        assert_eq!(QualityOfService::ExactlyOnce.to_string(), "QoS2");
    }

    #[test]
    fn credentials_debug_hides_password() {
        let creds = Credentials {
            username: "user".into(),
            password: "secret".into(),
        };
        let rendered = format!("{:?}", creds);
        assert!(rendered.contains("user"));
        assert!(!rendered.contains("secret"));
    }
}
