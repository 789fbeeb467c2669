//! Error taxonomy for broker interaction.

use thiserror::Error;

use crate::routing::RoutingError;

/// Failure reasons surfaced by the connectivity manager and its broker client.
///
/// `InvalidArgument` and `NotConnected` are reported immediately and never retried.
/// The three connect failures come from the broker client; only they are subject to the
/// reconnect policy (and `AuthenticationRejected` not even then).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MqttError {
    /// Malformed option or request argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Publish or subscribe attempted while no session is established
    #[error("Not connected to a broker")]
    NotConnected,

    /// The broker refused the supplied identity or credentials
    #[error("Authentication rejected: {0}")]
    AuthenticationRejected(String),

    /// The broker could not be reached or did not answer in time
    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),

    /// TLS, protocol version or packet level failure
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// The caller aborted the connect or its retry wait
    #[error("Operation cancelled")]
    Cancelled,

    /// The broker client rejected a publish or subscribe request
    #[error("Transfer error: {0}")]
    Transfer(String),

    /// The manager task is gone or dropped the request
    #[error("Channel error: {0}")]
    ChannelError(String),
}

impl MqttError {
    /// Whether a failed connect attempt with this error may be repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MqttError::NetworkUnreachable(_) | MqttError::ProtocolError(_)
        )
    }
}

impl From<RoutingError> for MqttError {
    fn from(err: RoutingError) -> Self {
        match err {
            RoutingError::InvalidArgument(msg) => MqttError::InvalidArgument(msg),
        }
    }
}
