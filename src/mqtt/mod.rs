//! # Messaging Connectivity
//!
//! Everything between the front-ends and the MQTT broker: connection options, the
//! retry schedule, the connectivity manager that owns the single broker session, and
//! the `rumqttc` client it drives.
//!
//! ```text
//! mqtt/
//! ├── options.rs  - ConnectionOptions snapshot and validation
//! ├── backoff.rs  - RetryPolicy and capped exponential Backoff
//! ├── manager.rs  - ConnectivityHandle and the worker owning the session
//! ├── client.rs   - BrokerClient contract, QoS and request types
//! ├── broker.rs   - RumqttcClient, the production BrokerClient
//! ├── publish.rs  - Endpoint/message batching, tag subscriptions
//! ├── message.rs  - Messages received on subscribed topics
//! └── error.rs    - MqttError
//! ```
//!
//! Payload templates are resolved against a [`crate::routing::MessageRouter`] at
//! publish time; topics are sent as given.

pub mod backoff;
pub mod broker;
pub mod client;
pub mod error;
pub mod manager;
pub mod message;
pub mod options;
pub mod publish;

pub use backoff::RetryPolicy;
pub use broker::RumqttcClient;
pub use client::{BrokerClient, ConnectRequest, QualityOfService};
pub use error::MqttError;
pub use manager::{ConnectionEvent, ConnectionState, ConnectivityHandle};
pub use message::InboundMessage;
pub use options::{ConnectionOptions, ConnectionType};
pub use publish::{
    batch_endpoint_messages, batch_outgoing_messages, EndpointMessage, TagSubscription,
};
