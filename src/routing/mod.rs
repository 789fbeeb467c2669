//! # Cross-Service Message Routing
//!
//! Lets independently configured services talk to each other by name. Every service
//! records its latest output in a shared [`TokenRegistry`]; any other service can then
//! embed `{<name>.Message}` placeholders in its own payloads and have them replaced with
//! that output right before sending.
//!
//! ```text
//! TCP service ──update_message("tcp", ..)──► TokenRegistry ◄──resolve_tokens(..)── MQTT publish
//! ```
//!
//! The registry is an ordinary value owned by the application's composition root and
//! handed out as `Arc<TokenRegistry>` (or `Arc<dyn MessageRouter>`), never a global.

pub mod registry;
pub mod tokens;

pub use registry::TokenRegistry;

use thiserror::Error;

/// Errors raised by the routing layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// Service names must contain at least one non-whitespace character
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Message storage and token resolution shared between services.
///
/// Implemented by [`TokenRegistry`]; the connectivity manager only depends on this trait.
pub trait MessageRouter: Send + Sync {
    /// Stores `message` as the latest output of `service_name`, replacing any previous value.
    fn update_message(&self, service_name: &str, message: &str) -> Result<(), RoutingError>;

    /// Returns the latest message recorded for `service_name`, if any.
    fn try_get_message(&self, service_name: &str) -> Option<String>;

    /// Replaces every `{<name>.Message}` token in `template` with the latest message of `<name>`.
    fn resolve_tokens(&self, template: &str) -> String;
}
