//! In-memory store of the latest message per service.

use dashmap::DashMap;
use tracing::{debug, trace};

use super::{tokens, MessageRouter, RoutingError};

/// Latest-message store shared by all services of the process.
///
/// Backed by a [`DashMap`] so that service threads can read and write concurrently.
/// Concurrent updates of the same name are last-writer-wins; no history is kept and
/// entries live as long as the registry.
#[derive(Debug, Default)]
pub struct TokenRegistry {
    messages: DashMap<String, String>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of services that have reported at least one message.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl MessageRouter for TokenRegistry {
    fn update_message(&self, service_name: &str, message: &str) -> Result<(), RoutingError> {
        if service_name.trim().is_empty() {
            return Err(RoutingError::InvalidArgument(
                "Service name cannot be empty or whitespace".into(),
            ));
        }

        self.messages
            .insert(service_name.to_string(), message.to_string());
        debug!("Updated message for {}", service_name);
        Ok(())
    }

    fn try_get_message(&self, service_name: &str) -> Option<String> {
        self.messages.get(service_name).map(|entry| entry.value().clone())
    }

    fn resolve_tokens(&self, template: &str) -> String {
        let resolved = tokens::resolve_with(template, |name| self.try_get_message(name));
        trace!("Resolved template '{}' to '{}'", template, resolved);
        resolved
    }
}
