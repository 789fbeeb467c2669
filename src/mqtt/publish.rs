//! Request shapes used by the publish/subscribe front-ends.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::client::QualityOfService;

/// A topic paired with a payload template, as collected by the publish front-end.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointMessage {
    pub endpoint: String,
    pub message: String,
}

impl EndpointMessage {
    pub fn new(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }
}

/// A topic filter the subscription front-end wants to follow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagSubscription {
    pub topic: String,
    #[serde(default)]
    pub qos: QualityOfService,
    /// Test payload template published to the tag's topic
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub outgoing_message: String,
}

impl TagSubscription {
    pub fn new(topic: impl Into<String>, qos: QualityOfService) -> Self {
        Self {
            topic: topic.into(),
            qos,
            outgoing_message: String::new(),
        }
    }

    pub fn with_outgoing_message(mut self, message: impl Into<String>) -> Self {
        self.outgoing_message = message.into();
        self
    }
}

/// Groups endpoint/message pairs by topic, keeping the order of messages per topic.
///
/// Pairs with a blank endpoint are dropped.
pub fn batch_endpoint_messages(pairs: &[EndpointMessage]) -> HashMap<String, Vec<String>> {
    let mut batch: HashMap<String, Vec<String>> = HashMap::new();
    for pair in pairs.iter().filter(|p| !p.endpoint.trim().is_empty()) {
        batch
            .entry(pair.endpoint.clone())
            .or_default()
            .push(pair.message.clone());
    }
    batch
}

/// Test payloads of all tags that carry one, grouped by topic.
///
/// Wildcard filters cannot be published to and are skipped.
pub fn batch_outgoing_messages(tags: &[TagSubscription]) -> HashMap<String, Vec<String>> {
    let pairs: Vec<EndpointMessage> = tags
        .iter()
        .filter(|tag| !tag.outgoing_message.is_empty())
        .filter(|tag| !tag.topic.contains(&['+', '#'][..]))
        .map(|tag| EndpointMessage::new(tag.topic.clone(), tag.outgoing_message.clone()))
        .collect();
    batch_endpoint_messages(&pairs)
}
