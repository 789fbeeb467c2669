use chrono::NaiveDateTime;
use std::fmt;

/// A message received on one of the subscribed topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: String,
    pub timestamp: NaiveDateTime,
}

impl InboundMessage {
    pub fn from_topic(topic: impl Into<String>, payload: &[u8]) -> Self {
        InboundMessage {
            topic: topic.into(),
            payload: String::from_utf8_lossy(payload).into_owned(),
            timestamp: chrono::Local::now().naive_local(),
        }
    }

    /// Payload shortened to at most `max_chars` characters, for log lines.
    pub fn preview(&self, max_chars: usize) -> String {
        let mut preview: String = self.payload.chars().take(max_chars).collect();
        if self.payload.chars().count() > max_chars {
            preview.push('…');
        }
        preview
    }
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} - {}: {}",
            self.timestamp.format("%H:%M:%S"),
            self.topic,
            self.preview(32)
        )
    }
}
