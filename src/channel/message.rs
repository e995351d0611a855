//! Wire types exchanged with the plugin.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sender tag used for messages the simulated host originates.
pub const HOST_SENDER: &str = "host";

/// Signal the plugin posts to its parent to request initialization.
pub const HELLO_SIGNAL: &str = "plugin:hello";
/// Signal the plugin posts once it has processed the init event.
pub const ACK_SIGNAL: &str = "plugin:ack";
/// Type of the init event dispatched into the page.
pub const INIT_EVENT: &str = "host:init";

/// One unit of cross-context communication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventBusMessage {
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub sender: String,
    pub topic: String,
    #[serde(default)]
    pub data: Value,
    /// Present only on request/response exchanges
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default)]
    pub debug: bool,
}

impl EventBusMessage {
    /// Message stamped with the current time.
    pub fn new(topic: impl Into<String>, data: Value, sender: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp_millis(),
            sender: sender.into(),
            topic: topic.into(),
            data,
            event_id: None,
            debug: false,
        }
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }
}

/// Answer to a request-style event, correlated by `eventId`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventResponse {
    pub event_id: String,
    pub topic: String,
    pub data: Value,
    pub timestamp: i64,
}

/// Envelope of everything posted over the dedicated channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelEnvelope {
    Event { event: EventBusMessage },
    Response { response: EventResponse },
}

impl ChannelEnvelope {
    pub fn event(&self) -> Option<&EventBusMessage> {
        match self {
            ChannelEnvelope::Event { event } => Some(event),
            ChannelEnvelope::Response { .. } => None,
        }
    }

    pub fn response(&self) -> Option<&EventResponse> {
        match self {
            ChannelEnvelope::Response { response } => Some(response),
            ChannelEnvelope::Event { .. } => None,
        }
    }
}

/// Handshake message the plugin posts to `window.parent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HandshakeSignal {
    #[serde(rename = "plugin:hello", rename_all = "camelCase")]
    Hello { plugin_id: String },
    #[serde(rename = "plugin:ack")]
    Ack,
}

/// How an inbound channel message is handled.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Carries an `event` field
    Event(EventBusMessage),
    /// Carries an `event` field that does not parse
    Malformed(String),
    /// Anything else
    Other(Value),
}

/// Classify a message the plugin sent over its end of the channel.
pub fn classify_inbound(value: Value) -> Inbound {
    match value.get("event") {
        Some(event) => match serde_json::from_value::<EventBusMessage>(event.clone()) {
            Ok(event) => Inbound::Event(event),
            Err(e) => Inbound::Malformed(e.to_string()),
        },
        None => Inbound::Other(value),
    }
}
