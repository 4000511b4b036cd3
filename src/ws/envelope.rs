//! Wire envelope and typed request vocabulary.
//!
//! Only the fields needed to judge completeness of the event stream are interpreted here:
//! the sequence counter, the timestamp and the frame type. The body is passed through untouched.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use strum_macros::{AsRefStr, Display};

use super::error::WsError;

/// Event timestamp as reported by the server.
pub type Timestamp = DateTime<Utc>;

/// Counter value the server reserves for the first frame of a logical session.
pub const SESSION_START_COUNTER: u64 = 0;

/// Format a timestamp the way the server expects in request payloads.
#[must_use]
pub fn format_timestamp(timestamp: &Timestamp) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Minimal view of every inbound frame.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Envelope {
    /// Sequence counter for the logical session
    pub counter: Option<u64>,
    pub timestamp: Option<Timestamp>,
    /// Frame type (e.g., `change`, `response`, `signal`)
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, alias = "data")]
    pub body: Value,
}

impl Envelope {
    pub fn parse(text: &str) -> Result<Self, WsError> {
        serde_json::from_str(text).map_err(WsError::MessageParse)
    }

    #[must_use]
    pub fn is_session_start(&self) -> bool {
        self.counter == Some(SESSION_START_COUNTER)
    }
}

/// Protocol-level identifiers of the typed requests this crate issues.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
pub enum Method {
    /// Liveness and gap probe
    #[strum(serialize = "Counter.read")]
    CounterRead,
    #[strum(serialize = "Event.replay")]
    EventReplay,
    #[strum(serialize = "Presence.subscribe")]
    PresenceSubscribe,
    #[strum(serialize = "Presence.update")]
    PresenceUpdate,
    #[strum(serialize = "Presence.sync")]
    PresenceSync,
}

/// A typed request handed to the [`crate::ws::Dispatcher`].
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    pub data: Option<Value>,
}

impl Request {
    #[must_use]
    pub fn new(method: Method, data: Option<Value>) -> Self {
        Self { method, data }
    }

    #[must_use]
    pub fn counter_read() -> Self {
        Self::new(Method::CounterRead, None)
    }

    #[must_use]
    pub fn event_replay(from: &Timestamp) -> Self {
        Self::new(
            Method::EventReplay,
            Some(json!({ "from_timestamp": format_timestamp(from) })),
        )
    }

    #[must_use]
    pub fn presence_subscribe() -> Self {
        Self::new(Method::PresenceSubscribe, None)
    }

    #[must_use]
    pub fn presence_update(operations: &[PresenceOperation]) -> Self {
        Self::new(Method::PresenceUpdate, Some(json!(operations)))
    }

    #[must_use]
    pub fn presence_sync(since: &Timestamp) -> Self {
        Self::new(
            Method::PresenceSync,
            Some(json!({ "since": format_timestamp(since) })),
        )
    }
}

/// A successful reply to a [`Request`].
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub data: Value,
    /// Counter carried by the reply frame itself
    pub counter: Option<u64>,
}

impl Response {
    #[must_use]
    pub fn new(data: Value, counter: Option<u64>) -> Self {
        Self { data, counter }
    }
}

/// One entry of a `Presence.update` payload.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceOperation {
    pub operation: String,
    pub property: String,
    pub value: Value,
}

impl PresenceOperation {
    /// `{operation: "set", property: "status", value: "auto"}`
    #[must_use]
    pub fn auto_status() -> Self {
        Self {
            operation: "set".to_owned(),
            property: "status".to_owned(),
            value: Value::from("auto"),
        }
    }
}

/// Result of a `Counter.read` request.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterReading {
    /// Latest counter the server has assigned in this session
    pub counter: Option<u64>,
    /// Counter of the frame that carried the reply
    pub envelope_counter: Option<u64>,
}

impl From<&Response> for CounterReading {
    fn from(response: &Response) -> Self {
        Self {
            counter: response.data.get("counter").and_then(Value::as_u64),
            envelope_counter: response.counter,
        }
    }
}

/// Body of a fire-and-forget `signal` frame.
#[must_use]
pub fn signal(body: &Value) -> Value {
    json!({ "type": "signal", "body": body })
}
