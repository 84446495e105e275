//! Events fanned out to downstream subscribers.
//!
//! Upstream events come from the supervised process's event stream;
//! synthetic events are injected by internal producers (the auth broker,
//! the aggregator's own terminal notice). The aggregator stamps `context`
//! and `seq` at delivery time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Well-known synthetic event kinds.
pub mod kinds {
    /// Terminal: the upstream subscription could not be re-established.
    pub const UPSTREAM_LOST: &str = "upstream.lost";
    pub const AUTH_PROMPT: &str = "auth.prompt";
    pub const AUTH_RESOLVED: &str = "auth.resolved";
    pub const AUTH_TIMEOUT: &str = "auth.timeout";
    pub const AUTH_CANCELLED: &str = "auth.cancelled";
}

/// Where an event entered the fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOrigin {
    Upstream,
    Synthetic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Per-context delivery sequence, starting at 1.
    pub seq: u64,
    pub context: String,
    pub kind: String,
    pub origin: EventOrigin,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl StreamEvent {
    fn new(origin: EventOrigin, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            seq: 0,
            context: String::new(),
            kind: kind.into(),
            origin,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn upstream(kind: impl Into<String>, payload: Value) -> Self {
        Self::new(EventOrigin::Upstream, kind, payload)
    }

    pub fn synthetic(kind: impl Into<String>, payload: Value) -> Self {
        Self::new(EventOrigin::Synthetic, kind, payload)
    }

    /// Terminal notice sent to every subscriber before the context is closed.
    pub fn upstream_lost(reason: &str, attempts: u32) -> Self {
        Self::synthetic(
            kinds::UPSTREAM_LOST,
            serde_json::json!({ "reason": reason, "attempts": attempts }),
        )
    }

    /// Build an upstream event from a raw data line.
    ///
    /// JSON payloads carrying a string `type` field use it as the kind;
    /// otherwise the transport-level event name (or `message`) is used.
    pub fn from_upstream_data(event_name: Option<&str>, data: &str) -> Self {
        let payload = serde_json::from_str::<Value>(data)
            .unwrap_or_else(|_| Value::String(data.to_string()));
        let kind = payload
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| event_name.filter(|n| !n.is_empty()).map(str::to_string))
            .unwrap_or_else(|| "message".to_string());
        Self::upstream(kind, payload)
    }

    pub fn is_terminal(&self) -> bool {
        self.kind == kinds::UPSTREAM_LOST
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_kind_prefers_payload_type() {
        let ev = StreamEvent::from_upstream_data(
            Some("message"),
            r#"{"type":"session.updated","properties":{"id":"s1"}}"#,
        );
        assert_eq!(ev.kind, "session.updated");
        assert_eq!(ev.origin, EventOrigin::Upstream);
        assert_eq!(ev.payload["properties"]["id"], "s1");
    }

    #[test]
    fn non_json_data_is_kept_as_string() {
        let ev = StreamEvent::from_upstream_data(Some("ping"), "hello");
        assert_eq!(ev.kind, "ping");
        assert_eq!(ev.payload, Value::String("hello".into()));

        let ev = StreamEvent::from_upstream_data(None, "[1,2]");
        assert_eq!(ev.kind, "message");
    }

    #[test]
    fn upstream_lost_is_terminal() {
        let ev = StreamEvent::upstream_lost("connection refused", 5);
        assert!(ev.is_terminal());
        assert_eq!(ev.origin, EventOrigin::Synthetic);
        assert_eq!(ev.payload["attempts"], 5);
        assert!(!StreamEvent::synthetic(kinds::AUTH_PROMPT, Value::Null).is_terminal());
    }
}
