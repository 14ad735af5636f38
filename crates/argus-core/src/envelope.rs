//! Wire envelope: one discrete message between the bridge and a peer.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ErrorBody;
use crate::ids::EventId;

/// Highest protocol version this build understands.
pub const PROTOCOL_VERSION: u32 = 1;

/// Lowest protocol version this build still accepts.
pub const MIN_PROTOCOL_VERSION: u32 = 1;

/// Reserved topic for bridge control verbs (`hello`, `subscribe`, ...).
pub const CONTROL_TOPIC: &str = "bridge";

/// Envelope kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    /// Server-pushed snapshot of a topic.
    Telemetry,
    /// Client request addressed to `(topic, verb)`.
    Command,
    /// Correlated answer to a command.
    Response,
    /// Liveness signal (either direction).
    Heartbeat,
    /// Protocol-level error not tied to a successful command.
    Error,
}

impl EnvelopeKind {
    /// Telemetry may be dropped under backpressure; everything else may not.
    pub fn is_lossy(self) -> bool {
        matches!(self, Self::Telemetry)
    }

    /// Lowercase wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Telemetry => "telemetry",
            Self::Command => "command",
            Self::Response => "response",
            Self::Heartbeat => "heartbeat",
            Self::Error => "error",
        }
    }
}

/// One wire message.
///
/// Field order here is the encoding order; do not reorder.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version.
    #[serde(rename = "v")]
    pub version: u32,
    /// Opaque correlation token.
    pub id: String,
    /// Message kind.
    pub kind: EnvelopeKind,
    /// Topic (telemetry and commands).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// Command verb.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verb: Option<String>,
    /// Opaque payload.
    #[serde(default)]
    pub payload: Value,
    /// Per-session sequence number, stamped on admission to the outbound
    /// queue. Inbound client envelopes may leave it at zero.
    #[serde(default)]
    pub seq: u64,
}

impl Envelope {
    fn base(id: impl Into<String>, kind: EnvelopeKind, payload: Value) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            id: id.into(),
            kind,
            topic: None,
            verb: None,
            payload,
            seq: 0,
        }
    }

    /// Telemetry envelope for a topic.
    pub fn telemetry(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: Some(topic.into()),
            ..Self::base(EventId::new(), EnvelopeKind::Telemetry, payload)
        }
    }

    /// Command envelope addressed to `(topic, verb)`.
    pub fn command(
        id: impl Into<String>,
        topic: impl Into<String>,
        verb: impl Into<String>,
        args: Value,
    ) -> Self {
        Self {
            topic: Some(topic.into()),
            verb: Some(verb.into()),
            ..Self::base(id, EnvelopeKind::Command, args)
        }
    }

    /// Control command on the reserved `bridge` topic.
    pub fn control(id: impl Into<String>, verb: impl Into<String>, args: Value) -> Self {
        Self::command(id, CONTROL_TOPIC, verb, args)
    }

    /// Response envelope with an arbitrary payload.
    pub fn response(id: impl Into<String>, payload: Value) -> Self {
        Self::base(id, EnvelopeKind::Response, payload)
    }

    /// Heartbeat envelope with a fresh id.
    pub fn heartbeat() -> Self {
        Self::base(EventId::new(), EnvelopeKind::Heartbeat, Value::Null)
    }

    /// Error envelope correlated to `id`.
    pub fn error(id: impl Into<String>, body: &ErrorBody) -> Self {
        let payload = serde_json::to_value(body).unwrap_or(Value::Null);
        Self::base(id, EnvelopeKind::Error, payload)
    }

    /// Set the sequence number.
    #[must_use]
    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    /// Whether this is a command on the reserved control topic.
    pub fn is_control(&self) -> bool {
        self.kind == EnvelopeKind::Command && self.topic.as_deref() == Some(CONTROL_TOPIC)
    }

    /// Decode the error body of an `error` envelope.
    pub fn error_body(&self) -> Option<ErrorBody> {
        if self.kind != EnvelopeKind::Error {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn telemetry_has_topic_and_fresh_id() {
        let a = Envelope::telemetry("health", json!({"ok": true}));
        let b = Envelope::telemetry("health", json!({"ok": true}));
        assert_eq!(a.kind, EnvelopeKind::Telemetry);
        assert_eq!(a.topic.as_deref(), Some("health"));
        assert!(a.id.starts_with("evt_"));
        assert_ne!(a.id, b.id);
        assert_eq!(a.version, PROTOCOL_VERSION);
    }

    #[test]
    fn command_addresses_topic_and_verb() {
        let env = Envelope::command("c1", "scene", "spawn", json!({"n": 3}));
        assert_eq!(env.topic.as_deref(), Some("scene"));
        assert_eq!(env.verb.as_deref(), Some("spawn"));
        assert!(!env.is_control());
        assert!(Envelope::control("c2", "ping", Value::Null).is_control());
    }

    #[test]
    fn only_telemetry_is_lossy() {
        assert!(EnvelopeKind::Telemetry.is_lossy());
        for kind in [
            EnvelopeKind::Command,
            EnvelopeKind::Response,
            EnvelopeKind::Heartbeat,
            EnvelopeKind::Error,
        ] {
            assert!(!kind.is_lossy(), "{kind:?}");
        }
    }

    #[test]
    fn error_envelope_roundtrips_body() {
        let body = ErrorBody::new("COMMAND_TIMEOUT", "too slow");
        let env = Envelope::error("c9", &body);
        assert_eq!(env.error_body(), Some(body));
        assert!(Envelope::heartbeat().error_body().is_none());
    }

    #[test]
    fn kind_serializes_lowercase() {
        let json = serde_json::to_string(&EnvelopeKind::Heartbeat).unwrap();
        assert_eq!(json, "\"heartbeat\"");
        assert_eq!(EnvelopeKind::Heartbeat.as_str(), "heartbeat");
    }

    #[test]
    fn missing_optional_fields_default() {
        let env: Envelope =
            serde_json::from_str(r#"{"v":1,"id":"h1","kind":"heartbeat"}"#).unwrap();
        assert_eq!(env.payload, Value::Null);
        assert_eq!(env.seq, 0);
        assert!(env.topic.is_none());
    }
}
