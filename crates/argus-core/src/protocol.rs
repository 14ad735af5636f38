//! Typed payloads carried inside envelopes: command requests/responses and
//! the bridge control verbs.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cadence::Cadence;
use crate::envelope::{Envelope, EnvelopeKind};
use crate::errors::ErrorBody;

// ── Control verbs on the `bridge` topic ─────────────────────────────

/// Version/capability exchange; must be the first message on a stream session.
pub const VERB_HELLO: &str = "hello";
/// Subscribe to a topic.
pub const VERB_SUBSCRIBE: &str = "subscribe";
/// Unsubscribe from a topic.
pub const VERB_UNSUBSCRIBE: &str = "unsubscribe";
/// Round-trip check.
pub const VERB_PING: &str = "ping";
/// List topics published by the host.
pub const VERB_TOPICS: &str = "topics";
/// List registered host commands.
pub const VERB_COMMANDS: &str = "commands";
/// Session status (state, queue depth, subscriptions).
pub const VERB_STATUS: &str = "status";

/// Capabilities this build offers during the handshake.
pub const SERVER_CAPABILITIES: &[&str] = &["telemetry", "commands", "cadence.on-change", "cadence.throttled"];

/// `bridge.hello` arguments.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloArgs {
    /// Highest protocol version the client speaks.
    pub version: u32,
    /// Client capabilities.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Optional client name, for logs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
}

/// `bridge.hello` result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloResult {
    /// Assigned session id.
    pub session_id: String,
    /// Trace id attached to the session's logs.
    pub trace_id: String,
    /// Negotiated protocol version.
    pub version: u32,
    /// Capabilities both sides share.
    pub capabilities: Vec<String>,
    /// Expected client heartbeat interval.
    pub heartbeat_interval_ms: u64,
}

/// `bridge.subscribe` arguments.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubscribeArgs {
    /// Topic to subscribe to.
    pub topic: String,
    /// Cadence policy (defaults to every tick).
    #[serde(default)]
    pub cadence: Cadence,
}

/// `bridge.unsubscribe` arguments.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnsubscribeArgs {
    /// Topic to drop.
    pub topic: String,
}

// ── Commands ────────────────────────────────────────────────────────

/// A command request addressed to a host handler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Correlation id.
    pub id: String,
    /// Command topic.
    pub topic: String,
    /// Command verb.
    pub verb: String,
    /// Arguments.
    #[serde(default)]
    pub args: Value,
}

impl CommandRequest {
    /// Build a request.
    pub fn new(
        id: impl Into<String>,
        topic: impl Into<String>,
        verb: impl Into<String>,
        args: Value,
    ) -> Self {
        Self {
            id: id.into(),
            topic: topic.into(),
            verb: verb.into(),
            args,
        }
    }

    /// Extract a request from a command envelope.
    ///
    /// Returns `None` for non-command envelopes or commands without a
    /// topic/verb.
    pub fn from_envelope(envelope: &Envelope) -> Option<Self> {
        if envelope.kind != EnvelopeKind::Command {
            return None;
        }
        Some(Self {
            id: envelope.id.clone(),
            topic: envelope.topic.clone()?,
            verb: envelope.verb.clone()?,
            args: envelope.payload.clone(),
        })
    }

    /// Dotted `topic.verb` name, for logs and metrics.
    pub fn name(&self) -> String {
        format!("{}.{}", self.topic, self.verb)
    }
}

/// Correlated result of one command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Echoed correlation id.
    pub id: String,
    /// Whether the call succeeded.
    pub success: bool,
    /// Result payload (present when `success == true`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error payload (present when `success == false`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl CommandResponse {
    /// Build a success response.
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            success: true,
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response.
    pub fn error(id: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::from_body(id, ErrorBody::new(code, message))
    }

    /// Build an error response from a prepared body.
    pub fn from_body(id: impl Into<String>, body: ErrorBody) -> Self {
        Self {
            id: id.into(),
            success: false,
            result: None,
            error: Some(body),
        }
    }

    /// Error code, if this is a failure.
    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }

    /// Wrap into a `response` envelope. The payload carries
    /// `{success, result?, error?}`.
    pub fn into_envelope(self) -> Envelope {
        let id = self.id.clone();
        let payload = serde_json::to_value(&self).unwrap_or(Value::Null);
        Envelope::response(id, payload)
    }

    /// Parse a `response` envelope.
    pub fn from_envelope(envelope: &Envelope) -> Option<Self> {
        if envelope.kind != EnvelopeKind::Response {
            return None;
        }
        serde_json::from_value(envelope.payload.clone()).ok()
    }
}
