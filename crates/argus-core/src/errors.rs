//! Bridge error taxonomy and wire error codes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Error code constants ────────────────────────────────────────────

/// Envelope bytes were truncated or structurally invalid.
pub const MALFORMED_ENVELOPE: &str = "MALFORMED_ENVELOPE";
/// Envelope protocol version is newer than this build understands.
pub const UNSUPPORTED_VERSION: &str = "UNSUPPORTED_VERSION";
/// Version negotiation failed; the connection is closed.
pub const HANDSHAKE_REJECTED: &str = "HANDSHAKE_REJECTED";
/// No handler registered for the `(topic, verb)` pair.
pub const UNKNOWN_COMMAND: &str = "UNKNOWN_COMMAND";
/// The handler did not answer within the command timeout.
pub const COMMAND_TIMEOUT: &str = "COMMAND_TIMEOUT";
/// Command arguments missing or of the wrong shape.
pub const INVALID_ARGS: &str = "INVALID_ARGS";
/// The handler returned a failure.
pub const HANDLER_FAILED: &str = "HANDLER_FAILED";
/// The handler panicked; the panic was contained at the dispatch boundary.
pub const HANDLER_PANICKED: &str = "HANDLER_PANICKED";
/// A request with the same correlation id is still in flight on this session.
pub const DUPLICATE_REQUEST: &str = "DUPLICATE_REQUEST";
/// The topic is not published by the host.
pub const NOT_SUBSCRIBABLE: &str = "NOT_SUBSCRIBABLE";
/// The envelope kind is not accepted in the current session state.
pub const UNEXPECTED_ENVELOPE: &str = "UNEXPECTED_ENVELOPE";
/// The session table is full; the connection was refused.
pub const SESSION_LIMIT: &str = "SESSION_LIMIT";
/// Unexpected internal error.
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";

/// Structured error body carried by `error` envelopes and failed responses.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable error code (e.g. `COMMAND_TIMEOUT`).
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional structured details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorBody {
    /// Build an error body without details.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    /// Attach structured details.
    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Top-level bridge error.
///
/// Per-message variants (`MalformedEnvelope`, `UnsupportedVersion`,
/// `UnknownCommand`, `CommandTimeout`) are isolated to the offending message.
/// `Transport` closes one session. `Configuration` only ever surfaces from
/// startup.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Envelope could not be decoded.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Envelope protocol version is not supported.
    #[error("unsupported protocol version {found} (supported {min}..={max})")]
    UnsupportedVersion {
        /// Version announced by the peer.
        found: u32,
        /// Lowest supported version.
        min: u32,
        /// Highest supported version.
        max: u32,
    },

    /// Handshake failed.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// No handler for the command.
    #[error("unknown command {topic}.{verb}")]
    UnknownCommand {
        /// Command topic.
        topic: String,
        /// Command verb.
        verb: String,
    },

    /// Handler timed out.
    #[error("command {id} timed out after {timeout_ms}ms")]
    CommandTimeout {
        /// Correlation id of the request.
        id: String,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// Transient transport failure.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Fatal configuration or bind error (startup only).
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl BridgeError {
    /// Wire error code for this variant.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedEnvelope(_) => MALFORMED_ENVELOPE,
            Self::UnsupportedVersion { .. } => UNSUPPORTED_VERSION,
            Self::HandshakeRejected(_) => HANDSHAKE_REJECTED,
            Self::UnknownCommand { .. } => UNKNOWN_COMMAND,
            Self::CommandTimeout { .. } => COMMAND_TIMEOUT,
            Self::Transport(_) | Self::Configuration(_) => INTERNAL_ERROR,
        }
    }

    /// Whether the error is fatal to the bridge (startup-only errors).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Convert to the wire-format error body.
    pub fn to_error_body(&self) -> ErrorBody {
        ErrorBody::new(self.code(), self.to_string())
    }
}

/// Result alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Error returned by host command handlers.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// Required argument missing or wrong type.
    #[error("{message}")]
    InvalidArgs {
        /// Description of what is wrong.
        message: String,
    },

    /// The handler ran but failed.
    #[error("{message}")]
    Failed {
        /// Description.
        message: String,
    },

    /// Domain-specific error with arbitrary code.
    #[error("{message}")]
    Custom {
        /// Machine-readable code.
        code: String,
        /// Human-readable message.
        message: String,
        /// Optional structured details.
        details: Option<Value>,
    },
}

impl CommandError {
    /// Shorthand for [`CommandError::InvalidArgs`].
    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::InvalidArgs {
            message: message.into(),
        }
    }

    /// Shorthand for [`CommandError::Failed`].
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    /// Machine-readable error code for this variant.
    pub fn code(&self) -> &str {
        match self {
            Self::InvalidArgs { .. } => INVALID_ARGS,
            Self::Failed { .. } => HANDLER_FAILED,
            Self::Custom { code, .. } => code,
        }
    }

    /// Convert to the wire-format error body.
    pub fn to_error_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code().to_owned(),
            message: self.to_string(),
            details: match self {
                Self::Custom { details, .. } => details.clone(),
                _ => None,
            },
        }
    }
}
