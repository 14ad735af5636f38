//! Envelope codec: JSON bytes in, typed envelopes out.
//!
//! Encoding is deterministic. Struct fields serialize in declaration order
//! and JSON objects inside payloads serialize with sorted keys, so two equal
//! envelopes always produce byte-identical output.
//!
//! Decoding never panics and never poisons a stream: every failure is a
//! [`DecodeError`] scoped to the single message, which the caller drops.

use serde::Serialize;
use serde_json::Value;

use crate::envelope::{Envelope, EnvelopeKind, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};
use crate::errors::{BridgeError, ErrorBody, MALFORMED_ENVELOPE, UNSUPPORTED_VERSION};

/// Decode failure for one message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Truncated or structurally invalid envelope.
    #[error("malformed envelope: {0}")]
    Malformed(String),
    /// The envelope announces a protocol version this build cannot read.
    #[error(
        "unsupported protocol version {found} (supported {min}..={max})",
        min = MIN_PROTOCOL_VERSION,
        max = PROTOCOL_VERSION
    )]
    UnsupportedVersion {
        /// Version found in the envelope.
        found: u64,
    },
}

impl DecodeError {
    /// Wire error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Malformed(_) => MALFORMED_ENVELOPE,
            Self::UnsupportedVersion { .. } => UNSUPPORTED_VERSION,
        }
    }

    /// Wire error body.
    pub fn to_error_body(&self) -> ErrorBody {
        ErrorBody::new(self.code(), self.to_string())
    }
}

impl From<DecodeError> for BridgeError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::Malformed(msg) => Self::MalformedEnvelope(msg),
            DecodeError::UnsupportedVersion { found } => Self::UnsupportedVersion {
                found: u32::try_from(found).unwrap_or(u32::MAX),
                min: MIN_PROTOCOL_VERSION,
                max: PROTOCOL_VERSION,
            },
        }
    }
}

/// Encoding failure (only possible for payloads that are not valid JSON
/// values, which `serde_json::Value` rules out in practice).
#[derive(Debug, thiserror::Error)]
#[error("failed to encode envelope: {0}")]
pub struct EncodeError(#[from] serde_json::Error);

/// Borrowed view of an envelope with an overridden sequence number.
///
/// Mirrors [`Envelope`] field-for-field so the output is byte-identical to
/// encoding an owned envelope with the same `seq`.
#[derive(Serialize)]
struct SequencedRef<'a> {
    #[serde(rename = "v")]
    version: u32,
    id: &'a str,
    kind: EnvelopeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    topic: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    verb: Option<&'a str>,
    payload: &'a Value,
    seq: u64,
}

/// Encode an envelope to JSON bytes.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, EncodeError> {
    Ok(serde_json::to_vec(envelope)?)
}

/// Encode a shared envelope with a per-session sequence number, without
/// cloning it.
pub fn encode_sequenced(envelope: &Envelope, seq: u64) -> Result<Vec<u8>, EncodeError> {
    let view = SequencedRef {
        version: envelope.version,
        id: &envelope.id,
        kind: envelope.kind,
        topic: envelope.topic.as_deref(),
        verb: envelope.verb.as_deref(),
        payload: &envelope.payload,
        seq,
    };
    Ok(serde_json::to_vec(&view)?)
}

/// Decode JSON bytes into an envelope.
///
/// The version field is probed before the full structure is validated, so a
/// newer peer whose envelope shape changed still gets `UnsupportedVersion`
/// rather than a generic parse failure.
pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    if !value.is_object() {
        return Err(DecodeError::Malformed("envelope must be a JSON object".into()));
    }
    if let Some(found) = value.get("v").and_then(Value::as_u64) {
        if found > u64::from(PROTOCOL_VERSION) || found < u64::from(MIN_PROTOCOL_VERSION) {
            return Err(DecodeError::UnsupportedVersion { found });
        }
    }
    serde_json::from_value(value).map_err(|e| DecodeError::Malformed(e.to_string()))
}

/// Decode a UTF-8 text frame.
pub fn decode_str(text: &str) -> Result<Envelope, DecodeError> {
    decode(text.as_bytes())
}

/// A decode failure plus the correlation id, when one could be recovered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{error}")]
pub struct DecodeFailure {
    /// `id` field of the rejected message, if it was readable.
    pub id: Option<String>,
    /// Why the message was rejected.
    pub error: DecodeError,
}

impl DecodeFailure {
    /// Error envelope answering the rejected message, if it had an id.
    pub fn to_error_envelope(&self) -> Option<Envelope> {
        self.id
            .as_ref()
            .map(|id| Envelope::error(id.clone(), &self.error.to_error_body()))
    }
}

/// Decode one frame, keeping the correlation id on failure so the caller
/// can answer the sender.
pub fn decode_frame(bytes: &[u8]) -> Result<Envelope, DecodeFailure> {
    decode(bytes).map_err(|error| DecodeFailure {
        id: probe_id(bytes),
        error,
    })
}

/// Best-effort extraction of the `id` field from raw bytes.
pub fn probe_id(bytes: &[u8]) -> Option<String> {
    #[derive(serde::Deserialize)]
    struct IdOnly {
        id: String,
    }
    serde_json::from_slice::<IdOnly>(bytes).ok().map(|v| v.id)
}

/// An envelope serialized once, ready to be stamped with any number of
/// per-session sequence numbers.
///
/// `seq` is the last encoded field, so the body up to and including
/// `"seq":` is shared and each session only appends its number and the
/// closing brace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreEncoded {
    head: Vec<u8>,
    kind: EnvelopeKind,
}

impl PreEncoded {
    /// Serialize `envelope` once. Its own `seq` is ignored.
    pub fn new(envelope: &Envelope) -> Result<Self, EncodeError> {
        let mut head = encode_sequenced(envelope, 0)?;
        // Strip the trailing `0}`.
        debug_assert!(head.ends_with(b"\"seq\":0}"));
        head.truncate(head.len().saturating_sub(2));
        Ok(Self {
            head,
            kind: envelope.kind,
        })
    }

    /// Kind of the encoded envelope.
    pub fn kind(&self) -> EnvelopeKind {
        self.kind
    }

    /// Encoded bytes for sequence number `seq`.
    pub fn with_seq(&self, seq: u64) -> Vec<u8> {
        let digits = seq.to_string();
        let mut out = Vec::with_capacity(self.head.len() + digits.len() + 1);
        out.extend_from_slice(&self.head);
        out.extend_from_slice(digits.as_bytes());
        out.push(b'}');
        out
    }
}
