//! # argus-core
//!
//! Shared vocabulary for the Argus instrumentation bridge.
//!
//! - **Envelopes**: the single wire message type and its deterministic JSON codec
//! - **Snapshots**: immutable per-topic host values plus the provider trait
//! - **Cadence**: every-tick, throttled and on-change delivery policies
//! - **Protocol**: hello/subscribe payloads, command requests and responses
//! - **Errors**: `BridgeError`, `CommandError`, wire error codes
//! - **Branded IDs**: `SessionId`, `EventId`, `TraceId`, `LocalSinkId`
//! - **Perf**: frame sample tracking with pass/fail gates

#![deny(unsafe_code)]

pub mod cadence;
pub mod codec;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod perf;
pub mod protocol;
pub mod sequence;
pub mod snapshot;

pub use cadence::Cadence;
pub use codec::{
    DecodeError, DecodeFailure, EncodeError, PreEncoded, decode, decode_frame, encode,
    encode_sequenced,
};
pub use envelope::{CONTROL_TOPIC, Envelope, EnvelopeKind, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};
pub use errors::{BridgeError, CommandError, ErrorBody};
pub use ids::{EventId, LocalSinkId, SessionId, TraceId};
pub use protocol::{CommandRequest, CommandResponse};
pub use sequence::{SeqObservation, SequenceTracker};
pub use snapshot::{ContentHash, Snapshot, SnapshotProvider};
