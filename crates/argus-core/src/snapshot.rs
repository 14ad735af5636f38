//! Host snapshots and the provider capability the bridge consumes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// An immutable, timestamped value for one topic at one logical tick.
///
/// The bridge never mutates a snapshot; it hashes, serializes and forwards
/// it, then drops it at the end of the scheduling pass.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Topic this snapshot belongs to.
    pub topic: String,
    /// Host logical tick the snapshot was taken at.
    pub tick: u64,
    /// Wall-clock capture time.
    pub taken_at: DateTime<Utc>,
    /// Snapshot content.
    pub value: Value,
}

impl Snapshot {
    /// Capture a snapshot now.
    pub fn new(topic: impl Into<String>, tick: u64, value: Value) -> Self {
        Self {
            topic: topic.into(),
            tick,
            taken_at: Utc::now(),
            value,
        }
    }

    /// SHA-256 of the canonical JSON encoding of `value`.
    ///
    /// Metadata (tick, capture time) is excluded so that an unchanged value
    /// at a later tick hashes identically.
    pub fn content_hash(&self) -> ContentHash {
        let mut hasher = Sha256::new();
        // Serializing a `Value` into an in-memory hasher cannot fail.
        let _ = serde_json::to_writer(&mut hasher, &self.value);
        ContentHash(hasher.finalize().into())
    }

    /// Telemetry payload for this snapshot.
    pub fn to_payload(&self) -> Value {
        serde_json::json!({
            "tick": self.tick,
            "takenAt": self.taken_at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            "value": self.value,
        })
    }
}

/// Content digest used by on-change cadence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Host capability: produce a snapshot for a topic on demand.
///
/// Called from the host's own tick, at most once per topic per scheduling
/// pass. Implementations must be non-blocking or bounded-latency.
pub trait SnapshotProvider: Send + Sync {
    /// Topics the host can publish.
    fn topics(&self) -> Vec<String>;

    /// Take a snapshot of `topic` at `tick`. `None` means the topic has
    /// nothing to publish this tick.
    fn snapshot(&self, topic: &str, tick: u64) -> Option<Snapshot>;
}
