//! Branded ID newtypes.
//!
//! Sessions, server-generated envelopes and traces each get a distinct
//! newtype around `String` so one can never be passed where another is
//! expected. Generated IDs are a short prefix plus a UUID v7 (time-ordered),
//! which keeps them unique for the lifetime of the process and sortable in
//! logs.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// ID prefix used by [`Self::new`].
            pub const PREFIX: &'static str = $prefix;

            /// Create a new random ID (prefix + UUID v7).
            #[must_use]
            pub fn new() -> Self {
                Self(format!("{}{}", $prefix, Uuid::now_v7().simple()))
            }

            /// Create from an existing string value.
            #[must_use]
            pub fn from_string(s: String) -> Self {
                Self(s)
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Identifies one connected peer for the lifetime of the process.
    SessionId, "ses_"
}

branded_id! {
    /// Correlation token for server-originated envelopes (telemetry,
    /// heartbeats, unsolicited errors).
    EventId, "evt_"
}

branded_id! {
    /// Trace identifier attached to a session's log span.
    TraceId, "argus-"
}

branded_id! {
    /// Identifies an in-process (local) subscriber such as the overlay.
    LocalSinkId, "sink_"
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
