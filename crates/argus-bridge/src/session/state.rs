//! Session lifecycle state machine.
//!
//! ```text
//! Connecting ──TransportReady──▶ Handshaking ──HandshakeAccepted──▶ Active
//!                                    │                                 │
//!                           HandshakeRejected            HeartbeatLost / DrainRequested
//!                                    ▼                                 ▼
//!                                  Closed ◀──────────Drained────────  Draining
//! ```
//!
//! `TransportLost` closes from any live state. `Closed` is terminal.

use std::fmt;

use serde::Serialize;

/// Lifecycle state of one session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Transport accepted, not yet ready for traffic.
    Connecting,
    /// Waiting for the client's hello.
    Handshaking,
    /// Normal bidirectional traffic.
    Active,
    /// Flushing queued envelopes; no new telemetry admitted.
    Draining,
    /// Terminal.
    Closed,
}

/// Input to [`SessionState::transition`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionEvent {
    /// The byte stream is ready.
    TransportReady,
    /// Hello accepted; version negotiated.
    HandshakeAccepted,
    /// Hello missing, late or incompatible.
    HandshakeRejected,
    /// Too many heartbeat intervals passed without a heartbeat.
    HeartbeatLost,
    /// Shutdown or an explicit close asked the session to drain.
    DrainRequested,
    /// The peer went away or a write failed.
    TransportLost,
    /// The outbound queue was flushed (or the drain timeout elapsed).
    Drained,
}

/// Rejected state transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid session transition from {from} on {event:?}")]
pub struct InvalidTransition {
    /// State the session was in.
    pub from: SessionState,
    /// Event that was applied.
    pub event: SessionEvent,
}

impl SessionState {
    /// Apply `event`, returning the next state.
    pub fn transition(self, event: SessionEvent) -> Result<Self, InvalidTransition> {
        use SessionEvent as E;
        use SessionState as S;

        let next = match (self, event) {
            (S::Connecting, E::TransportReady) => S::Handshaking,
            (S::Handshaking, E::HandshakeAccepted) => S::Active,
            (S::Handshaking, E::HandshakeRejected) => S::Closed,
            (S::Active, E::HeartbeatLost | E::DrainRequested) | (S::Draining, E::DrainRequested) => {
                S::Draining
            }
            // Nothing is queued before the handshake completes.
            (S::Connecting | S::Handshaking, E::DrainRequested) => S::Closed,
            (S::Draining, E::Drained) => S::Closed,
            (S::Connecting | S::Handshaking | S::Active | S::Draining, E::TransportLost) => {
                S::Closed
            }
            (from, event) => return Err(InvalidTransition { from, event }),
        };
        Ok(next)
    }

    /// `Closed` only.
    pub fn is_terminal(self) -> bool {
        self == Self::Closed
    }

    /// Only active sessions accept new telemetry.
    pub fn accepts_telemetry(self) -> bool {
        self == Self::Active
    }

    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionEvent as E;
    use SessionState as S;

    const STATES: [SessionState; 5] = [S::Connecting, S::Handshaking, S::Active, S::Draining, S::Closed];
    const EVENTS: [SessionEvent; 7] = [
        E::TransportReady,
        E::HandshakeAccepted,
        E::HandshakeRejected,
        E::HeartbeatLost,
        E::DrainRequested,
        E::TransportLost,
        E::Drained,
    ];

    #[test]
    fn happy_path() {
        let s = S::Connecting.transition(E::TransportReady).unwrap();
        let s = s.transition(E::HandshakeAccepted).unwrap();
        assert_eq!(s, S::Active);
        let s = s.transition(E::HeartbeatLost).unwrap();
        assert_eq!(s, S::Draining);
        assert_eq!(s.transition(E::Drained).unwrap(), S::Closed);
    }

    #[test]
    fn full_transition_table() {
        let expected = |from: S, event: E| -> Option<S> {
            Some(match (from, event) {
                (S::Connecting, E::TransportReady) => S::Handshaking,
                (S::Handshaking, E::HandshakeAccepted) => S::Active,
                (S::Handshaking, E::HandshakeRejected) => S::Closed,
                (S::Active | S::Draining, E::DrainRequested) | (S::Active, E::HeartbeatLost) => {
                    S::Draining
                }
                (S::Connecting | S::Handshaking, E::DrainRequested) => S::Closed,
                (S::Draining, E::Drained) => S::Closed,
                (s, E::TransportLost) if s != S::Closed => S::Closed,
                _ => return None,
            })
        };
        for from in STATES {
            for event in EVENTS {
                let got = from.transition(event).ok();
                assert_eq!(got, expected(from, event), "{from} on {event:?}");
            }
        }
    }

    #[test]
    fn closed_is_terminal() {
        for event in EVENTS {
            let err = S::Closed.transition(event).unwrap_err();
            assert_eq!(err.from, S::Closed);
            assert_eq!(err.event, event);
        }
        assert!(S::Closed.is_terminal());
    }

    #[test]
    fn active_cannot_rehandshake() {
        assert!(S::Active.transition(E::HandshakeAccepted).is_err());
        assert!(S::Active.transition(E::TransportReady).is_err());
    }

    #[test]
    fn only_active_accepts_telemetry() {
        for s in STATES {
            assert_eq!(s.accepts_telemetry(), s == S::Active);
        }
    }

    #[test]
    fn error_message_names_state() {
        let err = S::Closed.transition(E::Drained).unwrap_err();
        assert_eq!(err.to_string(), "invalid session transition from closed on Drained");
    }
}
