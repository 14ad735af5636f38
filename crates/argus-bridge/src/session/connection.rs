//! Shared per-session record.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use argus_core::{Envelope, PreEncoded, SessionId, TraceId};
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use super::outbound::{Admission, OutboundQueue, RejectReason};
use super::state::{InvalidTransition, SessionEvent, SessionState};
use crate::metrics::TELEMETRY_DROPPED_TOTAL;

/// How the peer is connected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Length-prefixed envelopes over raw TCP.
    Tcp,
    /// One envelope per WebSocket message.
    WebSocket,
    /// Server-sent events for a single topic.
    EventStream,
    /// One-shot HTTP command.
    Http,
}

impl TransportKind {
    /// Whether the transport carries client heartbeats and a handshake.
    pub fn is_interactive(self) -> bool {
        matches!(self, Self::Tcp | Self::WebSocket)
    }

    /// Kebab-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::WebSocket => "websocket",
            Self::EventStream => "event-stream",
            Self::Http => "http",
        }
    }
}

#[derive(Debug)]
struct Lifecycle {
    state: SessionState,
    history: Vec<SessionState>,
}

/// One connected peer.
///
/// Owned by the session manager; the registry and scheduler refer to it by
/// id only.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    trace_id: TraceId,
    transport: TransportKind,
    peer: Option<SocketAddr>,
    connected_at: Instant,
    lifecycle: Mutex<Lifecycle>,
    version: AtomicU32,
    alive: AtomicBool,
    last_heartbeat: Mutex<Instant>,
    queue: OutboundQueue,
    drain: CancellationToken,
    kill: CancellationToken,
    commands: TaskTracker,
}

impl Session {
    /// New session in `Connecting`.
    pub fn new(transport: TransportKind, peer: Option<SocketAddr>, queue_depth: usize) -> Self {
        let now = Instant::now();
        Self {
            id: SessionId::new(),
            trace_id: TraceId::new(),
            transport,
            peer,
            connected_at: now,
            lifecycle: Mutex::new(Lifecycle {
                state: SessionState::Connecting,
                history: vec![SessionState::Connecting],
            }),
            version: AtomicU32::new(0),
            alive: AtomicBool::new(true),
            last_heartbeat: Mutex::new(now),
            queue: OutboundQueue::new(queue_depth),
            drain: CancellationToken::new(),
            kill: CancellationToken::new(),
            commands: TaskTracker::new(),
        }
    }

    /// Session id.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Trace id attached to this session's logs.
    pub fn trace_id(&self) -> &TraceId {
        &self.trace_id
    }

    /// Transport kind.
    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Peer address, when known.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.lifecycle.lock().state
    }

    /// Every state this session has been in, oldest first.
    pub fn history(&self) -> Vec<SessionState> {
        self.lifecycle.lock().history.clone()
    }

    /// Apply a lifecycle event.
    ///
    /// Entering `Draining` stops telemetry admission; entering `Closed`
    /// closes the outbound queue.
    pub fn apply(&self, event: SessionEvent) -> Result<SessionState, InvalidTransition> {
        let mut lifecycle = self.lifecycle.lock();
        let from = lifecycle.state;
        let next = from.transition(event)?;
        if next != from {
            lifecycle.state = next;
            lifecycle.history.push(next);
            debug!(session_id = %self.id, %from, to = %next, ?event, "session transition");
        }
        drop(lifecycle);
        match next {
            SessionState::Draining => self.queue.stop_telemetry(),
            SessionState::Closed => self.queue.close(),
            _ => {}
        }
        Ok(next)
    }

    /// Negotiated protocol version (zero before the handshake).
    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Relaxed)
    }

    /// Record the negotiated protocol version.
    pub fn set_version(&self, version: u32) {
        self.version.store(version, Ordering::Relaxed);
    }

    /// Record a heartbeat (or any liveness signal).
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Relaxed);
        *self.last_heartbeat.lock() = Instant::now();
    }

    /// Check and reset the liveness flag. Returns `true` if a heartbeat was
    /// seen since the last check.
    pub fn check_alive(&self) -> bool {
        self.alive.swap(false, Ordering::Relaxed)
    }

    /// Time since the last heartbeat (or connection).
    pub fn last_heartbeat_elapsed(&self) -> Duration {
        self.last_heartbeat.lock().elapsed()
    }

    /// Session age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Enqueue shared telemetry. Only `Active` sessions accept it.
    pub fn enqueue_telemetry(&self, body: Arc<PreEncoded>) -> Admission {
        if !self.state().accepts_telemetry() {
            return Admission::Rejected(RejectReason::NotAccepting);
        }
        let admission = self.queue.push_telemetry(body);
        if admission == Admission::Rejected(RejectReason::Full) {
            counter!(TELEMETRY_DROPPED_TOTAL, "transport" => self.transport.as_str()).increment(1);
            debug!(session_id = %self.id, depth = self.queue.len(), "outbound queue full, telemetry dropped");
        }
        admission
    }

    /// Enqueue a control envelope (response, error, heartbeat).
    pub fn send_control(&self, envelope: Envelope) -> Admission {
        let admission = self.queue.push_control(envelope);
        if let Admission::Admitted { evicted: true, .. } = admission {
            counter!(TELEMETRY_DROPPED_TOTAL, "transport" => self.transport.as_str()).increment(1);
            debug!(session_id = %self.id, "evicted queued telemetry for control envelope");
        }
        admission
    }

    /// Outbound queue.
    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    /// Telemetry dropped or evicted so far.
    pub fn dropped_telemetry(&self) -> u64 {
        self.queue.dropped()
    }

    /// Ask the session driver to drain and close.
    pub fn request_drain(&self) {
        self.drain.cancel();
    }

    /// Fires when a drain was requested.
    pub fn drain_token(&self) -> &CancellationToken {
        &self.drain
    }

    /// Force-close: discard the queue and stop the driver immediately.
    pub fn kill(&self) {
        let _ = self.queue.abort();
        self.drain.cancel();
        self.kill.cancel();
    }

    /// Fires when the session is force-closed.
    pub fn kill_token(&self) -> &CancellationToken {
        &self.kill
    }

    /// Host commands still running for this session. A drain waits on it
    /// so their responses are queued before the queue closes.
    pub fn commands(&self) -> &TaskTracker {
        &self.commands
    }

    /// Serializable status for introspection.
    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            session_id: self.id.to_string(),
            trace_id: self.trace_id.to_string(),
            transport: self.transport,
            peer: self.peer.map(|p| p.to_string()),
            state: self.state(),
            version: self.version(),
            queue_depth: self.queue.len(),
            queue_capacity: self.queue.capacity(),
            dropped_telemetry: self.dropped_telemetry(),
            last_seq: self.queue.last_seq(),
            age_ms: u64::try_from(self.age().as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Session status snapshot, as returned by `bridge.status`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    /// Session id.
    pub session_id: String,
    /// Trace id.
    pub trace_id: String,
    /// Transport.
    pub transport: TransportKind,
    /// Peer address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer: Option<String>,
    /// Lifecycle state.
    pub state: SessionState,
    /// Negotiated protocol version.
    pub version: u32,
    /// Envelopes waiting to be written.
    pub queue_depth: usize,
    /// Queue bound.
    pub queue_capacity: usize,
    /// Telemetry dropped under backpressure.
    pub dropped_telemetry: u64,
    /// Last sequence number assigned.
    pub last_seq: u64,
    /// Milliseconds since connect.
    pub age_ms: u64,
}
