//! Bounded per-session outbound queue.
//!
//! Telemetry is lossy, control traffic is not:
//! - a telemetry envelope arriving at a full queue is dropped;
//! - a control envelope (response, error, heartbeat) arriving at a full
//!   queue evicts the newest queued telemetry envelope, or is admitted past
//!   the bound when no telemetry is queued.
//!
//! Sequence numbers are stamped on admission, so an evicted envelope shows
//! up at the receiver as a gap.

use std::collections::VecDeque;
use std::sync::Arc;

use argus_core::{EncodeError, Envelope, EnvelopeKind, PreEncoded, encode_sequenced};
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Payload of a queued item.
#[derive(Clone, Debug)]
pub enum OutboundBody {
    /// Telemetry encoded once for every subscriber of the pass.
    Shared(Arc<PreEncoded>),
    /// A control envelope owned by this session.
    Owned(Box<Envelope>),
}

/// One admitted envelope with its sequence number.
#[derive(Clone, Debug)]
pub struct Outbound {
    /// Per-session sequence number.
    pub seq: u64,
    /// What to write.
    pub body: OutboundBody,
}

impl Outbound {
    /// Envelope kind.
    pub fn kind(&self) -> EnvelopeKind {
        match &self.body {
            OutboundBody::Shared(pre) => pre.kind(),
            OutboundBody::Owned(env) => env.kind,
        }
    }

    /// Whether this item may be dropped under pressure.
    pub fn is_lossy(&self) -> bool {
        self.kind().is_lossy()
    }

    /// Wire bytes for this item.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        match &self.body {
            OutboundBody::Shared(pre) => Ok(pre.with_seq(self.seq)),
            OutboundBody::Owned(env) => encode_sequenced(env, self.seq),
        }
    }
}

/// Result of an enqueue attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// Queued with this sequence number.
    Admitted {
        /// Assigned sequence number.
        seq: u64,
        /// A queued telemetry envelope was evicted to make room.
        evicted: bool,
    },
    /// Not queued.
    Rejected(RejectReason),
}

impl Admission {
    /// Whether the envelope was queued.
    pub fn is_admitted(self) -> bool {
        matches!(self, Self::Admitted { .. })
    }
}

/// Why an envelope was not queued.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    /// Queue at capacity (telemetry only).
    Full,
    /// Session is draining; telemetry no longer accepted.
    NotAccepting,
    /// Queue closed.
    Closed,
}

#[derive(Debug)]
struct Inner {
    items: VecDeque<Outbound>,
    next_seq: u64,
    accepting_telemetry: bool,
    closed: bool,
    dropped: u64,
}

/// Bounded outbound queue with a single consumer.
#[derive(Debug)]
pub struct OutboundQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
}

impl OutboundQueue {
    /// Queue holding up to `capacity` envelopes (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity.min(1024)),
                next_seq: 1,
                accepting_telemetry: true,
                closed: false,
                dropped: 0,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Enqueue shared telemetry. Never blocks.
    pub fn push_telemetry(&self, body: Arc<PreEncoded>) -> Admission {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Admission::Rejected(RejectReason::Closed);
        }
        if !inner.accepting_telemetry {
            return Admission::Rejected(RejectReason::NotAccepting);
        }
        if inner.items.len() >= self.capacity {
            inner.dropped += 1;
            return Admission::Rejected(RejectReason::Full);
        }
        let seq = Self::admit(&mut inner, OutboundBody::Shared(body));
        drop(inner);
        self.notify.notify_one();
        Admission::Admitted {
            seq,
            evicted: false,
        }
    }

    /// Enqueue a control envelope. Only a closed queue refuses it.
    pub fn push_control(&self, envelope: Envelope) -> Admission {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Admission::Rejected(RejectReason::Closed);
        }
        let mut evicted = false;
        if inner.items.len() >= self.capacity {
            if let Some(pos) = inner.items.iter().rposition(Outbound::is_lossy) {
                let _ = inner.items.remove(pos);
                inner.dropped += 1;
                evicted = true;
            }
        }
        let seq = Self::admit(&mut inner, OutboundBody::Owned(Box::new(envelope)));
        drop(inner);
        self.notify.notify_one();
        Admission::Admitted { seq, evicted }
    }

    fn admit(inner: &mut Inner, body: OutboundBody) -> u64 {
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.items.push_back(Outbound { seq, body });
        seq
    }

    /// Next item in FIFO order. Returns `None` once the queue is closed and
    /// empty.
    pub async fn pop(&self) -> Option<Outbound> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock();
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Non-waiting variant of [`pop`](Self::pop).
    pub fn try_pop(&self) -> Option<Outbound> {
        self.inner.lock().items.pop_front()
    }

    /// Stop admitting telemetry (draining). Already-queued items stay.
    pub fn stop_telemetry(&self) {
        self.inner.lock().accepting_telemetry = false;
    }

    /// Refuse further pushes. Queued items are still handed out by `pop`.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_one();
    }

    /// Close and discard everything queued. Returns how many were discarded.
    pub fn abort(&self) -> usize {
        let discarded = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.accepting_telemetry = false;
            let n = inner.items.len();
            inner.items.clear();
            n
        };
        self.notify.notify_one();
        discarded
    }

    /// Queued items.
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Nothing queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured bound.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Telemetry envelopes dropped or evicted so far.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }

    /// Last sequence number handed out (zero before the first admission).
    pub fn last_seq(&self) -> u64 {
        self.inner.lock().next_seq - 1
    }

    /// Whether [`close`](Self::close) or [`abort`](Self::abort) was called.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}
