//! Session table and the built-in `bridge.*` control verbs.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use argus_core::errors::{
    HANDSHAKE_REJECTED, INVALID_ARGS, NOT_SUBSCRIBABLE, UNEXPECTED_ENVELOPE, UNKNOWN_COMMAND,
};
use argus_core::protocol::{
    HelloArgs, HelloResult, SERVER_CAPABILITIES, SubscribeArgs, UnsubscribeArgs, VERB_COMMANDS,
    VERB_HELLO, VERB_PING, VERB_STATUS, VERB_SUBSCRIBE, VERB_TOPICS, VERB_UNSUBSCRIBE,
};
use argus_core::{
    CONTROL_TOPIC, Cadence, CommandResponse, Envelope, EnvelopeKind, ErrorBody,
    MIN_PROTOCOL_VERSION, PROTOCOL_VERSION, SessionId, SnapshotProvider,
};
use metrics::{counter, gauge};
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info};

use super::connection::{Session, TransportKind};
use super::state::{SessionEvent, SessionState};
use crate::config::SessionConfig;
use crate::dispatcher::CommandDispatcher;
use crate::metrics::{SESSIONS_ACTIVE, SESSIONS_CLOSED_TOTAL, SESSIONS_REJECTED_TOTAL, SESSIONS_TOTAL};
use crate::registry::{Subscriber, SubscriptionRegistry};

/// Why a session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CloseReason {
    /// Hello missing, malformed or incompatible.
    HandshakeRejected,
    /// No hello within the handshake timeout.
    HandshakeTimeout,
    /// Too many silent heartbeat intervals.
    HeartbeatLost,
    /// Shutdown or an explicit drain.
    DrainRequested,
    /// The peer closed the connection.
    ClientClosed,
    /// Read or write failure.
    TransportError,
    /// Force-closed after the shutdown grace period.
    Killed,
}

impl CloseReason {
    /// Kebab-case label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HandshakeRejected => "handshake-rejected",
            Self::HandshakeTimeout => "handshake-timeout",
            Self::HeartbeatLost => "heartbeat-lost",
            Self::DrainRequested => "drain-requested",
            Self::ClientClosed => "client-closed",
            Self::TransportError => "transport-error",
            Self::Killed => "killed",
        }
    }
}

/// Refused to open a session because the table is full.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("session limit of {limit} reached")]
pub struct SessionLimitReached {
    /// Configured maximum.
    pub limit: usize,
}

/// Negotiate a protocol version with a client that speaks up to `client`.
///
/// Returns `None` when the ranges do not overlap.
pub fn negotiate_version(client: u32) -> Option<u32> {
    (client >= MIN_PROTOCOL_VERSION).then(|| client.min(PROTOCOL_VERSION))
}

/// Owns every live session and answers control verbs on their behalf.
pub struct SessionManager {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Arc<CommandDispatcher>,
    provider: Arc<dyn SnapshotProvider>,
    config: SessionConfig,
    max_sessions: usize,
}

impl SessionManager {
    /// New, empty manager.
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        dispatcher: Arc<CommandDispatcher>,
        provider: Arc<dyn SnapshotProvider>,
        config: SessionConfig,
        max_sessions: usize,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            registry,
            dispatcher,
            provider,
            config,
            max_sessions: max_sessions.max(1),
        }
    }

    /// Session policy.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Shared subscription registry.
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Shared command dispatcher.
    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    /// Snapshot provider.
    pub fn provider(&self) -> &Arc<dyn SnapshotProvider> {
        &self.provider
    }

    /// Register a new session in `Connecting`.
    pub fn open(
        &self,
        transport: TransportKind,
        peer: Option<SocketAddr>,
    ) -> Result<Arc<Session>, SessionLimitReached> {
        let mut sessions = self.sessions.write();
        if sessions.len() >= self.max_sessions {
            drop(sessions);
            counter!(SESSIONS_REJECTED_TOTAL).increment(1);
            return Err(SessionLimitReached {
                limit: self.max_sessions,
            });
        }
        let session = Arc::new(Session::new(transport, peer, self.config.outbound_queue_depth));
        let _ = sessions.insert(session.id().clone(), session.clone());
        let count = sessions.len();
        drop(sessions);

        counter!(SESSIONS_TOTAL, "transport" => transport.as_str()).increment(1);
        #[allow(clippy::cast_precision_loss)]
        gauge!(SESSIONS_ACTIVE).set(count as f64);
        info!(
            session_id = %session.id(),
            trace_id = %session.trace_id(),
            transport = transport.as_str(),
            peer = ?peer,
            "session opened"
        );
        Ok(session)
    }

    /// Look up a session.
    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    /// All registered sessions.
    pub fn list(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }

    /// Registered sessions in any state.
    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Sessions in `Active`.
    pub fn active_count(&self) -> usize {
        self.sessions
            .read()
            .values()
            .filter(|s| s.state() == SessionState::Active)
            .count()
    }

    /// Close a session for good: force `Closed`, drop its subscriptions and
    /// pending commands, and remove it from the table. Idempotent.
    pub fn finalize(&self, session: &Session, reason: CloseReason) {
        if !session.state().is_terminal() {
            let _ = session.apply(SessionEvent::TransportLost);
        }
        let subscriptions = self
            .registry
            .remove_subscriber(&Subscriber::Session(session.id().clone()));
        let cancelled = self.dispatcher.cancel_session(session.id());

        let mut sessions = self.sessions.write();
        let removed = sessions.remove(session.id()).is_some();
        let count = sessions.len();
        drop(sessions);

        if removed {
            counter!(SESSIONS_CLOSED_TOTAL, "reason" => reason.as_str()).increment(1);
            #[allow(clippy::cast_precision_loss)]
            gauge!(SESSIONS_ACTIVE).set(count as f64);
            info!(
                session_id = %session.id(),
                trace_id = %session.trace_id(),
                reason = reason.as_str(),
                subscriptions,
                cancelled,
                dropped = session.dropped_telemetry(),
                "session closed"
            );
        }
    }

    /// Ask every session to drain. Returns how many were asked.
    pub fn drain_all(&self) -> usize {
        let sessions = self.list();
        for session in &sessions {
            session.request_drain();
        }
        sessions.len()
    }

    /// Force-close every session still registered. Returns how many.
    pub fn abort_all(&self) -> usize {
        let sessions = self.list();
        for session in &sessions {
            session.kill();
            self.finalize(session, CloseReason::Killed);
        }
        sessions.len()
    }

    /// Bring a handshake-free session (event stream, one-shot HTTP) straight
    /// to `Active` at the current protocol version.
    pub fn activate_without_handshake(&self, session: &Session) {
        let _ = session.apply(SessionEvent::TransportReady);
        let _ = session.apply(SessionEvent::HandshakeAccepted);
        session.set_version(PROTOCOL_VERSION);
    }

    /// Validate the first envelope of a stream session.
    ///
    /// On success the session is `Active` and the hello result is returned;
    /// on failure the caller sends the error body and applies
    /// `HandshakeRejected`.
    pub fn handshake(&self, session: &Session, envelope: &Envelope) -> Result<HelloResult, ErrorBody> {
        let is_hello = envelope.kind == EnvelopeKind::Command
            && envelope.topic.as_deref() == Some(CONTROL_TOPIC)
            && envelope.verb.as_deref() == Some(VERB_HELLO);
        if !is_hello {
            return Err(ErrorBody::new(
                HANDSHAKE_REJECTED,
                "first message must be bridge.hello",
            ));
        }
        let args: HelloArgs = serde_json::from_value(envelope.payload.clone())
            .map_err(|e| ErrorBody::new(HANDSHAKE_REJECTED, format!("invalid hello: {e}")))?;
        let Some(version) = negotiate_version(args.version) else {
            return Err(ErrorBody::new(
                HANDSHAKE_REJECTED,
                format!(
                    "protocol version {} not supported (supported {MIN_PROTOCOL_VERSION}..={PROTOCOL_VERSION})",
                    args.version
                ),
            )
            .with_details(json!({
                "min": MIN_PROTOCOL_VERSION,
                "max": PROTOCOL_VERSION,
            })));
        };

        let capabilities: Vec<String> = if args.capabilities.is_empty() {
            SERVER_CAPABILITIES.iter().map(|c| (*c).to_owned()).collect()
        } else {
            args.capabilities
                .into_iter()
                .filter(|c| SERVER_CAPABILITIES.contains(&c.as_str()))
                .collect()
        };

        session
            .apply(SessionEvent::HandshakeAccepted)
            .map_err(|e| ErrorBody::new(HANDSHAKE_REJECTED, e.to_string()))?;
        session.set_version(version);
        debug!(
            session_id = %session.id(),
            client = args.client.as_deref().unwrap_or("unknown"),
            version,
            "handshake accepted"
        );

        Ok(HelloResult {
            session_id: session.id().to_string(),
            trace_id: session.trace_id().to_string(),
            version,
            capabilities,
            heartbeat_interval_ms: u64::try_from(self.config.heartbeat_interval.as_millis())
                .unwrap_or(u64::MAX),
        })
    }

    /// Answer a `bridge.*` command from an active session.
    pub fn handle_control(&self, session: &Session, envelope: &Envelope) -> CommandResponse {
        let id = envelope.id.clone();
        let verb = envelope.verb.as_deref().unwrap_or_default();
        let outcome = match verb {
            VERB_HELLO => Err(ErrorBody::new(
                UNEXPECTED_ENVELOPE,
                "session already completed its handshake",
            )),
            VERB_SUBSCRIBE => self.subscribe(session, &envelope.payload),
            VERB_UNSUBSCRIBE => self.unsubscribe(session, &envelope.payload),
            VERB_PING => Ok(json!({ "pong": envelope.payload })),
            VERB_TOPICS => Ok(json!({ "topics": self.topic_listing() })),
            VERB_COMMANDS => Ok(json!({ "commands": self.dispatcher.commands() })),
            VERB_STATUS => Ok(self.status_of(session)),
            other => Err(ErrorBody::new(
                UNKNOWN_COMMAND,
                format!("unknown control verb {CONTROL_TOPIC}.{other}"),
            )),
        };
        match outcome {
            Ok(result) => CommandResponse::success(id, result),
            Err(body) => CommandResponse::from_body(id, body),
        }
    }

    /// Subscribe `subscriber` after checking the topic and cadence.
    pub fn subscribe_checked(
        &self,
        subscriber: Subscriber,
        topic: &str,
        cadence: Cadence,
    ) -> Result<Option<Cadence>, ErrorBody> {
        let cadence = cadence
            .validate()
            .map_err(|msg| ErrorBody::new(INVALID_ARGS, msg))?;
        if !self.provider.topics().iter().any(|t| t == topic) {
            return Err(ErrorBody::new(
                NOT_SUBSCRIBABLE,
                format!("topic '{topic}' is not published by the host"),
            ));
        }
        Ok(self.registry.subscribe(subscriber, topic, cadence))
    }

    /// Published topics with their current subscriber counts.
    pub fn topic_listing(&self) -> Vec<TopicInfo> {
        let index = self.registry.snapshot();
        let mut topics = self.provider.topics();
        topics.sort();
        topics.dedup();
        topics
            .into_iter()
            .map(|topic| TopicInfo {
                subscribers: index.subscriber_count(&topic),
                topic,
            })
            .collect()
    }

    fn subscribe(&self, session: &Session, payload: &Value) -> Result<Value, ErrorBody> {
        let args: SubscribeArgs = parse_args(payload)?;
        let previous = self.subscribe_checked(
            Subscriber::Session(session.id().clone()),
            &args.topic,
            args.cadence,
        )?;
        Ok(json!({
            "topic": args.topic,
            "cadence": args.cadence,
            "replaced": previous.is_some(),
        }))
    }

    fn unsubscribe(&self, session: &Session, payload: &Value) -> Result<Value, ErrorBody> {
        let args: UnsubscribeArgs = parse_args(payload)?;
        let removed = self
            .registry
            .unsubscribe(&Subscriber::Session(session.id().clone()), &args.topic);
        Ok(json!({ "topic": args.topic, "removed": removed }))
    }

    fn status_of(&self, session: &Session) -> Value {
        let subscriptions: Vec<Value> = self
            .registry
            .snapshot()
            .subscriptions_of(&Subscriber::Session(session.id().clone()))
            .into_iter()
            .map(|(topic, cadence)| json!({ "topic": topic, "cadence": cadence }))
            .collect();
        let mut status = serde_json::to_value(session.status()).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut status {
            let _ = map.insert("subscriptions".into(), Value::Array(subscriptions));
            let _ = map.insert(
                "pendingCommands".into(),
                json!(self.dispatcher.pending_count()),
            );
        }
        status
    }
}

/// One entry of the topic listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TopicInfo {
    /// Topic name.
    pub topic: String,
    /// Current subscriber count.
    pub subscribers: usize,
}

fn parse_args<T: DeserializeOwned>(payload: &Value) -> Result<T, ErrorBody> {
    serde_json::from_value(payload.clone())
        .map_err(|e| ErrorBody::new(INVALID_ARGS, format!("invalid arguments: {e}")))
}
