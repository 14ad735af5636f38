//! Transport-agnostic session driver.
//!
//! Runs one stream session from `TransportReady` to `Closed`: the hello
//! exchange, the active read loop with heartbeat monitoring, and the drain.
//! Transports only adapt their byte stream into [`Inbound`] items and accept
//! encoded envelopes as [`Bytes`].

use std::io;
use std::sync::Arc;

use argus_core::errors::{HANDSHAKE_REJECTED, MALFORMED_ENVELOPE, UNEXPECTED_ENVELOPE};
use argus_core::{
    CommandRequest, CommandResponse, DecodeFailure, Envelope, EnvelopeKind, ErrorBody, EventId,
};
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use metrics::counter;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, instrument, warn};

use super::connection::Session;
use super::heartbeat::{HeartbeatResult, run_heartbeat};
use super::manager::{CloseReason, SessionManager};
use super::state::{SessionEvent, SessionState};
use crate::metrics::{DECODE_ERRORS_TOTAL, ENVELOPES_SENT_TOTAL};

/// One item read from a transport.
#[derive(Debug)]
pub enum Inbound {
    /// A decoded (or undecodable) envelope.
    Frame(Result<Envelope, DecodeFailure>),
    /// Transport-level liveness signal (WebSocket ping/pong).
    Liveness,
    /// The peer closed the stream.
    Close,
}

/// How a session ended.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    /// Why it ended.
    pub reason: CloseReason,
    /// Final state (always `Closed`).
    pub final_state: SessionState,
    /// Every state the session passed through.
    pub history: Vec<SessionState>,
}

/// Drive `session` over `reader`/`writer` until it closes.
///
/// The session must be freshly opened by `manager`. It is finalized (removed
/// from the table, subscriptions dropped, pending commands cancelled) before
/// this returns.
#[instrument(skip_all, fields(
    session_id = %session.id(),
    trace_id = %session.trace_id(),
    transport = session.transport().as_str(),
))]
pub async fn run_session<R, W>(
    manager: Arc<SessionManager>,
    session: Arc<Session>,
    mut reader: R,
    writer: W,
) -> SessionOutcome
where
    R: Stream<Item = io::Result<Inbound>> + Unpin + Send,
    W: Sink<Bytes, Error = io::Error> + Unpin + Send + 'static,
{
    let write_failed = CancellationToken::new();
    let mut writer_task = tokio::spawn(
        write_loop(session.clone(), writer, write_failed.clone()).in_current_span(),
    );

    let reason = if session.apply(SessionEvent::TransportReady).is_ok() {
        match handshake(&manager, &session, &mut reader).await {
            Ok(()) => active_loop(&manager, &session, &mut reader, &write_failed).await,
            Err(reason) => reason,
        }
    } else {
        // Killed before the driver started.
        CloseReason::Killed
    };

    close(&manager, &session, reason, &mut writer_task).await;
    let outcome = SessionOutcome {
        reason,
        final_state: session.state(),
        history: session.history(),
    };
    debug!(reason = reason.as_str(), history = ?outcome.history, "session driver finished");
    outcome
}

async fn handshake<R>(
    manager: &SessionManager,
    session: &Session,
    reader: &mut R,
) -> Result<(), CloseReason>
where
    R: Stream<Item = io::Result<Inbound>> + Unpin,
{
    let deadline = tokio::time::sleep(manager.config().handshake_timeout);
    tokio::pin!(deadline);

    let frame = loop {
        tokio::select! {
            () = &mut deadline => {
                reject(session, None, ErrorBody::new(HANDSHAKE_REJECTED, "no hello within the handshake timeout"));
                return Err(CloseReason::HandshakeTimeout);
            }
            () = session.drain_token().cancelled() => return Err(CloseReason::DrainRequested),
            msg = reader.next() => match msg {
                Some(Ok(Inbound::Frame(frame))) => break frame,
                Some(Ok(Inbound::Liveness)) => session.mark_alive(),
                Some(Ok(Inbound::Close)) | None => return Err(CloseReason::ClientClosed),
                Some(Err(e)) => {
                    debug!(error = %e, "read failed during handshake");
                    return Err(CloseReason::TransportError);
                }
            }
        }
    };

    match frame {
        Ok(envelope) => match manager.handshake(session, &envelope) {
            Ok(hello) => {
                let result = serde_json::to_value(&hello).unwrap_or_default();
                let _ = session.send_control(CommandResponse::success(envelope.id, result).into_envelope());
                info!(version = hello.version, "handshake complete");
                Ok(())
            }
            Err(body) => {
                reject(session, Some(envelope.id), body);
                Err(CloseReason::HandshakeRejected)
            }
        },
        Err(failure) => {
            let body = failure.error.to_error_body();
            reject(session, failure.id, body);
            Err(CloseReason::HandshakeRejected)
        }
    }
}

fn reject(session: &Session, id: Option<String>, body: ErrorBody) {
    warn!(code = %body.code, message = %body.message, "handshake rejected");
    let id = id.unwrap_or_else(|| EventId::new().into_inner());
    let _ = session.send_control(Envelope::error(id, &body));
    let _ = session.apply(SessionEvent::HandshakeRejected);
}

async fn active_loop<R>(
    manager: &Arc<SessionManager>,
    session: &Arc<Session>,
    reader: &mut R,
    write_failed: &CancellationToken,
) -> CloseReason
where
    R: Stream<Item = io::Result<Inbound>> + Unpin,
{
    let config = *manager.config();
    let heartbeat = run_heartbeat(
        session.clone(),
        config.heartbeat_interval,
        config.missed_heartbeats,
        session.drain_token().clone(),
    );
    tokio::pin!(heartbeat);

    loop {
        tokio::select! {
            biased;
            () = session.kill_token().cancelled() => return CloseReason::Killed,
            () = write_failed.cancelled() => return CloseReason::TransportError,
            result = &mut heartbeat => {
                return match result {
                    HeartbeatResult::TimedOut => {
                        warn!(
                            missed = config.missed_heartbeats,
                            silent_ms = session.last_heartbeat_elapsed().as_millis(),
                            "heartbeat lost"
                        );
                        CloseReason::HeartbeatLost
                    }
                    HeartbeatResult::Cancelled => CloseReason::DrainRequested,
                };
            }
            msg = reader.next() => match msg {
                Some(Ok(Inbound::Frame(frame))) => handle_frame(manager, session, frame),
                Some(Ok(Inbound::Liveness)) => session.mark_alive(),
                Some(Ok(Inbound::Close)) | None => return CloseReason::ClientClosed,
                Some(Err(e)) => {
                    debug!(error = %e, "read failed");
                    return CloseReason::TransportError;
                }
            }
        }
    }
}

fn handle_frame(
    manager: &Arc<SessionManager>,
    session: &Arc<Session>,
    frame: Result<Envelope, DecodeFailure>,
) {
    let envelope = match frame {
        Ok(envelope) => envelope,
        Err(failure) => {
            counter!(DECODE_ERRORS_TOTAL, "code" => failure.error.code()).increment(1);
            warn!(error = %failure, id = ?failure.id, "dropping undecodable envelope");
            if let Some(reply) = failure.to_error_envelope() {
                let _ = session.send_control(reply);
            }
            return;
        }
    };

    match envelope.kind {
        EnvelopeKind::Heartbeat => {
            session.mark_alive();
            let _ = session.send_control(Envelope::heartbeat());
        }
        EnvelopeKind::Command if envelope.is_control() => {
            let response = manager.handle_control(session, &envelope);
            let _ = session.send_control(response.into_envelope());
        }
        EnvelopeKind::Command => match CommandRequest::from_envelope(&envelope) {
            Some(request) => spawn_command(manager.clone(), session.clone(), request),
            None => {
                let body = ErrorBody::new(MALFORMED_ENVELOPE, "command needs a topic and a verb");
                let _ = session.send_control(Envelope::error(envelope.id, &body));
            }
        },
        EnvelopeKind::Telemetry | EnvelopeKind::Response => {
            let body = ErrorBody::new(
                UNEXPECTED_ENVELOPE,
                format!("clients may not send {} envelopes", envelope.kind.as_str()),
            );
            let _ = session.send_control(Envelope::error(envelope.id, &body));
        }
        EnvelopeKind::Error => {
            debug!(id = %envelope.id, payload = %envelope.payload, "client reported an error");
        }
    }
}

fn spawn_command(manager: Arc<SessionManager>, session: Arc<Session>, request: CommandRequest) {
    let commands = session.commands().clone();
    let _ = commands.spawn(
        async move {
            let id = request.id.clone();
            let response = manager.dispatcher().dispatch(session.id(), request).await;
            if !session.send_control(response.into_envelope()).is_admitted() {
                debug!(request_id = %id, "session closed before the response could be queued");
            }
        }
        .in_current_span(),
    );
}

async fn write_loop<W>(session: Arc<Session>, mut writer: W, failed: CancellationToken)
where
    W: Sink<Bytes, Error = io::Error> + Unpin,
{
    let transport = session.transport().as_str();
    while let Some(item) = session.queue().pop().await {
        let bytes = match item.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(seq = item.seq, error = %e, "failed to encode outbound envelope");
                continue;
            }
        };
        if let Err(e) = writer.send(Bytes::from(bytes)).await {
            debug!(error = %e, "write failed");
            failed.cancel();
            return;
        }
        counter!(ENVELOPES_SENT_TOTAL, "transport" => transport).increment(1);
    }
    let _ = writer.close().await;
}

async fn close(
    manager: &SessionManager,
    session: &Session,
    reason: CloseReason,
    writer: &mut JoinHandle<()>,
) {
    let deadline = Instant::now() + manager.config().drain_timeout;
    match reason {
        CloseReason::HeartbeatLost | CloseReason::DrainRequested => {
            let event = if reason == CloseReason::HeartbeatLost {
                SessionEvent::HeartbeatLost
            } else {
                SessionEvent::DrainRequested
            };
            // Draining refuses telemetry only; responses of commands still
            // running are admitted until they finish or the deadline passes.
            let _ = session.apply(event);
            await_commands(session, deadline).await;
            session.queue().close();
            flush(session, writer, deadline).await;
            if session.state() == SessionState::Draining {
                let _ = session.apply(SessionEvent::Drained);
            }
        }
        CloseReason::HandshakeRejected | CloseReason::HandshakeTimeout => {
            flush(session, writer, deadline).await;
        }
        CloseReason::ClientClosed | CloseReason::TransportError | CloseReason::Killed => {
            let _ = session.apply(SessionEvent::TransportLost);
            let _ = session.queue().abort();
            writer.abort();
        }
    }
    manager.finalize(session, reason);
}

async fn await_commands(session: &Session, deadline: Instant) {
    let commands = session.commands();
    let _ = commands.close();
    if commands.is_empty() {
        return;
    }
    tokio::select! {
        () = commands.wait() => {}
        () = session.kill_token().cancelled() => {}
        () = tokio::time::sleep_until(deadline) => {
            warn!(in_flight = commands.len(), "drain timed out waiting for in-flight commands");
        }
    }
}

/// Wait for the writer to flush the (closed) queue until `deadline`.
async fn flush(session: &Session, writer: &mut JoinHandle<()>, deadline: Instant) {
    if tokio::time::timeout_at(deadline, &mut *writer).await.is_err() {
        let discarded = session.queue().abort();
        writer.abort();
        warn!(discarded, "drain timed out, discarding queued envelopes");
    }
}
