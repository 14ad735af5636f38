//! HTTP transport: WebSocket sessions, per-topic SSE streams, one-shot
//! commands and introspection routes.

use std::cell::Cell;
use std::convert::Infallible;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use argus_core::errors::{
    COMMAND_TIMEOUT, DUPLICATE_REQUEST, INVALID_ARGS, NOT_SUBSCRIBABLE, SESSION_LIMIT,
    UNKNOWN_COMMAND,
};
use argus_core::{Cadence, CommandRequest, ErrorBody, EventId, SessionId, decode_frame};
use axum::Router;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use futures::{SinkExt, Stream, StreamExt, future};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

use crate::health::{self, HealthResponse};
use crate::registry::Subscriber;
use crate::session::{
    CloseReason, Inbound, Session, SessionEvent, SessionManager, SessionState, TransportKind,
    run_session,
};

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    /// Session table, registry, dispatcher and provider.
    pub manager: Arc<SessionManager>,
    /// Prometheus handle backing `GET /metrics`.
    pub metrics: Option<PrometheusHandle>,
    /// When the bridge started.
    pub started: Instant,
}

impl HttpState {
    /// State without a metrics endpoint.
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self {
            manager,
            metrics: None,
            started: Instant::now(),
        }
    }
}

/// Build the HTTP router.
pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/topics", get(topics_handler))
        .route("/topics/{topic}/events", get(events_handler))
        .route("/commands/{topic}/{verb}", post(command_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// GET /ws
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<HttpState>) -> Response {
    let manager = state.manager;
    let session = match manager.open(TransportKind::WebSocket, None) {
        Ok(session) => session,
        Err(e) => return error_response(StatusCode::SERVICE_UNAVAILABLE, &ErrorBody::new(SESSION_LIMIT, e.to_string())),
    };
    let (failed_manager, failed_session) = (manager.clone(), session.clone());
    ws.on_failed_upgrade(move |e| {
        warn!(error = %e, "websocket upgrade failed");
        failed_manager.finalize(&failed_session, CloseReason::TransportError);
    })
    .on_upgrade(move |socket| serve_websocket(manager, session, socket))
}

async fn serve_websocket(manager: Arc<SessionManager>, session: Arc<Session>, socket: WebSocket) {
    let (sink, stream) = socket.split();
    let reader = stream.map(|message| match message {
        Ok(Message::Text(text)) => Ok(Inbound::Frame(decode_frame(text.as_str().as_bytes()))),
        Ok(Message::Binary(bytes)) => Ok(Inbound::Frame(decode_frame(&bytes))),
        Ok(Message::Ping(_) | Message::Pong(_)) => Ok(Inbound::Liveness),
        Ok(Message::Close(_)) => Ok(Inbound::Close),
        Err(e) => Err(io::Error::other(e)),
    });
    let writer = sink
        .sink_map_err(io::Error::other)
        .with(|bytes: Bytes| {
            future::ready(
                String::from_utf8(bytes.to_vec())
                    .map(|text| Message::Text(text.into()))
                    .map_err(io::Error::other),
            )
        });
    let outcome = run_session(manager, session, reader, writer).await;
    debug!(reason = outcome.reason.as_str(), "websocket session ended");
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    cadence: Option<String>,
    rate: Option<u32>,
}

/// GET /topics/{topic}/events
async fn events_handler(
    Path(topic): Path<String>,
    Query(query): Query<EventsQuery>,
    State(state): State<HttpState>,
) -> Response {
    let cadence = match Cadence::parse(query.cadence.as_deref().unwrap_or("every-tick"), query.rate) {
        Ok(cadence) => cadence,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &ErrorBody::new(INVALID_ARGS, msg)),
    };
    let manager = state.manager;
    let session = match manager.open(TransportKind::EventStream, None) {
        Ok(session) => session,
        Err(e) => return error_response(StatusCode::SERVICE_UNAVAILABLE, &ErrorBody::new(SESSION_LIMIT, e.to_string())),
    };
    manager.activate_without_handshake(&session);
    if let Err(body) = manager.subscribe_checked(Subscriber::Session(session.id().clone()), &topic, cadence) {
        manager.finalize(&session, CloseReason::HandshakeRejected);
        return error_response(status_for(&body.code), &body);
    }
    debug!(session_id = %session.id(), %topic, cadence = cadence.label(), "event stream opened");
    Sse::new(event_stream(EventStreamGuard {
        manager,
        session,
        reason: Cell::new(CloseReason::ClientClosed),
    }))
    .keep_alive(KeepAlive::default())
    .into_response()
}

/// Finalizes an event-stream session when the response body is dropped.
struct EventStreamGuard {
    manager: Arc<SessionManager>,
    session: Arc<Session>,
    reason: Cell<CloseReason>,
}

impl EventStreamGuard {
    /// Record why the stream is ending; read when the guard drops.
    fn close_with(&self, reason: CloseReason) {
        self.reason.set(reason);
    }
}

impl Drop for EventStreamGuard {
    fn drop(&mut self) {
        self.manager.finalize(&self.session, self.reason.get());
    }
}

fn event_stream(guard: EventStreamGuard) -> impl Stream<Item = Result<Event, Infallible>> + Send {
    async_stream::stream! {
        let session = guard.session.clone();
        let mut draining = false;
        loop {
            let next = tokio::select! {
                biased;
                () = session.kill_token().cancelled() => {
                    guard.close_with(CloseReason::Killed);
                    None
                }
                () = session.drain_token().cancelled(), if !draining => {
                    draining = true;
                    guard.close_with(CloseReason::DrainRequested);
                    let _ = session.apply(SessionEvent::DrainRequested);
                    session.queue().close();
                    continue;
                }
                item = session.queue().pop() => item,
            };
            let Some(item) = next else {
                break;
            };
            let bytes = match item.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!(seq = item.seq, error = %e, "failed to encode outbound envelope");
                    continue;
                }
            };
            match String::from_utf8(bytes) {
                Ok(data) => yield Ok(Event::default().event(item.kind().as_str()).data(data)),
                Err(e) => error!(error = %e, "encoded envelope is not utf-8"),
            }
        }
        if session.state() == SessionState::Draining {
            let _ = session.apply(SessionEvent::Drained);
        }
    }
}

/// POST /commands/{topic}/{verb}
async fn command_handler(
    Path((topic, verb)): Path<(String, String)>,
    State(state): State<HttpState>,
    body: Bytes,
) -> Response {
    let args = if body.iter().all(u8::is_ascii_whitespace) {
        json!({})
    } else {
        match serde_json::from_slice::<Value>(&body) {
            Ok(args) => args,
            Err(e) => {
                let body = ErrorBody::new(INVALID_ARGS, format!("body is not JSON: {e}"));
                return error_response(StatusCode::BAD_REQUEST, &body);
            }
        }
    };
    let request = CommandRequest::new(EventId::new().into_inner(), topic, verb, args);
    let response = state
        .manager
        .dispatcher()
        .dispatch(&SessionId::new(), request)
        .await;
    let status = response.error_code().map_or(StatusCode::OK, status_for);
    (status, Json(response)).into_response()
}

/// GET /topics
async fn topics_handler(State(state): State<HttpState>) -> Json<Value> {
    Json(json!({ "topics": state.manager.topic_listing() }))
}

/// GET /health
async fn health_handler(State(state): State<HttpState>) -> Json<HealthResponse> {
    let manager = &state.manager;
    Json(health::health_check(
        state.started,
        manager.count(),
        manager.active_count(),
        manager.provider().topics().len(),
        manager.registry().len(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<HttpState>) -> Response {
    match &state.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn status_for(code: &str) -> StatusCode {
    match code {
        UNKNOWN_COMMAND | NOT_SUBSCRIBABLE => StatusCode::NOT_FOUND,
        INVALID_ARGS => StatusCode::BAD_REQUEST,
        DUPLICATE_REQUEST => StatusCode::CONFLICT,
        COMMAND_TIMEOUT => StatusCode::GATEWAY_TIMEOUT,
        SESSION_LIMIT => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(status: StatusCode, body: &ErrorBody) -> Response {
    (status, Json(json!({ "error": body }))).into_response()
}
