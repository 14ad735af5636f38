//! End-to-end tests with real wire clients: framed TCP, in-memory duplex
//! streams, WebSocket and HTTP.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use argus_bridge::transport::{EnvelopeFrameCodec, serve_stream};
use argus_bridge::{
    Bridge, BridgeConfig, CloseReason, CommandDispatcher, SessionConfig, SessionState,
};
use argus_core::errors::{COMMAND_TIMEOUT, HANDSHAKE_REJECTED};
use argus_core::protocol::{VERB_HELLO, VERB_PING, VERB_SUBSCRIBE};
use argus_core::{
    CommandError, Envelope, EnvelopeKind, PROTOCOL_VERSION, SequenceTracker, Snapshot,
    SnapshotProvider, decode, encode,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::codec::Framed;

const TIMEOUT: Duration = Duration::from_secs(5);

// ── Host fixture ──

#[derive(Default)]
struct Host {
    values: Mutex<HashMap<String, Value>>,
}

impl Host {
    fn with(topics: &[(&str, Value)]) -> Arc<Self> {
        let host = Arc::new(Self::default());
        for (topic, value) in topics {
            host.set(topic, value.clone());
        }
        host
    }

    fn set(&self, topic: &str, value: Value) {
        let _ = self.values.lock().insert(topic.to_owned(), value);
    }
}

impl SnapshotProvider for Host {
    fn topics(&self) -> Vec<String> {
        self.values.lock().keys().cloned().collect()
    }

    fn snapshot(&self, topic: &str, tick: u64) -> Option<Snapshot> {
        let value = self.values.lock().get(topic).cloned()?;
        Some(Snapshot::new(topic, tick, value))
    }
}

fn commands() -> CommandDispatcher {
    let mut dispatcher = CommandDispatcher::new();
    dispatcher.register_fn("game", "echo", |args, _ctx| async move { Ok::<_, CommandError>(args) });
    dispatcher.register_fn("game", "stall", |_args, _ctx| async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok::<_, CommandError>(json!("late"))
    });
    dispatcher
}

fn config(session: SessionConfig) -> BridgeConfig {
    BridgeConfig {
        session,
        command_timeout: Duration::from_millis(100),
        ..BridgeConfig::ephemeral()
    }
}

// ── Framed wire client ──

struct Client<S> {
    framed: Framed<S, EnvelopeFrameCodec>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Client<S> {
    fn new(stream: S) -> Self {
        Self {
            framed: Framed::new(stream, EnvelopeFrameCodec::default()),
        }
    }

    async fn send(&mut self, envelope: &Envelope) {
        self.framed
            .send(Bytes::from(encode(envelope).unwrap()))
            .await
            .unwrap();
    }

    async fn recv(&mut self) -> Option<Envelope> {
        timeout(TIMEOUT, self.framed.next())
            .await
            .expect("no frame within timeout")
            .map(|frame| frame.unwrap().unwrap())
    }

    async fn call(&mut self, envelope: Envelope) -> Envelope {
        let id = envelope.id.clone();
        self.send(&envelope).await;
        loop {
            let reply = self.recv().await.expect("connection closed");
            if reply.id == id && reply.kind != EnvelopeKind::Telemetry {
                return reply;
            }
        }
    }

    async fn hello(&mut self) -> Value {
        let reply = self
            .call(Envelope::control("hello", VERB_HELLO, json!({ "version": PROTOCOL_VERSION })))
            .await;
        assert_eq!(reply.kind, EnvelopeKind::Response);
        assert_eq!(reply.payload["success"], true);
        reply.payload["result"].clone()
    }

    async fn subscribe(&mut self, topic: &str, cadence: Value) {
        let reply = self
            .call(Envelope::control(
                format!("sub-{topic}"),
                VERB_SUBSCRIBE,
                json!({ "topic": topic, "cadence": cadence }),
            ))
            .await;
        assert_eq!(reply.payload["success"], true, "{reply:?}");
    }
}

// ── TCP ──

#[tokio::test]
async fn tcp_handshake_subscribe_and_receive_telemetry() {
    let host = Host::with(&[("clock", json!({"t": 0}))]);
    let bridge = Bridge::new(config(SessionConfig::default()), host, commands());
    let addrs = bridge.serve().await.unwrap();

    let mut client = Client::new(TcpStream::connect(addrs.tcp).await.unwrap());
    let hello = client.hello().await;
    assert_eq!(hello["version"], PROTOCOL_VERSION);
    assert!(hello["traceId"].as_str().unwrap().starts_with("argus-"));

    client.subscribe("clock", json!({"mode": "every-tick"})).await;
    assert_eq!(bridge.registry().len(), 1);

    let report = bridge.tick();
    assert_eq!(report.delivered, 1);
    let telemetry = client.recv().await.unwrap();
    assert_eq!(telemetry.kind, EnvelopeKind::Telemetry);
    assert_eq!(telemetry.topic.as_deref(), Some("clock"));
    assert_eq!(telemetry.payload["value"], json!({"t": 0}));
    assert_eq!(telemetry.seq, 3);

    let echo = client
        .call(Envelope::command("c1", "game", "echo", json!({"x": 1})))
        .await;
    assert_eq!(echo.payload["result"], json!({"x": 1}));

    assert!(bridge.shutdown().await);
    assert!(client.recv().await.is_none());
}

#[tokio::test]
async fn tcp_first_message_must_be_hello() {
    let host = Host::with(&[("clock", json!(0))]);
    let bridge = Bridge::new(config(SessionConfig::default()), host, commands());
    let addrs = bridge.serve().await.unwrap();

    let mut client = Client::new(TcpStream::connect(addrs.tcp).await.unwrap());
    client
        .send(&Envelope::control("s", VERB_SUBSCRIBE, json!({"topic": "clock"})))
        .await;
    let rejected = client.recv().await.unwrap();
    assert_eq!(rejected.kind, EnvelopeKind::Error);
    assert_eq!(rejected.id, "s");
    assert_eq!(rejected.payload["code"], HANDSHAKE_REJECTED);
    assert!(client.recv().await.is_none());
    assert!(bridge.registry().is_empty());

    let _ = bridge.shutdown().await;
}

#[tokio::test]
async fn health_on_change_delivers_two_envelopes_for_three_ticks() {
    let host = Host::with(&[("health", json!({"hp": 100}))]);
    let bridge = Bridge::new(config(SessionConfig::default()), host.clone(), commands());
    let addrs = bridge.serve().await.unwrap();

    let mut client = Client::new(TcpStream::connect(addrs.tcp).await.unwrap());
    let _ = client.hello().await;
    client.subscribe("health", json!({"mode": "on-change"})).await;

    let _ = bridge.tick();
    let _ = bridge.tick();
    host.set("health", json!({"hp": 75}));
    let _ = bridge.tick();

    client
        .send(&Envelope::control("p", VERB_PING, json!("marker")))
        .await;
    let mut seen = Vec::new();
    loop {
        let envelope = client.recv().await.unwrap();
        if envelope.id == "p" {
            break;
        }
        seen.push(envelope.payload["value"]["hp"].clone());
    }
    assert_eq!(seen, vec![json!(100), json!(75)]);

    let _ = bridge.shutdown().await;
}

// ── Duplex streams ──

fn duplex_session(
    bridge: &Bridge,
    buffer: usize,
) -> (
    Client<tokio::io::DuplexStream>,
    tokio::task::JoinHandle<argus_bridge::session::SessionOutcome>,
) {
    let (client, server) = tokio::io::duplex(buffer);
    let manager = bridge.manager().clone();
    let driver = tokio::spawn(async move {
        serve_stream(manager, server, None, 1 << 20).await.unwrap()
    });
    (Client::new(client), driver)
}

#[tokio::test(start_paused = true)]
async fn heartbeat_loss_drains_and_removes_subscriptions() {
    let host = Host::with(&[("health", json!(1))]);
    let bridge = Bridge::new(
        config(SessionConfig {
            heartbeat_interval: Duration::from_millis(100),
            missed_heartbeats: 3,
            ..SessionConfig::default()
        }),
        host,
        commands(),
    );
    let (mut client, driver) = duplex_session(&bridge, 64 * 1024);
    let _ = client.hello().await;
    client.subscribe("health", json!({"mode": "every-tick"})).await;
    assert_eq!(bridge.registry().len(), 1);

    let outcome = driver.await.unwrap();
    assert_eq!(outcome.reason, CloseReason::HeartbeatLost);
    assert_eq!(outcome.final_state, SessionState::Closed);
    assert_eq!(
        outcome.history,
        vec![
            SessionState::Connecting,
            SessionState::Handshaking,
            SessionState::Active,
            SessionState::Draining,
            SessionState::Closed,
        ]
    );
    assert!(bridge.registry().is_empty());
    assert_eq!(bridge.manager().count(), 0);
    assert!(client.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn heartbeats_keep_a_quiet_session_alive() {
    let host = Host::with(&[("health", json!(1))]);
    let bridge = Bridge::new(
        config(SessionConfig {
            heartbeat_interval: Duration::from_millis(100),
            missed_heartbeats: 3,
            ..SessionConfig::default()
        }),
        host,
        commands(),
    );
    let (mut client, driver) = duplex_session(&bridge, 64 * 1024);
    let _ = client.hello().await;

    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(150)).await;
        client.send(&Envelope::heartbeat()).await;
        let echo = client.recv().await.unwrap();
        assert_eq!(echo.kind, EnvelopeKind::Heartbeat);
    }
    assert!(!driver.is_finished());
    assert_eq!(bridge.manager().active_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn command_timeout_yields_exactly_one_response() {
    let host = Host::with(&[("health", json!(1))]);
    let bridge = Bridge::new(
        config(SessionConfig {
            heartbeat_interval: Duration::from_secs(60),
            ..SessionConfig::default()
        }),
        host,
        commands(),
    );
    let (mut client, _driver) = duplex_session(&bridge, 64 * 1024);
    let _ = client.hello().await;

    let started = tokio::time::Instant::now();
    let reply = client
        .call(Envelope::command("slow", "game", "stall", json!({})))
        .await;
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(100) && waited < Duration::from_secs(1), "{waited:?}");
    assert_eq!(reply.kind, EnvelopeKind::Response);
    assert_eq!(reply.payload["success"], false);
    assert_eq!(reply.payload["error"]["code"], COMMAND_TIMEOUT);

    // The handler finishes at 10s; its result must not reach the client.
    tokio::time::sleep(Duration::from_secs(20)).await;
    client
        .send(&Envelope::control("p", VERB_PING, json!(null)))
        .await;
    let next = client.recv().await.unwrap();
    assert_eq!(next.id, "p");
    assert_eq!(bridge.manager().dispatcher().pending_count(), 0);
}

#[tokio::test]
async fn command_completes_while_telemetry_floods_a_slow_consumer() {
    let host = Host::with(&[("perf", json!({"fps": 60}))]);
    let bridge = Bridge::new(
        config(SessionConfig {
            outbound_queue_depth: 4,
            ..SessionConfig::default()
        }),
        host,
        commands(),
    );
    // A tiny pipe so the writer blocks almost at once.
    let (mut client, _driver) = duplex_session(&bridge, 256);
    let _ = client.hello().await;
    client.subscribe("perf", json!({"mode": "every-tick"})).await;

    for _ in 0..50 {
        let _ = bridge.tick();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    for _ in 0..50 {
        let _ = bridge.tick();
    }
    client
        .send(&Envelope::command("cmd", "game", "echo", json!("through")))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let session = bridge.manager().list().pop().unwrap();
    assert!(session.dropped_telemetry() > 0);

    let mut tracker = SequenceTracker::new();
    let reply = loop {
        let envelope = client.recv().await.expect("response never arrived");
        let _ = tracker.observe(envelope.seq);
        if envelope.id == "cmd" {
            break envelope;
        }
    };
    assert_eq!(reply.payload["result"], "through");
    assert!(tracker.gaps() >= 1);
    assert_eq!(tracker.stale(), 0);
}

// ── WebSocket / HTTP ──

#[tokio::test]
async fn websocket_session_runs_the_same_protocol() {
    let host = Host::with(&[("clock", json!({"t": 1}))]);
    let bridge = Bridge::new(config(SessionConfig::default()), host, commands());
    let addrs = bridge.serve().await.unwrap();
    let url = format!("ws://{}/ws", addrs.http.unwrap());
    let (mut ws, _) = connect_async(url).await.unwrap();

    async fn next(ws: &mut (impl futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin)) -> Envelope {
        loop {
            let msg = timeout(TIMEOUT, ws.next()).await.unwrap().unwrap().unwrap();
            if msg.is_text() || msg.is_binary() {
                return decode(&msg.into_data()).unwrap();
            }
        }
    }

    let hello = Envelope::control("h", VERB_HELLO, json!({"version": PROTOCOL_VERSION}));
    ws.send(Message::text(String::from_utf8(encode(&hello).unwrap()).unwrap()))
        .await
        .unwrap();
    let reply = next(&mut ws).await;
    assert_eq!(reply.payload["result"]["version"], PROTOCOL_VERSION);

    let sub = Envelope::control("s", VERB_SUBSCRIBE, json!({"topic": "clock"}));
    ws.send(Message::text(String::from_utf8(encode(&sub).unwrap()).unwrap()))
        .await
        .unwrap();
    assert_eq!(next(&mut ws).await.id, "s");

    let _ = bridge.tick();
    let telemetry = next(&mut ws).await;
    assert_eq!(telemetry.kind, EnvelopeKind::Telemetry);
    assert_eq!(telemetry.payload["value"]["t"], 1);

    let session = bridge.manager().list().pop().unwrap();
    assert_eq!(session.status().transport.as_str(), "websocket");

    ws.close(None).await.unwrap();
    let _ = bridge.shutdown().await;
}

#[tokio::test]
async fn sse_stream_and_http_commands() {
    let host = Host::with(&[("health", json!({"hp": 3}))]);
    let bridge = Bridge::new(config(SessionConfig::default()), host, commands());
    let addrs = bridge.serve().await.unwrap();
    let base = format!("http://{}", addrs.http.unwrap());
    let http = reqwest::Client::new();

    let resp = http
        .post(format!("{base}/commands/game/echo"))
        .json(&json!({"n": 7}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["result"], json!({"n": 7}));

    let resp = http
        .get(format!("{base}/topics/health/events?cadence=every-tick"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let mut events = resp.bytes_stream();

    let mut buffer = String::new();
    while !buffer.contains(r#""topic":"health""#) {
        let _ = bridge.tick();
        let chunk = timeout(TIMEOUT, events.next()).await.unwrap().unwrap().unwrap();
        buffer.push_str(&String::from_utf8_lossy(&chunk));
    }
    assert!(buffer.contains("telemetry"));

    let topics: Value = http
        .get(format!("{base}/topics"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(topics["topics"][0]["subscribers"], 1);

    drop(events);
    let _ = bridge.shutdown().await;
}
