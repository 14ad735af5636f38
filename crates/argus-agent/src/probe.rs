//! Wire probe: a plain TCP client that handshakes, subscribes and prints
//! what it receives as JSON lines.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use argus_bridge::transport::EnvelopeFrameCodec;
use argus_core::protocol::{VERB_HELLO, VERB_SUBSCRIBE};
use argus_core::{
    Cadence, Envelope, EnvelopeKind, PROTOCOL_VERSION, SeqObservation, SequenceTracker, encode,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{info, warn};

/// What to probe.
#[derive(Clone, Debug)]
pub struct ProbeOptions {
    /// Bridge TCP address.
    pub addr: SocketAddr,
    /// Topics to subscribe to.
    pub topics: Vec<String>,
    /// Cadence for every subscription.
    pub cadence: Cadence,
    /// Stop after this many telemetry envelopes.
    pub count: Option<u64>,
}

/// Totals printed when the probe stops.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProbeSummary {
    /// Telemetry envelopes received.
    pub telemetry: u64,
    /// Sequence gaps observed.
    pub gaps: u64,
    /// Sequence numbers skipped across all gaps.
    pub missing: u64,
}

/// Connect over TCP and run the probe.
pub async fn run(options: ProbeOptions) -> Result<ProbeSummary> {
    let stream = TcpStream::connect(options.addr)
        .await
        .with_context(|| format!("failed to connect to {}", options.addr))?;
    probe(stream, &options, &mut std::io::stdout()).await
}

/// Run the probe over any byte stream, writing envelopes to `out`.
pub async fn probe<S, W>(stream: S, options: &ProbeOptions, out: &mut W) -> Result<ProbeSummary>
where
    S: AsyncRead + AsyncWrite + Unpin,
    W: std::io::Write,
{
    let mut framed = Framed::new(stream, EnvelopeFrameCodec::default());

    let hello = Envelope::control(
        "probe-hello",
        VERB_HELLO,
        json!({ "version": PROTOCOL_VERSION, "client": "argus-probe" }),
    );
    send(&mut framed, &hello).await?;
    let reply = next(&mut framed).await?.context("connection closed during handshake")?;
    if reply.kind != EnvelopeKind::Response || reply.payload["success"] != true {
        bail!("handshake rejected: {}", reply.payload);
    }
    let result = &reply.payload["result"];
    let heartbeat_ms = result["heartbeatIntervalMs"].as_u64().unwrap_or(5_000).max(1);
    info!(session_id = %result["sessionId"], version = %result["version"], "probe connected");

    for topic in &options.topics {
        let id = format!("probe-sub-{topic}");
        send(
            &mut framed,
            &Envelope::control(id, VERB_SUBSCRIBE, json!({ "topic": topic, "cadence": options.cadence })),
        )
        .await?;
    }

    let mut tracker = SequenceTracker::new();
    let mut summary = ProbeSummary::default();
    // Heartbeat at half the server's interval so a slow tick never trips it.
    let mut heartbeat = tokio::time::interval(Duration::from_millis(heartbeat_ms / 2 + 1));

    loop {
        if options.count.is_some_and(|count| summary.telemetry >= count) {
            break;
        }
        tokio::select! {
            _ = heartbeat.tick() => send(&mut framed, &Envelope::heartbeat()).await?,
            envelope = next(&mut framed) => {
                let Some(envelope) = envelope? else {
                    info!("bridge closed the connection");
                    break;
                };
                if let SeqObservation::Gap { missing } = tracker.observe(envelope.seq) {
                    warn!(seq = envelope.seq, missing, "sequence gap");
                }
                match envelope.kind {
                    EnvelopeKind::Heartbeat => continue,
                    EnvelopeKind::Telemetry => summary.telemetry += 1,
                    EnvelopeKind::Response if envelope.payload["success"] != true => {
                        warn!(id = %envelope.id, payload = %envelope.payload, "request failed");
                    }
                    _ => {}
                }
                writeln!(out, "{}", serde_json::to_string(&envelope)?)?;
            }
        }
    }

    summary.gaps = tracker.gaps();
    summary.missing = tracker.missing();
    Ok(summary)
}

async fn send<S>(framed: &mut Framed<S, EnvelopeFrameCodec>, envelope: &Envelope) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    framed
        .send(Bytes::from(encode(envelope)?))
        .await
        .context("failed to send envelope")
}

async fn next<S>(framed: &mut Framed<S, EnvelopeFrameCodec>) -> Result<Option<Envelope>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match framed.next().await {
        Some(frame) => Ok(Some(frame.context("read failed")??)),
        None => Ok(None),
    }
}
