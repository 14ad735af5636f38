//! Length-prefixed stream sessions (raw TCP, or any byte stream).

use std::net::SocketAddr;
use std::sync::Arc;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::warn;

use super::framing::EnvelopeFrameCodec;
use crate::session::{
    Inbound, SessionLimitReached, SessionManager, SessionOutcome, TransportKind, run_session,
};

/// Run a framed session over `stream` until it closes.
///
/// Fails without touching the stream when the session table is full; the
/// caller drops the connection.
pub async fn serve_stream<S>(
    manager: Arc<SessionManager>,
    stream: S,
    peer: Option<SocketAddr>,
    max_frame_bytes: usize,
) -> Result<SessionOutcome, SessionLimitReached>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let session = manager.open(TransportKind::Tcp, peer).inspect_err(|e| {
        warn!(peer = ?peer, error = %e, "refusing connection");
    })?;
    let (read_half, write_half) = tokio::io::split(stream);
    let reader = FramedRead::new(read_half, EnvelopeFrameCodec::with_max_frame(max_frame_bytes))
        .map(|item| item.map(Inbound::Frame));
    let writer = FramedWrite::new(write_half, EnvelopeFrameCodec::with_max_frame(max_frame_bytes));
    Ok(run_session(manager, session, reader, writer).await)
}
