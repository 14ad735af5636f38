//! TCP accept loop with transient-error backoff.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use argus_core::BridgeError;
use futures::Stream;
use futures::stream::{self, StreamExt};
use metrics::counter;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use crate::metrics::ACCEPT_ERRORS_TOTAL;
use crate::session::TransportKind;

/// First retry delay after a failed accept.
pub const MIN_BACKOFF: Duration = Duration::from_millis(5);
/// Retry delay cap.
pub const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// One accepted connection.
#[derive(Debug)]
pub struct Accepted {
    /// The connected socket.
    pub stream: TcpStream,
    /// Remote address.
    pub peer: SocketAddr,
    /// Local address it arrived on.
    pub local: SocketAddr,
    /// Transport the connection speaks.
    pub transport: TransportKind,
}

/// Exponential backoff, doubling from [`MIN_BACKOFF`] to [`MAX_BACKOFF`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    current: Duration,
}

impl Backoff {
    /// Start at the minimum delay.
    pub fn new() -> Self {
        Self {
            current: MIN_BACKOFF,
        }
    }

    /// Delay to wait now; the following call returns double (capped).
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(MAX_BACKOFF);
        delay
    }

    /// Back to the minimum after a success.
    pub fn reset(&mut self) {
        self.current = MIN_BACKOFF;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether an accept error is expected to clear up on its own.
///
/// Covers aborted handshakes, interrupted or spurious wake-ups and resource
/// exhaustion (`ENFILE`, `EMFILE`, `ENOMEM`, `ENOBUFS`).
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) || matches!(err.raw_os_error(), Some(12 | 23 | 24 | 105))
}

/// Bound TCP listeners.
#[derive(Debug, Clone)]
pub struct TransportListener {
    listeners: Vec<Arc<TcpListener>>,
    local_addrs: Vec<SocketAddr>,
}

impl TransportListener {
    /// Bind every address. Any failure is a startup configuration error.
    pub async fn bind(addrs: &[SocketAddr]) -> Result<Self, BridgeError> {
        if addrs.is_empty() {
            return Err(BridgeError::Configuration("no listen addresses".into()));
        }
        let mut listeners = Vec::with_capacity(addrs.len());
        let mut local_addrs = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|e| BridgeError::Configuration(format!("failed to bind {addr}: {e}")))?;
            let local = listener.local_addr().map_err(|e| {
                BridgeError::Configuration(format!("failed to read local address of {addr}: {e}"))
            })?;
            info!(%local, "tcp listener bound");
            local_addrs.push(local);
            listeners.push(Arc::new(listener));
        }
        Ok(Self {
            listeners,
            local_addrs,
        })
    }

    /// Addresses actually bound (resolves port `0`).
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Endless stream of accepted connections across every listener.
    ///
    /// Accept errors never end the stream. Dropping the stream stops
    /// accepting; calling this again resumes on the same sockets.
    pub fn accept_stream(&self) -> impl Stream<Item = Accepted> + Send + Unpin + 'static {
        let streams: Vec<Pin<Box<dyn Stream<Item = Accepted> + Send>>> = self
            .listeners
            .iter()
            .zip(&self.local_addrs)
            .map(|(listener, local)| accept_loop(listener.clone(), *local).boxed())
            .collect();
        stream::select_all(streams)
    }
}

fn accept_loop(listener: Arc<TcpListener>, local: SocketAddr) -> impl Stream<Item = Accepted> + Send {
    async_stream::stream! {
        let mut backoff = Backoff::new();
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    backoff.reset();
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!(%peer, error = %e, "failed to set TCP_NODELAY");
                    }
                    yield Accepted {
                        stream,
                        peer,
                        local,
                        transport: TransportKind::Tcp,
                    };
                }
                Err(e) if is_transient(&e) => {
                    counter!(ACCEPT_ERRORS_TOTAL, "kind" => "transient").increment(1);
                    let delay = backoff.next_delay();
                    warn!(%local, error = %e, delay_ms = delay.as_millis(), "transient accept error, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    counter!(ACCEPT_ERRORS_TOTAL, "kind" => "other").increment(1);
                    error!(%local, error = %e, "accept failed, retrying after max backoff");
                    tokio::time::sleep(MAX_BACKOFF).await;
                }
            }
        }
    }
}
