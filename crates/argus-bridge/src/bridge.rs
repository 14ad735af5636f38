//! The `Bridge`: wires the provider and handlers into listeners, sessions
//! and the scheduler, and owns their shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use argus_core::{BridgeError, SnapshotProvider};
use axum::Router;
use futures::StreamExt;
use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::dispatcher::CommandDispatcher;
use crate::registry::SubscriptionRegistry;
use crate::scheduler::{PassReport, PublicationScheduler};
use crate::session::SessionManager;
use crate::shutdown::ShutdownCoordinator;
use crate::transport::{HttpState, TransportListener, router, serve_stream};

/// Addresses the bridge is listening on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundAddrs {
    /// Raw TCP listener.
    pub tcp: SocketAddr,
    /// HTTP listener, when enabled.
    pub http: Option<SocketAddr>,
}

/// Instrumentation bridge embedded in a host.
pub struct Bridge {
    config: BridgeConfig,
    manager: Arc<SessionManager>,
    scheduler: Arc<PublicationScheduler>,
    shutdown: ShutdownCoordinator,
    metrics: Option<PrometheusHandle>,
    started: Instant,
    serving: AtomicBool,
    connections: TaskTracker,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Bridge {
    /// Build a bridge around the host's provider and command handlers.
    pub fn new(
        config: BridgeConfig,
        provider: Arc<dyn SnapshotProvider>,
        dispatcher: CommandDispatcher,
    ) -> Self {
        let dispatcher = dispatcher.with_timeout(config.command_timeout);
        let manager = Arc::new(SessionManager::new(
            Arc::new(SubscriptionRegistry::new()),
            Arc::new(dispatcher),
            provider,
            config.session,
            config.max_connections,
        ));
        let scheduler = Arc::new(PublicationScheduler::new(manager.clone()));
        Self {
            config,
            manager,
            scheduler,
            shutdown: ShutdownCoordinator::new(),
            metrics: None,
            started: Instant::now(),
            serving: AtomicBool::new(false),
            connections: TaskTracker::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Serve `GET /metrics` from this recorder handle.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Bind the listeners and start accepting.
    ///
    /// Every listener is bound before any task starts, so a bind failure
    /// leaves nothing running and `serve` may be called again. Bind failures
    /// are fatal and returned here; nothing else is.
    pub async fn serve(&self) -> Result<BoundAddrs, BridgeError> {
        if self.serving.swap(true, Ordering::SeqCst) {
            return Err(BridgeError::Configuration("bridge is already serving".into()));
        }
        let (listener, http_listener) = match self.bind_listeners().await {
            Ok(bound) => bound,
            Err(e) => {
                self.serving.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let tcp = listener.local_addrs()[0];
        let mut tasks = vec![self.spawn_accept_loop(&listener)];
        let http = http_listener.map(|(bound, http_listener)| {
            tasks.push(self.spawn_http(http_listener));
            bound
        });
        if let Some(interval) = self.config.tick_interval {
            tasks.push(self.scheduler.spawn_ticker(interval, self.shutdown.token()));
        }
        self.tasks.lock().extend(tasks);

        info!(%tcp, http = ?http, max_connections = self.config.max_connections, "bridge serving");
        Ok(BoundAddrs { tcp, http })
    }

    async fn bind_listeners(
        &self,
    ) -> Result<(TransportListener, Option<(SocketAddr, TcpListener)>), BridgeError> {
        let listener = TransportListener::bind(&[self.config.tcp_addr()]).await?;
        let Some(addr) = self.config.http_addr() else {
            return Ok((listener, None));
        };
        let http = TcpListener::bind(addr)
            .await
            .map_err(|e| BridgeError::Configuration(format!("failed to bind {addr}: {e}")))?;
        let bound = http
            .local_addr()
            .map_err(|e| BridgeError::Configuration(format!("failed to read local address of {addr}: {e}")))?;
        info!(local = %bound, "http listener bound");
        Ok((listener, Some((bound, http))))
    }

    fn spawn_accept_loop(&self, listener: &TransportListener) -> JoinHandle<()> {
        let mut accepts = listener.accept_stream();
        let token = self.shutdown.token();
        let manager = self.manager.clone();
        let connections = self.connections.clone();
        let max_frame = self.config.max_frame_bytes;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    Some(accepted) = accepts.next() => {
                        debug!(peer = %accepted.peer, local = %accepted.local, "connection accepted");
                        let manager = manager.clone();
                        let _ = connections.spawn(async move {
                            let _ = serve_stream(manager, accepted.stream, Some(accepted.peer), max_frame).await;
                        });
                    }
                }
            }
            debug!("accept loop stopped");
        })
    }

    fn spawn_http(&self, listener: TcpListener) -> JoinHandle<()> {
        let app = self.router();
        let token = self.shutdown.token();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                warn!(error = %e, "http server stopped with error");
            }
        })
    }

    /// The HTTP router, for mounting into a host's own server.
    pub fn router(&self) -> Router {
        router(HttpState {
            manager: self.manager.clone(),
            metrics: self.metrics.clone(),
            started: self.started,
        })
    }

    /// Run one scheduling pass. Hosts call this from their own tick.
    pub fn tick(&self) -> PassReport {
        self.scheduler.tick()
    }

    /// Session table.
    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Subscription registry.
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        self.manager.registry()
    }

    /// Publication scheduler.
    pub fn scheduler(&self) -> &Arc<PublicationScheduler> {
        &self.scheduler
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_shutting_down()
    }

    /// Stop accepting, drain every session and wait up to the grace period;
    /// whatever is left is aborted.
    ///
    /// Returns `true` when everything finished within the grace period.
    pub async fn shutdown(&self) -> bool {
        let grace = self.config.shutdown_grace;
        let deadline = tokio::time::Instant::now() + grace;
        let draining = self.manager.drain_all();
        info!(sessions = draining, grace_ms = grace.as_millis(), "bridge shutting down");

        let tasks = std::mem::take(&mut *self.tasks.lock());
        let mut clean = self.shutdown.graceful_shutdown(tasks, Some(grace)).await;

        let _ = self.connections.close();
        if tokio::time::timeout_at(deadline, self.connections.wait()).await.is_err() {
            clean = false;
        }
        while self.manager.count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let aborted = self.manager.abort_all();
        if aborted > 0 {
            warn!(aborted, "sessions still open after grace period, aborted");
            clean = false;
        }
        info!(clean, "bridge stopped");
        clean
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_core::Snapshot;
    use serde_json::json;

    struct Clock;

    impl SnapshotProvider for Clock {
        fn topics(&self) -> Vec<String> {
            vec!["clock".into()]
        }

        fn snapshot(&self, topic: &str, tick: u64) -> Option<Snapshot> {
            Some(Snapshot::new(topic, tick, json!({"tick": tick})))
        }
    }

    fn bridge(config: BridgeConfig) -> Bridge {
        Bridge::new(config, Arc::new(Clock), CommandDispatcher::new())
    }

    #[tokio::test]
    async fn serve_binds_ephemeral_ports_and_shuts_down() {
        let b = bridge(BridgeConfig::ephemeral());
        let addrs = b.serve().await.unwrap();
        assert_ne!(addrs.tcp.port(), 0);
        assert!(addrs.http.is_some_and(|a| a.port() != 0));
        assert!(b.serve().await.unwrap_err().is_fatal());

        assert!(b.shutdown().await);
        assert!(b.is_shutting_down());
    }

    #[tokio::test]
    async fn http_can_be_disabled() {
        let b = bridge(BridgeConfig {
            http_port: None,
            ..BridgeConfig::ephemeral()
        });
        let addrs = b.serve().await.unwrap();
        assert_eq!(addrs.http, None);
        assert!(b.shutdown().await);
    }

    #[tokio::test]
    async fn bind_conflict_is_fatal() {
        let first = bridge(BridgeConfig::ephemeral());
        let taken = first.serve().await.unwrap().tcp;
        let second = bridge(BridgeConfig {
            tcp_port: taken.port(),
            http_port: None,
            ..BridgeConfig::ephemeral()
        });
        let err = second.serve().await.unwrap_err();
        assert!(err.is_fatal());
        let _ = first.shutdown().await;
    }

    #[tokio::test]
    async fn http_bind_failure_leaves_nothing_serving() {
        let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken = blocker.local_addr().unwrap().port();
        let free = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tcp_port = free.local_addr().unwrap().port();
        drop(free);

        let b = bridge(BridgeConfig {
            tcp_port,
            http_port: Some(taken),
            ..BridgeConfig::ephemeral()
        });
        assert!(b.serve().await.unwrap_err().is_fatal());
        assert!(b.tasks.lock().is_empty());
        assert!(tokio::net::TcpStream::connect(("127.0.0.1", tcp_port)).await.is_err());
        assert_eq!(b.manager().count(), 0);

        drop(blocker);
        let addrs = b.serve().await.unwrap();
        assert_eq!(addrs.http.map(|a| a.port()), Some(taken));
        assert!(b.shutdown().await);
    }

    #[tokio::test]
    async fn command_timeout_comes_from_config() {
        let b = bridge(BridgeConfig {
            command_timeout: Duration::from_millis(250),
            ..BridgeConfig::ephemeral()
        });
        assert_eq!(b.manager().dispatcher().timeout(), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn tick_without_subscribers_is_empty() {
        let b = bridge(BridgeConfig::ephemeral());
        let report = b.tick();
        assert_eq!(report.topics, 0);
        assert_eq!(b.tick().tick, 1);
    }
}
