//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]`, so a settings
//! file may name any subset of fields and the rest keep their compiled
//! defaults.

use std::time::Duration;

use argus_core::perf::PerfThresholds;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings for the bridge and its demo host.
///
/// ```json
/// {
///   "server": { "tcpPort": 9000 },
///   "session": { "outboundQueueDepth": 64 }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ArgusSettings {
    /// Listener addresses and limits.
    pub server: ServerSettings,
    /// Per-session heartbeat, queue and handshake policy.
    pub session: SessionSettings,
    /// Command dispatch policy.
    pub commands: CommandSettings,
    /// Publication scheduler policy.
    pub scheduler: SchedulerSettings,
    /// Graceful shutdown policy.
    pub shutdown: ShutdownSettings,
    /// Logging.
    pub logging: LoggingSettings,
    /// Performance gates used by the `perf` topic.
    pub perf: PerfThresholds,
}

impl ArgusSettings {
    /// Reject values the bridge cannot run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(SettingsError::InvalidValue(msg.to_string()));

        if self.server.host.trim().is_empty() {
            return invalid("server.host must not be empty");
        }
        if self.server.enable_http && self.server.tcp_port != 0 && self.server.tcp_port == self.server.http_port {
            return invalid("server.tcpPort and server.httpPort must differ");
        }
        if self.server.max_connections == 0 {
            return invalid("server.maxConnections must be > 0");
        }
        if self.server.max_frame_bytes < 1024 {
            return invalid("server.maxFrameBytes must be at least 1024");
        }
        if self.session.heartbeat_interval_ms == 0 {
            return invalid("session.heartbeatIntervalMs must be > 0");
        }
        if self.session.missed_heartbeats == 0 {
            return invalid("session.missedHeartbeats must be > 0");
        }
        if self.session.outbound_queue_depth == 0 {
            return invalid("session.outboundQueueDepth must be > 0");
        }
        if self.session.handshake_timeout_ms == 0 {
            return invalid("session.handshakeTimeoutMs must be > 0");
        }
        if self.commands.timeout_ms == 0 {
            return invalid("commands.timeoutMs must be > 0");
        }
        Ok(())
    }
}

/// Listener settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address for both listeners.
    pub host: String,
    /// Raw TCP (length-prefixed envelopes) port. `0` picks an ephemeral port.
    pub tcp_port: u16,
    /// HTTP port (WebSocket, event stream, commands, health, metrics).
    pub http_port: u16,
    /// Serve the HTTP transport at all.
    pub enable_http: bool,
    /// Maximum concurrent sessions; further connections are refused.
    pub max_connections: usize,
    /// Largest accepted TCP frame.
    pub max_frame_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            tcp_port: 7878,
            http_port: 7879,
            enable_http: true,
            max_connections: 64,
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Session lifecycle settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Expected client heartbeat interval; liveness is checked this often.
    pub heartbeat_interval_ms: u64,
    /// Consecutive silent intervals before the session drains.
    pub missed_heartbeats: u32,
    /// Bounded outbound queue depth per session.
    pub outbound_queue_depth: usize,
    /// Time allowed for the client's hello.
    pub handshake_timeout_ms: u64,
    /// Time allowed to flush queued envelopes while draining.
    pub drain_timeout_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            missed_heartbeats: 3,
            outbound_queue_depth: 256,
            handshake_timeout_ms: 10_000,
            drain_timeout_ms: 2_000,
        }
    }
}

impl SessionSettings {
    /// Heartbeat interval as a `Duration`.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Handshake timeout as a `Duration`.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Drain timeout as a `Duration`.
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Command dispatch settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommandSettings {
    /// Per-request handler timeout.
    pub timeout_ms: u64,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self { timeout_ms: 5_000 }
    }
}

impl CommandSettings {
    /// Timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Scheduler settings.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerSettings {
    /// Timer-driven pass interval. `0` means the host drives passes by
    /// calling `tick()` itself.
    pub tick_interval_ms: u64,
}

impl SchedulerSettings {
    /// Timer interval, if the scheduler is timer-driven.
    pub fn tick_interval(&self) -> Option<Duration> {
        (self.tick_interval_ms > 0).then(|| Duration::from_millis(self.tick_interval_ms))
    }
}

/// Shutdown settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShutdownSettings {
    /// Grace period for sessions to drain before tasks are aborted.
    pub grace_ms: u64,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self { grace_ms: 5_000 }
    }
}

impl ShutdownSettings {
    /// Grace period as a `Duration`.
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

/// Logging settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of the compact format.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
