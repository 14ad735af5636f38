//! Bridge configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use argus_core::BridgeError;
use argus_settings::ArgusSettings;

/// Per-session lifecycle policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Liveness check interval; clients should heartbeat at least this often.
    pub heartbeat_interval: Duration,
    /// Consecutive silent intervals before the session drains.
    pub missed_heartbeats: u32,
    /// Bounded outbound queue depth.
    pub outbound_queue_depth: usize,
    /// Time allowed for the hello exchange.
    pub handshake_timeout: Duration,
    /// Time allowed to flush queued envelopes while draining.
    pub drain_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            missed_heartbeats: 3,
            outbound_queue_depth: 256,
            handshake_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(2),
        }
    }
}

/// Configuration for the bridge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Bind address for both listeners.
    pub host: IpAddr,
    /// Raw TCP port (`0` picks an ephemeral port).
    pub tcp_port: u16,
    /// HTTP port, or `None` to disable the HTTP transport.
    pub http_port: Option<u16>,
    /// Maximum concurrent sessions.
    pub max_connections: usize,
    /// Largest accepted TCP frame.
    pub max_frame_bytes: usize,
    /// Session lifecycle policy.
    pub session: SessionConfig,
    /// Per-request command timeout.
    pub command_timeout: Duration,
    /// Timer-driven scheduler interval; `None` when the host calls `tick()`.
    pub tick_interval: Option<Duration>,
    /// Grace period for draining sessions at shutdown.
    pub shutdown_grace: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            tcp_port: 7878,
            http_port: Some(7879),
            max_connections: 64,
            max_frame_bytes: 16 * 1024 * 1024,
            session: SessionConfig::default(),
            command_timeout: Duration::from_secs(5),
            tick_interval: None,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl BridgeConfig {
    /// Ephemeral ports on localhost; what tests and embedded hosts want.
    pub fn ephemeral() -> Self {
        Self {
            tcp_port: 0,
            http_port: Some(0),
            ..Self::default()
        }
    }

    /// Build from validated settings.
    ///
    /// Invalid settings are a fatal startup error.
    pub fn from_settings(settings: &ArgusSettings) -> Result<Self, BridgeError> {
        settings
            .validate()
            .map_err(|e| BridgeError::Configuration(e.to_string()))?;
        let host: IpAddr = settings.server.host.parse().map_err(|_| {
            BridgeError::Configuration(format!(
                "server.host '{}' is not an IP address",
                settings.server.host
            ))
        })?;
        Ok(Self {
            host,
            tcp_port: settings.server.tcp_port,
            http_port: settings.server.enable_http.then_some(settings.server.http_port),
            max_connections: settings.server.max_connections,
            max_frame_bytes: settings.server.max_frame_bytes,
            session: SessionConfig {
                heartbeat_interval: settings.session.heartbeat_interval(),
                missed_heartbeats: settings.session.missed_heartbeats,
                outbound_queue_depth: settings.session.outbound_queue_depth,
                handshake_timeout: settings.session.handshake_timeout(),
                drain_timeout: settings.session.drain_timeout(),
            },
            command_timeout: settings.commands.timeout(),
            tick_interval: settings.scheduler.tick_interval(),
            shutdown_grace: settings.shutdown.grace(),
        })
    }

    /// TCP bind address.
    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.tcp_port)
    }

    /// HTTP bind address, if enabled.
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_port.map(|port| SocketAddr::new(self.host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn defaults_match_settings_defaults() {
        let from_settings = BridgeConfig::from_settings(&ArgusSettings::default()).unwrap();
        assert_eq!(from_settings, BridgeConfig::default());
    }

    #[test]
    fn addresses() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.tcp_addr().to_string(), "127.0.0.1:7878");
        assert_eq!(cfg.http_addr().unwrap().port(), 7879);
        let cfg = BridgeConfig {
            http_port: None,
            ..cfg
        };
        assert!(cfg.http_addr().is_none());
    }

    #[test]
    fn http_disabled_in_settings() {
        let mut settings = ArgusSettings::default();
        settings.server.enable_http = false;
        let cfg = BridgeConfig::from_settings(&settings).unwrap();
        assert_eq!(cfg.http_port, None);
    }

    #[test]
    fn invalid_settings_are_configuration_errors() {
        let mut settings = ArgusSettings::default();
        settings.session.outbound_queue_depth = 0;
        let err = BridgeConfig::from_settings(&settings).unwrap_err();
        assert_matches!(err, BridgeError::Configuration(_));
        assert!(err.is_fatal());

        let mut settings = ArgusSettings::default();
        settings.server.host = "localhost.invalid".into();
        assert_matches!(
            BridgeConfig::from_settings(&settings),
            Err(BridgeError::Configuration(msg)) if msg.contains("server.host")
        );
    }

    #[test]
    fn ephemeral_uses_port_zero() {
        let cfg = BridgeConfig::ephemeral();
        assert_eq!(cfg.tcp_port, 0);
        assert_eq!(cfg.http_port, Some(0));
    }
}
