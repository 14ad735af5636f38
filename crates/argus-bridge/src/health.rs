//! `/health` endpoint body.

use std::time::Instant;

use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `"ok"` while the bridge is serving.
    pub status: String,
    /// Seconds since the bridge started.
    pub uptime_secs: u64,
    /// Registered sessions in any state.
    pub sessions: usize,
    /// Sessions in `Active`.
    pub active_sessions: usize,
    /// Topics the host publishes.
    pub topics: usize,
    /// Live subscriptions.
    pub subscriptions: usize,
}

/// Build a health response from live counters.
pub fn health_check(
    start_time: Instant,
    sessions: usize,
    active_sessions: usize,
    topics: usize,
    subscriptions: usize,
) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        sessions,
        active_sessions,
        topics,
        subscriptions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn status_is_ok() {
        let resp = health_check(Instant::now(), 0, 0, 0, 0);
        assert_eq!(resp.status, "ok");
        assert!(resp.uptime_secs < 2);
    }

    #[test]
    fn uptime_increases() {
        let start = Instant::now().checked_sub(Duration::from_secs(60)).unwrap();
        assert!(health_check(start, 0, 0, 0, 0).uptime_secs >= 59);
    }

    #[test]
    fn serializes_camel_case() {
        let resp = health_check(Instant::now(), 3, 2, 4, 5);
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["sessions"], 3);
        assert_eq!(v["activeSessions"], 2);
        assert_eq!(v["topics"], 4);
        assert_eq!(v["subscriptions"], 5);
        assert!(v["uptimeSecs"].is_number());
    }
}
