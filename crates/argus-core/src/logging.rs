//! Tracing subscriber setup.
//!
//! Context (session id, trace id, topic, peer) travels on spans; callers only
//! need to install a subscriber once at startup.

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber, writing to stderr.
///
/// `RUST_LOG` overrides `level` when set. With `json = true` each event is a
/// single JSON line, otherwise the compact human format is used. Subsequent
/// calls are no-ops.
pub fn init_subscriber(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .json();
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .compact();
        let _ = subscriber.try_init();
    }
}
