//! Prometheus recorder and metric names.

use argus_core::BridgeError;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus recorder as the global `metrics` recorder.
///
/// Returns the handle used by the `/metrics` route. Fails if a recorder is
/// already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BridgeError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| BridgeError::Configuration(format!("failed to install metrics recorder: {e}")))?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// Sessions opened (counter, labels: transport).
pub const SESSIONS_TOTAL: &str = "bridge_sessions_total";
/// Sessions currently registered (gauge).
pub const SESSIONS_ACTIVE: &str = "bridge_sessions_active";
/// Sessions closed (counter, labels: reason).
pub const SESSIONS_CLOSED_TOTAL: &str = "bridge_sessions_closed_total";
/// Connections refused at the session limit (counter).
pub const SESSIONS_REJECTED_TOTAL: &str = "bridge_sessions_rejected_total";
/// Envelopes written to a transport (counter, labels: transport).
pub const ENVELOPES_SENT_TOTAL: &str = "bridge_envelopes_sent_total";
/// Inbound frames that failed to decode (counter, labels: code).
pub const DECODE_ERRORS_TOTAL: &str = "bridge_decode_errors_total";
/// Telemetry dropped or evicted under backpressure (counter, labels: transport).
pub const TELEMETRY_DROPPED_TOTAL: &str = "bridge_telemetry_dropped_total";
/// Commands dispatched (counter, labels: command).
pub const COMMANDS_TOTAL: &str = "bridge_commands_total";
/// Command errors (counter, labels: command, code).
pub const COMMAND_ERRORS_TOTAL: &str = "bridge_command_errors_total";
/// Commands that hit the timeout (counter, labels: command).
pub const COMMAND_TIMEOUTS_TOTAL: &str = "bridge_command_timeouts_total";
/// Handler results discarded after the response was already sent (counter).
pub const COMMAND_LATE_RESULTS_TOTAL: &str = "bridge_command_late_results_total";
/// Command duration (histogram, labels: command).
pub const COMMAND_DURATION_SECONDS: &str = "bridge_command_duration_seconds";
/// Scheduling pass duration (histogram).
pub const PASS_DURATION_SECONDS: &str = "bridge_pass_duration_seconds";
/// Snapshots delivered to subscribers (counter).
pub const SNAPSHOTS_DELIVERED_TOTAL: &str = "bridge_snapshots_delivered_total";
/// Transient accept errors (counter).
pub const ACCEPT_ERRORS_TOTAL: &str = "bridge_accept_errors_total";
