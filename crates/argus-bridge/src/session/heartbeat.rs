//! Heartbeat liveness monitoring.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;

use super::connection::Session;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// The client went quiet for `max_missed` consecutive intervals.
    TimedOut,
    /// The heartbeat was cancelled externally.
    Cancelled,
}

/// Watch a session's liveness flag.
///
/// At each `interval` tick the flag is checked and reset. A tick that finds
/// it unset counts as a miss; any heartbeat resets the count. Once
/// `max_missed` consecutive misses accumulate the session is considered lost.
/// The first tick fires immediately and consumes the flag set at connect, so
/// a silent client times out after `max_missed * interval`.
pub async fn run_heartbeat(
    session: Arc<Session>,
    interval: Duration,
    max_missed: u32,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let mut check_interval = time::interval(interval);
    let max_missed = max_missed.max(1);
    let mut missed: u32 = 0;

    loop {
        tokio::select! {
            _ = check_interval.tick() => {
                if session.check_alive() {
                    missed = 0;
                } else {
                    missed += 1;
                    tracing::trace!(session_id = %session.id(), missed, "heartbeat missed");
                    if missed >= max_missed {
                        return HeartbeatResult::TimedOut;
                    }
                }
            }
            () = cancel.cancelled() => {
                return HeartbeatResult::Cancelled;
            }
        }
    }
}
