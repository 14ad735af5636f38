//! Per-connection sessions: lifecycle state, outbound queue, heartbeat and
//! the driver that runs a stream session end to end.

pub mod connection;
pub mod driver;
pub mod heartbeat;
pub mod manager;
pub mod outbound;
pub mod state;

pub use connection::{Session, SessionStatus, TransportKind};
pub use driver::{Inbound, SessionOutcome, run_session};
pub use heartbeat::{HeartbeatResult, run_heartbeat};
pub use manager::{CloseReason, SessionLimitReached, SessionManager, TopicInfo, negotiate_version};
pub use outbound::{Admission, OutboundQueue, RejectReason};
pub use state::{InvalidTransition, SessionEvent, SessionState};
