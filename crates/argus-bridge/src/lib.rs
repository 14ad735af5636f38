//! # argus-bridge
//!
//! Runtime instrumentation bridge: publishes host snapshots to subscribed
//! clients and dispatches their commands back into the host.
//!
//! - **Transports**: length-prefixed TCP, plus WebSocket, SSE and one-shot
//!   HTTP commands on a separate port
//! - **Sessions**: explicit lifecycle state machine, heartbeat liveness and a
//!   bounded outbound queue that sheds telemetry before control traffic
//! - **Registry / scheduler**: copy-on-write subscriptions, per-subscriber
//!   cadence, one snapshot and one encoding per topic per pass
//! - **Dispatcher**: per-request timeouts with exactly one response per
//!   request, panics contained at the dispatch boundary
//! - **Overlay**: local render sinks, and an in-process mirror behind the
//!   `overlay` feature

#![deny(unsafe_code)]

pub mod bridge;
pub mod config;
pub mod dispatcher;
pub mod health;
pub mod metrics;
pub mod overlay;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod shutdown;
pub mod transport;

pub use bridge::{BoundAddrs, Bridge};
pub use config::{BridgeConfig, SessionConfig};
pub use dispatcher::{CommandContext, CommandDispatcher, CommandHandler};
#[cfg(feature = "overlay")]
pub use overlay::OverlayMirror;
pub use overlay::RenderSink;
pub use registry::{Subscriber, SubscriptionRegistry};
pub use scheduler::{PassReport, PublicationScheduler};
pub use session::{CloseReason, Session, SessionManager, SessionState, TransportKind};
