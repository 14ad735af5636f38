//! Transports: length-prefixed TCP, and HTTP (WebSocket, SSE, one-shot
//! commands) on a separate port.

pub mod framing;
pub mod http;
pub mod listener;
pub mod tcp;

pub use framing::EnvelopeFrameCodec;
pub use http::{HttpState, router};
pub use listener::{Accepted, Backoff, TransportListener};
pub use tcp::serve_stream;
