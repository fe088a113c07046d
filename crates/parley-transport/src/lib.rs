//! Persistent WebSocket transport: connect, send, receive, heartbeat and
//! automatic reconnection. Frames are opaque text; see `parley-session`
//! for the protocol layer.

pub mod error;
pub mod policy;
pub mod transport;

#[cfg(feature = "test-util")]
pub mod testing;

pub use error::{Result, TransportError};
pub use policy::ReconnectPolicy;
pub use transport::{FrameStream, Transport, TransportEvent};
