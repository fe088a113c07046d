//! Protocol layer over the transport: encodes control operations, decodes
//! server frames into [`SessionEvent`]s and buffers audio while offline.

pub mod audio;
pub mod error;
pub mod events;
pub mod session;

pub use audio::{AudioBuffer, pcm16_level};
pub use error::{Result, SessionError};
pub use events::SessionEvent;
pub use session::{Session, SessionEventStream};
