//! Application-facing conversation: intents in, observable state out.
//!
//! A single actor task owns all mutable conversation state. It consumes the
//! session's event stream and the intent queue, so history order always
//! matches event arrival order.

pub mod conversation;
pub mod error;
pub mod observers;
pub mod state;

pub use conversation::Conversation;
pub use error::{ConversationError, Result};
pub use observers::{AudioLevel, AudioSource, TranscriptEvent};
pub use state::{Trigger, transition};
