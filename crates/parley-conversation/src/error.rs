use parley_core::types::ConversationState;
use parley_session::SessionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("conversation is not running")]
    NotStarted,

    #[error("cannot {action} while {state}")]
    InvalidState {
        state: ConversationState,
        action: &'static str,
    },

    #[error(transparent)]
    Session(#[from] SessionError),
}

pub type Result<T> = std::result::Result<T, ConversationError>;
