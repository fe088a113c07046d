use parley_transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("not connected")]
    NotConnected,

    #[error("transport error: {0}")]
    Transport(TransportError),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<TransportError> for SessionError {
    fn from(value: TransportError) -> Self {
        match value {
            TransportError::NotConnected => Self::NotConnected,
            other => Self::Transport(other),
        }
    }
}

impl SessionError {
    pub fn is_not_connected(&self) -> bool {
        matches!(self, Self::NotConnected)
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
