use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,

    #[error("invalid connection request: {0}")]
    InvalidRequest(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("connection closed: {0}")]
    Closed(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("reconnection failed after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
}

impl TransportError {
    /// Connectivity errors are retried by the reconnection policy;
    /// everything else is reported to the caller as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Handshake(_) | Self::Timeout(_) | Self::Closed(_) | Self::Send(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
