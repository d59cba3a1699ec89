use thiserror::Error;

/// Errors produced by the hubrelay protocol and connector layers.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("channel closed")]
    ChannelClosed,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session ended")]
    SessionEnded,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("cancelled")]
    Cancelled,

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Whether this error ends the connection it occurred on.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            RelayError::Transport(_)
                | RelayError::ChannelClosed
                | RelayError::FrameTooLarge { .. }
                | RelayError::Io(_)
        )
    }
}

impl From<ciborium::de::Error<std::io::Error>> for RelayError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        RelayError::Deserialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for RelayError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        RelayError::Codec(e.to_string())
    }
}

impl From<ciborium::value::Error> for RelayError {
    fn from(e: ciborium::value::Error) -> Self {
        RelayError::Deserialization(e.to_string())
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
