//! Error types shared across classcast crates

/// Result type alias using the core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in signaling, roster, and storage operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Signaling relay cannot be reached or refused the operation
    #[error("Signaling unavailable: {0}")]
    SignalingUnavailable(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Session directory error (unknown session, conflicting live session)
    #[error("Session error: {0}")]
    SessionError(String),

    /// Roster operation error
    #[error("Roster error: {0}")]
    RosterError(String),

    /// Recording storage error
    #[error("Recording storage error: {0}")]
    RecordingStorageError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SignalingUnavailable(_) | Error::RecordingStorageError(_) | Error::IoError(_)
        )
    }

    /// Check if this error came from the signaling layer
    pub fn is_signaling_error(&self) -> bool {
        matches!(self, Error::SignalingUnavailable(_))
    }
}
