//! Error types for broadcast sessions

/// Result type alias using broadcast Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a broadcast or viewer session
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// WebRTC peer connection error
    #[error("Peer connection error: {0}")]
    PeerConnectionError(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// Media source error
    #[error("Media source error: {0}")]
    MediaSourceError(String),

    /// A peer link did not reach the connected state in time
    #[error("Negotiation with peer {peer_id} timed out after {timeout_secs}s")]
    NegotiationTimeout {
        /// Remote peer of the stalled link
        peer_id: String,
        /// Configured negotiation window
        timeout_secs: u64,
    },

    /// Operation requires a started (or joined) session
    #[error("Session not active: {0}")]
    SessionNotActive(String),

    /// Internal error (should not occur in normal operation)
    #[error("Internal error: {0}")]
    InternalError(String),

    /// Error from the session core (relay, roster, recording store)
    #[error(transparent)]
    Core(#[from] classcast_core::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::NegotiationTimeout { .. } | Error::PeerConnectionError(_) => true,
            Error::Core(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Check if this error means the signaling relay is unreachable
    pub fn is_signaling_error(&self) -> bool {
        matches!(self, Error::Core(e) if e.is_signaling_error())
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }
}
