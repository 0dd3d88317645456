//! Configuration types for broadcast and viewer sessions

use serde::{Deserialize, Serialize};

/// Configuration shared by the broadcaster and viewer sides of a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// STUN server URLs (at least one required)
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Maximum concurrent viewer links (default: 50, broadcaster side only)
    pub max_viewers: u32,

    /// How long a link may stay in the connecting state before it is
    /// marked failed and torn down (default: 20s)
    pub negotiation_timeout_secs: u64,

    /// How long an incoming video track may go without a frame before its
    /// slot is considered ended (default: 5s, viewer side only)
    pub track_idle_timeout_secs: u64,
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn:// or turns://)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            max_viewers: 50,
            negotiation_timeout_secs: 20,
            track_idle_timeout_secs: 5,
        }
    }
}

impl SessionConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `stun_servers` is empty or contains a non-STUN URL
    /// - a TURN server URL is not a TURN URL
    /// - `max_viewers` is not in range 1-200
    /// - `negotiation_timeout_secs` is not in range 1-300
    /// - `track_idle_timeout_secs` is not in range 1-60
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.stun_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one STUN server is required".to_string(),
            ));
        }

        for url in &self.stun_servers {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                return Err(Error::InvalidConfig(format!(
                    "STUN server URL must start with stun: or stuns:, got {}",
                    url
                )));
            }
        }

        for server in &self.turn_servers {
            if !server.url.starts_with("turn:") && !server.url.starts_with("turns:") {
                return Err(Error::InvalidConfig(format!(
                    "TURN server URL must start with turn: or turns:, got {}",
                    server.url
                )));
            }
        }

        if self.max_viewers == 0 || self.max_viewers > 200 {
            return Err(Error::InvalidConfig(format!(
                "max_viewers must be in range 1-200, got {}",
                self.max_viewers
            )));
        }

        if self.negotiation_timeout_secs == 0 || self.negotiation_timeout_secs > 300 {
            return Err(Error::InvalidConfig(format!(
                "negotiation_timeout_secs must be in range 1-300, got {}",
                self.negotiation_timeout_secs
            )));
        }

        if self.track_idle_timeout_secs == 0 || self.track_idle_timeout_secs > 60 {
            return Err(Error::InvalidConfig(format!(
                "track_idle_timeout_secs must be in range 1-60, got {}",
                self.track_idle_timeout_secs
            )));
        }

        Ok(())
    }

    /// Create a configuration preset for a full classroom
    ///
    /// Generous viewer limit and a patient negotiation window for viewers
    /// joining over slow school networks.
    ///
    /// # Example
    ///
    /// ```
    /// use classcast_broadcast::config::SessionConfig;
    ///
    /// let config = SessionConfig::classroom_preset();
    /// assert_eq!(config.max_viewers, 50);
    /// ```
    pub fn classroom_preset() -> Self {
        Self::default()
    }

    /// Create a configuration preset for a small tutoring group
    ///
    /// Settings:
    /// - 8 viewers maximum
    /// - 10s negotiation window (fail fast, groups sit on good networks)
    /// - 3s track idle window for snappy slot updates
    ///
    /// # Example
    ///
    /// ```
    /// use classcast_broadcast::config::SessionConfig;
    ///
    /// let config = SessionConfig::small_group_preset();
    /// assert_eq!(config.max_viewers, 8);
    /// assert_eq!(config.negotiation_timeout_secs, 10);
    /// ```
    pub fn small_group_preset() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            max_viewers: 8,
            negotiation_timeout_secs: 10,
            track_idle_timeout_secs: 3,
        }
    }

    /// Replace the STUN server list
    ///
    /// Useful for chaining with preset methods.
    pub fn with_stun_servers(mut self, stun_servers: Vec<String>) -> Self {
        self.stun_servers = stun_servers;
        self
    }

    /// Add TURN servers to this configuration
    ///
    /// Useful for chaining with preset methods.
    pub fn with_turn_servers(mut self, turn_servers: Vec<TurnServerConfig>) -> Self {
        self.turn_servers = turn_servers;
        self
    }

    /// Set the maximum number of concurrent viewers
    ///
    /// Useful for chaining with preset methods.
    pub fn with_max_viewers(mut self, max_viewers: u32) -> Self {
        self.max_viewers = max_viewers;
        self
    }

    /// Set the negotiation timeout in seconds
    ///
    /// Useful for chaining with preset methods.
    pub fn with_negotiation_timeout_secs(mut self, secs: u64) -> Self {
        self.negotiation_timeout_secs = secs;
        self
    }

    /// Set the track idle timeout in seconds
    ///
    /// Useful for chaining with preset methods.
    pub fn with_track_idle_timeout_secs(mut self, secs: u64) -> Self {
        self.track_idle_timeout_secs = secs;
        self
    }
}
