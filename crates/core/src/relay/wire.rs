//! Relay wire protocol
//!
//! JSON frames exchanged between a relay client and the standalone relay
//! service over a WebSocket. The frame set mirrors the [`SignalingRelay`]
//! contract: `publish`, `subscribe` and `ack` requests flow up, retained and
//! live signals flow back down as `deliver` frames.
//!
//! [`SignalingRelay`]: crate::relay::SignalingRelay

use serde::{Deserialize, Serialize};

use crate::relay::{SignalId, StoredSignal};
use crate::session::SessionId;
use crate::signal::SignalMessage;
use crate::{Error, Result};

/// Frames sent by a relay client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Publish a signal into a session
    Publish {
        session_id: SessionId,
        message: SignalMessage,
    },

    /// Start receiving a session's signals (backlog first, then live)
    Subscribe { session_id: SessionId },

    /// Stop receiving a session's signals
    Unsubscribe { session_id: SessionId },

    /// Acknowledge a fully-handled signal so it is not redelivered
    Ack { session_id: SessionId, id: SignalId },
}

/// Frames sent by the relay service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServerFrame {
    /// A retained or live signal for a subscribed session
    Deliver {
        session_id: SessionId,
        signal: StoredSignal,
    },

    /// Confirms a `publish`, carrying the relay-assigned signal id
    ///
    /// Sent in request order, so a client may match confirmations to its
    /// in-flight publishes positionally.
    Published { session_id: SessionId, id: SignalId },

    /// A `publish` could not be processed
    ///
    /// Takes the place of the [`ServerFrame::Published`] confirmation, in
    /// the same request order. Failures of other frame kinds are logged by
    /// the service, never answered.
    Error { message: String },
}

impl ClientFrame {
    /// Serialize to a JSON string
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::SerializationError(e.to_string()))
    }

    /// Parse from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::SerializationError(e.to_string()))
    }
}

impl ServerFrame {
    /// Serialize to a JSON string
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::SerializationError(e.to_string()))
    }

    /// Parse from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::SerializationError(e.to_string()))
    }
}
