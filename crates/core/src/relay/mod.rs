//! Signaling relay contract
//!
//! The relay is a session-scoped message bus with at-least-once delivery and
//! acknowledgement-by-deletion: a published signal is retained and replayed
//! to every subscriber of its session until some consumer that has fully
//! handled it acks it away. Per-sender publish order is preserved.

mod memory;
pub mod wire;

pub use memory::InMemoryRelay;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::signal::SignalMessage;
use crate::Result;

/// Relay-assigned signal identifier
pub type SignalId = String;

/// Relay envelope: a signal plus the bookkeeping needed to ack it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSignal {
    /// Relay-assigned id, used for acknowledgement
    pub id: SignalId,

    /// The signal itself
    pub message: SignalMessage,

    /// When the relay accepted the signal
    pub published_at: DateTime<Utc>,
}

/// Session-scoped signaling bus
///
/// Guarantees required by the session components:
/// - signals reach all current subscribers of their session in per-sender
///   publish order;
/// - unacked signals are replayed to late subscribers (at-least-once;
///   consumers must be idempotent);
/// - [`SignalingRelay::ack`] removes a fully-handled signal so it is not
///   redelivered;
/// - an unreachable relay fails `publish` loudly with
///   [`crate::Error::SignalingUnavailable`] instead of dropping silently.
#[async_trait]
pub trait SignalingRelay: Send + Sync {
    /// Publish a signal to a session
    async fn publish(&self, session_id: &str, message: SignalMessage) -> Result<SignalId>;

    /// Subscribe to a session's signals
    ///
    /// The subscription first yields the session's retained backlog, then
    /// live signals as they are published. Dropping it unsubscribes.
    async fn subscribe(&self, session_id: &str) -> Result<RelaySubscription>;

    /// Acknowledge (and thereby delete) a handled signal
    async fn ack(&self, session_id: &str, signal_id: &str) -> Result<()>;
}

/// Cleanup hook invoked when a subscription is dropped or closed
type UnsubscribeFn = Box<dyn FnOnce() + Send>;

/// Handle to one session subscription
pub struct RelaySubscription {
    receiver: mpsc::UnboundedReceiver<StoredSignal>,
    unsubscribe: Option<UnsubscribeFn>,
}

impl RelaySubscription {
    /// Build a subscription from a delivery channel and a cleanup hook
    pub fn new(
        receiver: mpsc::UnboundedReceiver<StoredSignal>,
        unsubscribe: UnsubscribeFn,
    ) -> Self {
        Self {
            receiver,
            unsubscribe: Some(unsubscribe),
        }
    }

    /// Receive the next signal
    ///
    /// Returns `None` once the subscription is closed and drained.
    pub async fn recv(&mut self) -> Option<StoredSignal> {
        self.receiver.recv().await
    }

    /// Unsubscribe explicitly
    ///
    /// Signals already queued locally remain receivable.
    pub fn close(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl Drop for RelaySubscription {
    fn drop(&mut self) {
        self.close();
    }
}
