//! In-process signaling relay
//!
//! Backs tests and single-process deployments. Retains unacked signals per
//! session and replays them to late subscribers, mirroring the behavior of
//! the remote relay service.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{RelaySubscription, SignalId, SignalingRelay, StoredSignal};
use crate::signal::SignalMessage;
use crate::Result;

/// Default cap on retained signals per session
const DEFAULT_RETENTION_LIMIT: usize = 1024;

#[derive(Default)]
struct SessionTopic {
    /// Unacked signals, oldest first
    retained: VecDeque<StoredSignal>,

    /// Live delivery channels keyed by subscriber id
    subscribers: HashMap<u64, mpsc::UnboundedSender<StoredSignal>>,
}

impl SessionTopic {
    fn is_empty(&self) -> bool {
        self.retained.is_empty() && self.subscribers.is_empty()
    }
}

struct RelayInner {
    topics: HashMap<String, SessionTopic>,
    next_subscriber_id: u64,
    retention_limit: usize,
}

/// In-memory [`SignalingRelay`]
#[derive(Clone)]
pub struct InMemoryRelay {
    inner: Arc<RwLock<RelayInner>>,
}

impl Default for InMemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRelay {
    /// Create a relay with the default retention limit
    pub fn new() -> Self {
        Self::with_retention_limit(DEFAULT_RETENTION_LIMIT)
    }

    /// Create a relay that retains at most `limit` unacked signals per
    /// session, dropping the oldest beyond that
    pub fn with_retention_limit(limit: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RelayInner {
                topics: HashMap::new(),
                next_subscriber_id: 0,
                retention_limit: limit.max(1),
            })),
        }
    }

    /// Number of unacked signals retained for a session
    pub fn retained_count(&self, session_id: &str) -> usize {
        self.inner
            .read()
            .topics
            .get(session_id)
            .map(|topic| topic.retained.len())
            .unwrap_or(0)
    }

    /// Number of live subscribers for a session
    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.inner
            .read()
            .topics
            .get(session_id)
            .map(|topic| topic.subscribers.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl SignalingRelay for InMemoryRelay {
    async fn publish(&self, session_id: &str, message: SignalMessage) -> Result<SignalId> {
        let stored = StoredSignal {
            id: Uuid::new_v4().to_string(),
            message,
            published_at: Utc::now(),
        };

        let mut inner = self.inner.write();
        let retention_limit = inner.retention_limit;
        let topic = inner.topics.entry(session_id.to_string()).or_default();

        topic.retained.push_back(stored.clone());
        if topic.retained.len() > retention_limit {
            let dropped = topic.retained.pop_front();
            if let Some(dropped) = dropped {
                warn!(
                    "Relay: retention limit hit for session {}, dropping {} signal {}",
                    session_id,
                    dropped.message.type_name(),
                    dropped.id
                );
            }
        }

        // Prune subscribers whose receiving side is gone
        topic
            .subscribers
            .retain(|_, tx| tx.send(stored.clone()).is_ok());

        debug!(
            "Relay: {} from {} published to session {} ({} subscribers)",
            stored.message.type_name(),
            stored.message.from,
            session_id,
            topic.subscribers.len()
        );

        Ok(stored.id)
    }

    async fn subscribe(&self, session_id: &str) -> Result<RelaySubscription> {
        let (tx, rx) = mpsc::unbounded_channel();

        let subscriber_id = {
            let mut inner = self.inner.write();
            let subscriber_id = inner.next_subscriber_id;
            inner.next_subscriber_id += 1;

            let topic = inner.topics.entry(session_id.to_string()).or_default();
            for stored in &topic.retained {
                // Receiver is held locally, the send cannot fail here
                let _ = tx.send(stored.clone());
            }
            topic.subscribers.insert(subscriber_id, tx);
            subscriber_id
        };

        debug!(
            "Relay: subscriber {} joined session {}",
            subscriber_id, session_id
        );

        let inner = Arc::clone(&self.inner);
        let session = session_id.to_string();
        let unsubscribe = Box::new(move || {
            let mut inner = inner.write();
            if let Some(topic) = inner.topics.get_mut(&session) {
                topic.subscribers.remove(&subscriber_id);
                if topic.is_empty() {
                    inner.topics.remove(&session);
                }
            }
            debug!("Relay: subscriber {} left session {}", subscriber_id, session);
        });

        Ok(RelaySubscription::new(rx, unsubscribe))
    }

    async fn ack(&self, session_id: &str, signal_id: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(topic) = inner.topics.get_mut(session_id) {
            topic.retained.retain(|stored| stored.id != signal_id);
            if topic.is_empty() {
                inner.topics.remove(session_id);
            }
        }
        Ok(())
    }
}
