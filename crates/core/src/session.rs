//! Live-session directory
//!
//! Tracks which sessions are currently live. The broadcast manager is the
//! only writer; every other component consumes read-only projections, either
//! by point reads or by watching a session's slot for changes. At most one
//! live session exists per session id at a time.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info};

use crate::signal::ParticipantId;
use crate::{Error, Result};

/// Session identifier (the class identifier)
pub type SessionId = String;

/// One live broadcast, as visible to the rest of the system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Session identifier
    pub session_id: SessionId,

    /// Participant currently broadcasting
    pub broadcaster_id: ParticipantId,

    /// Whether the session is live right now
    pub is_live: bool,

    /// When the broadcast went live
    pub started_at: DateTime<Utc>,
}

struct DirectoryInner {
    /// Records of currently-live sessions
    records: HashMap<SessionId, SessionRecord>,

    /// Watch slots, kept across live/end cycles so readers can observe a
    /// session before it goes live
    watchers: HashMap<SessionId, watch::Sender<Option<SessionRecord>>>,
}

/// Single-writer store of [`SessionRecord`]s
#[derive(Clone)]
pub struct SessionDirectory {
    inner: Arc<RwLock<DirectoryInner>>,
}

impl Default for SessionDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(DirectoryInner {
                records: HashMap::new(),
                watchers: HashMap::new(),
            })),
        }
    }

    /// Mark a session live
    ///
    /// Idempotent for the same broadcaster: a repeated call returns the
    /// existing record unchanged. A different broadcaster attempting to go
    /// live on an already-live session is rejected.
    pub async fn mark_live(
        &self,
        session_id: &str,
        broadcaster_id: &str,
    ) -> Result<SessionRecord> {
        let mut inner = self.inner.write().await;

        if let Some(existing) = inner.records.get(session_id) {
            if existing.broadcaster_id == broadcaster_id {
                debug!("Session {} already live, keeping record", session_id);
                return Ok(existing.clone());
            }
            return Err(Error::SessionError(format!(
                "Session {} is already live with broadcaster {}",
                session_id, existing.broadcaster_id
            )));
        }

        let record = SessionRecord {
            session_id: session_id.to_string(),
            broadcaster_id: broadcaster_id.to_string(),
            is_live: true,
            started_at: Utc::now(),
        };
        info!(
            "Session {} live, broadcaster {}",
            session_id, broadcaster_id
        );

        inner
            .records
            .insert(session_id.to_string(), record.clone());
        if let Some(tx) = inner.watchers.get(session_id) {
            // send_replace keeps the slot current even with no receivers
            tx.send_replace(Some(record.clone()));
        }

        Ok(record)
    }

    /// Mark a session ended and destroy its record
    ///
    /// Idempotent: ending a session that is not live is a no-op.
    pub async fn mark_ended(&self, session_id: &str) {
        let mut inner = self.inner.write().await;

        if inner.records.remove(session_id).is_some() {
            info!("Session {} ended", session_id);
            if let Some(tx) = inner.watchers.get(session_id) {
                tx.send_replace(None);
            }
        }
    }

    /// Point read of a session's record
    pub async fn get(&self, session_id: &str) -> Option<SessionRecord> {
        self.inner.read().await.records.get(session_id).cloned()
    }

    /// Whether a session is live right now
    pub async fn is_live(&self, session_id: &str) -> bool {
        self.inner.read().await.records.contains_key(session_id)
    }

    /// Read-only projection of a session's record
    ///
    /// The receiver yields `Some(record)` while the session is live and
    /// `None` otherwise, starting from the current state.
    pub async fn watch(&self, session_id: &str) -> watch::Receiver<Option<SessionRecord>> {
        let mut inner = self.inner.write().await;
        let current = inner.records.get(session_id).cloned();

        match inner.watchers.get(session_id) {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = watch::channel(current);
                inner.watchers.insert(session_id.to_string(), tx);
                rx
            }
        }
    }

    /// Ids of all currently-live sessions
    pub async fn live_sessions(&self) -> Vec<SessionId> {
        self.inner.read().await.records.keys().cloned().collect()
    }
}
