//! Participant roster with field-level merge
//!
//! The roster is the one piece of session state written by multiple actors:
//! participants self-report their camera state while the broadcaster flips
//! attendance checks. Updates therefore carry only the fields they intend to
//! change and are merged field by field, never applied as whole-record
//! replacement.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::session::SessionId;
use crate::signal::ParticipantId;

/// Roster entry for one session participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Stable participant/registry identifier
    pub id: ParticipantId,

    /// Name shown in attendance views
    pub display_name: String,

    /// Session the entry belongs to
    pub session_id: SessionId,

    /// Self-reported camera state
    pub has_video: bool,

    /// Set by the broadcaster when attendance is confirmed
    pub attendance_checked: bool,
}

/// Partial update merged into a participant's roster entry
///
/// Only fields that are present are applied; everything else is left
/// untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterUpdate {
    /// Participant the update applies to
    pub id: ParticipantId,

    /// New display name, if changing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// New camera state, if changing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_video: Option<bool>,

    /// New attendance state, if changing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attendance_checked: Option<bool>,
}

impl RosterUpdate {
    /// Create an empty update for a participant
    pub fn new(id: impl Into<ParticipantId>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Set the display name field
    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    /// Set the camera state field
    pub fn with_has_video(mut self, has_video: bool) -> Self {
        self.has_video = Some(has_video);
        self
    }

    /// Set the attendance state field
    pub fn with_attendance_checked(mut self, attendance_checked: bool) -> Self {
        self.attendance_checked = Some(attendance_checked);
        self
    }
}

/// In-memory roster projection
///
/// Keeps participants per session in join order. Entries are created on the
/// first update for an id (idempotent upsert) and discarded only by
/// [`Roster::clear`] when the session ends.
#[derive(Clone, Default)]
pub struct Roster {
    /// Participants per session, in join order
    entries: Arc<RwLock<HashMap<SessionId, Vec<Participant>>>>,
}

impl Roster {
    /// Create an empty roster
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge an update into a session's roster
    ///
    /// Returns `true` if a new entry was created, `false` if an existing
    /// entry was merged into.
    pub async fn apply(&self, session_id: &str, update: RosterUpdate) -> bool {
        let mut entries = self.entries.write().await;
        let session = entries.entry(session_id.to_string()).or_default();

        if let Some(existing) = session.iter_mut().find(|p| p.id == update.id) {
            if let Some(display_name) = update.display_name {
                existing.display_name = display_name;
            }
            if let Some(has_video) = update.has_video {
                existing.has_video = has_video;
            }
            if let Some(attendance_checked) = update.attendance_checked {
                existing.attendance_checked = attendance_checked;
            }
            false
        } else {
            debug!(
                "Roster: new participant {} in session {}",
                update.id, session_id
            );
            let display_name = update.display_name.unwrap_or_else(|| update.id.clone());
            session.push(Participant {
                id: update.id,
                display_name,
                session_id: session_id.to_string(),
                has_video: update.has_video.unwrap_or(false),
                attendance_checked: update.attendance_checked.unwrap_or(false),
            });
            true
        }
    }

    /// Get one participant's current entry
    pub async fn get(&self, session_id: &str, participant_id: &str) -> Option<Participant> {
        self.entries
            .read()
            .await
            .get(session_id)
            .and_then(|session| session.iter().find(|p| p.id == participant_id).cloned())
    }

    /// List a session's participants in join order
    pub async fn list_for_session(&self, session_id: &str) -> Vec<Participant> {
        self.entries
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of participants known for a session
    pub async fn count_for_session(&self, session_id: &str) -> usize {
        self.entries
            .read()
            .await
            .get(session_id)
            .map(|session| session.len())
            .unwrap_or(0)
    }

    /// Remove all entries for a session
    pub async fn clear(&self, session_id: &str) {
        let mut entries = self.entries.write().await;
        if let Some(removed) = entries.remove(session_id) {
            debug!(
                "Roster: cleared {} participants from session {}",
                removed.len(),
                session_id
            );
        }
    }
}
