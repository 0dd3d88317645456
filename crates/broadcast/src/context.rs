//! Shared service handles for session components
//!
//! Both sides of a session (broadcaster and viewers) talk to the same four
//! services: the signaling relay, the session directory, the roster
//! projection and the recording store. `SessionContext` bundles them so
//! constructors stay small and tests can swap in doubles per service.

use std::sync::Arc;

use classcast_core::recording::InMemoryRecordingStore;
use classcast_core::relay::InMemoryRelay;
use classcast_core::{RecordingStore, Roster, SessionDirectory, SignalingRelay};

/// Handles to the services a session runs against
#[derive(Clone)]
pub struct SessionContext {
    /// Signaling relay carrying all session messages
    pub relay: Arc<dyn SignalingRelay>,

    /// Live-session directory
    pub directory: SessionDirectory,

    /// Participant roster projection
    pub roster: Roster,

    /// Store for finished recordings
    pub recordings: Arc<dyn RecordingStore>,
}

impl SessionContext {
    /// Build a context from explicit service handles
    pub fn new(
        relay: Arc<dyn SignalingRelay>,
        directory: SessionDirectory,
        roster: Roster,
        recordings: Arc<dyn RecordingStore>,
    ) -> Self {
        Self {
            relay,
            directory,
            roster,
            recordings,
        }
    }

    /// Build a fully in-memory context
    ///
    /// One process hosting broadcaster and viewers, with nothing persisted.
    /// This is what the integration tests and local demos run on.
    pub fn in_memory() -> Self {
        Self {
            relay: Arc::new(InMemoryRelay::new()),
            directory: SessionDirectory::new(),
            roster: Roster::new(),
            recordings: Arc::new(InMemoryRecordingStore::new()),
        }
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_context_shares_services_across_clones() {
        let ctx = SessionContext::in_memory();
        let other = ctx.clone();

        ctx.directory
            .mark_live("class-7", "teacher-1")
            .await
            .expect("mark_live");

        assert!(other.directory.is_live("class-7").await);
    }
}
