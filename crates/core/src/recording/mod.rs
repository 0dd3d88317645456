//! Recording storage
//!
//! A completed broadcast is persisted as one immutable record: metadata plus
//! an opaque media blob. Stores list metadata newest first; the blob is only
//! loaded on a point read.

mod fs;
mod memory;

pub use fs::FsRecordingStore;
pub use memory::InMemoryRecordingStore;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::SessionId;
use crate::Result;

/// Metadata for a completed recording
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingMeta {
    /// Record identifier, `rec-{session_id}-{unix_millis}`
    pub id: String,

    /// Session the recording captured
    pub session_id: SessionId,

    /// Human-readable title
    pub title: String,

    /// Display name of the broadcaster
    pub broadcaster_name: String,

    /// When the recording started
    pub started_at: DateTime<Utc>,

    /// Elapsed wall-clock duration, rounded to whole seconds
    pub duration_seconds: u64,
}

/// A completed recording
#[derive(Debug, Clone)]
pub struct RecordedSession {
    /// Recording metadata
    pub meta: RecordingMeta,

    /// Captured media blob
    pub media: Bytes,
}

/// Durable storage for completed recordings
#[async_trait]
pub trait RecordingStore: Send + Sync {
    /// Persist a recording
    async fn put(&self, record: RecordedSession) -> Result<()>;

    /// List metadata of all recordings, newest first
    async fn get_all(&self) -> Result<Vec<RecordingMeta>>;

    /// Load one recording including its media blob
    async fn get(&self, id: &str) -> Result<Option<RecordedSession>>;

    /// Delete a recording; unknown ids are a no-op
    async fn delete(&self, id: &str) -> Result<()>;
}

/// Sort metadata newest first, with the id as a stable tiebreaker
pub(crate) fn sort_newest_first(metas: &mut [RecordingMeta]) {
    metas.sort_by(|a, b| {
        b.started_at
            .cmp(&a.started_at)
            .then_with(|| b.id.cmp(&a.id))
    });
}
