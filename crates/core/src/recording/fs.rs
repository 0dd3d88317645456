//! Filesystem recording store
//!
//! Lays one recording out as two files under the root directory:
//! `{id}.json` with the metadata and `{id}.bin` with the media blob.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tracing::{debug, warn};

use super::{sort_newest_first, RecordedSession, RecordingMeta, RecordingStore};
use crate::{Error, Result};

/// [`RecordingStore`] backed by a directory on disk
#[derive(Clone)]
pub struct FsRecordingStore {
    root: PathBuf,
}

impl FsRecordingStore {
    /// Create a store rooted at `root`
    ///
    /// The directory is created on the first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}.json", id))
    }

    fn blob_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}.bin", id))
    }

    /// Ids become file names, so they must stay inside the root
    fn validate_id(id: &str) -> Result<()> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if valid {
            Ok(())
        } else {
            Err(Error::RecordingStorageError(format!(
                "Invalid recording id: {:?}",
                id
            )))
        }
    }
}

#[async_trait]
impl RecordingStore for FsRecordingStore {
    async fn put(&self, record: RecordedSession) -> Result<()> {
        Self::validate_id(&record.meta.id)?;

        fs::create_dir_all(&self.root).await.map_err(|e| {
            Error::RecordingStorageError(format!(
                "Failed to create recording directory {}: {}",
                self.root.display(),
                e
            ))
        })?;

        let meta_json = serde_json::to_vec_pretty(&record.meta).map_err(|e| {
            Error::SerializationError(format!("Failed to serialize recording metadata: {}", e))
        })?;

        // Blob first, so a metadata file never points at a missing blob
        fs::write(self.blob_path(&record.meta.id), &record.media)
            .await
            .map_err(|e| {
                Error::RecordingStorageError(format!(
                    "Failed to write recording blob {}: {}",
                    record.meta.id, e
                ))
            })?;
        fs::write(self.meta_path(&record.meta.id), &meta_json)
            .await
            .map_err(|e| {
                Error::RecordingStorageError(format!(
                    "Failed to write recording metadata {}: {}",
                    record.meta.id, e
                ))
            })?;

        debug!(
            "Stored recording {} ({} bytes) under {}",
            record.meta.id,
            record.media.len(),
            self.root.display()
        );
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<RecordingMeta>> {
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::RecordingStorageError(format!(
                    "Failed to read recording directory {}: {}",
                    self.root.display(),
                    e
                )))
            }
        };

        let mut metas = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(|e| {
            Error::RecordingStorageError(format!("Failed to list recordings: {}", e))
        })? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<RecordingMeta>(&bytes) {
                    Ok(meta) => metas.push(meta),
                    Err(e) => {
                        warn!("Skipping unreadable recording metadata {:?}: {}", path, e);
                    }
                },
                Err(e) => {
                    warn!("Skipping unreadable recording metadata {:?}: {}", path, e);
                }
            }
        }

        sort_newest_first(&mut metas);
        Ok(metas)
    }

    async fn get(&self, id: &str) -> Result<Option<RecordedSession>> {
        Self::validate_id(id)?;

        let meta_bytes = match fs::read(self.meta_path(id)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::RecordingStorageError(format!(
                    "Failed to read recording metadata {}: {}",
                    id, e
                )))
            }
        };
        let meta = serde_json::from_slice::<RecordingMeta>(&meta_bytes).map_err(|e| {
            Error::SerializationError(format!("Corrupt recording metadata {}: {}", id, e))
        })?;

        let media = fs::read(self.blob_path(id)).await.map_err(|e| {
            Error::RecordingStorageError(format!("Failed to read recording blob {}: {}", id, e))
        })?;

        Ok(Some(RecordedSession {
            meta,
            media: Bytes::from(media),
        }))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        Self::validate_id(id)?;

        for path in [self.meta_path(id), self.blob_path(id)] {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(Error::RecordingStorageError(format!(
                        "Failed to delete recording {}: {}",
                        id, e
                    )))
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn record(id: &str, started_millis: i64) -> RecordedSession {
        RecordedSession {
            meta: RecordingMeta {
                id: id.to_string(),
                session_id: "class-7".to_string(),
                title: "Live class".to_string(),
                broadcaster_name: "Teacher".to_string(),
                started_at: Utc.timestamp_millis_opt(started_millis).unwrap(),
                duration_seconds: 90,
            },
            media: Bytes::from_static(b"frame-data"),
        }
    }

    #[tokio::test]
    async fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRecordingStore::new(dir.path());

        store.put(record("rec-class-7-1000", 1000)).await.unwrap();

        let loaded = store.get("rec-class-7-1000").await.unwrap().unwrap();
        assert_eq!(loaded.meta.duration_seconds, 90);
        assert_eq!(loaded.media, Bytes::from_static(b"frame-data"));
    }

    #[tokio::test]
    async fn test_get_all_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRecordingStore::new(dir.path());

        store.put(record("rec-class-7-2000", 2000)).await.unwrap();
        store.put(record("rec-class-7-1000", 1000)).await.unwrap();

        let ids: Vec<String> = store
            .get_all()
            .await
            .unwrap()
            .into_iter()
            .map(|meta| meta.id)
            .collect();
        assert_eq!(ids, vec!["rec-class-7-2000", "rec-class-7-1000"]);
    }

    #[tokio::test]
    async fn test_get_all_on_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRecordingStore::new(dir.path().join("never-created"));
        assert!(store.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRecordingStore::new(dir.path());
        assert!(store.get("rec-none").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_removes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRecordingStore::new(dir.path());

        store.put(record("rec-class-7-1000", 1000)).await.unwrap();
        store.delete("rec-class-7-1000").await.unwrap();

        assert!(store.get("rec-class-7-1000").await.unwrap().is_none());
        assert!(store.get_all().await.unwrap().is_empty());

        // Deleting again is a no-op
        store.delete("rec-class-7-1000").await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_path_escaping_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRecordingStore::new(dir.path());

        let mut bad = record("rec-ok", 1000);
        bad.meta.id = "../escape".to_string();
        assert!(store.put(bad).await.is_err());
        assert!(store.get("../escape").await.is_err());
    }
}
