//! In-memory recording store

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::{sort_newest_first, RecordedSession, RecordingMeta, RecordingStore};
use crate::Result;

/// [`RecordingStore`] backed by a process-local map
#[derive(Clone, Default)]
pub struct InMemoryRecordingStore {
    records: Arc<RwLock<HashMap<String, RecordedSession>>>,
}

impl InMemoryRecordingStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored recordings
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Whether the store is empty
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl RecordingStore for InMemoryRecordingStore {
    async fn put(&self, record: RecordedSession) -> Result<()> {
        debug!(
            "Storing recording {} ({} bytes)",
            record.meta.id,
            record.media.len()
        );
        self.records
            .write()
            .await
            .insert(record.meta.id.clone(), record);
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<RecordingMeta>> {
        let mut metas: Vec<RecordingMeta> = self
            .records
            .read()
            .await
            .values()
            .map(|record| record.meta.clone())
            .collect();
        sort_newest_first(&mut metas);
        Ok(metas)
    }

    async fn get(&self, id: &str) -> Result<Option<RecordedSession>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.records.write().await.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::{TimeZone, Utc};

    fn record(id: &str, started_millis: i64) -> RecordedSession {
        RecordedSession {
            meta: RecordingMeta {
                id: id.to_string(),
                session_id: "class-7".to_string(),
                title: "Live class".to_string(),
                broadcaster_name: "Teacher".to_string(),
                started_at: Utc.timestamp_millis_opt(started_millis).unwrap(),
                duration_seconds: 60,
            },
            media: Bytes::from_static(b"segment"),
        }
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let store = InMemoryRecordingStore::new();

        store.put(record("rec-class-7-1000", 1000)).await.unwrap();

        let loaded = store.get("rec-class-7-1000").await.unwrap().unwrap();
        assert_eq!(loaded.meta.title, "Live class");
        assert_eq!(loaded.media, Bytes::from_static(b"segment"));

        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_all_newest_first() {
        let store = InMemoryRecordingStore::new();

        store.put(record("rec-class-7-1000", 1000)).await.unwrap();
        store.put(record("rec-class-7-3000", 3000)).await.unwrap();
        store.put(record("rec-class-7-2000", 2000)).await.unwrap();

        let ids: Vec<String> = store
            .get_all()
            .await
            .unwrap()
            .into_iter()
            .map(|meta| meta.id)
            .collect();
        assert_eq!(
            ids,
            vec!["rec-class-7-3000", "rec-class-7-2000", "rec-class-7-1000"]
        );
    }

    #[tokio::test]
    async fn test_delete() {
        let store = InMemoryRecordingStore::new();

        store.put(record("rec-class-7-1000", 1000)).await.unwrap();
        store.delete("rec-class-7-1000").await.unwrap();
        assert!(store.is_empty().await);

        // Unknown id is a no-op
        store.delete("rec-class-7-1000").await.unwrap();
    }
}
