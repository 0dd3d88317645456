//! Session recording.
//!
//! The recorder taps live [`MediaSource`]s rather than the per-viewer links,
//! so capture keeps working while viewers churn. Tapped frames funnel into a
//! collector task; stopping drains the collector, concatenates the segments
//! into one blob and hands it to the [`RecordingStore`].

use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use classcast_core::recording::{RecordedSession, RecordingMeta, RecordingStore};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::media::{MediaSource, RecordedSegment};

struct ActiveRecording {
    session_id: String,
    started_at: DateTime<Utc>,
    started_instant: Instant,
    /// Kept open so sources added mid-recording can be tapped with the same
    /// channel. Dropped on stop to let the collector drain out.
    segment_tx: mpsc::UnboundedSender<RecordedSegment>,
    tapped: Vec<MediaSource>,
    collector: JoinHandle<Vec<RecordedSegment>>,
}

/// Captures broadcast media and persists finished takes.
pub struct Recorder {
    store: Arc<dyn RecordingStore>,
    active: Mutex<Option<ActiveRecording>>,
}

impl Recorder {
    pub fn new(store: Arc<dyn RecordingStore>) -> Self {
        Self {
            store,
            active: Mutex::new(None),
        }
    }

    /// Whether a recording is currently running.
    pub async fn is_recording(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// Begin capturing the given sources.
    ///
    /// Calling while a recording is already running leaves the first one in
    /// place.
    pub async fn start(&self, session_id: &str, sources: &[MediaSource]) -> Result<()> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            warn!(
                "Recording already running for session {}, ignoring start",
                session_id
            );
            return Ok(());
        }

        let (segment_tx, mut segment_rx) = mpsc::unbounded_channel::<RecordedSegment>();

        let mut tapped = Vec::with_capacity(sources.len());
        for source in sources {
            source.install_tap(segment_tx.clone());
            tapped.push(source.clone());
        }

        let collector = tokio::spawn(async move {
            let mut segments = Vec::new();
            while let Some(segment) = segment_rx.recv().await {
                segments.push(segment);
            }
            segments
        });

        info!(
            "Recording started for session {} with {} source(s)",
            session_id,
            tapped.len()
        );

        *active = Some(ActiveRecording {
            session_id: session_id.to_string(),
            started_at: Utc::now(),
            started_instant: Instant::now(),
            segment_tx,
            tapped,
            collector,
        });

        Ok(())
    }

    /// Tap a source that appeared after the recording started, such as a
    /// screen share switched on mid-session. Returns whether a recording was
    /// running.
    pub async fn tap_source(&self, source: &MediaSource) -> bool {
        let mut active = self.active.lock().await;
        match active.as_mut() {
            Some(recording) => {
                source.install_tap(recording.segment_tx.clone());
                recording.tapped.push(source.clone());
                debug!("Recording picked up {} source", source.kind());
                true
            }
            None => false,
        }
    }

    /// Finish the active recording and persist it.
    ///
    /// Returns `Ok(None)` when no recording was running or when nothing was
    /// captured; an empty take stores no blob.
    pub async fn stop(
        &self,
        title: &str,
        broadcaster_name: &str,
    ) -> Result<Option<RecordingMeta>> {
        let recording = match self.active.lock().await.take() {
            Some(recording) => recording,
            None => return Ok(None),
        };

        for source in &recording.tapped {
            source.clear_tap();
        }
        drop(recording.segment_tx);

        let segments = recording
            .collector
            .await
            .map_err(|e| Error::InternalError(format!("Recording collector panicked: {}", e)))?;

        if segments.is_empty() {
            info!(
                "Recording for session {} captured nothing, discarding",
                recording.session_id
            );
            return Ok(None);
        }

        let mut blob = BytesMut::with_capacity(segments.iter().map(|s| s.data.len()).sum());
        for segment in &segments {
            blob.extend_from_slice(&segment.data);
        }

        let duration_seconds = recording.started_instant.elapsed().as_secs_f64().round() as u64;
        let meta = RecordingMeta {
            id: format!(
                "rec-{}-{}",
                recording.session_id,
                recording.started_at.timestamp_millis()
            ),
            session_id: recording.session_id,
            title: title.to_string(),
            broadcaster_name: broadcaster_name.to_string(),
            started_at: recording.started_at,
            duration_seconds,
        };

        info!(
            "Recording {} finished: {} segment(s), {} bytes over {}s",
            meta.id,
            segments.len(),
            blob.len(),
            duration_seconds
        );

        self.store
            .put(RecordedSession {
                meta: meta.clone(),
                media: blob.freeze(),
            })
            .await?;

        Ok(Some(meta))
    }
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder").finish_non_exhaustive()
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use classcast_core::recording::InMemoryRecordingStore;
    use std::time::Duration;

    fn recorder() -> (Recorder, Arc<InMemoryRecordingStore>) {
        let store = Arc::new(InMemoryRecordingStore::new());
        (Recorder::new(store.clone()), store)
    }

    #[tokio::test]
    async fn stop_without_start_is_a_noop() {
        let (recorder, store) = recorder();
        assert!(recorder.stop("Untitled", "Dana").await.unwrap().is_none());
        assert!(store.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_take_stores_no_blob() {
        let (recorder, store) = recorder();
        let camera = MediaSource::camera();

        recorder.start("class-7", &[camera.clone()]).await.unwrap();
        assert!(recorder.is_recording().await);

        assert!(recorder.stop("Week 3", "Dana").await.unwrap().is_none());
        assert!(!recorder.is_recording().await);
        assert!(!camera.has_tap());
        assert!(store.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn captured_frames_are_persisted_in_order() {
        let (recorder, store) = recorder();
        let camera = MediaSource::camera();

        recorder.start("class-7", &[camera.clone()]).await.unwrap();
        camera
            .write_frame(Bytes::from_static(b"frame-a"), Duration::from_millis(33))
            .await;
        camera
            .write_frame(Bytes::from_static(b"frame-b"), Duration::from_millis(33))
            .await;

        let meta = recorder
            .stop("Week 3", "Dana")
            .await
            .unwrap()
            .expect("captured frames should persist");

        assert!(meta.id.starts_with("rec-class-7-"));
        assert_eq!(meta.session_id, "class-7");
        assert_eq!(meta.title, "Week 3");
        assert_eq!(meta.broadcaster_name, "Dana");

        let stored = store.get(&meta.id).await.unwrap().expect("blob stored");
        assert_eq!(stored.media, Bytes::from_static(b"frame-aframe-b"));
    }

    #[tokio::test]
    async fn source_added_mid_recording_is_captured() {
        let (recorder, store) = recorder();
        let camera = MediaSource::camera();
        let screen = MediaSource::screen();

        recorder.start("class-7", &[camera.clone()]).await.unwrap();
        assert!(recorder.tap_source(&screen).await);

        screen
            .write_frame(Bytes::from_static(b"slides"), Duration::from_millis(33))
            .await;

        let meta = recorder.stop("Week 3", "Dana").await.unwrap().unwrap();
        let stored = store.get(&meta.id).await.unwrap().unwrap();
        assert_eq!(stored.media, Bytes::from_static(b"slides"));
        assert!(!screen.has_tap());
    }

    #[tokio::test]
    async fn tap_source_without_recording_reports_idle() {
        let (recorder, _store) = recorder();
        assert!(!recorder.tap_source(&MediaSource::screen()).await);
    }

    #[tokio::test]
    async fn second_start_keeps_first_recording() {
        let (recorder, store) = recorder();
        let camera = MediaSource::camera();

        recorder.start("class-7", &[camera.clone()]).await.unwrap();
        camera
            .write_frame(Bytes::from_static(b"early"), Duration::from_millis(33))
            .await;

        // The repeat start must not reset the capture buffer.
        recorder.start("class-7", &[camera.clone()]).await.unwrap();

        let meta = recorder.stop("Week 3", "Dana").await.unwrap().unwrap();
        let stored = store.get(&meta.id).await.unwrap().unwrap();
        assert_eq!(stored.media, Bytes::from_static(b"early"));
    }
}
