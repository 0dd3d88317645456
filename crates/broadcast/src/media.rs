//! Local media sources
//!
//! A [`MediaSource`] wraps one outgoing video track. The capture side (camera
//! or screen grabber) pushes encoded frames in; every peer link the source is
//! attached to fans the same track out to its viewer. The track kind is
//! carried in the WebRTC stream id, so the receiving side can tell camera
//! from screen without inspecting the media itself.
//!
//! A source can also carry one recording tap. When installed, every frame
//! written is mirrored into the tap before it is handed to the transport, so
//! recordings capture the broadcast even while no viewer is connected.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Kind of a broadcast video source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    /// Camera feed
    Camera,
    /// Screen share
    Screen,
}

impl TrackKind {
    /// Stream-id label carried on the wire
    pub fn label(&self) -> &'static str {
        match self {
            TrackKind::Camera => "camera",
            TrackKind::Screen => "screen",
        }
    }

    /// Parse a stream-id label back into a kind
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "camera" => Some(TrackKind::Camera),
            "screen" => Some(TrackKind::Screen),
            _ => None,
        }
    }
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// One frame captured for recording
#[derive(Debug, Clone)]
pub struct RecordedSegment {
    /// Source the frame came from
    pub kind: TrackKind,

    /// Encoded frame payload
    pub data: Bytes,

    /// When the frame was written
    pub captured_at: Instant,
}

type RecordingTap = Arc<RwLock<Option<mpsc::UnboundedSender<RecordedSegment>>>>;

/// One outgoing video track plus its recording tap
#[derive(Clone)]
pub struct MediaSource {
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
    tap: RecordingTap,
}

impl MediaSource {
    /// Create a camera source
    pub fn camera() -> Self {
        Self::new(TrackKind::Camera)
    }

    /// Create a screen-share source
    pub fn screen() -> Self {
        Self::new(TrackKind::Screen)
    }

    fn new(kind: TrackKind) -> Self {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
            format!("video-{}", kind.label()),
            kind.label().to_string(),
        ));

        Self {
            kind,
            track,
            tap: Arc::new(RwLock::new(None)),
        }
    }

    /// Kind of this source
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Write one encoded frame
    ///
    /// The frame is mirrored into the recording tap first, then handed to the
    /// transport, which fans it out to every bound link. Transport-side write
    /// failures are not surfaced: with no viewer bound there is nowhere to
    /// deliver, and a link mid-teardown fails its own binding without
    /// affecting the rest.
    pub async fn write_frame(&self, data: Bytes, duration: Duration) {
        self.forward_to_tap(&data);

        let sample = Sample {
            data,
            duration,
            timestamp: std::time::SystemTime::now(),
            ..Default::default()
        };

        if let Err(e) = self.track.write_sample(&sample).await {
            debug!("Frame on {} source not deliverable: {}", self.kind, e);
        }
    }

    fn forward_to_tap(&self, data: &Bytes) {
        let stale = {
            let tap = self.tap.read();
            match tap.as_ref() {
                Some(tx) => tx
                    .send(RecordedSegment {
                        kind: self.kind,
                        data: data.clone(),
                        captured_at: Instant::now(),
                    })
                    .is_err(),
                None => false,
            }
        };

        if stale {
            warn!("Recording tap on {} source is gone, removing it", self.kind);
            *self.tap.write() = None;
        }
    }

    /// Install the recording tap, replacing any previous one
    pub(crate) fn install_tap(&self, tx: mpsc::UnboundedSender<RecordedSegment>) {
        *self.tap.write() = Some(tx);
    }

    /// Remove the recording tap
    pub(crate) fn clear_tap(&self) {
        *self.tap.write() = None;
    }

    /// Whether a recording tap is currently installed
    pub fn has_tap(&self) -> bool {
        self.tap.read().is_some()
    }

    /// The transport-level track, for attaching to a peer link
    pub(crate) fn local_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }
}

impl std::fmt::Debug for MediaSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaSource")
            .field("kind", &self.kind)
            .field("has_tap", &self.has_tap())
            .finish()
    }
}

/// The broadcaster's currently-active sources, at most one per kind
#[derive(Debug, Clone, Default)]
pub struct SourceSet {
    /// Active camera source
    pub camera: Option<MediaSource>,

    /// Active screen source
    pub screen: Option<MediaSource>,
}

impl SourceSet {
    /// All active sources, camera first
    pub fn active(&self) -> Vec<MediaSource> {
        self.camera
            .iter()
            .chain(self.screen.iter())
            .cloned()
            .collect()
    }

    /// The source of one kind, if active
    pub fn get(&self, kind: TrackKind) -> Option<&MediaSource> {
        match kind {
            TrackKind::Camera => self.camera.as_ref(),
            TrackKind::Screen => self.screen.as_ref(),
        }
    }

    /// Whether any source is active
    pub fn is_empty(&self) -> bool {
        self.camera.is_none() && self.screen.is_none()
    }
}
