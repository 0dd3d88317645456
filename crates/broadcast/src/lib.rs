//! Live broadcast sessions over per-viewer WebRTC links
//!
//! One broadcaster streams camera and screen video to many viewers. Each
//! viewer gets its own peer connection, negotiated through a lightweight
//! signaling relay, so one slow or broken viewer never disturbs the rest.
//!
//! # Features
//!
//! - **Per-viewer peer links**: independent offer/answer/ICE flow per viewer
//! - **Two video slots**: camera and screen, attach/replace/detach live
//! - **Viewer roster**: field-level merged presence shared over the relay
//! - **Recording**: taps the outgoing sources, persists through the
//!   `RecordingStore` on stop
//! - **Relay-agnostic signaling**: in-process relay for tests, WebSocket
//!   relay client behind the `ws-relay` feature
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  BroadcastSession (one per live session)                 │
//! │  ├─ routing task (relay subscription → dispatch)         │
//! │  ├─ PeerLink per viewer (webrtc peer connection)         │
//! │  │   └─ monitor task (negotiation timeout, failure)      │
//! │  ├─ SourceSet (camera / screen MediaSource)              │
//! │  └─ Recorder (taps sources, persists on stop)            │
//! │                                                          │
//! │  ViewerSession (one per watching participant)            │
//! │  ├─ routing task (offer/candidate/end → dispatch)        │
//! │  ├─ PeerLink to the broadcaster (lazy, on first offer)   │
//! │  └─ track watcher (slots + per-track RTP readers)        │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use classcast_broadcast::{
//!     BroadcastSession, MediaSource, SessionConfig, SessionContext, ViewerSession,
//! };
//!
//! let context = SessionContext::in_memory();
//!
//! let broadcast = BroadcastSession::new(
//!     "class-7",
//!     "teacher-1",
//!     "Ms. Alvarez",
//!     context.clone(),
//!     SessionConfig::classroom_preset(),
//! )?;
//! broadcast.start().await?;
//! broadcast
//!     .update_tracks(Some(MediaSource::camera()), None)
//!     .await?;
//!
//! let viewer = ViewerSession::new(
//!     "viewer-1",
//!     "Sam",
//!     context,
//!     SessionConfig::classroom_preset(),
//! )?;
//! viewer.join("class-7").await?;
//!
//! // ... stream ...
//!
//! let recording = broadcast.end().await?;
//! ```

#![warn(clippy::all)]

pub mod broadcaster;
pub mod config;
pub mod context;
pub mod error;
pub mod link;
pub mod media;
pub mod recording;
pub mod viewer;

#[cfg(feature = "ws-relay")]
pub mod relay_ws;

// Re-exports for public API
pub use broadcaster::BroadcastSession;
pub use config::{SessionConfig, TurnServerConfig};
pub use context::SessionContext;
pub use error::{Error, Result};
pub use link::{LinkState, PeerLink, TrackChange};
pub use media::{MediaSource, RecordedSegment, SourceSet, TrackKind};
pub use recording::Recorder;
pub use viewer::{TrackSlots, ViewerSession, ViewerState};

#[cfg(feature = "ws-relay")]
pub use relay_ws::WsRelay;

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let ver = version();
        assert!(!ver.is_empty());
    }
}
