//! Core types for classcast live sessions
//!
//! This crate carries everything the broadcast and viewer components share
//! without pulling in a media transport: the signaling protocol, the relay
//! contract with an in-process implementation, the live-session directory,
//! the participant roster, and recording storage.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  Broadcaster / Viewer session components             │
//! │  ├─ SignalingRelay (publish / subscribe / ack)       │
//! │  │   └─ SignalMessage (join/offer/answer/candidate/  │
//! │  │                     leave/end/roster)             │
//! │  ├─ SessionDirectory (single writer, watch readers)  │
//! │  ├─ Roster (field-level merge projection)            │
//! │  └─ RecordingStore (put / get_all / delete)          │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use classcast_core::{InMemoryRelay, SignalMessage, SignalingRelay};
//!
//! # async fn example() -> classcast_core::Result<()> {
//! let relay = InMemoryRelay::new();
//! let mut sub = relay.subscribe("class-7").await?;
//!
//! relay
//!     .publish("class-7", SignalMessage::join("class-7", "viewer-1"))
//!     .await?;
//!
//! let stored = sub.recv().await.unwrap();
//! assert_eq!(stored.message.type_name(), "join");
//! relay.ack("class-7", &stored.id).await?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod error;
pub mod recording;
pub mod relay;
pub mod roster;
pub mod session;
pub mod signal;

// Re-exports for public API
pub use error::{Error, Result};
pub use recording::{
    FsRecordingStore, InMemoryRecordingStore, RecordedSession, RecordingMeta, RecordingStore,
};
pub use relay::{InMemoryRelay, RelaySubscription, SignalId, SignalingRelay, StoredSignal};
pub use roster::{Participant, Roster, RosterUpdate};
pub use session::{SessionDirectory, SessionId, SessionRecord};
pub use signal::{
    CandidateInit, ParticipantId, PeerRole, SdpKind, SessionSdp, SignalMessage, SignalPayload,
};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
