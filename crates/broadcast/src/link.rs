//! Per-peer WebRTC link management.
//!
//! A [`PeerLink`] wraps one `RTCPeerConnection` together with the RTP senders
//! feeding it. The broadcaster holds one link per viewer and drives offers
//! through it; a viewer holds a single link back to the broadcaster and
//! answers. Local ICE candidates surface through a channel so the owner can
//! forward them over signaling without the link knowing about the relay.

use std::collections::HashMap;
use std::sync::Arc;

use classcast_core::signal::CandidateInit;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::media::{MediaSource, TrackKind};

/// Lifecycle of a peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Link created, negotiation not yet started.
    New,
    /// ICE and DTLS handshakes in progress.
    Connecting,
    /// Media can flow.
    Connected,
    /// Transport interrupted. May recover on its own or fail.
    Disconnected,
    /// ICE gave up. The link will not recover.
    Failed,
    /// Torn down locally.
    Closed,
}

impl LinkState {
    /// Whether the link can never carry media again.
    pub fn is_terminal(self) -> bool {
        matches!(self, LinkState::Failed | LinkState::Closed)
    }
}

/// Outcome of [`PeerLink::attach_or_replace`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackChange {
    /// A new sender was created. The remote peer must receive a fresh offer.
    Added,
    /// An existing sender swapped tracks in place. No renegotiation needed.
    Replaced,
}

/// One WebRTC peer connection plus the senders feeding it.
pub struct PeerLink {
    peer_id: String,
    pc: Arc<RTCPeerConnection>,
    state_tx: Arc<watch::Sender<LinkState>>,
    state_rx: watch::Receiver<LinkState>,
    /// At most one sender per track kind. `attach_or_replace` swaps the track
    /// inside an existing sender instead of growing this map.
    senders: Mutex<HashMap<TrackKind, Arc<RTCRtpSender>>>,
    remote_tracks: SyncMutex<Option<mpsc::UnboundedReceiver<Arc<TrackRemote>>>>,
}

impl PeerLink {
    /// Build a fresh peer connection for `peer_id`.
    ///
    /// Local ICE candidates are pushed into `candidate_tx` as they are
    /// gathered; the owner forwards them to the remote peer over signaling.
    /// Dropping the receiver silently discards further candidates.
    pub async fn connect(
        peer_id: impl Into<String>,
        config: &SessionConfig,
        candidate_tx: mpsc::UnboundedSender<CandidateInit>,
    ) -> Result<Self> {
        let peer_id = peer_id.into();

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::PeerConnectionError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::PeerConnectionError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(config.turn_servers.iter().map(|turn| {
                #[allow(clippy::needless_update)]
                RTCIceServer {
                    urls: vec![turn.url.clone()],
                    username: turn.username.clone(),
                    credential: turn.credential.clone(),
                    ..Default::default()
                }
            }))
            .collect();

        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await
            .map_err(|e| {
                Error::PeerConnectionError(format!("Failed to create peer connection: {}", e))
            })?,
        );

        let (state_tx, state_rx) = watch::channel(LinkState::New);
        let state_tx = Arc::new(state_tx);

        {
            let state_tx = Arc::clone(&state_tx);
            let peer_id = peer_id.clone();
            pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let state_tx = Arc::clone(&state_tx);
                let peer_id = peer_id.clone();
                Box::pin(async move {
                    let next = match s {
                        RTCPeerConnectionState::New => LinkState::New,
                        RTCPeerConnectionState::Connecting => LinkState::Connecting,
                        RTCPeerConnectionState::Connected => LinkState::Connected,
                        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
                        RTCPeerConnectionState::Failed => LinkState::Failed,
                        RTCPeerConnectionState::Closed => LinkState::Closed,
                        _ => return,
                    };
                    advance(&state_tx, &peer_id, next);
                })
            }));
        }

        let (track_tx, track_rx) = mpsc::unbounded_channel();
        {
            let peer_id = peer_id.clone();
            pc.on_track(Box::new(move |track, _receiver, _transceiver| {
                let track_tx = track_tx.clone();
                let peer_id = peer_id.clone();
                Box::pin(async move {
                    debug!(
                        "Peer {} delivered remote track: stream={}",
                        peer_id,
                        track.stream_id()
                    );
                    let _ = track_tx.send(track);
                })
            }));
        }

        {
            let peer_id = peer_id.clone();
            pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let candidate_tx = candidate_tx.clone();
                let peer_id = peer_id.clone();
                Box::pin(async move {
                    if let Some(candidate) = candidate {
                        match candidate.to_json() {
                            Ok(init) => {
                                let forwarded = candidate_tx.send(CandidateInit {
                                    candidate: init.candidate,
                                    sdp_mid: init.sdp_mid,
                                    sdp_mline_index: init.sdp_mline_index,
                                });
                                if forwarded.is_err() {
                                    debug!(
                                        "Peer {} candidate dropped, forwarder gone",
                                        peer_id
                                    );
                                }
                            }
                            Err(e) => {
                                warn!("Peer {} produced unserializable candidate: {}", peer_id, e)
                            }
                        }
                    }
                })
            }));
        }

        debug!("Created peer link to {}", peer_id);

        Ok(Self {
            peer_id,
            pc,
            state_tx,
            state_rx,
            senders: Mutex::new(HashMap::new()),
            remote_tracks: SyncMutex::new(Some(track_rx)),
        })
    }

    /// Identifier of the remote peer.
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Current link state.
    pub fn state(&self) -> LinkState {
        *self.state_rx.borrow()
    }

    /// Watch for state transitions. The receiver sees the current state
    /// immediately.
    pub fn state_watch(&self) -> watch::Receiver<LinkState> {
        self.state_rx.clone()
    }

    /// Force a state transition that the transport callbacks cannot observe,
    /// such as a negotiation that never completed.
    pub(crate) fn mark(&self, next: LinkState) {
        advance(&self.state_tx, &self.peer_id, next);
    }

    /// Take the stream of inbound remote tracks. Yields `None` after the
    /// first call.
    pub fn take_remote_tracks(&self) -> Option<mpsc::UnboundedReceiver<Arc<TrackRemote>>> {
        self.remote_tracks.lock().take()
    }

    /// Track kinds currently attached to this link.
    pub async fn attached_kinds(&self) -> Vec<TrackKind> {
        self.senders.lock().await.keys().copied().collect()
    }

    /// Feed `source` to this peer, swapping the track in place when a sender
    /// for its kind already exists.
    pub async fn attach_or_replace(&self, source: &MediaSource) -> Result<TrackChange> {
        let mut senders = self.senders.lock().await;
        let track = source.local_track() as Arc<dyn TrackLocal + Send + Sync>;

        if let Some(sender) = senders.get(&source.kind()) {
            sender.replace_track(Some(track)).await.map_err(|e| {
                Error::PeerConnectionError(format!(
                    "Failed to replace {} track for {}: {}",
                    source.kind(),
                    self.peer_id,
                    e
                ))
            })?;
            debug!("Peer {} swapped {} track in place", self.peer_id, source.kind());
            Ok(TrackChange::Replaced)
        } else {
            let sender = self.pc.add_track(track).await.map_err(|e| {
                Error::PeerConnectionError(format!(
                    "Failed to add {} track for {}: {}",
                    source.kind(),
                    self.peer_id,
                    e
                ))
            })?;
            senders.insert(source.kind(), sender);
            debug!("Peer {} gained {} sender", self.peer_id, source.kind());
            Ok(TrackChange::Added)
        }
    }

    /// Stop sending `kind` to this peer. Returns whether a sender existed.
    pub async fn detach(&self, kind: TrackKind) -> Result<bool> {
        let mut senders = self.senders.lock().await;
        match senders.remove(&kind) {
            Some(sender) => {
                self.pc.remove_track(&sender).await.map_err(|e| {
                    Error::PeerConnectionError(format!(
                        "Failed to remove {} track for {}: {}",
                        kind, self.peer_id, e
                    ))
                })?;
                debug!("Peer {} lost {} sender", self.peer_id, kind);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Create an SDP offer and install it as the local description.
    pub async fn create_offer(&self) -> Result<String> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;

        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        let local = self.pc.local_description().await.ok_or_else(|| {
            Error::SdpError("No local description after setting offer".to_string())
        })?;

        debug!("Created offer for peer {}", self.peer_id);
        Ok(local.sdp)
    }

    /// Install the remote answer.
    ///
    /// An answer that arrives after negotiation already settled is ignored;
    /// the relay delivers at least once, so repeats are expected.
    pub async fn apply_answer(&self, sdp: String) -> Result<()> {
        if self.pc.signaling_state() == RTCSignalingState::Stable {
            debug!(
                "Peer {} answer arrived in stable state, ignoring repeat",
                self.peer_id
            );
            return Ok(());
        }

        let answer = RTCSessionDescription::answer(sdp)
            .map_err(|e| Error::SdpError(format!("Failed to parse answer: {}", e)))?;

        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))?;

        debug!("Applied answer from peer {}", self.peer_id);
        Ok(())
    }

    /// Install a remote offer and produce the local answer.
    pub async fn apply_offer(&self, sdp: String) -> Result<String> {
        let offer = RTCSessionDescription::offer(sdp)
            .map_err(|e| Error::SdpError(format!("Failed to parse offer: {}", e)))?;

        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;

        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        let local = self.pc.local_description().await.ok_or_else(|| {
            Error::SdpError("No local description after setting answer".to_string())
        })?;

        debug!("Created answer for peer {}", self.peer_id);
        Ok(local.sdp)
    }

    /// Add an ICE candidate received from the remote peer.
    pub async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(|e| {
                Error::IceCandidateError(format!(
                    "Failed to add ICE candidate from {}: {}",
                    self.peer_id, e
                ))
            })?;
        Ok(())
    }

    /// Tear the link down. Safe to call more than once.
    pub async fn close(&self) -> Result<()> {
        info!("Closing link to peer {}", self.peer_id);
        self.mark(LinkState::Closed);
        self.pc.close().await.map_err(|e| {
            Error::PeerConnectionError(format!("Failed to close link to {}: {}", self.peer_id, e))
        })?;
        Ok(())
    }
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("peer_id", &self.peer_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Advance the shared state, keeping `Closed` final so late transport
/// callbacks cannot resurrect a torn-down link.
fn advance(state_tx: &watch::Sender<LinkState>, peer_id: &str, next: LinkState) {
    let changed = state_tx.send_if_modified(|current| {
        if *current == next || *current == LinkState::Closed {
            return false;
        }
        *current = next;
        true
    });
    if changed {
        debug!("Peer {} link state -> {:?}", peer_id, next);
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_link_starts_in_new_state() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let link = PeerLink::connect("viewer-1", &SessionConfig::default(), tx)
            .await
            .unwrap();

        assert_eq!(link.state(), LinkState::New);
        assert!(!link.state().is_terminal());

        link.close().await.unwrap();
        assert_eq!(link.state(), LinkState::Closed);
        assert!(link.state().is_terminal());
    }

    #[tokio::test]
    async fn second_attach_of_same_kind_replaces() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let link = PeerLink::connect("viewer-1", &SessionConfig::default(), tx)
            .await
            .unwrap();

        let first = MediaSource::camera();
        let change = link.attach_or_replace(&first).await.unwrap();
        assert_eq!(change, TrackChange::Added);

        let second = MediaSource::camera();
        let change = link.attach_or_replace(&second).await.unwrap();
        assert_eq!(change, TrackChange::Replaced);

        assert_eq!(link.attached_kinds().await, vec![TrackKind::Camera]);
        link.close().await.unwrap();
    }

    #[tokio::test]
    async fn detach_reports_whether_sender_existed() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let link = PeerLink::connect("viewer-1", &SessionConfig::default(), tx)
            .await
            .unwrap();

        link.attach_or_replace(&MediaSource::screen()).await.unwrap();
        assert!(link.detach(TrackKind::Screen).await.unwrap());
        assert!(!link.detach(TrackKind::Screen).await.unwrap());
        assert!(!link.detach(TrackKind::Camera).await.unwrap());

        link.close().await.unwrap();
    }

    #[tokio::test]
    async fn offer_carries_attached_video() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let link = PeerLink::connect("viewer-1", &SessionConfig::default(), tx)
            .await
            .unwrap();

        link.attach_or_replace(&MediaSource::camera()).await.unwrap();
        let sdp = link.create_offer().await.unwrap();
        assert!(sdp.contains("m=video"));

        link.close().await.unwrap();
    }

    #[test]
    fn closed_is_final() {
        let (tx, _rx) = watch::channel(LinkState::New);
        advance(&tx, "viewer-1", LinkState::Connected);
        assert_eq!(*tx.borrow(), LinkState::Connected);

        advance(&tx, "viewer-1", LinkState::Closed);
        advance(&tx, "viewer-1", LinkState::Connecting);
        assert_eq!(*tx.borrow(), LinkState::Closed);
    }
}
