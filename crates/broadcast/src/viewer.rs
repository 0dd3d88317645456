//! Viewer session client.
//!
//! A [`ViewerSession`] is one watcher's side of a live session: it announces
//! itself over the relay, answers the broadcaster's offers on a single
//! [`PeerLink`], and sorts incoming video tracks into camera and screen
//! slots. The broadcaster's id is not known up front; the first offer
//! reveals it.

use std::sync::Arc;
use std::time::Duration;

use classcast_core::relay::{RelaySubscription, StoredSignal};
use classcast_core::roster::RosterUpdate;
use classcast_core::signal::{CandidateInit, PeerRole, SignalMessage, SignalPayload};
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_remote::TrackRemote;

use crate::config::SessionConfig;
use crate::context::SessionContext;
use crate::error::{Error, Result};
use crate::link::{LinkState, PeerLink};
use crate::media::TrackKind;

/// Where a viewer stands in the session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerState {
    /// Not part of any session.
    Idle,
    /// `join` announced, waiting for the broadcaster's offer.
    Joining,
    /// Offer answered, ICE and DTLS in progress.
    Connecting,
    /// Media is flowing.
    Live,
    /// The broadcaster ended the session.
    Ended,
    /// The link failed or never came up.
    Error,
}

/// Which incoming video slots currently carry a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrackSlots {
    /// Camera feed present.
    pub camera: bool,
    /// Screen share present.
    pub screen: bool,
}

impl TrackSlots {
    /// Whether no slot carries a track.
    pub fn is_empty(&self) -> bool {
        !self.camera && !self.screen
    }

    fn set(&mut self, kind: TrackKind, filled: bool) -> bool {
        let slot = match kind {
            TrackKind::Camera => &mut self.camera,
            TrackKind::Screen => &mut self.screen,
        };
        if *slot == filled {
            false
        } else {
            *slot = filled;
            true
        }
    }
}

/// One watcher's connection to a live session.
pub struct ViewerSession {
    participant_id: String,
    display_name: String,
    config: SessionConfig,
    context: SessionContext,
    state_tx: Arc<watch::Sender<ViewerState>>,
    state_rx: watch::Receiver<ViewerState>,
    slots_tx: Arc<watch::Sender<TrackSlots>>,
    slots_rx: watch::Receiver<TrackSlots>,
    active: Mutex<Option<ActiveViewer>>,
}

struct ActiveViewer {
    session_id: String,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
    /// Created lazily by the routing task when the first offer arrives.
    link: Arc<Mutex<Option<Arc<PeerLink>>>>,
}

impl ViewerSession {
    /// Create a viewer client. Nothing happens on the wire until
    /// [`ViewerSession::join`].
    pub fn new(
        participant_id: impl Into<String>,
        display_name: impl Into<String>,
        context: SessionContext,
        config: SessionConfig,
    ) -> Result<Self> {
        config.validate()?;

        let (state_tx, state_rx) = watch::channel(ViewerState::Idle);
        let (slots_tx, slots_rx) = watch::channel(TrackSlots::default());

        Ok(Self {
            participant_id: participant_id.into(),
            display_name: display_name.into(),
            config,
            context,
            state_tx: Arc::new(state_tx),
            state_rx,
            slots_tx: Arc::new(slots_tx),
            slots_rx,
            active: Mutex::new(None),
        })
    }

    /// Join a live session.
    ///
    /// Any previous link state is reset first. The relay subscription is
    /// opened before `join` is announced so the broadcaster's response
    /// cannot slip past us. The display name rides a roster delta right
    /// behind the join.
    pub async fn join(&self, session_id: impl Into<String>) -> Result<()> {
        let session_id = session_id.into();

        let previous = self.active.lock().await.take();
        if let Some(previous) = previous {
            debug!(
                "Joining {} while session {} is active, resetting",
                session_id, previous.session_id
            );
            finish_active(previous, &self.slots_tx).await;
        }

        let subscription = self.context.relay.subscribe(&session_id).await?;

        self.context
            .relay
            .publish(
                &session_id,
                SignalMessage::join(session_id.clone(), self.participant_id.clone()),
            )
            .await?;

        let update =
            RosterUpdate::new(self.participant_id.clone()).with_display_name(self.display_name.clone());
        self.context.roster.apply(&session_id, update.clone()).await;
        self.context
            .relay
            .publish(
                &session_id,
                SignalMessage::roster(
                    session_id.clone(),
                    self.participant_id.clone(),
                    PeerRole::Viewer,
                    update,
                ),
            )
            .await?;

        let link = Arc::new(Mutex::new(None));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let run = ViewerRun {
            session_id: session_id.clone(),
            participant_id: self.participant_id.clone(),
            config: self.config.clone(),
            context: self.context.clone(),
            state_tx: Arc::clone(&self.state_tx),
            slots_tx: Arc::clone(&self.slots_tx),
            link: Arc::clone(&link),
            shutdown_rx: shutdown_rx.clone(),
        };
        // Joining must be set before the routing task runs; the first offer
        // may arrive immediately and Connecting is only reachable from
        // Joining.
        advance_viewer(&self.state_tx, ViewerState::Joining);
        let handle = tokio::spawn(run_viewer(run, subscription, shutdown_rx));

        *self.active.lock().await = Some(ActiveViewer {
            session_id: session_id.clone(),
            shutdown_tx,
            handle,
            link,
        });

        info!(
            "Viewer {} joined session {}",
            self.participant_id, session_id
        );
        Ok(())
    }

    /// Leave the session.
    ///
    /// The `leave` signal is best effort; local teardown happens regardless
    /// of relay reachability. Idempotent.
    pub async fn leave(&self) -> Result<()> {
        let active = self.active.lock().await.take();
        let Some(active) = active else {
            advance_viewer(&self.state_tx, ViewerState::Idle);
            return Ok(());
        };

        if let Err(e) = self
            .context
            .relay
            .publish(
                &active.session_id,
                SignalMessage::leave(active.session_id.clone(), self.participant_id.clone()),
            )
            .await
        {
            warn!(
                "Leave for session {} not published: {}",
                active.session_id, e
            );
        }

        let session_id = active.session_id.clone();
        finish_active(active, &self.slots_tx).await;
        advance_viewer(&self.state_tx, ViewerState::Idle);

        info!("Viewer {} left session {}", self.participant_id, session_id);
        Ok(())
    }

    /// Self-report whether this participant's own camera is on.
    ///
    /// Rides a roster delta; the broadcaster and the other viewers merge it
    /// into their projections.
    pub async fn set_camera_active(&self, active: bool) -> Result<()> {
        let session_id = self
            .active
            .lock()
            .await
            .as_ref()
            .map(|a| a.session_id.clone())
            .ok_or_else(|| {
                Error::SessionNotActive(
                    "join a session before reporting camera state".to_string(),
                )
            })?;

        let update = RosterUpdate::new(self.participant_id.clone()).with_has_video(active);
        self.context.roster.apply(&session_id, update.clone()).await;
        self.context
            .relay
            .publish(
                &session_id,
                SignalMessage::roster(
                    session_id.clone(),
                    self.participant_id.clone(),
                    PeerRole::Viewer,
                    update,
                ),
            )
            .await?;

        debug!(
            "Viewer {} reported has_video={}",
            self.participant_id, active
        );
        Ok(())
    }

    /// This participant's id.
    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    /// Session currently joined, if any.
    pub async fn current_session(&self) -> Option<String> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|a| a.session_id.clone())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ViewerState {
        *self.state_rx.borrow()
    }

    /// Watch lifecycle transitions. The receiver sees the current state
    /// immediately.
    pub fn state_watch(&self) -> watch::Receiver<ViewerState> {
        self.state_rx.clone()
    }

    /// Current track slot occupancy.
    pub fn slots(&self) -> TrackSlots {
        *self.slots_rx.borrow()
    }

    /// Watch slot changes.
    pub fn slots_watch(&self) -> watch::Receiver<TrackSlots> {
        self.slots_rx.clone()
    }
}

impl std::fmt::Debug for ViewerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewerSession")
            .field("participant_id", &self.participant_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Everything the routing task needs for one joined session.
struct ViewerRun {
    session_id: String,
    participant_id: String,
    config: SessionConfig,
    context: SessionContext,
    state_tx: Arc<watch::Sender<ViewerState>>,
    slots_tx: Arc<watch::Sender<TrackSlots>>,
    link: Arc<Mutex<Option<Arc<PeerLink>>>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ViewerRun {
    /// Route one relay signal. Returns `false` when the session is over and
    /// the routing loop should stop.
    ///
    /// Our own messages loop back and are skipped unacked, as is anything
    /// addressed to someone else. Other viewers' roster deltas are applied
    /// but left for the broadcaster to ack. Broadcaster signals for us are
    /// consumed and acked.
    async fn dispatch(&self, pending: &mut Vec<CandidateInit>, signal: StoredSignal) -> bool {
        let StoredSignal { id, message, .. } = signal;

        if message.from == self.participant_id {
            return true;
        }
        if !message.is_addressed_to(&self.participant_id) {
            return true;
        }

        match message.role {
            PeerRole::Viewer => {
                if let SignalPayload::Roster { update } = message.payload {
                    self.context.roster.apply(&self.session_id, update).await;
                }
                true
            }
            PeerRole::Broadcaster => {
                let from = message.from.clone();
                let type_name = message.type_name();
                let mut keep_running = true;
                match message.payload {
                    SignalPayload::Offer { sdp } => {
                        self.handle_offer(pending, &from, sdp.body).await
                    }
                    SignalPayload::Candidate { candidate } => {
                        self.handle_candidate(pending, candidate).await
                    }
                    SignalPayload::Roster { update } => {
                        self.context.roster.apply(&self.session_id, update).await;
                    }
                    SignalPayload::End => {
                        self.handle_end().await;
                        keep_running = false;
                    }
                    SignalPayload::Join | SignalPayload::Answer { .. } | SignalPayload::Leave => {
                        warn!(
                            "Dropping {} carrying the broadcaster role, from {}",
                            type_name, from
                        );
                    }
                }
                self.ack(&id).await;
                keep_running
            }
        }
    }

    /// Apply an offer, publish the answer, flush buffered candidates.
    ///
    /// The first offer reveals the broadcaster's id and creates the link;
    /// later offers renegotiate on the same link (screen share toggled,
    /// camera dropped).
    async fn handle_offer(
        &self,
        pending: &mut Vec<CandidateInit>,
        broadcaster_id: &str,
        sdp: String,
    ) {
        let existing = self.link.lock().await.clone();
        let link = match existing {
            Some(link) => link,
            None => match self.open_link(broadcaster_id).await {
                Ok(link) => link,
                Err(e) => {
                    warn!(
                        "Could not build link to broadcaster {}: {}",
                        broadcaster_id, e
                    );
                    advance_viewer(&self.state_tx, ViewerState::Error);
                    return;
                }
            },
        };

        let answer = match link.apply_offer(sdp).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!("Offer from {} failed: {}", broadcaster_id, e);
                return;
            }
        };

        if let Err(e) = self
            .context
            .relay
            .publish(
                &self.session_id,
                SignalMessage::answer(
                    self.session_id.clone(),
                    self.participant_id.clone(),
                    broadcaster_id,
                    answer,
                ),
            )
            .await
        {
            warn!("Answer to {} not published: {}", broadcaster_id, e);
            return;
        }

        if link.state() == LinkState::New {
            link.mark(LinkState::Connecting);
        }
        advance_viewer(&self.state_tx, ViewerState::Connecting);

        for candidate in pending.drain(..) {
            if let Err(e) = link.add_remote_candidate(candidate).await {
                warn!("Buffered candidate from {} failed: {}", broadcaster_id, e);
            }
        }
    }

    /// Build the single link back to the broadcaster and start its helper
    /// tasks: candidate forwarding, track intake, lifecycle monitoring.
    async fn open_link(&self, broadcaster_id: &str) -> Result<Arc<PeerLink>> {
        let (candidate_tx, candidate_rx) = mpsc::unbounded_channel();
        let link = Arc::new(PeerLink::connect(broadcaster_id, &self.config, candidate_tx).await?);

        tokio::spawn(forward_candidates(
            self.context.clone(),
            self.session_id.clone(),
            self.participant_id.clone(),
            broadcaster_id.to_string(),
            candidate_rx,
        ));

        if let Some(tracks_rx) = link.take_remote_tracks() {
            tokio::spawn(watch_tracks(
                tracks_rx,
                Arc::clone(&self.slots_tx),
                Duration::from_secs(self.config.track_idle_timeout_secs),
            ));
        }

        tokio::spawn(monitor_link(
            Arc::clone(&link),
            Arc::clone(&self.state_tx),
            self.shutdown_rx.clone(),
            self.config.negotiation_timeout_secs,
        ));

        *self.link.lock().await = Some(Arc::clone(&link));
        info!("Link to broadcaster {} created", broadcaster_id);
        Ok(link)
    }

    /// Candidates can outrun the offer; buffer until the link exists.
    async fn handle_candidate(&self, pending: &mut Vec<CandidateInit>, candidate: CandidateInit) {
        let link = self.link.lock().await.clone();
        match link {
            Some(link) => {
                if let Err(e) = link.add_remote_candidate(candidate).await {
                    warn!("Candidate from broadcaster failed: {}", e);
                }
            }
            None => {
                debug!("Candidate arrived before the offer, buffering");
                pending.push(candidate);
            }
        }
    }

    /// The broadcaster ended the session: settle into `Ended`, tear the
    /// link down, clear local projections.
    async fn handle_end(&self) {
        info!("Session {} ended by the broadcaster", self.session_id);
        advance_viewer(&self.state_tx, ViewerState::Ended);

        let link = self.link.lock().await.take();
        if let Some(link) = link {
            if let Err(e) = link.close().await {
                debug!("Link close after session end: {}", e);
            }
        }
        self.slots_tx.send_replace(TrackSlots::default());
        self.context.roster.clear(&self.session_id).await;
    }

    async fn ack(&self, signal_id: &str) {
        if let Err(e) = self.context.relay.ack(&self.session_id, signal_id).await {
            warn!("Could not ack signal {}: {}", signal_id, e);
        }
    }
}

/// Routing loop: consume the session's relay subscription until shutdown or
/// session end.
async fn run_viewer(
    run: ViewerRun,
    mut subscription: RelaySubscription,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!("Viewer routing started for session {}", run.session_id);
    let mut pending_candidates: Vec<CandidateInit> = Vec::new();

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                debug!("Viewer routing for session {} shutting down", run.session_id);
                break;
            }

            signal = subscription.recv() => {
                match signal {
                    Some(signal) => {
                        if !run.dispatch(&mut pending_candidates, signal).await {
                            break;
                        }
                    }
                    None => {
                        warn!(
                            "Relay subscription for session {} ended",
                            run.session_id
                        );
                        // With no link yet there is no media path left to
                        // wait on. An established link keeps running; the
                        // monitor tracks its fate from here.
                        if run.link.lock().await.is_none() {
                            advance_viewer(&run.state_tx, ViewerState::Error);
                        }
                        break;
                    }
                }
            }
        }
    }

    subscription.close();
    info!("Viewer routing stopped for session {}", run.session_id);
}

/// Stop the routing task, close the link, reset the slots.
async fn finish_active(active: ActiveViewer, slots_tx: &watch::Sender<TrackSlots>) {
    let _ = active.shutdown_tx.send(true);
    if let Err(e) = active.handle.await {
        warn!("Viewer routing task ended badly: {}", e);
    }

    let link = active.link.lock().await.take();
    if let Some(link) = link {
        if let Err(e) = link.close().await {
            debug!("Link close on teardown: {}", e);
        }
    }
    slots_tx.send_replace(TrackSlots::default());
}

/// Pump locally-gathered candidates to the broadcaster.
async fn forward_candidates(
    context: SessionContext,
    session_id: String,
    participant_id: String,
    broadcaster_id: String,
    mut candidate_rx: mpsc::UnboundedReceiver<CandidateInit>,
) {
    while let Some(candidate) = candidate_rx.recv().await {
        let message = SignalMessage::candidate(
            session_id.clone(),
            participant_id.clone(),
            broadcaster_id.clone(),
            PeerRole::Viewer,
            candidate,
        );
        if let Err(e) = context.relay.publish(&session_id, message).await {
            warn!("Candidate for {} not published: {}", broadcaster_id, e);
        }
    }
    debug!("Candidate forwarding to {} finished", broadcaster_id);
}

/// Link lifecycle monitor.
///
/// Bounds the time a negotiation may take to reach `Connected`, maps link
/// states onto viewer states afterwards, and steps aside on shutdown so a
/// deliberate teardown never reads as an error.
async fn monitor_link(
    link: Arc<PeerLink>,
    state_tx: Arc<watch::Sender<ViewerState>>,
    mut shutdown_rx: watch::Receiver<bool>,
    timeout_secs: u64,
) {
    let mut link_rx = link.state_watch();

    loop {
        let state = *link_rx.borrow();
        if state.is_terminal() {
            advance_viewer(&state_tx, ViewerState::Error);
            return;
        }
        if state != LinkState::New {
            break;
        }
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => return,
            changed = link_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }

    // From the answer onward the broadcaster has a bounded window to bring
    // the link up.
    let window = Duration::from_secs(timeout_secs);
    let outcome = tokio::time::timeout(window, async {
        loop {
            let state = *link_rx.borrow();
            if state == LinkState::Connected || state.is_terminal() {
                return Some(state);
            }
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => return None,
                changed = link_rx.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    })
    .await;

    match outcome {
        Ok(Some(LinkState::Connected)) => {
            advance_viewer(&state_tx, ViewerState::Live);
            debug!("Link to {} is up", link.peer_id());
        }
        Ok(Some(_)) => {
            advance_viewer(&state_tx, ViewerState::Error);
            return;
        }
        Ok(None) => return,
        Err(_) => {
            warn!(
                "{}",
                Error::NegotiationTimeout {
                    peer_id: link.peer_id().to_string(),
                    timeout_secs,
                }
            );
            link.mark(LinkState::Failed);
            advance_viewer(&state_tx, ViewerState::Error);
            return;
        }
    }

    // Live. A later interruption or failure surfaces as an error unless an
    // end signal already settled the state.
    loop {
        let state = *link_rx.borrow();
        if state.is_terminal() || state == LinkState::Disconnected {
            advance_viewer(&state_tx, ViewerState::Error);
            return;
        }
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => return,
            changed = link_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

/// Per-slot takeover counters so a superseded track's reader cannot clear
/// the slot its replacement now owns.
#[derive(Default)]
struct SlotEpochs {
    camera: u64,
    screen: u64,
}

impl SlotEpochs {
    fn bump(&mut self, kind: TrackKind) -> u64 {
        let slot = match kind {
            TrackKind::Camera => &mut self.camera,
            TrackKind::Screen => &mut self.screen,
        };
        *slot += 1;
        *slot
    }

    fn current(&self, kind: TrackKind) -> u64 {
        match kind {
            TrackKind::Camera => self.camera,
            TrackKind::Screen => self.screen,
        }
    }
}

/// Sort incoming video tracks into slots.
///
/// The stream id label decides the slot; an unlabeled track falls back to
/// arrival order (first free slot, camera before screen, at most two).
async fn watch_tracks(
    mut tracks_rx: mpsc::UnboundedReceiver<Arc<TrackRemote>>,
    slots_tx: Arc<watch::Sender<TrackSlots>>,
    idle_timeout: Duration,
) {
    let epochs = Arc::new(SyncMutex::new(SlotEpochs::default()));

    while let Some(track) = tracks_rx.recv().await {
        if track.kind() != RTPCodecType::Video {
            debug!("Ignoring non-video track, stream {}", track.stream_id());
            continue;
        }

        let label = track.stream_id();
        let slot = TrackKind::from_label(&label).or_else(|| {
            let slots = *slots_tx.borrow();
            if !slots.camera {
                Some(TrackKind::Camera)
            } else if !slots.screen {
                Some(TrackKind::Screen)
            } else {
                None
            }
        });

        let Some(kind) = slot else {
            warn!("No slot left for incoming video track, stream {}", label);
            continue;
        };

        let epoch = epochs.lock().bump(kind);
        slots_tx.send_if_modified(|slots| slots.set(kind, true));
        info!("Incoming {} track filled its slot (stream {})", kind, label);

        tokio::spawn(read_track(
            track,
            kind,
            epoch,
            Arc::clone(&epochs),
            Arc::clone(&slots_tx),
            idle_timeout,
        ));
    }
    debug!("Track intake finished");
}

/// Drain one track's RTP until it ends or goes idle, then clear its slot.
async fn read_track(
    track: Arc<TrackRemote>,
    kind: TrackKind,
    epoch: u64,
    epochs: Arc<SyncMutex<SlotEpochs>>,
    slots_tx: Arc<watch::Sender<TrackSlots>>,
    idle_timeout: Duration,
) {
    loop {
        match tokio::time::timeout(idle_timeout, track.read_rtp()).await {
            Ok(Ok(_packet)) => {}
            Ok(Err(e)) => {
                debug!("{} track ended: {}", kind, e);
                break;
            }
            Err(_) => {
                info!(
                    "{} track silent for {:?}, clearing its slot",
                    kind, idle_timeout
                );
                break;
            }
        }
    }

    let superseded = epochs.lock().current(kind) != epoch;
    if superseded {
        debug!("{} slot already owned by a newer track", kind);
        return;
    }
    slots_tx.send_if_modified(|slots| slots.set(kind, false));
}

/// Advance the viewer state, rejecting transitions the lifecycle does not
/// allow. `Ended` absorbs everything except a reset; `Error` can still be
/// upgraded to `Ended` when the end signal catches up.
fn advance_viewer(state_tx: &watch::Sender<ViewerState>, next: ViewerState) {
    let changed = state_tx.send_if_modified(|current| {
        let allowed = match next {
            ViewerState::Idle | ViewerState::Joining => true,
            ViewerState::Connecting => *current == ViewerState::Joining,
            ViewerState::Live => {
                matches!(*current, ViewerState::Joining | ViewerState::Connecting)
            }
            ViewerState::Ended => !matches!(*current, ViewerState::Idle),
            ViewerState::Error => matches!(
                *current,
                ViewerState::Joining | ViewerState::Connecting | ViewerState::Live
            ),
        };
        if !allowed || *current == next {
            return false;
        }
        *current = next;
        true
    });
    if changed {
        debug!("Viewer state -> {:?}", next);
    }
}

// ============================================================
// Tests
// ============================================================
