//! Broadcaster session manager.
//!
//! A [`BroadcastSession`] is the presenter's side of a live session: it owns
//! one [`PeerLink`] per joined viewer, keeps every link's senders aligned
//! with the active [`SourceSet`], and consumes viewer signals from the relay
//! in a single routing task. Failures stay per-link: one viewer's broken
//! negotiation never touches another's.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use classcast_core::recording::RecordingMeta;
use classcast_core::relay::{RelaySubscription, StoredSignal};
use classcast_core::roster::RosterUpdate;
use classcast_core::signal::{CandidateInit, PeerRole, SignalMessage, SignalPayload};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::context::SessionContext;
use crate::error::{Error, Result};
use crate::link::{LinkState, PeerLink, TrackChange};
use crate::media::{MediaSource, SourceSet, TrackKind};
use crate::recording::Recorder;

/// The presenter's live session: viewer links, media fan-out, recording.
pub struct BroadcastSession {
    shared: Arc<Shared>,
    routing: Mutex<Option<RoutingTask>>,
}

struct RoutingTask {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Shared {
    session_id: String,
    broadcaster_id: String,
    display_name: String,
    config: SessionConfig,
    context: SessionContext,
    recorder: Recorder,
    links: RwLock<HashMap<String, Arc<PeerLink>>>,
    sources: RwLock<SourceSet>,
}

impl BroadcastSession {
    /// Create a session manager for one class session.
    ///
    /// Nothing happens on the wire until [`BroadcastSession::start`].
    pub fn new(
        session_id: impl Into<String>,
        broadcaster_id: impl Into<String>,
        display_name: impl Into<String>,
        context: SessionContext,
        config: SessionConfig,
    ) -> Result<Self> {
        config.validate()?;
        let recorder = Recorder::new(context.recordings.clone());

        Ok(Self {
            shared: Arc::new(Shared {
                session_id: session_id.into(),
                broadcaster_id: broadcaster_id.into(),
                display_name: display_name.into(),
                config,
                context,
                recorder,
                links: RwLock::new(HashMap::new()),
                sources: RwLock::new(SourceSet::default()),
            }),
            routing: Mutex::new(None),
        })
    }

    /// Go live: mark the session in the directory, subscribe to the relay
    /// and start routing viewer signals.
    ///
    /// Calling again while live re-applies the current sources to every link
    /// instead of duplicating state.
    pub async fn start(&self) -> Result<()> {
        let mut routing = self.routing.lock().await;

        let already_live = routing
            .as_ref()
            .map(|task| !task.handle.is_finished())
            .unwrap_or(false);
        if already_live {
            drop(routing);
            debug!(
                "Session {} already broadcasting, re-applying tracks",
                self.shared.session_id
            );
            let sources = self.shared.sources.read().await.clone();
            return self.shared.resync_all_links(&sources).await;
        }

        self.shared
            .context
            .directory
            .mark_live(&self.shared.session_id, &self.shared.broadcaster_id)
            .await?;

        let subscription = self
            .shared
            .context
            .relay
            .subscribe(&self.shared.session_id)
            .await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_routing(
            Arc::clone(&self.shared),
            subscription,
            shutdown_rx,
        ));
        *routing = Some(RoutingTask {
            shutdown_tx,
            handle,
        });

        info!(
            "Session {} is live, broadcaster {}",
            self.shared.session_id, self.shared.broadcaster_id
        );
        Ok(())
    }

    /// Swap the set of outgoing sources.
    ///
    /// Existing senders of a kind swap tracks in place without renegotiation;
    /// kinds that appear or disappear renegotiate with a targeted offer per
    /// affected viewer. Toggling one kind never disturbs the other.
    ///
    /// A webrtc failure on one link drops only that link. A relay failure is
    /// returned after every link has been attempted, with connected links
    /// left intact.
    pub async fn update_tracks(
        &self,
        camera: Option<MediaSource>,
        screen: Option<MediaSource>,
    ) -> Result<()> {
        let next = SourceSet { camera, screen };

        // A recording in flight keeps capturing across source swaps.
        for source in next.active() {
            if !source.has_tap() {
                self.shared.recorder.tap_source(&source).await;
            }
        }

        *self.shared.sources.write().await = next.clone();
        self.shared.resync_all_links(&next).await
    }

    /// Flip a participant's attendance flag and share the delta with the
    /// session.
    pub async fn check_attendance(&self, participant_id: &str) -> Result<()> {
        let update = RosterUpdate::new(participant_id).with_attendance_checked(true);

        self.shared
            .context
            .roster
            .apply(&self.shared.session_id, update.clone())
            .await;

        self.shared
            .context
            .relay
            .publish(
                &self.shared.session_id,
                SignalMessage::roster(
                    self.shared.session_id.clone(),
                    self.shared.broadcaster_id.clone(),
                    PeerRole::Broadcaster,
                    update,
                ),
            )
            .await?;

        debug!("Attendance checked for {}", participant_id);
        Ok(())
    }

    /// Begin recording the currently-active sources.
    ///
    /// Sources that appear later are tapped as they arrive, so a recording
    /// started before the camera goes live still captures it.
    pub async fn start_recording(&self) -> Result<()> {
        let sources = self.shared.sources.read().await.active();
        self.shared
            .recorder
            .start(&self.shared.session_id, &sources)
            .await
    }

    /// Finish recording and persist the take under `title`.
    pub async fn stop_recording(&self, title: &str) -> Result<Option<RecordingMeta>> {
        self.shared
            .recorder
            .stop(title, &self.shared.display_name)
            .await
    }

    /// Whether a recording is running.
    pub async fn is_recording(&self) -> bool {
        self.shared.recorder.is_recording().await
    }

    /// End the live session.
    ///
    /// Finalizes any active recording, announces `end`, stops routing, tears
    /// down every link, marks the directory record ended and clears the
    /// roster. A recording persistence failure is reported only after
    /// teardown has completed; the session end is never rolled back.
    pub async fn end(&self) -> Result<Option<RecordingMeta>> {
        let routing = match self.routing.lock().await.take() {
            Some(task) => task,
            None => {
                debug!(
                    "end() without a live broadcast for session {}",
                    self.shared.session_id
                );
                return Ok(None);
            }
        };

        info!("Ending session {}", self.shared.session_id);

        // The take stops at the end boundary; frames written after this are
        // not part of it.
        let recording = self
            .shared
            .recorder
            .stop(&self.shared.session_id, &self.shared.display_name)
            .await;

        // Live viewers get the end signal pushed at publish time; acking our
        // retained copy right away keeps it from replaying into a later
        // session on the same id.
        match self
            .shared
            .context
            .relay
            .publish(
                &self.shared.session_id,
                SignalMessage::end(
                    self.shared.session_id.clone(),
                    self.shared.broadcaster_id.clone(),
                ),
            )
            .await
        {
            Ok(signal_id) => {
                if let Err(e) = self
                    .shared
                    .context
                    .relay
                    .ack(&self.shared.session_id, &signal_id)
                    .await
                {
                    warn!("Could not clear own end signal: {}", e);
                }
            }
            Err(e) => warn!(
                "End signal for session {} not published: {}",
                self.shared.session_id, e
            ),
        }

        let _ = routing.shutdown_tx.send(true);
        if let Err(e) = routing.handle.await {
            warn!(
                "Routing task for session {} ended badly: {}",
                self.shared.session_id, e
            );
        }

        let links: Vec<(String, Arc<PeerLink>)> =
            self.shared.links.write().await.drain().collect();
        let closes = links.iter().map(|(_, link)| link.close());
        for result in futures::future::join_all(closes).await {
            if let Err(e) = result {
                debug!("Link close during session end: {}", e);
            }
        }
        info!(
            "Closed {} viewer link(s) for session {}",
            links.len(),
            self.shared.session_id
        );

        self.shared
            .context
            .directory
            .mark_ended(&self.shared.session_id)
            .await;
        self.shared.context.roster.clear(&self.shared.session_id).await;

        recording
    }

    /// Session this manager broadcasts.
    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    /// The broadcaster's participant id.
    pub fn broadcaster_id(&self) -> &str {
        &self.shared.broadcaster_id
    }

    /// Number of viewer links currently held.
    pub async fn link_count(&self) -> usize {
        self.shared.links.read().await.len()
    }

    /// State of one viewer's link, if it exists.
    pub async fn link_state(&self, viewer_id: &str) -> Option<LinkState> {
        self.shared
            .links
            .read()
            .await
            .get(viewer_id)
            .map(|link| link.state())
    }
}

impl std::fmt::Debug for BroadcastSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastSession")
            .field("session_id", &self.shared.session_id)
            .field("broadcaster_id", &self.shared.broadcaster_id)
            .finish_non_exhaustive()
    }
}

impl Shared {
    /// Route one relay signal.
    ///
    /// Viewer signals addressed to this broadcaster (or broadcast-scope) are
    /// handled and acked. The broadcaster's own signals loop back and are
    /// skipped unacked so their viewers can still claim them; so are signals
    /// targeted at someone else.
    async fn dispatch(self: &Arc<Self>, signal: StoredSignal) {
        let StoredSignal { id, message, .. } = signal;

        if message.role == PeerRole::Broadcaster {
            return;
        }
        if !message.is_addressed_to(&self.broadcaster_id) {
            return;
        }

        let from = message.from.clone();
        let type_name = message.type_name();
        match message.payload {
            SignalPayload::Join => self.handle_join(&from).await,
            SignalPayload::Answer { sdp } => self.handle_answer(&from, sdp.body).await,
            SignalPayload::Candidate { candidate } => {
                self.handle_candidate(&from, candidate).await
            }
            SignalPayload::Leave => self.handle_leave(&from).await,
            SignalPayload::Roster { update } => self.handle_roster(update).await,
            SignalPayload::Offer { .. } | SignalPayload::End => {
                warn!("Dropping {} carrying a viewer role, from {}", type_name, from);
            }
        }

        self.ack(&id).await;
    }

    /// A viewer asked to join: build its link, feed it the active sources
    /// and make the opening offer.
    async fn handle_join(self: &Arc<Self>, viewer_id: &str) {
        let replacing = {
            let links = self.links.read().await;
            if !links.contains_key(viewer_id)
                && links.len() >= self.config.max_viewers as usize
            {
                warn!(
                    "Session {} at capacity ({} viewers), ignoring join from {}",
                    self.session_id, self.config.max_viewers, viewer_id
                );
                return;
            }
            links.contains_key(viewer_id)
        };

        if replacing {
            info!(
                "Viewer {} rejoined session {}, replacing its link",
                viewer_id, self.session_id
            );
            self.drop_link(viewer_id).await;
        }

        let (candidate_tx, candidate_rx) = mpsc::unbounded_channel();
        let link = match PeerLink::connect(viewer_id, &self.config, candidate_tx).await {
            Ok(link) => Arc::new(link),
            Err(e) => {
                warn!("Could not build link for viewer {}: {}", viewer_id, e);
                return;
            }
        };

        self.links
            .write()
            .await
            .insert(viewer_id.to_string(), Arc::clone(&link));

        tokio::spawn(forward_candidates(
            Arc::clone(self),
            viewer_id.to_string(),
            candidate_rx,
        ));

        // Seed the roster entry; the viewer's own delta fills in the name.
        // Re-publishing the full roster catches the late joiner up on
        // everyone already present.
        self.context
            .roster
            .apply(&self.session_id, RosterUpdate::new(viewer_id))
            .await;
        self.republish_roster().await;

        let sources = self.sources.read().await.clone();
        if sources.is_empty() {
            info!(
                "Viewer {} joined session {} before any source is active, parking link",
                viewer_id, self.session_id
            );
        } else if let Err(e) = self.sync_link(&link, &sources).await {
            if e.is_signaling_error() {
                warn!("Opening offer to {} not published: {}", viewer_id, e);
            } else {
                warn!("Link to {} failed during setup: {}", viewer_id, e);
                link.mark(LinkState::Failed);
                self.drop_link(viewer_id).await;
                return;
            }
        }

        tokio::spawn(monitor_link(Arc::clone(self), Arc::clone(&link)));

        info!("Viewer {} joined session {}", viewer_id, self.session_id);
    }

    async fn handle_answer(self: &Arc<Self>, viewer_id: &str, sdp: String) {
        let link = self.links.read().await.get(viewer_id).cloned();
        match link {
            Some(link) => {
                if let Err(e) = link.apply_answer(sdp).await {
                    warn!("Answer from {} failed: {}", viewer_id, e);
                    link.mark(LinkState::Failed);
                    self.drop_link(viewer_id).await;
                }
            }
            None => warn!("Answer from {} without a link, ignoring", viewer_id),
        }
    }

    async fn handle_candidate(self: &Arc<Self>, viewer_id: &str, candidate: CandidateInit) {
        let link = self.links.read().await.get(viewer_id).cloned();
        match link {
            Some(link) => {
                if let Err(e) = link.add_remote_candidate(candidate).await {
                    warn!("Candidate from {} failed: {}", viewer_id, e);
                    link.mark(LinkState::Failed);
                    self.drop_link(viewer_id).await;
                }
            }
            None => debug!("Candidate from {} without a link, ignoring", viewer_id),
        }
    }

    /// Explicit leave fast path. The roster entry stays for attendance.
    async fn handle_leave(&self, viewer_id: &str) {
        info!("Viewer {} left session {}", viewer_id, self.session_id);
        self.drop_link(viewer_id).await;
    }

    async fn handle_roster(&self, update: RosterUpdate) {
        self.context.roster.apply(&self.session_id, update).await;
    }

    async fn ack(&self, signal_id: &str) {
        if let Err(e) = self.context.relay.ack(&self.session_id, signal_id).await {
            warn!("Could not ack signal {}: {}", signal_id, e);
        }
    }

    /// Re-publish the full roster as broadcast deltas so a late joiner sees
    /// every participant.
    async fn republish_roster(&self) {
        for participant in self.context.roster.list_for_session(&self.session_id).await {
            let update = RosterUpdate::new(participant.id)
                .with_display_name(participant.display_name)
                .with_has_video(participant.has_video)
                .with_attendance_checked(participant.attendance_checked);
            let message = SignalMessage::roster(
                self.session_id.clone(),
                self.broadcaster_id.clone(),
                PeerRole::Broadcaster,
                update,
            );
            if let Err(e) = self.context.relay.publish(&self.session_id, message).await {
                warn!(
                    "Roster sync for session {} not published: {}",
                    self.session_id, e
                );
                break;
            }
        }
    }

    /// Align every link's senders with `sources`, offering where topology
    /// changed.
    async fn resync_all_links(&self, sources: &SourceSet) -> Result<()> {
        let links: Vec<Arc<PeerLink>> = self.links.read().await.values().cloned().collect();
        let mut relay_failure: Option<Error> = None;

        for link in links {
            if let Err(e) = self.sync_link(&link, sources).await {
                if e.is_signaling_error() {
                    warn!("Offer to {} not published: {}", link.peer_id(), e);
                    relay_failure.get_or_insert(e);
                } else {
                    warn!(
                        "Link to {} failed while updating tracks: {}",
                        link.peer_id(),
                        e
                    );
                    link.mark(LinkState::Failed);
                    self.drop_link(link.peer_id()).await;
                }
            }
        }

        match relay_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Bring one link's senders in line with `sources`; send a targeted
    /// offer if a sender was added or removed.
    async fn sync_link(&self, link: &Arc<PeerLink>, sources: &SourceSet) -> Result<()> {
        let mut needs_offer = false;

        for kind in [TrackKind::Camera, TrackKind::Screen] {
            match sources.get(kind) {
                Some(source) => {
                    if link.attach_or_replace(source).await? == TrackChange::Added {
                        needs_offer = true;
                    }
                }
                None => {
                    if link.detach(kind).await? {
                        needs_offer = true;
                    }
                }
            }
        }

        if needs_offer {
            self.send_offer(link).await?;
        }
        Ok(())
    }

    /// Create and publish a targeted offer for one viewer.
    async fn send_offer(&self, link: &Arc<PeerLink>) -> Result<()> {
        let sdp = link.create_offer().await?;
        self.context
            .relay
            .publish(
                &self.session_id,
                SignalMessage::offer(
                    self.session_id.clone(),
                    self.broadcaster_id.clone(),
                    link.peer_id(),
                    sdp,
                ),
            )
            .await?;

        if link.state() == LinkState::New {
            link.mark(LinkState::Connecting);
        }
        debug!("Offer sent to viewer {}", link.peer_id());
        Ok(())
    }

    /// Remove a link from the set and close it. No-op if already gone.
    async fn drop_link(&self, viewer_id: &str) {
        let removed = self.links.write().await.remove(viewer_id);
        if let Some(link) = removed {
            if let Err(e) = link.close().await {
                debug!("Error closing link to {}: {}", viewer_id, e);
            }
            info!(
                "Viewer {} removed from session {}",
                viewer_id, self.session_id
            );
        }
    }
}

/// Routing loop: consume the session's relay subscription until shutdown.
async fn run_routing(
    shared: Arc<Shared>,
    mut subscription: RelaySubscription,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!("Routing started for session {}", shared.session_id);

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                debug!("Routing for session {} shutting down", shared.session_id);
                break;
            }

            signal = subscription.recv() => {
                match signal {
                    Some(signal) => shared.dispatch(signal).await,
                    None => {
                        warn!("Relay subscription for session {} ended", shared.session_id);
                        break;
                    }
                }
            }
        }
    }

    subscription.close();
    info!("Routing stopped for session {}", shared.session_id);
}

/// Pump one link's locally-gathered candidates to its viewer.
async fn forward_candidates(
    shared: Arc<Shared>,
    viewer_id: String,
    mut candidate_rx: mpsc::UnboundedReceiver<CandidateInit>,
) {
    while let Some(candidate) = candidate_rx.recv().await {
        let message = SignalMessage::candidate(
            shared.session_id.clone(),
            shared.broadcaster_id.clone(),
            viewer_id.clone(),
            PeerRole::Broadcaster,
            candidate,
        );
        if let Err(e) = shared.context.relay.publish(&shared.session_id, message).await {
            warn!("Candidate for {} not published: {}", viewer_id, e);
        }
    }
    debug!("Candidate forwarding for {} finished", viewer_id);
}

/// Per-link lifecycle monitor.
///
/// Times out a negotiation that never reaches `Connected`, then keeps
/// watching so a link that fails later is removed from the set. Parked links
/// still in `New` (no offer sent yet) are not timed.
async fn monitor_link(shared: Arc<Shared>, link: Arc<PeerLink>) {
    let mut state_rx = link.state_watch();

    loop {
        let state = *state_rx.borrow();
        if state.is_terminal() {
            finish_link(&shared, &link, state).await;
            return;
        }
        if state != LinkState::New {
            break;
        }
        if state_rx.changed().await.is_err() {
            return;
        }
    }

    // From the first offer the viewer has a bounded window to connect.
    let window = Duration::from_secs(shared.config.negotiation_timeout_secs);
    let outcome = tokio::time::timeout(window, async {
        loop {
            let state = *state_rx.borrow();
            if state == LinkState::Connected || state.is_terminal() {
                return state;
            }
            if state_rx.changed().await.is_err() {
                return LinkState::Closed;
            }
        }
    })
    .await;

    match outcome {
        Ok(LinkState::Connected) => {
            debug!("Viewer {} connected", link.peer_id());
        }
        Ok(state) => {
            finish_link(&shared, &link, state).await;
            return;
        }
        Err(_) => {
            warn!(
                "{}",
                Error::NegotiationTimeout {
                    peer_id: link.peer_id().to_string(),
                    timeout_secs: shared.config.negotiation_timeout_secs,
                }
            );
            link.mark(LinkState::Failed);
            shared.drop_link(link.peer_id()).await;
            return;
        }
    }

    // Connected. Watch for a failure later in the session.
    loop {
        let state = *state_rx.borrow();
        if state.is_terminal() {
            finish_link(&shared, &link, state).await;
            return;
        }
        if state_rx.changed().await.is_err() {
            return;
        }
    }
}

/// Handle a link that reached a terminal state on its own. A `Closed` link
/// was torn down deliberately and needs nothing further.
async fn finish_link(shared: &Arc<Shared>, link: &Arc<PeerLink>, state: LinkState) {
    if state == LinkState::Failed {
        info!("Viewer {} link failed, removing it", link.peer_id());
        shared.drop_link(link.peer_id()).await;
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn session(context: &SessionContext) -> BroadcastSession {
        BroadcastSession::new(
            "class-7",
            "teacher-1",
            "Dana",
            context.clone(),
            SessionConfig::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn end_without_start_is_a_noop() {
        let context = SessionContext::in_memory();
        let broadcast = session(&context);
        assert!(broadcast.end().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn start_marks_live_and_end_marks_ended() {
        let context = SessionContext::in_memory();
        let broadcast = session(&context);

        broadcast.start().await.unwrap();
        assert!(context.directory.is_live("class-7").await);

        // Repeat start while live is allowed.
        broadcast.start().await.unwrap();

        assert!(broadcast.end().await.unwrap().is_none());
        assert!(!context.directory.is_live("class-7").await);
        assert_eq!(broadcast.link_count().await, 0);
    }

    #[tokio::test]
    async fn second_broadcaster_for_same_session_is_rejected() {
        let context = SessionContext::in_memory();
        let first = session(&context);
        first.start().await.unwrap();

        let second = BroadcastSession::new(
            "class-7",
            "teacher-2",
            "Riley",
            context.clone(),
            SessionConfig::default(),
        )
        .unwrap();
        assert!(second.start().await.is_err());

        first.end().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_up_front() {
        let context = SessionContext::in_memory();
        let result = BroadcastSession::new(
            "class-7",
            "teacher-1",
            "Dana",
            context,
            SessionConfig::default().with_max_viewers(0),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn update_tracks_before_any_viewer_just_stores_sources() {
        let context = SessionContext::in_memory();
        let broadcast = session(&context);
        broadcast.start().await.unwrap();

        broadcast
            .update_tracks(Some(MediaSource::camera()), None)
            .await
            .unwrap();
        assert_eq!(broadcast.link_count().await, 0);

        broadcast.end().await.unwrap();
    }
}
