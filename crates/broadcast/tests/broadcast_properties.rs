//! Broadcast Session Property Tests
//!
//! These tests drive a `BroadcastSession` over the in-process relay with raw
//! viewer signals, so each property can be checked without a full viewer
//! client on the other end.
//!
//! ## Covered Properties
//!
//! 1. One link per joined viewer, no more
//! 2. Rejoin replaces the viewer's link instead of duplicating it
//! 3. Joins past the capacity limit are ignored
//! 4. Replacing a source sends no offer; attaching one renegotiates
//! 5. One viewer's broken negotiation never touches the others
//! 6. A relay outage preserves established links
//! 7. Ending the session leaves no links, roster entries or live record
//! 8. A recording that captured nothing stores nothing
//! 9. Roster deltas from both roles merge field by field

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use classcast_broadcast::{BroadcastSession, MediaSource, SessionConfig, SessionContext};
use classcast_core::recording::InMemoryRecordingStore;
use classcast_core::relay::{InMemoryRelay, RelaySubscription, SignalId};
use classcast_core::signal::SignalPayload;
use classcast_core::{
    Roster, RosterUpdate, SessionDirectory, SignalMessage, SignalingRelay,
};
use tokio::time::sleep;
use tracing::info;

const SESSION: &str = "class-7";
const BROADCASTER: &str = "teacher-1";

// =============================================================================
// Test Setup Helpers
// =============================================================================

/// Initialize tracing for tests (call once per test)
fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,webrtc=warn")
        .try_init();
}

fn test_config() -> SessionConfig {
    SessionConfig::classroom_preset()
}

async fn live_broadcast(context: &SessionContext) -> BroadcastSession {
    let broadcast = BroadcastSession::new(
        SESSION,
        BROADCASTER,
        "Ms. Alvarez",
        context.clone(),
        test_config(),
    )
    .expect("valid config");
    broadcast.start().await.expect("start");
    broadcast
        .update_tracks(Some(MediaSource::camera()), None)
        .await
        .expect("camera source");
    broadcast
}

async fn publish_join(context: &SessionContext, viewer_id: &str) {
    context
        .relay
        .publish(SESSION, SignalMessage::join(SESSION, viewer_id))
        .await
        .expect("join published");
}

async fn wait_for_links(broadcast: &BroadcastSession, expected: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while broadcast.link_count().await != expected {
        assert!(
            Instant::now() < deadline,
            "expected {} link(s), still at {}",
            expected,
            broadcast.link_count().await
        );
        sleep(Duration::from_millis(20)).await;
    }
}

/// Relay double whose publishes can be made to fail on demand. Delivery and
/// acks keep working so already-established flows are unaffected.
struct FlakyRelay {
    inner: InMemoryRelay,
    failing: AtomicBool,
}

impl FlakyRelay {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryRelay::new(),
            failing: AtomicBool::new(false),
        })
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl SignalingRelay for FlakyRelay {
    async fn publish(
        &self,
        session_id: &str,
        message: SignalMessage,
    ) -> classcast_core::Result<SignalId> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(classcast_core::Error::SignalingUnavailable(
                "relay taken down for the test".to_string(),
            ));
        }
        self.inner.publish(session_id, message).await
    }

    async fn subscribe(&self, session_id: &str) -> classcast_core::Result<RelaySubscription> {
        self.inner.subscribe(session_id).await
    }

    async fn ack(&self, session_id: &str, signal_id: &str) -> classcast_core::Result<()> {
        self.inner.ack(session_id, signal_id).await
    }
}

// =============================================================================
// Link Lifecycle Properties
// =============================================================================

#[tokio::test]
async fn each_joining_viewer_gets_exactly_one_link() {
    init_test_tracing();
    info!("Starting each_joining_viewer_gets_exactly_one_link");

    let context = SessionContext::in_memory();
    let broadcast = live_broadcast(&context).await;

    for viewer in ["viewer-1", "viewer-2", "viewer-3"] {
        publish_join(&context, viewer).await;
    }
    wait_for_links(&broadcast, 3).await;

    for viewer in ["viewer-1", "viewer-2", "viewer-3"] {
        assert!(
            broadcast.link_state(viewer).await.is_some(),
            "no link for {}",
            viewer
        );
    }
    assert_eq!(context.roster.count_for_session(SESSION).await, 3);

    broadcast.end().await.expect("end");
}

#[tokio::test]
async fn rejoin_replaces_the_link_instead_of_duplicating() {
    init_test_tracing();
    info!("Starting rejoin_replaces_the_link_instead_of_duplicating");

    let context = SessionContext::in_memory();

    // Probe subscription opened first so it observes the full stream.
    let mut probe = context.relay.subscribe(SESSION).await.expect("probe");

    let broadcast = live_broadcast(&context).await;
    publish_join(&context, "viewer-1").await;
    wait_for_links(&broadcast, 1).await;

    publish_join(&context, "viewer-1").await;

    // Each join answers with a fresh targeted offer.
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut offers_to_viewer = 0;
    while offers_to_viewer < 2 {
        assert!(Instant::now() < deadline, "second offer never arrived");
        let stored = tokio::time::timeout(Duration::from_secs(1), probe.recv())
            .await
            .expect("probe stream alive")
            .expect("probe stream open");
        if matches!(stored.message.payload, SignalPayload::Offer { .. })
            && stored.message.to.as_deref() == Some("viewer-1")
        {
            offers_to_viewer += 1;
        }
    }

    assert_eq!(broadcast.link_count().await, 1);

    broadcast.end().await.expect("end");
}

#[tokio::test]
async fn joins_past_capacity_are_ignored() {
    init_test_tracing();
    info!("Starting joins_past_capacity_are_ignored");

    let context = SessionContext::in_memory();
    let broadcast = BroadcastSession::new(
        SESSION,
        BROADCASTER,
        "Ms. Alvarez",
        context.clone(),
        test_config().with_max_viewers(1),
    )
    .expect("valid config");
    broadcast.start().await.expect("start");

    publish_join(&context, "viewer-1").await;
    wait_for_links(&broadcast, 1).await;

    publish_join(&context, "viewer-2").await;

    // A roster delta published behind the join doubles as an ordering
    // sentinel: once it lands, the join before it has been routed.
    context
        .relay
        .publish(
            SESSION,
            SignalMessage::roster(
                SESSION,
                "viewer-3",
                classcast_core::PeerRole::Viewer,
                RosterUpdate::new("viewer-3").with_display_name("Sentinel"),
            ),
        )
        .await
        .expect("sentinel published");

    let deadline = Instant::now() + Duration::from_secs(5);
    while context.roster.get(SESSION, "viewer-3").await.is_none() {
        assert!(Instant::now() < deadline, "sentinel never routed");
        sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(broadcast.link_count().await, 1);
    assert!(broadcast.link_state("viewer-1").await.is_some());
    assert!(broadcast.link_state("viewer-2").await.is_none());

    broadcast.end().await.expect("end");
}

#[tokio::test]
async fn viewer_leave_drops_the_link_but_keeps_attendance() {
    init_test_tracing();
    info!("Starting viewer_leave_drops_the_link_but_keeps_attendance");

    let context = SessionContext::in_memory();
    let broadcast = live_broadcast(&context).await;

    publish_join(&context, "viewer-1").await;
    wait_for_links(&broadcast, 1).await;

    context
        .relay
        .publish(SESSION, SignalMessage::leave(SESSION, "viewer-1"))
        .await
        .expect("leave published");
    wait_for_links(&broadcast, 0).await;

    // The roster entry survives departure so attendance stays reviewable.
    assert!(context.roster.get(SESSION, "viewer-1").await.is_some());

    broadcast.end().await.expect("end");
}

#[tokio::test]
async fn replacing_a_source_sends_no_offer_but_attaching_does() {
    init_test_tracing();
    info!("Starting replacing_a_source_sends_no_offer_but_attaching_does");

    let context = SessionContext::in_memory();
    let mut probe = context.relay.subscribe(SESSION).await.expect("probe");

    let broadcast = live_broadcast(&context).await;
    publish_join(&context, "viewer-1").await;
    wait_for_links(&broadcast, 1).await;

    // Swapping the camera for a fresh source of the same kind replaces the
    // sender track in place.
    broadcast
        .update_tracks(Some(MediaSource::camera()), None)
        .await
        .expect("replace camera");

    // Adding the screen changes the link topology and renegotiates.
    broadcast
        .update_tracks(Some(MediaSource::camera()), Some(MediaSource::screen()))
        .await
        .expect("attach screen");

    // update_tracks publishes before returning, so once the sentinel lands
    // every offer the two calls produced is already in the probe stream.
    context
        .relay
        .publish(
            SESSION,
            SignalMessage::roster(
                SESSION,
                "viewer-9",
                classcast_core::PeerRole::Viewer,
                RosterUpdate::new("viewer-9").with_display_name("Sentinel"),
            ),
        )
        .await
        .expect("sentinel published");

    let mut offers_to_viewer = 0;
    loop {
        let stored = tokio::time::timeout(Duration::from_secs(5), probe.recv())
            .await
            .expect("probe stream alive")
            .expect("probe stream open");
        if stored.message.from == "viewer-9" {
            break;
        }
        if matches!(stored.message.payload, SignalPayload::Offer { .. })
            && stored.message.to.as_deref() == Some("viewer-1")
        {
            offers_to_viewer += 1;
        }
    }

    // One offer for the join, one for the screen attach, none for the
    // camera swap.
    assert_eq!(offers_to_viewer, 2);

    broadcast.end().await.expect("end");
}

// =============================================================================
// Failure Isolation Properties
// =============================================================================

#[tokio::test]
async fn broken_negotiation_drops_only_that_viewers_link() {
    init_test_tracing();
    info!("Starting broken_negotiation_drops_only_that_viewers_link");

    let context = SessionContext::in_memory();
    let broadcast = live_broadcast(&context).await;

    publish_join(&context, "viewer-1").await;
    publish_join(&context, "viewer-2").await;
    wait_for_links(&broadcast, 2).await;

    // viewer-2 answers with garbage SDP; its link must fail alone.
    context
        .relay
        .publish(
            SESSION,
            SignalMessage::answer(SESSION, "viewer-2", BROADCASTER, "not an sdp body"),
        )
        .await
        .expect("answer published");
    wait_for_links(&broadcast, 1).await;

    assert!(broadcast.link_state("viewer-1").await.is_some());
    assert!(broadcast.link_state("viewer-2").await.is_none());

    broadcast.end().await.expect("end");
}

#[tokio::test]
async fn relay_outage_preserves_established_links() {
    init_test_tracing();
    info!("Starting relay_outage_preserves_established_links");

    let flaky = FlakyRelay::new();
    let context = SessionContext::new(
        flaky.clone(),
        SessionDirectory::new(),
        Roster::new(),
        Arc::new(InMemoryRecordingStore::new()),
    );

    let broadcast = live_broadcast(&context).await;
    publish_join(&context, "viewer-1").await;
    publish_join(&context, "viewer-2").await;
    wait_for_links(&broadcast, 2).await;

    flaky.set_failing(true);

    // Adding the screen needs a renegotiation offer per link; with the relay
    // down that surfaces as a signaling error, not as dropped links.
    let result = broadcast
        .update_tracks(Some(MediaSource::camera()), Some(MediaSource::screen()))
        .await;
    match result {
        Err(e) => assert!(e.is_signaling_error(), "unexpected error kind: {}", e),
        Ok(_) => panic!("update_tracks should surface the relay outage"),
    }
    assert_eq!(broadcast.link_count().await, 2);

    flaky.set_failing(false);
    broadcast
        .check_attendance("viewer-1")
        .await
        .expect("relay recovered");

    broadcast.end().await.expect("end");
}

// =============================================================================
// Teardown and Recording Properties
// =============================================================================

#[tokio::test]
async fn end_leaves_no_links_roster_or_live_record() {
    init_test_tracing();
    info!("Starting end_leaves_no_links_roster_or_live_record");

    let context = SessionContext::in_memory();
    let broadcast = live_broadcast(&context).await;

    publish_join(&context, "viewer-1").await;
    publish_join(&context, "viewer-2").await;
    wait_for_links(&broadcast, 2).await;

    broadcast.end().await.expect("end");

    assert_eq!(broadcast.link_count().await, 0);
    assert_eq!(context.roster.count_for_session(SESSION).await, 0);
    let record = context.directory.get(SESSION).await.expect("record kept");
    assert!(!record.is_live);
}

#[tokio::test]
async fn recording_that_captured_nothing_stores_nothing() {
    init_test_tracing();
    info!("Starting recording_that_captured_nothing_stores_nothing");

    let context = SessionContext::in_memory();
    let broadcast = BroadcastSession::new(
        SESSION,
        BROADCASTER,
        "Ms. Alvarez",
        context.clone(),
        test_config(),
    )
    .expect("valid config");
    broadcast.start().await.expect("start");

    // No sources yet; the recording runs but has nothing to tap.
    broadcast.start_recording().await.expect("start recording");
    assert!(broadcast.is_recording().await);

    let meta = broadcast.stop_recording("Week 3").await.expect("stop");
    assert!(meta.is_none());
    assert!(context.recordings.get_all().await.expect("store").is_empty());

    broadcast.end().await.expect("end");
}

#[tokio::test]
async fn ending_persists_an_in_flight_recording() {
    init_test_tracing();
    info!("Starting ending_persists_an_in_flight_recording");

    let context = SessionContext::in_memory();
    let camera = MediaSource::camera();
    let broadcast = BroadcastSession::new(
        SESSION,
        BROADCASTER,
        "Ms. Alvarez",
        context.clone(),
        test_config(),
    )
    .expect("valid config");
    broadcast.start().await.expect("start");
    broadcast
        .update_tracks(Some(camera.clone()), None)
        .await
        .expect("camera source");

    broadcast.start_recording().await.expect("start recording");
    camera
        .write_frame(Bytes::from_static(b"frame-a"), Duration::from_millis(33))
        .await;
    camera
        .write_frame(Bytes::from_static(b"frame-b"), Duration::from_millis(33))
        .await;

    let meta = broadcast
        .end()
        .await
        .expect("end")
        .expect("recording persisted");
    assert_eq!(meta.session_id, SESSION);
    assert_eq!(meta.broadcaster_name, "Ms. Alvarez");
    assert!(meta.duration_seconds <= 1, "test recording ran for seconds?");

    let stored = context
        .recordings
        .get(&meta.id)
        .await
        .expect("store")
        .expect("blob kept");
    assert_eq!(stored.media, Bytes::from_static(b"frame-aframe-b"));
}

// =============================================================================
// Roster Merge Properties
// =============================================================================

#[tokio::test]
async fn roster_deltas_from_both_roles_merge_field_by_field() {
    init_test_tracing();
    info!("Starting roster_deltas_from_both_roles_merge_field_by_field");

    let context = SessionContext::in_memory();
    let broadcast = live_broadcast(&context).await;

    publish_join(&context, "viewer-1").await;
    wait_for_links(&broadcast, 1).await;

    // The viewer self-reports camera state while the broadcaster flips the
    // attendance flag; neither write may clobber the other.
    context
        .relay
        .publish(
            SESSION,
            SignalMessage::roster(
                SESSION,
                "viewer-1",
                classcast_core::PeerRole::Viewer,
                RosterUpdate::new("viewer-1")
                    .with_display_name("Sam")
                    .with_has_video(true),
            ),
        )
        .await
        .expect("viewer delta published");
    broadcast
        .check_attendance("viewer-1")
        .await
        .expect("attendance checked");

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let entry = context.roster.get(SESSION, "viewer-1").await;
        if let Some(entry) = &entry {
            if entry.has_video && entry.attendance_checked && entry.display_name == "Sam" {
                break;
            }
        }
        assert!(
            Instant::now() < deadline,
            "merge incomplete, entry: {:?}",
            entry
        );
        sleep(Duration::from_millis(20)).await;
    }

    broadcast.end().await.expect("end");
}
