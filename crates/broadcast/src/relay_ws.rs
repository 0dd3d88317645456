//! WebSocket relay client.
//!
//! [`WsRelay`] implements the [`SignalingRelay`] contract against the
//! standalone relay service, speaking the JSON frame protocol from
//! `classcast_core::relay::wire`. One WebSocket connection carries every
//! session this process takes part in. Publish confirmations arrive in
//! request order, so in-flight publishes are matched to `published` frames
//! positionally.
//!
//! Reconnecting is the caller's concern: when the connection drops, pending
//! publishes fail, local subscriptions end, and a fresh [`WsRelay`] must be
//! connected.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use classcast_core::relay::wire::{ClientFrame, ServerFrame};
use classcast_core::relay::{RelaySubscription, SignalId, SignalingRelay, StoredSignal};
use classcast_core::signal::SignalMessage;
use classcast_core::{Error as CoreError, Result as CoreResult};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex as SyncMutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long a publish may wait for its confirmation frame.
const PUBLISH_CONFIRM_TIMEOUT: Duration = Duration::from_secs(10);

/// [`SignalingRelay`] backed by the standalone relay service.
pub struct WsRelay {
    frame_tx: mpsc::UnboundedSender<Message>,
    shared: Arc<WsShared>,
}

struct WsShared {
    url: String,
    closed: AtomicBool,
    /// Oldest first; confirmations pop the front.
    pending_publishes: SyncMutex<VecDeque<oneshot::Sender<CoreResult<SignalId>>>>,
    subscriptions: SyncMutex<SubscriptionTable>,
}

#[derive(Default)]
struct SubscriptionTable {
    next_id: u64,
    sessions: HashMap<String, Vec<(u64, mpsc::UnboundedSender<StoredSignal>)>>,
}

impl WsRelay {
    /// Connect to a relay service at `url` (ws:// or wss://).
    pub async fn connect(url: &str) -> CoreResult<Self> {
        info!("Connecting to relay {}", url);

        let (ws_stream, _) = connect_async(url).await.map_err(|e| {
            CoreError::SignalingUnavailable(format!("Failed to connect to relay {}: {}", url, e))
        })?;

        let (write, read) = ws_stream.split();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(WsShared {
            url: url.to_string(),
            closed: AtomicBool::new(false),
            pending_publishes: SyncMutex::new(VecDeque::new()),
            subscriptions: SyncMutex::new(SubscriptionTable::default()),
        });

        tokio::spawn(send_frames(write, frame_rx));
        tokio::spawn(read_frames(read, Arc::clone(&shared)));

        info!("Connected to relay {}", url);
        Ok(Self { frame_tx, shared })
    }

    /// Whether the underlying connection is still up.
    pub fn is_connected(&self) -> bool {
        !self.shared.closed.load(Ordering::Acquire)
    }

    fn send_frame(&self, frame: &ClientFrame) -> CoreResult<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(CoreError::SignalingUnavailable(format!(
                "Relay connection to {} is closed",
                self.shared.url
            )));
        }

        let json = frame.to_json()?;
        self.frame_tx.send(Message::Text(json)).map_err(|_| {
            CoreError::SignalingUnavailable(format!(
                "Relay connection to {} is closed",
                self.shared.url
            ))
        })
    }
}

impl std::fmt::Debug for WsRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsRelay")
            .field("url", &self.shared.url)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SignalingRelay for WsRelay {
    async fn publish(&self, session_id: &str, message: SignalMessage) -> CoreResult<SignalId> {
        let (confirm_tx, confirm_rx) = oneshot::channel();

        // The queue entry and the frame must go out as one unit so the
        // confirmation order stays aligned with the send order.
        {
            let mut pending = self.shared.pending_publishes.lock();
            self.send_frame(&ClientFrame::Publish {
                session_id: session_id.to_string(),
                message,
            })?;
            pending.push_back(confirm_tx);
        }

        match tokio::time::timeout(PUBLISH_CONFIRM_TIMEOUT, confirm_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CoreError::SignalingUnavailable(format!(
                "Relay connection to {} closed before the publish was confirmed",
                self.shared.url
            ))),
            Err(_) => Err(CoreError::SignalingUnavailable(format!(
                "Relay {} did not confirm the publish within {:?}",
                self.shared.url, PUBLISH_CONFIRM_TIMEOUT
            ))),
        }
    }

    async fn subscribe(&self, session_id: &str) -> CoreResult<RelaySubscription> {
        let (tx, rx) = mpsc::unbounded_channel();

        let subscriber_id = {
            let mut table = self.shared.subscriptions.lock();
            let id = table.next_id;
            table.next_id += 1;
            table
                .sessions
                .entry(session_id.to_string())
                .or_default()
                .push((id, tx));
            id
        };

        if let Err(e) = self.send_frame(&ClientFrame::Subscribe {
            session_id: session_id.to_string(),
        }) {
            let mut table = self.shared.subscriptions.lock();
            if let Some(subs) = table.sessions.get_mut(session_id) {
                subs.retain(|(id, _)| *id != subscriber_id);
                if subs.is_empty() {
                    table.sessions.remove(session_id);
                }
            }
            return Err(e);
        }

        let shared = Arc::clone(&self.shared);
        let frame_tx = self.frame_tx.clone();
        let session = session_id.to_string();
        let unsubscribe = Box::new(move || {
            let last_for_session = {
                let mut table = shared.subscriptions.lock();
                match table.sessions.get_mut(&session) {
                    Some(subs) => {
                        subs.retain(|(id, _)| *id != subscriber_id);
                        let empty = subs.is_empty();
                        if empty {
                            table.sessions.remove(&session);
                        }
                        empty
                    }
                    None => false,
                }
            };

            if last_for_session {
                if let Ok(json) = (ClientFrame::Unsubscribe {
                    session_id: session.clone(),
                })
                .to_json()
                {
                    let _ = frame_tx.send(Message::Text(json));
                }
            }
            debug!("Relay subscription for session {} closed", session);
        });

        debug!("Subscribed to session {} on relay", session_id);
        Ok(RelaySubscription::new(rx, unsubscribe))
    }

    async fn ack(&self, session_id: &str, signal_id: &str) -> CoreResult<()> {
        self.send_frame(&ClientFrame::Ack {
            session_id: session_id.to_string(),
            id: signal_id.to_string(),
        })
    }
}

/// Pump outgoing frames into the WebSocket.
async fn send_frames(
    mut write: SplitSink<WsStream, Message>,
    mut frame_rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(frame) = frame_rx.recv().await {
        if let Err(e) = write.send(frame).await {
            warn!("Relay send failed: {}", e);
            break;
        }
    }
    debug!("Relay sender task finished");
}

/// Read server frames until the connection ends, then fail everything that
/// was still in flight.
async fn read_frames(mut read: SplitStream<WsStream>, shared: Arc<WsShared>) {
    while let Some(next) = read.next().await {
        match next {
            Ok(Message::Text(text)) => handle_frame(&text, &shared),
            Ok(Message::Close(_)) => {
                info!("Relay {} closed the connection", shared.url);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Relay read failed: {}", e);
                break;
            }
        }
    }

    shared.closed.store(true, Ordering::Release);

    let drained: Vec<_> = {
        let mut pending = shared.pending_publishes.lock();
        pending.drain(..).collect()
    };
    for confirm in drained {
        let _ = confirm.send(Err(CoreError::SignalingUnavailable(format!(
            "Relay connection to {} is closed",
            shared.url
        ))));
    }

    shared.subscriptions.lock().sessions.clear();
    debug!("Relay receiver task finished");
}

fn handle_frame(text: &str, shared: &Arc<WsShared>) {
    let frame = match ServerFrame::from_json(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Unparseable relay frame: {}", e);
            return;
        }
    };

    match frame {
        ServerFrame::Deliver { session_id, signal } => {
            let mut table = shared.subscriptions.lock();
            match table.sessions.get_mut(&session_id) {
                Some(subs) => {
                    subs.retain(|(_, tx)| tx.send(signal.clone()).is_ok());
                }
                None => debug!(
                    "Delivery for session {} without a local subscription",
                    session_id
                ),
            }
        }
        ServerFrame::Published { session_id, id } => {
            let confirm = shared.pending_publishes.lock().pop_front();
            match confirm {
                Some(confirm) => {
                    let _ = confirm.send(Ok(id));
                }
                None => warn!(
                    "Publish confirmation for session {} with nothing in flight",
                    session_id
                ),
            }
        }
        ServerFrame::Error { message } => {
            let confirm = shared.pending_publishes.lock().pop_front();
            match confirm {
                Some(confirm) => {
                    let _ = confirm.send(Err(CoreError::SignalingUnavailable(message)));
                }
                None => warn!("Relay reported an error outside any publish: {}", message),
            }
        }
    }
}

// ============================================================
// Tests
// ============================================================
