//! Relay WebSocket service
//!
//! Accepts relay clients and bridges the JSON frame protocol onto one shared
//! [`InMemoryRelay`]. Every connection gets a writer task plus one forward
//! task per subscribed session; the read loop handles frames sequentially so
//! `published` confirmations leave in the same order the publishes arrived.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use classcast_core::relay::wire::{ClientFrame, ServerFrame};
use classcast_core::relay::{InMemoryRelay, RelaySubscription, SignalingRelay};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// WebSocket front over a shared signal store
pub struct RelayServer {
    relay: Arc<InMemoryRelay>,
}

impl RelayServer {
    /// Create a server retaining at most `retention_limit` unacked signals
    /// per session.
    pub fn new(retention_limit: usize) -> Self {
        Self {
            relay: Arc::new(InMemoryRelay::with_retention_limit(retention_limit)),
        }
    }

    /// Accept relay clients until `shutdown` flips to true.
    pub async fn run(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let relay = Arc::clone(&self.relay);
                            tokio::spawn(handle_connection(stream, addr, relay));
                        }
                        Err(e) => warn!("Accept failed: {}", e),
                    }
                }
            }
        }
        info!("Relay server stopped accepting connections");
    }
}

impl std::fmt::Debug for RelayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayServer").finish_non_exhaustive()
    }
}

/// Per-session delivery pump for one connection.
struct ForwardTask {
    handle: JoinHandle<()>,
}

impl ForwardTask {
    async fn stop(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}

fn spawn_forward(
    session_id: String,
    mut subscription: RelaySubscription,
    out_tx: mpsc::UnboundedSender<ServerFrame>,
) -> ForwardTask {
    let handle = tokio::spawn(async move {
        while let Some(signal) = subscription.recv().await {
            let frame = ServerFrame::Deliver {
                session_id: session_id.clone(),
                signal,
            };
            if out_tx.send(frame).is_err() {
                break;
            }
        }
        subscription.close();
    });
    ForwardTask { handle }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, relay: Arc<InMemoryRelay>) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("Handshake with {} failed: {}", addr, e);
            return;
        }
    };
    info!("Relay client {} connected", addr);

    let (write, mut read) = ws.split();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<ServerFrame>();
    let writer = tokio::spawn(write_frames(write, out_rx));

    let mut forwards: HashMap<String, ForwardTask> = HashMap::new();

    while let Some(next) = read.next().await {
        let text = match next {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("Read from {} failed: {}", addr, e);
                break;
            }
        };

        let frame = match ClientFrame::from_json(&text) {
            Ok(frame) => frame,
            Err(e) => {
                // A client that cannot be parsed cannot stay aligned with
                // its confirmations either; cut it loose.
                warn!("Unparseable frame from {}, closing: {}", addr, e);
                break;
            }
        };

        match frame {
            ClientFrame::Publish {
                session_id,
                message,
            } => {
                let response = match relay.publish(&session_id, message).await {
                    Ok(id) => ServerFrame::Published { session_id, id },
                    Err(e) => ServerFrame::Error {
                        message: e.to_string(),
                    },
                };
                if out_tx.send(response).is_err() {
                    break;
                }
            }
            ClientFrame::Subscribe { session_id } => {
                // A repeat subscribe replaces the forward so the current
                // backlog replays; duplicate deliveries are covered by ack
                // idempotence on the consumer side.
                if let Some(old) = forwards.remove(&session_id) {
                    old.stop().await;
                }
                match relay.subscribe(&session_id).await {
                    Ok(subscription) => {
                        let task =
                            spawn_forward(session_id.clone(), subscription, out_tx.clone());
                        forwards.insert(session_id, task);
                    }
                    Err(e) => warn!(
                        "Subscribe to {} failed for {}: {}",
                        session_id, addr, e
                    ),
                }
            }
            ClientFrame::Unsubscribe { session_id } => {
                if let Some(task) = forwards.remove(&session_id) {
                    task.stop().await;
                    debug!("Client {} unsubscribed from {}", addr, session_id);
                }
            }
            ClientFrame::Ack { session_id, id } => {
                if let Err(e) = relay.ack(&session_id, &id).await {
                    warn!("Ack {} on session {} failed: {}", id, session_id, e);
                }
            }
        }
    }

    for (_, task) in forwards.drain() {
        task.stop().await;
    }
    drop(out_tx);
    let _ = writer.await;
    info!("Relay client {} disconnected", addr);
}

async fn write_frames(
    mut write: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut out_rx: mpsc::UnboundedReceiver<ServerFrame>,
) {
    while let Some(frame) = out_rx.recv().await {
        let json = match frame.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!("Outgoing frame not serializable: {}", e);
                continue;
            }
        };
        if let Err(e) = write.send(Message::Text(json)).await {
            debug!("Write failed: {}", e);
            break;
        }
    }
    let _ = write.close().await;
}
