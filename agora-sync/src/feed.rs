//! WebSocket live-feed adapter.
//!
//! One [`crate::sources::LiveFeed`] implementation: a WebSocket connection
//! per subscription, speaking the [`crate::protocol`] frame format.
//!
//! ```text
//! subscribe(collection_id)
//!       │ connect ws://host/collection_id
//!       │ send Subscribe, await SubscribeAck
//!       ▼
//! ┌────────────┐   frames   ┌─────────────┐   FeedEvent   ┌────────┐
//! │ ws reader  │ ─────────► │ decode +    │ ────────────► │ engine │
//! │ task       │            │ validate    │   (mpsc)      │ pump   │
//! └────────────┘            └─────────────┘               └────────┘
//! ┌────────────┐
//! │ ping task  │ ── Ping frame every interval ──► writer task ──► ws
//! └────────────┘
//! ```
//!
//! The adapter does not reconnect on its own; when the socket drops it
//! closes the event channel and the session manager owns the backoff and
//! resubscription. Undecodable or malformed frames are logged and dropped
//! here, before they ever reach a store.

use crate::protocol::{FeedFrame, FrameType};
use crate::sources::{FeedSubscription, LiveFeed, SyncError};
use agora_core::Payload;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Connection state of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Adapter configuration.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Feed endpoint; the collection id is appended as the path.
    pub server_url: String,
    /// Buffered events per subscription.
    pub event_capacity: usize,
    /// Heartbeat interval.
    pub ping_interval: Duration,
    /// How long to wait for the subscribe acknowledgement.
    pub ack_timeout: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            event_capacity: 256,
            ping_interval: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(5),
        }
    }
}

impl FeedConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }
}

/// Tasks and state behind one open subscription.
struct ActiveSubscription {
    collection_id: Uuid,
    state: Arc<RwLock<ConnectionState>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    pinger: JoinHandle<()>,
}

/// WebSocket [`LiveFeed`] for collections whose payload type is `P`.
pub struct WebSocketFeed<P> {
    config: FeedConfig,
    subscriptions: Arc<Mutex<HashMap<Uuid, ActiveSubscription>>>,
    _payload: PhantomData<fn() -> P>,
}

impl<P: Payload> WebSocketFeed<P> {
    pub fn new(config: FeedConfig) -> Self {
        Self {
            config,
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            _payload: PhantomData,
        }
    }

    /// Connection state of a subscription; `Disconnected` when unknown.
    pub async fn connection_state(&self, subscription_id: Uuid) -> ConnectionState {
        match self.subscriptions.lock().await.get(&subscription_id) {
            Some(sub) => *sub.state.read().await,
            None => ConnectionState::Disconnected,
        }
    }

    /// Number of open subscriptions.
    pub async fn active_subscriptions(&self) -> usize {
        self.subscriptions.lock().await.len()
    }

    /// Collection a subscription belongs to, while it is open.
    pub async fn collection_of(&self, subscription_id: Uuid) -> Option<Uuid> {
        self.subscriptions
            .lock()
            .await
            .get(&subscription_id)
            .map(|sub| sub.collection_id)
    }
}

impl<P: Payload> LiveFeed<P> for WebSocketFeed<P> {
    async fn subscribe(&self, collection_id: Uuid) -> Result<FeedSubscription<P>, SyncError> {
        let url = format!("{}/{}", self.config.server_url, collection_id);
        let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let request = FeedFrame::subscribe(collection_id)
            .encode()
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        ws_writer
            .send(Message::Binary(request.into()))
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;

        // The session is not live until the feed acknowledges; hold the
        // caller here so the ack-or-page ordering question disappears.
        let acked = tokio::time::timeout(self.config.ack_timeout, async {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        if let Ok(frame) = FeedFrame::decode(&bytes) {
                            if frame.frame_type == FrameType::SubscribeAck
                                && frame.collection_id == collection_id
                            {
                                return true;
                            }
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => return false,
                    _ => {}
                }
            }
            false
        })
        .await;
        match acked {
            Ok(true) => {}
            Ok(false) => {
                return Err(SyncError::Transport(
                    "feed closed before subscribe ack".to_string(),
                ))
            }
            Err(_) => {
                return Err(SyncError::Transport(
                    "timed out waiting for subscribe ack".to_string(),
                ))
            }
        }

        // Writer task: forward the outgoing channel to the socket.
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(self.config.event_capacity);
        let writer = tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
        });

        // Reader task: decode frames into typed events; drop what doesn't
        // decode. Closing the event channel is the feed-loss signal.
        let (event_tx, event_rx) = mpsc::channel(self.config.event_capacity);
        let state = Arc::new(RwLock::new(ConnectionState::Connected));
        let reader_state = state.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let frame = match FeedFrame::decode(&bytes) {
                            Ok(frame) => frame,
                            Err(e) => {
                                log::warn!(
                                    "collection {collection_id}: dropping undecodable frame: {e}"
                                );
                                continue;
                            }
                        };
                        match frame.frame_type {
                            FrameType::Insert | FrameType::Update | FrameType::Delete => {
                                match frame.feed_event::<P>() {
                                    Ok(event) => {
                                        if event_tx.send(event).await.is_err() {
                                            return;
                                        }
                                    }
                                    Err(e) => log::warn!(
                                        "collection {collection_id}: dropping malformed event: {e}"
                                    ),
                                }
                            }
                            _ => {}
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            *reader_state.write().await = ConnectionState::Disconnected;
        });

        // Heartbeat task.
        let ping_tx = out_tx.clone();
        let ping_interval = self.config.ping_interval;
        let pinger = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ping_interval);
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                let Ok(encoded) = FeedFrame::ping(collection_id).encode() else {
                    return;
                };
                if ping_tx.send(encoded).await.is_err() {
                    return;
                }
            }
        });

        let subscription_id = Uuid::new_v4();
        self.subscriptions.lock().await.insert(
            subscription_id,
            ActiveSubscription {
                collection_id,
                state,
                reader,
                writer,
                pinger,
            },
        );
        log::info!("collection {collection_id}: feed subscribed ({subscription_id})");

        Ok(FeedSubscription {
            subscription_id,
            events: event_rx,
        })
    }

    async fn unsubscribe(&self, subscription_id: Uuid) {
        let Some(sub) = self.subscriptions.lock().await.remove(&subscription_id) else {
            return;
        };
        sub.reader.abort();
        sub.writer.abort();
        sub.pinger.abort();
        log::info!(
            "collection {}: feed unsubscribed ({subscription_id})",
            sub.collection_id
        );
    }
}
