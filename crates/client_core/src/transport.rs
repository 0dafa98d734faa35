use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::{
    domain::{ChannelId, Message, MessageDraft},
    error::ApiError,
    protocol::{ClientFrame, ServerFrame},
};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{broadcast, mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage, WebSocketStream};
use tracing::{info, warn};

/// How long a submit waits for its acknowledgement before reporting
/// failure. The reference behavior left sends pending forever; a finite
/// timeout keeps the state machine live.
pub const SEND_ACK_TIMEOUT: Duration = Duration::from_secs(15);

const RECONNECT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const RECONNECT_MAX_BACKOFF: Duration = Duration::from_secs(30);
const OUTBOUND_QUEUE: usize = 64;

#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Connection (re)established and every previously joined room
    /// re-joined. Owners must re-run delta sync: nothing was buffered
    /// while the connection was down.
    Connected,
    /// A message broadcast into one of the joined rooms.
    Broadcast(Message),
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("server rejected message: {0}")]
    Rejected(ApiError),
    #[error("transport unavailable: {0}")]
    Transport(String),
    #[error("acknowledgement timed out")]
    AckTimeout,
}

/// Seam between the client state machine and the realtime connection, so
/// tests can script acks without a live socket.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn join_room(&self, channel_id: &ChannelId);
    async fn submit(&self, draft: MessageDraft) -> Result<Message, SubmitError>;
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}

/// WebSocket transport with automatic reconnect. Submits carry a
/// correlation id matched against the server's ack frame; room membership
/// is replayed on every reconnect since it is not durable server-side.
pub struct ChatTransport {
    inner: Arc<TransportInner>,
    run_task: Mutex<Option<JoinHandle<()>>>,
}

struct TransportInner {
    ws_url: String,
    ack_timeout: Duration,
    events: broadcast::Sender<TransportEvent>,
    state: Mutex<TransportState>,
}

#[derive(Default)]
struct TransportState {
    next_ack_id: u64,
    pending_acks: HashMap<u64, oneshot::Sender<Result<Message, SubmitError>>>,
    joined_rooms: HashSet<ChannelId>,
    outbound: Option<mpsc::Sender<String>>,
}

impl ChatTransport {
    pub fn connect(ws_url: impl Into<String>) -> Arc<Self> {
        Self::connect_with_ack_timeout(ws_url, SEND_ACK_TIMEOUT)
    }

    /// `connect` with a custom ack deadline; tests shorten it.
    pub fn connect_with_ack_timeout(ws_url: impl Into<String>, ack_timeout: Duration) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let inner = Arc::new(TransportInner {
            ws_url: ws_url.into(),
            ack_timeout,
            events,
            state: Mutex::new(TransportState::default()),
        });
        let run_task = tokio::spawn(run_loop(inner.clone()));
        Arc::new(Self {
            inner,
            run_task: Mutex::new(Some(run_task)),
        })
    }

    pub async fn shutdown(&self) {
        if let Some(task) = self.run_task.lock().await.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl MessageTransport for ChatTransport {
    async fn join_room(&self, channel_id: &ChannelId) {
        let outbound = {
            let mut state = self.inner.state.lock().await;
            state.joined_rooms.insert(channel_id.clone());
            state.outbound.clone()
        };
        if let Some(outbound) = outbound {
            send_frame(
                &outbound,
                &ClientFrame::JoinRoom {
                    channel_id: channel_id.clone(),
                },
            )
            .await;
        }
    }

    async fn submit(&self, draft: MessageDraft) -> Result<Message, SubmitError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let (ack_id, outbound) = {
            let mut state = self.inner.state.lock().await;
            let Some(outbound) = state.outbound.clone() else {
                return Err(SubmitError::Transport("not connected".into()));
            };
            state.next_ack_id += 1;
            let ack_id = state.next_ack_id;
            state.pending_acks.insert(ack_id, ack_tx);
            (ack_id, outbound)
        };

        send_frame(
            &outbound,
            &ClientFrame::Submit {
                ack_id,
                message: draft,
            },
        )
        .await;

        match tokio::time::timeout(self.inner.ack_timeout, ack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SubmitError::Transport("connection lost".into())),
            Err(_) => {
                self.inner.state.lock().await.pending_acks.remove(&ack_id);
                Err(SubmitError::AckTimeout)
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }
}

async fn run_loop(inner: Arc<TransportInner>) {
    let mut backoff = RECONNECT_INITIAL_BACKOFF;
    loop {
        match connect_async(inner.ws_url.as_str()).await {
            Ok((stream, _)) => {
                backoff = RECONNECT_INITIAL_BACKOFF;
                info!(url = %inner.ws_url, "realtime transport connected");
                run_connection(&inner, stream).await;
                warn!("realtime transport disconnected");
            }
            Err(err) => {
                warn!(%err, "realtime connect failed");
            }
        }
        fail_pending_acks(&inner, "connection lost").await;
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(RECONNECT_MAX_BACKOFF);
    }
}

async fn run_connection<S>(inner: &Arc<TransportInner>, stream: WebSocketStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut source) = stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);

    let writer = tokio::spawn(async move {
        while let Some(text) = outbound_rx.recv().await {
            if sink.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // Re-join every room before announcing the connection, so a resync
    // triggered by `Connected` cannot race ahead of room membership.
    {
        let mut state = inner.state.lock().await;
        state.outbound = Some(outbound_tx.clone());
        for channel_id in state.joined_rooms.iter().cloned().collect::<Vec<_>>() {
            send_frame(&outbound_tx, &ClientFrame::JoinRoom { channel_id }).await;
        }
    }
    let _ = inner.events.send(TransportEvent::Connected);

    while let Some(Ok(frame)) = source.next().await {
        let WsMessage::Text(text) = frame else {
            continue;
        };
        match serde_json::from_str::<ServerFrame>(&text) {
            Ok(ServerFrame::Ack {
                ack_id,
                message,
                error,
            }) => {
                let waiter = inner.state.lock().await.pending_acks.remove(&ack_id);
                if let Some(waiter) = waiter {
                    let result = match (message, error) {
                        (_, Some(error)) => Err(SubmitError::Rejected(error)),
                        (Some(message), None) => Ok(message),
                        (None, None) => {
                            Err(SubmitError::Transport("ack carried no message".into()))
                        }
                    };
                    let _ = waiter.send(result);
                }
            }
            Ok(ServerFrame::Broadcast { message }) => {
                let _ = inner.events.send(TransportEvent::Broadcast(message));
            }
            Err(err) => {
                warn!(%err, "dropping unparseable server frame");
            }
        }
    }

    inner.state.lock().await.outbound = None;
    writer.abort();
}

async fn fail_pending_acks(inner: &Arc<TransportInner>, reason: &str) {
    let waiters: Vec<_> = inner.state.lock().await.pending_acks.drain().collect();
    for (_, waiter) in waiters {
        let _ = waiter.send(Err(SubmitError::Transport(reason.into())));
    }
}

async fn send_frame(outbound: &mpsc::Sender<String>, frame: &ClientFrame) {
    match serde_json::to_string(frame) {
        Ok(text) => {
            let _ = outbound.send(text).await;
        }
        Err(err) => {
            warn!(%err, "failed to encode client frame");
        }
    }
}
