use std::{collections::HashSet, sync::Arc};

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use server_api::{submit_message, ConnectionId};
use shared::{
    domain::ChannelId,
    protocol::{ClientFrame, ServerFrame},
};
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tracing::{info, warn};

use crate::AppState;

const OUTBOUND_QUEUE: usize = 64;

/// Drives one realtime connection: reads client frames, joins rooms,
/// submits messages with acks, and forwards room broadcasts. All outbound
/// traffic funnels through one writer task so acks and broadcasts never
/// interleave mid-frame.
pub async fn ws_connection(state: Arc<AppState>, socket: WebSocket) {
    let connection_id = ConnectionId::new();
    let (sink, mut stream) = socket.split();
    let (outbound, outbound_rx) = mpsc::channel::<ServerFrame>(OUTBOUND_QUEUE);

    let writer = tokio::spawn(write_frames(sink, outbound_rx));
    let mut joined: HashSet<ChannelId> = HashSet::new();
    let mut forwarders = Vec::new();

    while let Some(Ok(frame)) = stream.next().await {
        let WsMessage::Text(text) = frame else {
            continue;
        };
        match serde_json::from_str::<ClientFrame>(&text) {
            Ok(ClientFrame::JoinRoom { channel_id }) => {
                // Room membership is per-connection and not durable; a
                // reconnecting client joins again.
                if !joined.insert(channel_id.clone()) {
                    continue;
                }
                info!(%channel_id, "connection joined room");
                let mut room_rx = state.api.rooms.join(&channel_id);
                let outbound = outbound.clone();
                forwarders.push(tokio::spawn(async move {
                    loop {
                        match room_rx.recv().await {
                            Ok(event) => {
                                if event.origin == Some(connection_id) {
                                    continue;
                                }
                                let frame = ServerFrame::Broadcast {
                                    message: event.message,
                                };
                                if outbound.send(frame).await.is_err() {
                                    break;
                                }
                            }
                            Err(RecvError::Lagged(skipped)) => {
                                warn!(skipped, "room receiver lagged, broadcasts dropped");
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }
                }));
            }
            Ok(ClientFrame::Submit { ack_id, message }) => {
                let frame = match submit_message(&state.api, Some(connection_id), message).await {
                    Ok(message) => ServerFrame::Ack {
                        ack_id,
                        message: Some(message),
                        error: None,
                    },
                    Err(error) => ServerFrame::Ack {
                        ack_id,
                        message: None,
                        error: Some(error),
                    },
                };
                if outbound.send(frame).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!(%err, "dropping unparseable client frame");
            }
        }
    }

    for task in forwarders {
        task.abort();
    }
    drop(outbound);
    let _ = writer.await;
}

async fn write_frames(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut outbound_rx: mpsc::Receiver<ServerFrame>,
) {
    while let Some(frame) = outbound_rx.recv().await {
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(err) => {
                warn!(%err, "failed to encode server frame");
                continue;
            }
        };
        if sink.send(WsMessage::Text(text)).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
#[path = "tests/ws_tests.rs"]
mod ws_tests;
