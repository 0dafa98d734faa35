use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::WebSocketUpgrade, response::IntoResponse, routing::get, Router};
use client_core::transport::{ChatTransport, MessageTransport, SubmitError, TransportEvent};
use push_gateway::DisabledPushGateway;
use server_api::{ApiContext, RoomRegistry};
use shared::domain::{ChannelId, Message, MessageDraft, Sender, UserId};
use storage::Storage;
use tokio::sync::broadcast;

use crate::{build_router, AppState};

async fn test_router() -> Router {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let api = ApiContext {
        storage,
        rooms: Arc::new(RoomRegistry::new()),
        push: Arc::new(DisabledPushGateway),
    };
    build_router(Arc::new(AppState { api }))
}

async fn serve(app: Router, listener: tokio::net::TcpListener) -> SocketAddr {
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    addr
}

fn draft(channel: &str, sender: &str, text: &str) -> MessageDraft {
    MessageDraft {
        id: None,
        channel_id: ChannelId::from(channel),
        sender: Sender {
            id: UserId::from(sender),
            name: None,
        },
        text: Some(text.to_string()),
        image_url: None,
        created_at: None,
    }
}

async fn wait_connected(events: &mut broadcast::Receiver<TransportEvent>) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(TransportEvent::Connected) = events.recv().await {
                break;
            }
        }
    })
    .await
    .expect("timed out waiting for the transport to connect");
}

async fn wait_broadcast(events: &mut broadcast::Receiver<TransportEvent>) -> Message {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(TransportEvent::Broadcast(message)) = events.recv().await {
                break message;
            }
        }
    })
    .await
    .expect("timed out waiting for a broadcast")
}

#[tokio::test]
async fn submit_over_websocket_acks_and_skips_the_senders_echo() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = serve(test_router().await, listener).await;
    let ws_url = format!("ws://{addr}/ws");

    let sender = ChatTransport::connect(ws_url.clone());
    let mut sender_events = sender.subscribe();
    let receiver = ChatTransport::connect(ws_url);
    let mut receiver_events = receiver.subscribe();
    wait_connected(&mut sender_events).await;
    wait_connected(&mut receiver_events).await;

    let channel = ChannelId::from("c1");
    sender.join_room(&channel).await;
    receiver.join_room(&channel).await;
    // Joins carry no reply; give the server a moment to register both.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let accepted = sender
        .submit(draft("c1", "alice", "hello over the wire"))
        .await
        .expect("ack");
    assert_eq!(accepted.text.as_deref(), Some("hello over the wire"));

    let broadcast = wait_broadcast(&mut receiver_events).await;
    assert_eq!(broadcast.id, accepted.id);

    // The ack is the submitter's only copy; the room does not echo back.
    let echo = tokio::time::timeout(Duration::from_millis(300), async {
        loop {
            if let Ok(TransportEvent::Broadcast(message)) = sender_events.recv().await {
                break message;
            }
        }
    })
    .await;
    assert!(echo.is_err());

    sender.shutdown().await;
    receiver.shutdown().await;
}

#[tokio::test]
async fn reconnect_rejoins_rooms_before_announcing_connected() {
    // Reserve an address, then drop the listener so the first attempts fail.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let transport = ChatTransport::connect(format!("ws://{addr}/ws"));
    let mut events = transport.subscribe();
    let channel = ChannelId::from("c1");
    // Joined while disconnected; must be replayed once a connection lands.
    transport.join_room(&channel).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    let listener = tokio::net::TcpListener::bind(addr).await.expect("rebind");
    serve(test_router().await, listener).await;

    wait_connected(&mut events).await;

    // A second connection publishing into the room proves the replayed
    // join took effect server-side.
    let publisher = ChatTransport::connect(format!("ws://{addr}/ws"));
    let mut publisher_events = publisher.subscribe();
    wait_connected(&mut publisher_events).await;
    publisher.join_room(&channel).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    publisher
        .submit(draft("c1", "bob", "are you back"))
        .await
        .expect("ack");

    let broadcast = wait_broadcast(&mut events).await;
    assert_eq!(broadcast.text.as_deref(), Some("are you back"));

    transport.shutdown().await;
    publisher.shutdown().await;
}

#[tokio::test]
async fn submit_without_an_ack_times_out() {
    // A server that upgrades the socket but never answers.
    async fn silent_ws(ws: WebSocketUpgrade) -> impl IntoResponse {
        ws.on_upgrade(|mut socket| async move { while socket.recv().await.is_some() {} })
    }
    let app = Router::new().route("/ws", get(silent_ws));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = serve(app, listener).await;

    let transport = ChatTransport::connect_with_ack_timeout(
        format!("ws://{addr}/ws"),
        Duration::from_millis(300),
    );
    let mut events = transport.subscribe();
    wait_connected(&mut events).await;

    let result = transport.submit(draft("c1", "alice", "anyone there")).await;
    assert!(matches!(result, Err(SubmitError::AckTimeout)));

    transport.shutdown().await;
}
