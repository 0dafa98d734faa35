use std::sync::Arc;

use chrono::{DateTime, Utc};
use push_gateway::{chunk_notifications, PushDispatcher, PushNotification};
use shared::{
    domain::{ChannelId, Message, MessageDraft, MessageId, UserId},
    error::ApiError,
};
use storage::Storage;
use tracing::{error, info};

pub mod rooms;

pub use rooms::{ConnectionId, RoomEvent, RoomRegistry};

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub rooms: Arc<RoomRegistry>,
    pub push: Arc<dyn PushDispatcher>,
}

/// Ingestion & broadcast: validates the draft, persists it, broadcasts to
/// the channel's room excluding the submitting connection, then kicks off
/// notification fan-out in the background.
///
/// Side effects are ordered persist-then-broadcast, so a client that fetches
/// the delta right after receiving the broadcast never sees a stale store.
/// A persistence failure is logged and the call still succeeds: the ack is
/// decoupled from storage durability to keep the interactive path
/// responsive.
pub async fn submit_message(
    ctx: &ApiContext,
    origin: Option<ConnectionId>,
    draft: MessageDraft,
) -> Result<Message, ApiError> {
    let message = validate_draft(draft)?;

    if let Err(err) = ctx.storage.insert_message(&message).await {
        error!(
            message_id = %message.id,
            channel_id = %message.channel_id,
            %err,
            "failed to persist message; continuing with broadcast"
        );
    }

    let reached = ctx
        .rooms
        .publish(&message.channel_id, origin, message.clone());
    info!(
        message_id = %message.id,
        channel_id = %message.channel_id,
        reached,
        "message broadcast to room"
    );

    let fanout_ctx = ctx.clone();
    let channel_id = message.channel_id.clone();
    let sender_id = message.sender.id.clone();
    let preview = message.preview();
    tokio::spawn(async move {
        if let Err(err) = notify_channel(&fanout_ctx, &channel_id, &sender_id, &preview).await {
            error!(%channel_id, %err, "notification fan-out failed");
        }
    });

    Ok(message)
}

/// Delta fetch: all persisted messages in the channel with `created_at`
/// strictly greater than the watermark, ascending.
pub async fn messages_after(
    ctx: &ApiContext,
    channel_id: &ChannelId,
    after: DateTime<Utc>,
) -> Result<Vec<Message>, ApiError> {
    ctx.storage
        .messages_after(channel_id, after)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))
}

/// Notification fan-out: resolves all subscribed, non-sender, non-muted
/// members to endpoint tokens and dispatches provider-sized chunks. Each
/// chunk is independent; a failure is logged and the rest still go out.
/// Returns how many notifications were handed to the dispatcher.
pub async fn notify_channel(
    ctx: &ApiContext,
    channel_id: &ChannelId,
    sender_id: &UserId,
    preview: &str,
) -> anyhow::Result<usize> {
    let targets = ctx
        .storage
        .notification_targets(channel_id, sender_id)
        .await?;

    let notifications: Vec<PushNotification> = targets
        .into_iter()
        .map(|target| PushNotification {
            to: target.token,
            title: "New Message".to_string(),
            body: preview.to_string(),
            channel_id: channel_id.clone(),
        })
        .collect();

    let mut dispatched = 0;
    for chunk in chunk_notifications(notifications) {
        let size = chunk.len();
        match ctx.push.dispatch_chunk(&chunk).await {
            Ok(()) => dispatched += size,
            Err(err) => {
                error!(%channel_id, size, %err, "push chunk dispatch failed");
            }
        }
    }
    Ok(dispatched)
}

fn validate_draft(draft: MessageDraft) -> Result<Message, ApiError> {
    if draft.channel_id.as_str().trim().is_empty() {
        return Err(ApiError::validation("channelId is required"));
    }

    let message = Message {
        id: draft.id.unwrap_or_else(MessageId::generate),
        channel_id: draft.channel_id,
        sender: draft.sender,
        text: draft.text,
        image_url: draft.image_url,
        created_at: draft.created_at.unwrap_or_else(Utc::now),
    };

    if !message.has_body() {
        return Err(ApiError::validation(
            "message must contain text or an image reference",
        ));
    }

    Ok(message)
}
