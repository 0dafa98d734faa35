use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ChannelId, Message, MessageDraft, UserId},
    error::ApiError,
};

/// Frames a client sends over the realtime transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Adds this connection to the channel's broadcast room. No reply.
    JoinRoom { channel_id: ChannelId },
    /// Submits a message; the server answers with an `Ack` carrying the
    /// same `ack_id`.
    Submit { ack_id: u64, message: MessageDraft },
}

/// Frames the server pushes over the realtime transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Acknowledgement for a `Submit`. `error: None` means accepted; the
    /// ack is the sender's authoritative success signal.
    Ack {
        ack_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<Message>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ApiError>,
    },
    /// A message submitted by some other connection in a joined room.
    Broadcast { message: Message },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub message: MessageDraft,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub message: Message,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaQuery {
    /// Return messages with `created_at` strictly greater than this.
    pub after: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterPushTokenRequest {
    pub user_id: UserId,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateChannelRequest {
    pub channel_id: ChannelId,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipQuery {
    pub user_id: UserId,
}
