use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shared::domain::ChannelId;
use tracing::info;

/// Provider chunk size: one dispatch call carries at most this many
/// notifications.
pub const PUSH_CHUNK_SIZE: usize = 100;

/// One push record for a single (member, endpoint token) pair. `channel_id`
/// is the deep link back into the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushNotification {
    pub to: String,
    pub title: String,
    pub body: String,
    pub channel_id: ChannelId,
}

/// Splits notifications into provider-sized chunks. Each chunk is dispatched
/// independently so one bad batch cannot suppress the others.
pub fn chunk_notifications(notifications: Vec<PushNotification>) -> Vec<Vec<PushNotification>> {
    let mut chunks = Vec::new();
    let mut iter = notifications.into_iter().peekable();
    while iter.peek().is_some() {
        chunks.push(iter.by_ref().take(PUSH_CHUNK_SIZE).collect());
    }
    chunks
}

#[async_trait]
pub trait PushDispatcher: Send + Sync {
    /// Dispatches one chunk. Best effort, at most one attempt: the caller
    /// logs a failure and moves on to the next chunk.
    async fn dispatch_chunk(&self, chunk: &[PushNotification]) -> Result<()>;
}

/// Posts chunks to the provider's HTTP endpoint as a JSON array.
pub struct HttpPushGateway {
    http: Client,
    endpoint: String,
}

impl HttpPushGateway {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl PushDispatcher for HttpPushGateway {
    async fn dispatch_chunk(&self, chunk: &[PushNotification]) -> Result<()> {
        self.http
            .post(&self.endpoint)
            .json(chunk)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Stand-in when no gateway is configured; logs and drops.
pub struct DisabledPushGateway;

#[async_trait]
impl PushDispatcher for DisabledPushGateway {
    async fn dispatch_chunk(&self, chunk: &[PushNotification]) -> Result<()> {
        info!(count = chunk.len(), "push gateway disabled, dropping chunk");
        Ok(())
    }
}
