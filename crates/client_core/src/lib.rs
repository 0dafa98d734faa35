pub mod cache;
pub mod outbox;
pub mod read_position;
pub mod sync;
pub mod transport;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::domain::{ChannelId, Message, MessageId, Sender};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{error, info, warn};

pub use cache::{CacheStore, CachedMessage, ChannelCache, FileCacheStore, MemoryCacheStore};
pub use read_position::TimelineEntry;
pub use transport::{ChatTransport, MessageTransport, SubmitError, TransportEvent};

const EVENT_QUEUE: usize = 1024;

/// Upper bound on any single HTTP request, so a hung delta fetch cannot
/// stall a sync indefinitely.
const HTTP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);

/// State transitions the UI renders next to an outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Pending,
    Sent,
    Failed,
    Removed,
}

/// Notifications emitted to the embedding UI.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The merged message set for a channel changed; re-render from
    /// `timeline`.
    ChannelUpdated { channel_id: ChannelId },
    /// An outgoing message moved through its delivery lifecycle.
    SendStateChanged {
        channel_id: ChannelId,
        message_id: MessageId,
        state: SendState,
    },
    /// A delta fetch completed after (re)connecting or opening a channel.
    Resynced { channel_id: ChannelId, fetched: usize },
}

/// Uploads a local attachment and returns its final remote URL.
#[async_trait]
pub trait AttachmentUploader: Send + Sync {
    async fn upload(&self, local_path: &str) -> Result<String>;
}

/// Stand-in for builds without an attachment backend configured.
pub struct MissingAttachmentUploader;

#[async_trait]
impl AttachmentUploader for MissingAttachmentUploader {
    async fn upload(&self, _local_path: &str) -> Result<String> {
        Err(anyhow!("no attachment uploader configured"))
    }
}

/// The client-side message core: offline-first channel caches, delta
/// sync against the server, and the optimistic send state machine. All
/// cache mutation goes through the single `channels` lock, so merges,
/// acks, and read-position updates serialize per client.
pub struct ChatClient {
    http: reqwest::Client,
    server_url: String,
    user: Sender,
    cache: Arc<dyn CacheStore>,
    uploader: Arc<dyn AttachmentUploader>,
    transport: Arc<dyn MessageTransport>,
    channels: Mutex<HashMap<ChannelId, ChannelCache>>,
    events: broadcast::Sender<ClientEvent>,
    pump_task: Mutex<Option<JoinHandle<()>>>,
}

impl ChatClient {
    pub fn new(
        server_url: impl Into<String>,
        user: Sender,
        cache: Arc<dyn CacheStore>,
        uploader: Arc<dyn AttachmentUploader>,
        transport: Arc<dyn MessageTransport>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_QUEUE);
        let client = Arc::new(Self {
            http: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .unwrap_or_default(),
            server_url: server_url.into().trim_end_matches('/').to_string(),
            user,
            cache,
            uploader,
            transport,
            channels: Mutex::new(HashMap::new()),
            events,
            pump_task: Mutex::new(None),
        });

        let pump = tokio::spawn(Arc::clone(&client).pump_transport_events());
        // No contention yet: the client has not been shared.
        if let Ok(mut slot) = client.pump_task.try_lock() {
            *slot = Some(pump);
        }
        client
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn shutdown(&self) {
        if let Some(task) = self.pump_task.lock().await.take() {
            task.abort();
        }
    }

    /// Enters a channel: joins its realtime room, surfaces the persisted
    /// cache immediately, then folds in a delta fetch from the watermark.
    /// A failed fetch is logged and the cached view stands; the next
    /// reconnect retries.
    ///
    /// The cache is registered before the fetch and the lock is dropped
    /// across it, so broadcasts arriving mid-fetch merge instead of being
    /// dropped and other open channels stay live while this one syncs.
    pub async fn open_channel(&self, channel_id: &ChannelId) -> Result<Vec<TimelineEntry>> {
        self.transport.join_room(channel_id).await;

        let watermark = {
            let mut channels = self.channels.lock().await;
            let mut cache = self.cache.load(channel_id).await?.unwrap_or_default();
            // Re-establish the canonical order and dedup invariants in case
            // the persisted document predates them.
            cache.messages = sync::merge_messages(std::mem::take(&mut cache.messages), Vec::new());
            let watermark = sync::delta_watermark(&cache, Utc::now());
            // A re-opened channel keeps its in-memory state; the idempotent
            // merge absorbs whatever the fetch returns on top of it.
            channels.entry(channel_id.clone()).or_insert(cache);
            watermark
        };

        match self.fetch_delta(channel_id, watermark).await {
            Ok(delta) => {
                let mut channels = self.channels.lock().await;
                if let Some(cache) = channels.get_mut(channel_id) {
                    let fetched = sync::apply_delta(
                        cache,
                        delta.into_iter().map(CachedMessage::sent).collect(),
                    );
                    self.cache.save(channel_id, cache).await?;
                    info!(%channel_id, fetched, "channel delta sync complete");
                    let _ = self.events.send(ClientEvent::Resynced {
                        channel_id: channel_id.clone(),
                        fetched,
                    });
                }
            }
            Err(err) => {
                warn!(%channel_id, %err, "delta fetch failed; serving cached history");
            }
        }

        let channels = self.channels.lock().await;
        let timeline = channels
            .get(channel_id)
            .map(|cache| {
                read_position::timeline_with_divider(&cache.messages, cache.last_read.as_ref())
            })
            .unwrap_or_default();
        Ok(timeline)
    }

    /// Leaves a channel: commits the viewport position as the next
    /// session's read boundary and persists the cache one last time.
    pub async fn close_channel(&self, channel_id: &ChannelId) -> Result<()> {
        let mut channels = self.channels.lock().await;
        if let Some(mut cache) = channels.remove(channel_id) {
            read_position::commit_read_position(&mut cache);
            self.cache.save(channel_id, &cache).await?;
        }
        Ok(())
    }

    /// The current rendered view of an open channel.
    pub async fn timeline(&self, channel_id: &ChannelId) -> Option<Vec<TimelineEntry>> {
        let channels = self.channels.lock().await;
        let cache = channels.get(channel_id)?;
        Some(read_position::timeline_with_divider(
            &cache.messages,
            cache.last_read.as_ref(),
        ))
    }

    /// Viewport scroll update for an open channel.
    pub async fn note_visible(&self, channel_id: &ChannelId, visible: &[MessageId]) {
        let mut channels = self.channels.lock().await;
        if let Some(cache) = channels.get_mut(channel_id) {
            read_position::note_visible(cache, visible);
        }
    }

    /// Sends a text message: inserted as pending immediately, transmitted
    /// in the background, settled (or failed) when the ack arrives.
    pub async fn send_text(
        self: &Arc<Self>,
        channel_id: &ChannelId,
        text: &str,
    ) -> Result<MessageId> {
        let message = Message {
            id: MessageId::generate(),
            channel_id: channel_id.clone(),
            sender: self.user.clone(),
            text: Some(text.to_string()),
            image_url: None,
            created_at: Utc::now(),
        };
        let message_id = message.id.clone();
        self.insert_pending(channel_id, message.clone()).await?;

        let client = Arc::clone(self);
        let channel_id = channel_id.clone();
        tokio::spawn(async move {
            client.transmit(channel_id, message).await;
        });
        Ok(message_id)
    }

    /// Sends an image message: rendered immediately against the local file
    /// path, transmitted only once the upload has produced the remote URL.
    /// An upload failure fails the send like a rejected ack would.
    pub async fn send_image(
        self: &Arc<Self>,
        channel_id: &ChannelId,
        local_path: &str,
    ) -> Result<MessageId> {
        let local_url = if local_path.starts_with("file://") {
            local_path.to_string()
        } else {
            format!("file://{local_path}")
        };
        let message = Message {
            id: MessageId::generate(),
            channel_id: channel_id.clone(),
            sender: self.user.clone(),
            text: None,
            image_url: Some(local_url),
            created_at: Utc::now(),
        };
        let message_id = message.id.clone();
        self.insert_pending(channel_id, message.clone()).await?;

        let client = Arc::clone(self);
        let channel_id = channel_id.clone();
        let local_path = local_path.to_string();
        tokio::spawn(async move {
            match client.uploader.upload(&local_path).await {
                Ok(remote_url) => {
                    let mut outgoing = message;
                    {
                        let mut channels = client.channels.lock().await;
                        if let Some(cache) = channels.get_mut(&channel_id) {
                            outbox::supersede_attachment(cache, &outgoing.id, &remote_url);
                            client.persist(&channel_id, cache).await;
                        }
                    }
                    outgoing.image_url = Some(remote_url);
                    client.transmit(channel_id, outgoing).await;
                }
                Err(err) => {
                    error!(%channel_id, %err, "attachment upload failed");
                    client.settle(&channel_id, &message.id, false).await;
                }
            }
        });
        Ok(message_id)
    }

    /// Retries a failed send under the same id; the server-side idempotent
    /// insert absorbs any duplicate from an attempt that did land.
    pub async fn resend(self: &Arc<Self>, channel_id: &ChannelId, message_id: &MessageId) -> bool {
        let rearmed = {
            let mut channels = self.channels.lock().await;
            let Some(cache) = channels.get_mut(channel_id) else {
                return false;
            };
            if !outbox::rearm_pending(cache, message_id) {
                return false;
            }
            self.persist(channel_id, cache).await;
            cache
                .messages
                .iter()
                .find(|e| &e.message.id == message_id)
                .map(|e| e.message.clone())
        };
        let Some(message) = rearmed else {
            return false;
        };

        self.emit_send_state(channel_id, message_id, SendState::Pending);
        let client = Arc::clone(self);
        let channel_id = channel_id.clone();
        tokio::spawn(async move {
            client.transmit(channel_id, message).await;
        });
        true
    }

    /// Abandons a failed send: the entry disappears locally and nothing is
    /// retracted remotely, since the message never reached anyone.
    pub async fn give_up(&self, channel_id: &ChannelId, message_id: &MessageId) -> bool {
        let mut channels = self.channels.lock().await;
        let Some(cache) = channels.get_mut(channel_id) else {
            return false;
        };
        if outbox::give_up(cache, message_id).is_none() {
            return false;
        }
        self.persist(channel_id, cache).await;
        self.emit_send_state(channel_id, message_id, SendState::Removed);
        let _ = self.events.send(ClientEvent::ChannelUpdated {
            channel_id: channel_id.clone(),
        });
        true
    }

    /// Drops local history older than `cutoff`, including cached attachment
    /// files. Server history is unaffected; a widened fetch window could
    /// re-download it.
    pub async fn purge_local_history(
        &self,
        channel_id: &ChannelId,
        cutoff: DateTime<Utc>,
    ) -> Result<usize> {
        let mut channels = self.channels.lock().await;
        if let Some(cache) = channels.get(channel_id) {
            self.cache.save(channel_id, cache).await?;
        }
        let removed = cache::purge_before(self.cache.as_ref(), channel_id, cutoff).await?;
        if let Some(cache) = channels.get_mut(channel_id) {
            if let Some(reloaded) = self.cache.load(channel_id).await? {
                *cache = reloaded;
            }
            let _ = self.events.send(ClientEvent::ChannelUpdated {
                channel_id: channel_id.clone(),
            });
        }
        Ok(removed)
    }

    /// Registers this device's push token with the membership directory.
    pub async fn register_push_token(&self, token: &str) -> Result<()> {
        self.post_json(
            "/api/register-push-token",
            &serde_json::json!({ "user_id": self.user.id, "token": token }),
        )
        .await
    }

    pub async fn unregister_push_token(&self, token: &str) -> Result<()> {
        self.post_json(
            "/api/unregister-push-token",
            &serde_json::json!({ "user_id": self.user.id, "token": token }),
        )
        .await
    }

    pub async fn subscribe_channel(&self, channel_id: &ChannelId) -> Result<()> {
        self.post_membership(channel_id, "subscribe").await
    }

    pub async fn unsubscribe_channel(&self, channel_id: &ChannelId) -> Result<()> {
        self.post_membership(channel_id, "unsubscribe").await
    }

    /// Mutes or unmutes push notifications for a channel. Muting does not
    /// affect realtime delivery while the channel is open.
    pub async fn set_channel_muted(&self, channel_id: &ChannelId, muted: bool) -> Result<()> {
        let action = if muted { "mute" } else { "unmute" };
        self.post_membership(channel_id, action).await
    }

    pub async fn update_channel_description(
        &self,
        channel_id: &ChannelId,
        description: &str,
    ) -> Result<()> {
        self.post_json(
            "/api/update-channel",
            &serde_json::json!({ "channel_id": channel_id, "description": description }),
        )
        .await
    }

    async fn pump_transport_events(self: Arc<Self>) {
        let mut events = self.transport.subscribe();
        loop {
            match events.recv().await {
                Ok(TransportEvent::Broadcast(message)) => {
                    self.ingest_broadcast(message).await;
                }
                Ok(TransportEvent::Connected) => {
                    self.resync_open_channels().await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Dropped broadcasts will be recovered by the next delta
                    // fetch; resync now rather than wait for a reconnect.
                    warn!(skipped, "transport event stream lagged");
                    self.resync_open_channels().await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Folds a realtime broadcast into the open channel it belongs to.
    /// Merge-by-id makes an echo of our own acked message a no-op, and a
    /// broadcast that wins the race against its ack settles the entry.
    async fn ingest_broadcast(&self, message: Message) {
        let channel_id = message.channel_id.clone();
        let mut channels = self.channels.lock().await;
        let Some(cache) = channels.get_mut(&channel_id) else {
            return;
        };
        sync::apply_delta(cache, vec![CachedMessage::sent(message)]);
        self.persist(&channel_id, cache).await;
        let _ = self.events.send(ClientEvent::ChannelUpdated { channel_id });
    }

    /// Reconnect recovery: every open channel re-fetches from its watermark
    /// to cover the window where no broadcasts were delivered.
    async fn resync_open_channels(&self) {
        let open: Vec<ChannelId> = self.channels.lock().await.keys().cloned().collect();
        for channel_id in open {
            let mut channels = self.channels.lock().await;
            let Some(cache) = channels.get_mut(&channel_id) else {
                continue;
            };
            let watermark = sync::delta_watermark(cache, Utc::now());
            drop(channels);

            let delta = match self.fetch_delta(&channel_id, watermark).await {
                Ok(delta) => delta,
                Err(err) => {
                    warn!(%channel_id, %err, "resync fetch failed");
                    continue;
                }
            };

            let mut channels = self.channels.lock().await;
            let Some(cache) = channels.get_mut(&channel_id) else {
                continue;
            };
            let fetched = sync::apply_delta(
                cache,
                delta.into_iter().map(CachedMessage::sent).collect(),
            );
            self.persist(&channel_id, cache).await;
            let _ = self.events.send(ClientEvent::Resynced {
                channel_id: channel_id.clone(),
                fetched,
            });
            if fetched > 0 {
                let _ = self.events.send(ClientEvent::ChannelUpdated {
                    channel_id: channel_id.clone(),
                });
            }
        }
    }

    async fn insert_pending(&self, channel_id: &ChannelId, message: Message) -> Result<()> {
        let mut channels = self.channels.lock().await;
        let cache = channels
            .get_mut(channel_id)
            .ok_or_else(|| anyhow!("channel {channel_id} is not open"))?;
        let message_id = message.id.clone();
        outbox::insert_pending(cache, message);
        self.persist(channel_id, cache).await;
        drop(channels);

        self.emit_send_state(channel_id, &message_id, SendState::Pending);
        let _ = self.events.send(ClientEvent::ChannelUpdated {
            channel_id: channel_id.clone(),
        });
        Ok(())
    }

    async fn transmit(self: Arc<Self>, channel_id: ChannelId, message: Message) {
        let message_id = message.id.clone();
        let result = self.transport.submit(message.into()).await;
        match result {
            Ok(_acked) => {
                self.settle(&channel_id, &message_id, true).await;
            }
            Err(err) => {
                warn!(%channel_id, %message_id, %err, "send not acknowledged");
                self.settle(&channel_id, &message_id, false).await;
            }
        }
    }

    /// Applies an ack outcome to the cached entry, if it still exists.
    async fn settle(&self, channel_id: &ChannelId, message_id: &MessageId, ok: bool) {
        let mut channels = self.channels.lock().await;
        let Some(cache) = channels.get_mut(channel_id) else {
            return;
        };
        if !outbox::apply_ack(cache, message_id, ok) {
            return;
        }
        self.persist(channel_id, cache).await;
        drop(channels);

        let state = if ok { SendState::Sent } else { SendState::Failed };
        self.emit_send_state(channel_id, message_id, state);
        let _ = self.events.send(ClientEvent::ChannelUpdated {
            channel_id: channel_id.clone(),
        });
    }

    async fn persist(&self, channel_id: &ChannelId, cache: &ChannelCache) {
        if let Err(err) = self.cache.save(channel_id, cache).await {
            error!(%channel_id, %err, "failed to persist channel cache");
        }
    }

    fn emit_send_state(&self, channel_id: &ChannelId, message_id: &MessageId, state: SendState) {
        let _ = self.events.send(ClientEvent::SendStateChanged {
            channel_id: channel_id.clone(),
            message_id: message_id.clone(),
            state,
        });
    }

    async fn fetch_delta(
        &self,
        channel_id: &ChannelId,
        after: DateTime<Utc>,
    ) -> Result<Vec<Message>> {
        let url = format!("{}/channels/{}/messages", self.server_url, channel_id);
        let response = self
            .http
            .get(&url)
            .query(&[("after", after.to_rfc3339())])
            .send()
            .await
            .with_context(|| format!("delta fetch request to {url} failed"))?
            .error_for_status()
            .context("delta fetch rejected by server")?;
        let messages = response
            .json::<Vec<Message>>()
            .await
            .context("malformed delta fetch response")?;
        Ok(messages)
    }

    async fn post_membership(&self, channel_id: &ChannelId, action: &str) -> Result<()> {
        let url = format!(
            "{}/channels/{}/{}?user_id={}",
            self.server_url, channel_id, action, self.user.id
        );
        self.http
            .post(&url)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?
            .error_for_status()
            .with_context(|| format!("{action} rejected by server"))?;
        Ok(())
    }

    async fn post_json<T: serde::Serialize>(&self, path: &str, body: &T) -> Result<()> {
        let url = format!("{}{}", self.server_url, path);
        self.http
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?
            .error_for_status()
            .with_context(|| format!("{path} rejected by server"))?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod lib_tests;
