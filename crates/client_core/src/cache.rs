use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shared::domain::{ChannelId, Message, MessageId, SendStatus};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// A message as the client persists it: the wire message plus the local
/// delivery status. The status lives next to the message, not inside it,
/// so it can never be serialized onto the wire; `None` means "sent".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedMessage {
    #[serde(flatten)]
    pub message: Message,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_status: Option<SendStatus>,
}

impl CachedMessage {
    pub fn sent(message: Message) -> Self {
        Self {
            message,
            send_status: None,
        }
    }

    pub fn pending(message: Message) -> Self {
        Self {
            message,
            send_status: Some(SendStatus::Pending),
        }
    }

    /// Settled entries (acked or received from the server) win dedup ties.
    pub fn is_settled(&self) -> bool {
        self.send_status.is_none()
    }
}

/// Per-channel, per-device persisted state: the merged message set in
/// canonical ascending order plus the three cursors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelCache {
    pub messages: Vec<CachedMessage>,
    /// Newest `created_at` seen from the server; the next delta watermark.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fetched: Option<DateTime<Utc>>,
    /// Newest message the user had seen as of the previous session; anchors
    /// the unread divider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_read: Option<MessageId>,
    /// Newest message currently scrolled into view; becomes `last_read` on
    /// channel exit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_visible: Option<MessageId>,
}

/// Opaque local persistence for channel caches. Implementations own the
/// serialization format and the attachment file cache.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn load(&self, channel_id: &ChannelId) -> Result<Option<ChannelCache>>;
    async fn save(&self, channel_id: &ChannelId, cache: &ChannelCache) -> Result<()>;
    /// Removes the locally cached attachment file for a message, if any.
    async fn remove_attachment_file(&self, channel_id: &ChannelId, image_url: &str) -> Result<()>;
}

/// Local-retention cutoff: drops every cached message older than `cutoff`
/// and removes their cached attachment files. Returns how many messages
/// were deleted. The cursors survive; only history is trimmed.
pub async fn purge_before(
    store: &dyn CacheStore,
    channel_id: &ChannelId,
    cutoff: DateTime<Utc>,
) -> Result<usize> {
    let Some(mut cache) = store.load(channel_id).await? else {
        return Ok(0);
    };

    let (keep, drop): (Vec<CachedMessage>, Vec<CachedMessage>) = cache
        .messages
        .into_iter()
        .partition(|entry| entry.message.created_at >= cutoff);

    for entry in &drop {
        if let Some(url) = entry.message.image_url.as_deref() {
            if let Err(err) = store.remove_attachment_file(channel_id, url).await {
                warn!(%channel_id, %err, "failed to remove cached attachment");
            }
        }
    }

    let removed = drop.len();
    cache.messages = keep;
    store.save(channel_id, &cache).await?;
    debug!(%channel_id, removed, "purged local history before cutoff");
    Ok(removed)
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryCacheStore {
    inner: Mutex<HashMap<ChannelId, ChannelCache>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn load(&self, channel_id: &ChannelId) -> Result<Option<ChannelCache>> {
        Ok(self.inner.lock().await.get(channel_id).cloned())
    }

    async fn save(&self, channel_id: &ChannelId, cache: &ChannelCache) -> Result<()> {
        self.inner
            .lock()
            .await
            .insert(channel_id.clone(), cache.clone());
        Ok(())
    }

    async fn remove_attachment_file(&self, _channel_id: &ChannelId, _image_url: &str) -> Result<()> {
        Ok(())
    }
}

/// File-backed store: one JSON document per channel under the root
/// directory, plus a per-channel attachment cache keyed by the SHA-256 of
/// the attachment URL. Saves go through a temp file and rename so a crash
/// mid-write never leaves a torn cache.
pub struct FileCacheStore {
    root: PathBuf,
}

impl FileCacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn cache_path(&self, channel_id: &ChannelId) -> PathBuf {
        self.root.join(format!("chat_{channel_id}_messages.json"))
    }

    /// Cached attachment location for a remote URL. Local `file://` paths
    /// are used as-is.
    pub fn attachment_path(&self, channel_id: &ChannelId, image_url: &str) -> PathBuf {
        if let Some(local) = image_url.strip_prefix("file://") {
            return Path::new(local).to_path_buf();
        }
        let digest = Sha256::digest(image_url.as_bytes());
        self.root
            .join(channel_id.as_str())
            .join(format!("{digest:x}"))
    }
}

#[async_trait]
impl CacheStore for FileCacheStore {
    async fn load(&self, channel_id: &ChannelId) -> Result<Option<ChannelCache>> {
        let path = self.cache_path(channel_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        let cache = serde_json::from_slice(&bytes)
            .with_context(|| format!("corrupt channel cache at {}", path.display()))?;
        Ok(Some(cache))
    }

    async fn save(&self, channel_id: &ChannelId, cache: &ChannelCache) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("failed to create {}", self.root.display()))?;

        let path = self.cache_path(channel_id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec(cache)?;
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }

    async fn remove_attachment_file(&self, channel_id: &ChannelId, image_url: &str) -> Result<()> {
        let path = self.attachment_path(channel_id, image_url);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
        }
    }
}
