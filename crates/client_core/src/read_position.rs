use shared::domain::MessageId;

use crate::cache::{CachedMessage, ChannelCache};

/// One row of the rendered conversation. The divider is a display-only
/// artifact: never persisted, never transmitted, never part of dedup.
#[derive(Debug, Clone, PartialEq)]
pub enum TimelineEntry {
    UnreadDivider,
    Message(CachedMessage),
}

/// Splices the unread divider immediately before the message whose id
/// equals the stored `last_read`. When that message is not in the merged
/// set (expired from cache, or never read anything), no divider is shown.
pub fn timeline_with_divider(
    messages: &[CachedMessage],
    last_read: Option<&MessageId>,
) -> Vec<TimelineEntry> {
    let divider_at = last_read.and_then(|id| messages.iter().position(|e| &e.message.id == id));

    let mut timeline = Vec::with_capacity(messages.len() + 1);
    for (index, entry) in messages.iter().enumerate() {
        if divider_at == Some(index) {
            timeline.push(TimelineEntry::UnreadDivider);
        }
        timeline.push(TimelineEntry::Message(entry.clone()));
    }
    timeline
}

/// Viewport update: the conversation renders newest-first, so the read
/// boundary is the oldest-timestamp item among those currently visible.
pub fn note_visible(cache: &mut ChannelCache, visible: &[MessageId]) {
    let boundary = cache
        .messages
        .iter()
        .filter(|entry| visible.contains(&entry.message.id))
        .min_by_key(|entry| entry.message.created_at)
        .map(|entry| entry.message.id.clone());

    if boundary.is_some() {
        cache.last_visible = boundary;
    }
}

/// Channel exit: the current viewport position becomes the next session's
/// `last_read`.
pub fn commit_read_position(cache: &mut ChannelCache) {
    if let Some(last_visible) = cache.last_visible.clone() {
        cache.last_read = Some(last_visible);
    }
}
