use shared::domain::{Message, MessageId, SendStatus};

use crate::cache::{CachedMessage, ChannelCache};

/// Optimistic insert: the message renders immediately with `pending`
/// status while transmission happens in the background.
pub fn insert_pending(cache: &mut ChannelCache, message: Message) {
    cache.messages.push(CachedMessage::pending(message));
    cache
        .messages
        .sort_by(|a, b| a.message.created_at.cmp(&b.message.created_at));
}

/// Applies the acknowledgement outcome. Success clears the status so the
/// entry becomes indistinguishable from one that arrived via broadcast;
/// failure arms the resend/give-up affordances. Returns false when the
/// entry no longer exists (given up while the send was in flight).
pub fn apply_ack(cache: &mut ChannelCache, id: &MessageId, ok: bool) -> bool {
    let Some(entry) = cache.messages.iter_mut().find(|e| &e.message.id == id) else {
        return false;
    };
    entry.send_status = if ok { None } else { Some(SendStatus::Failed) };
    true
}

/// Resend: re-arms a failed entry as pending. The id stays the same so the
/// server-side idempotent insert absorbs a duplicate from an earlier
/// attempt that did land.
pub fn rearm_pending(cache: &mut ChannelCache, id: &MessageId) -> bool {
    let Some(entry) = cache.messages.iter_mut().find(|e| &e.message.id == id) else {
        return false;
    };
    if entry.send_status != Some(SendStatus::Failed) {
        return false;
    }
    entry.send_status = Some(SendStatus::Pending);
    true
}

/// Give up: removes the local entry entirely. The message never reached
/// other clients, so there is nothing to retract remotely.
pub fn give_up(cache: &mut ChannelCache, id: &MessageId) -> Option<CachedMessage> {
    let index = cache
        .messages
        .iter()
        .position(|e| &e.message.id == id && !e.is_settled())?;
    Some(cache.messages.remove(index))
}

/// Attachment upload completed: the pending entry that referenced a local
/// file path is superseded in place by id with the final remote reference.
pub fn supersede_attachment(cache: &mut ChannelCache, id: &MessageId, remote_url: &str) -> bool {
    let Some(entry) = cache.messages.iter_mut().find(|e| &e.message.id == id) else {
        return false;
    };
    entry.message.image_url = Some(remote_url.to_string());
    true
}
