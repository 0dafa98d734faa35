use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use shared::domain::MessageId;

use crate::cache::{CachedMessage, ChannelCache};

/// First-run delta window: with no local history and no stored watermark,
/// fetch at most this far back.
pub const DEFAULT_SYNC_WINDOW_DAYS: i64 = 90;

/// Merges two message sets into one canonical, deduplicated set ordered
/// ascending by `created_at` (ties keep insertion order, local first).
///
/// Dedup is by id: a settled entry (no send status) beats one still
/// pending or failed, so a broadcast echo of one's own message upgrades it
/// to "sent" instead of duplicating it. Between entries of equal
/// settledness the later `created_at` wins. Merging the same delta twice
/// is a no-op.
pub fn merge_messages(
    local: Vec<CachedMessage>,
    incoming: Vec<CachedMessage>,
) -> Vec<CachedMessage> {
    let mut merged: Vec<CachedMessage> = Vec::with_capacity(local.len() + incoming.len());
    let mut by_id: HashMap<MessageId, usize> = HashMap::new();

    for entry in local.into_iter().chain(incoming) {
        match by_id.get(&entry.message.id) {
            Some(&slot) => {
                if prefer_replacement(&merged[slot], &entry) {
                    merged[slot] = entry;
                }
            }
            None => {
                by_id.insert(entry.message.id.clone(), merged.len());
                merged.push(entry);
            }
        }
    }

    merged.sort_by(|a, b| a.message.created_at.cmp(&b.message.created_at));
    merged
}

fn prefer_replacement(existing: &CachedMessage, candidate: &CachedMessage) -> bool {
    match (existing.is_settled(), candidate.is_settled()) {
        (false, true) => true,
        (true, false) => false,
        _ => candidate.message.created_at > existing.message.created_at,
    }
}

/// The watermark for the next delta fetch: the newest `created_at` present
/// locally, else the persisted `last_fetched` cursor, else a conservative
/// default window back from `now` to bound first-run cost.
pub fn delta_watermark(cache: &ChannelCache, now: DateTime<Utc>) -> DateTime<Utc> {
    cache
        .messages
        .iter()
        .map(|entry| entry.message.created_at)
        .max()
        .or(cache.last_fetched)
        .unwrap_or_else(|| now - Duration::days(DEFAULT_SYNC_WINDOW_DAYS))
}

/// Folds a fetched delta into the cache and advances the watermark.
/// Callers persist the cache afterwards; a failed fetch never reaches this
/// point, so the cache is untouched on error.
pub fn apply_delta(cache: &mut ChannelCache, delta: Vec<CachedMessage>) -> usize {
    let fetched = delta.len();
    let newest_fetched = delta.iter().map(|entry| entry.message.created_at).max();

    let local = std::mem::take(&mut cache.messages);
    cache.messages = merge_messages(local, delta);

    if let Some(newest) = newest_fetched {
        if cache.last_fetched.map_or(true, |current| newest > current) {
            cache.last_fetched = Some(newest);
        }
    }
    fetched
}
