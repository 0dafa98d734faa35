use std::collections::HashMap;
use std::sync::Mutex;

use shared::domain::{ChannelId, Message};
use tokio::sync::broadcast;
use uuid::Uuid;

const ROOM_CAPACITY: usize = 256;

/// Identifies one realtime connection for the lifetime of its socket. Used
/// to keep a submitter from receiving its own broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

/// One event fanned out to a room. `origin` is the submitting connection,
/// or `None` for request/response producers.
#[derive(Debug, Clone)]
pub struct RoomEvent {
    pub origin: Option<ConnectionId>,
    pub message: Message,
}

/// Topic-style rooms, one per channel, built on `tokio::sync::broadcast`.
/// Membership is not durable: a dropped connection's receiver disappears
/// with it, and the client re-joins on reconnect.
#[derive(Default)]
pub struct RoomRegistry {
    inner: Mutex<HashMap<ChannelId, broadcast::Sender<RoomEvent>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscriber to the channel's room, creating it on first join.
    pub fn join(&self, channel_id: &ChannelId) -> broadcast::Receiver<RoomEvent> {
        let mut rooms = self.inner.lock().expect("room registry lock");
        rooms
            .entry(channel_id.clone())
            .or_insert_with(|| broadcast::channel(ROOM_CAPACITY).0)
            .subscribe()
    }

    /// Broadcasts to every subscriber of the room. Returns the number of
    /// receivers the event reached; an empty or missing room is not an
    /// error.
    pub fn publish(
        &self,
        channel_id: &ChannelId,
        origin: Option<ConnectionId>,
        message: Message,
    ) -> usize {
        let mut rooms = self.inner.lock().expect("room registry lock");
        let Some(sender) = rooms.get(channel_id) else {
            return 0;
        };
        match sender.send(RoomEvent { origin, message }) {
            Ok(count) => count,
            Err(_) => {
                // Every receiver is gone; drop the empty room.
                rooms.remove(channel_id);
                0
            }
        }
    }
}
