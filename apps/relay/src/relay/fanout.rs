//! Broadcast hub for fanning frames out to trip rooms.
//!
//! Uses a single `tokio::sync::broadcast` channel. Each connection subscribes
//! once and filters frames locally by its own room membership, so a slow or
//! failed member never blocks delivery to the rest of the room.

use std::sync::Arc;

use tokio::sync::broadcast;
use waypoint_common::Envelope;

/// Capacity of the broadcast channel. Receivers that fall behind skip frames
/// (`RecvError::Lagged`).
const BROADCAST_CAPACITY: usize = 4096;

/// A frame addressed to one trip room, excluding its sender.
#[derive(Debug, Clone)]
pub struct RoomFrame {
    pub trip_id: String,
    /// Client id of the originator; never delivered back to it.
    pub sender: String,
    pub envelope: Envelope,
}

/// The global fan-out hub. Cloneable, stored in `AppState`.
#[derive(Clone)]
pub struct RoomBroadcast {
    sender: broadcast::Sender<Arc<RoomFrame>>,
}

impl RoomBroadcast {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { sender }
    }

    /// Subscribe to the hub. Each connection calls this once.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<RoomFrame>> {
        self.sender.subscribe()
    }

    /// Fan a frame out to the room. Having no receivers is not an error.
    pub fn relay(&self, frame: RoomFrame) {
        let _ = self.sender.send(Arc::new(frame));
    }
}

impl Default for RoomBroadcast {
    fn default() -> Self {
        Self::new()
    }
}
