//! Client records and trip-room membership.

use std::collections::HashSet;

use dashmap::DashMap;
use parking_lot::Mutex;

/// Room membership as an explicit state machine. A client is in at most one
/// room; every transition out of `Joined` goes through [`ClientRegistry`] so
/// the room set can never leak a member.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomMembership {
    Unjoined,
    Joined {
        trip_id: String,
        user_id: String,
        user_name: Option<String>,
    },
}

/// Server-side bookkeeping for one accepted connection.
#[derive(Debug)]
pub struct ClientRecord {
    pub client_id: String,
    pub membership: RoomMembership,
    /// Cleared by the heartbeat sweep, set again by the socket's pong.
    pub is_alive: bool,
}

/// The room a client occupied, returned when a transition leaves it.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomPeer {
    pub trip_id: String,
    pub user_id: String,
}

/// Outcome of a join: the room actually entered, plus the room implicitly
/// left when the client was already joined elsewhere.
#[derive(Debug)]
pub struct JoinOutcome {
    pub moved_from: Option<RoomPeer>,
}

/// Shared registry of all connected clients and their trip rooms.
///
/// Uses `DashMap` for shard-level concurrency and `parking_lot::Mutex` per
/// record for non-poisoning, fast locking. All mutation for one client
/// happens inside that client's own event loop.
pub struct ClientRegistry {
    clients: DashMap<String, Mutex<ClientRecord>>,
    rooms: DashMap<String, HashSet<String>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            rooms: DashMap::new(),
        }
    }

    /// Register a freshly accepted connection.
    pub fn register(&self, client_id: &str) {
        let record = ClientRecord {
            client_id: client_id.to_string(),
            membership: RoomMembership::Unjoined,
            is_alive: true,
        };
        self.clients
            .insert(client_id.to_string(), Mutex::new(record));
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Join a trip room, creating it on first use.
    ///
    /// A client already joined elsewhere is implicitly moved: the old room is
    /// left first and reported in `moved_from` so the caller can broadcast
    /// `member-left` there.
    pub fn join(
        &self,
        client_id: &str,
        trip_id: &str,
        user_id: &str,
        user_name: Option<String>,
    ) -> Option<JoinOutcome> {
        let entry = self.clients.get(client_id)?;
        let mut record = entry.lock();

        let moved_from = match std::mem::replace(&mut record.membership, RoomMembership::Unjoined) {
            RoomMembership::Joined {
                trip_id: old_trip,
                user_id: old_user,
                ..
            } => {
                self.remove_from_room(client_id, &old_trip);
                Some(RoomPeer {
                    trip_id: old_trip,
                    user_id: old_user,
                })
            }
            RoomMembership::Unjoined => None,
        };

        record.membership = RoomMembership::Joined {
            trip_id: trip_id.to_string(),
            user_id: user_id.to_string(),
            user_name,
        };
        self.rooms
            .entry(trip_id.to_string())
            .or_default()
            .insert(client_id.to_string());

        Some(JoinOutcome { moved_from })
    }

    /// Leave the current room, if any. Returns what was left so the caller
    /// can broadcast `member-left`.
    pub fn leave(&self, client_id: &str) -> Option<RoomPeer> {
        let entry = self.clients.get(client_id)?;
        let mut record = entry.lock();
        match std::mem::replace(&mut record.membership, RoomMembership::Unjoined) {
            RoomMembership::Joined {
                trip_id, user_id, ..
            } => {
                self.remove_from_room(client_id, &trip_id);
                Some(RoomPeer { trip_id, user_id })
            }
            RoomMembership::Unjoined => None,
        }
    }

    /// Drop the record entirely (socket closed or evicted). Returns the room
    /// that was occupied, mirroring [`leave`](Self::leave).
    pub fn remove(&self, client_id: &str) -> Option<RoomPeer> {
        let (_, record) = self.clients.remove(client_id)?;
        match record.into_inner().membership {
            RoomMembership::Joined {
                trip_id, user_id, ..
            } => {
                self.remove_from_room(client_id, &trip_id);
                Some(RoomPeer { trip_id, user_id })
            }
            RoomMembership::Unjoined => None,
        }
    }

    /// The trip room the client currently occupies.
    pub fn current_room(&self, client_id: &str) -> Option<String> {
        let entry = self.clients.get(client_id)?;
        let record = entry.lock();
        match &record.membership {
            RoomMembership::Joined { trip_id, .. } => Some(trip_id.clone()),
            RoomMembership::Unjoined => None,
        }
    }

    /// The `(trip_id, user_id)` pair for a joined client.
    pub fn peer(&self, client_id: &str) -> Option<RoomPeer> {
        let entry = self.clients.get(client_id)?;
        let record = entry.lock();
        match &record.membership {
            RoomMembership::Joined {
                trip_id, user_id, ..
            } => Some(RoomPeer {
                trip_id: trip_id.clone(),
                user_id: user_id.clone(),
            }),
            RoomMembership::Unjoined => None,
        }
    }

    /// Mark the client alive (its socket answered the last ping).
    pub fn mark_alive(&self, client_id: &str) {
        if let Some(entry) = self.clients.get(client_id) {
            entry.lock().is_alive = true;
        }
    }

    /// One sweep step: reads the liveness flag and clears it. A `false`
    /// return means the client never answered since the previous sweep and
    /// must be evicted.
    pub fn sweep_alive(&self, client_id: &str) -> bool {
        match self.clients.get(client_id) {
            Some(entry) => {
                let mut record = entry.lock();
                let was_alive = record.is_alive;
                record.is_alive = false;
                was_alive
            }
            None => false,
        }
    }

    /// Current members of a room, in unspecified order.
    pub fn room_members(&self, trip_id: &str) -> Vec<String> {
        self.rooms
            .get(trip_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn room_exists(&self, trip_id: &str) -> bool {
        self.rooms.contains_key(trip_id)
    }

    fn remove_from_room(&self, client_id: &str, trip_id: &str) {
        let emptied = match self.rooms.get_mut(trip_id) {
            Some(mut room) => {
                room.remove(client_id);
                room.is_empty()
            }
            None => false,
        };
        if emptied {
            self.rooms.remove(trip_id);
        }
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}
