//! Presence: announce the local user's online status and current page to the
//! rest of the trip room, and mirror everyone else's announcements into a
//! local member map.
//!
//! Refreshes are throttled to one per interval so an idle tab doesn't flood
//! the channel; a page navigation is materially new information and bypasses
//! the throttle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use waypoint_common::wire::{Body, JoinTrip, LeaveTrip, MemberEvent, Presence};
use waypoint_common::MessageKind;

use crate::transport::{RelayClient, Subscription};

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    pub trip_id: String,
    pub user_id: String,
    pub user_name: String,
    /// Periodic refresh cadence, doubling as the throttle floor.
    pub refresh_interval: Duration,
}

impl PresenceConfig {
    pub fn new(
        trip_id: impl Into<String>,
        user_id: impl Into<String>,
        user_name: impl Into<String>,
    ) -> Self {
        Self {
            trip_id: trip_id.into(),
            user_id: user_id.into(),
            user_name: user_name.into(),
            refresh_interval: Duration::from_secs(30),
        }
    }
}

/// What we currently believe about one trip member. Last write wins, in
/// arrival order; there is no versioning.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberPresence {
    pub user_id: String,
    pub user_name: Option<String>,
    pub is_online: bool,
    pub current_page: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
}

struct PresenceInner {
    client: RelayClient,
    config: PresenceConfig,
    members: Mutex<HashMap<String, MemberPresence>>,
    last_sent: Mutex<Option<Instant>>,
    current_page: Mutex<Option<String>>,
}

/// Tracks presence for one trip while alive. [`stop`](Self::stop) leaves the
/// room.
pub struct PresenceTracker {
    inner: Arc<PresenceInner>,
    subscriptions: Vec<Subscription>,
    refresh_task: JoinHandle<()>,
}

impl PresenceTracker {
    /// Join the trip room, announce ourselves, and start the periodic
    /// refresh.
    pub fn start(client: &RelayClient, config: PresenceConfig) -> Self {
        let inner = Arc::new(PresenceInner {
            client: client.clone(),
            config,
            members: Mutex::new(HashMap::new()),
            last_sent: Mutex::new(None),
            current_page: Mutex::new(None),
        });

        inner.client.send(Body::JoinTrip(JoinTrip {
            trip_id: inner.config.trip_id.clone(),
            user_id: inner.config.user_id.clone(),
            user_name: Some(inner.config.user_name.clone()),
        }));
        send_update(&inner, true);

        let mut subscriptions = Vec::new();
        {
            let inner = inner.clone();
            subscriptions.push(client.on(MessageKind::PresenceUpdate, move |envelope| {
                if let Body::PresenceUpdate(update) = &envelope.body {
                    apply_presence(&mut inner.members.lock(), update);
                }
            }));
        }
        {
            let inner = inner.clone();
            subscriptions.push(client.on(MessageKind::MemberJoined, move |envelope| {
                if let Body::MemberJoined(event) = &envelope.body {
                    apply_member_joined(&mut inner.members.lock(), event);
                }
            }));
        }
        for kind in [MessageKind::MemberLeft, MessageKind::MemberDisconnected] {
            let inner = inner.clone();
            subscriptions.push(client.on(kind, move |envelope| {
                match &envelope.body {
                    Body::MemberLeft(event) | Body::MemberDisconnected(event) => {
                        apply_member_gone(&mut inner.members.lock(), event, envelope.timestamp);
                    }
                    _ => {}
                }
            }));
        }

        let refresh_task = {
            let inner = inner.clone();
            tokio::spawn(async move {
                // The initial announcement just went out; wait a full period.
                let mut ticker = time::interval_at(
                    Instant::now() + inner.config.refresh_interval,
                    inner.config.refresh_interval,
                );
                loop {
                    ticker.tick().await;
                    send_update(&inner, false);
                }
            })
        };

        Self {
            inner,
            subscriptions,
            refresh_task,
        }
    }

    /// Record a page change and announce it immediately.
    pub fn navigate(&self, page: impl Into<String>) {
        *self.inner.current_page.lock() = Some(page.into());
        send_update(&self.inner, true);
    }

    /// Throttled refresh; a no-op when the last update is recent enough.
    pub fn refresh(&self) {
        send_update(&self.inner, false);
    }

    /// Snapshot of known members, ordered by user id.
    pub fn members(&self) -> Vec<MemberPresence> {
        let mut members: Vec<MemberPresence> = self.inner.members.lock().values().cloned().collect();
        members.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        members
    }

    pub fn member(&self, user_id: &str) -> Option<MemberPresence> {
        self.inner.members.lock().get(user_id).cloned()
    }

    /// Leave the trip room and stop refreshing.
    pub fn stop(self) {
        self.refresh_task.abort();
        for subscription in self.subscriptions {
            subscription.unsubscribe();
        }
        self.inner.client.send(Body::LeaveTrip(LeaveTrip {
            trip_id: Some(self.inner.config.trip_id.clone()),
            user_id: Some(self.inner.config.user_id.clone()),
        }));
    }
}

fn send_update(inner: &Arc<PresenceInner>, force: bool) {
    {
        let mut last_sent = inner.last_sent.lock();
        let now = Instant::now();
        if !force {
            if let Some(previous) = *last_sent {
                if now.duration_since(previous) < inner.config.refresh_interval {
                    return;
                }
            }
        }
        *last_sent = Some(now);
    }

    inner.client.send(Body::PresenceUpdate(Presence {
        user_id: Some(inner.config.user_id.clone()),
        user_name: inner.config.user_name.clone(),
        current_page: inner.current_page.lock().clone(),
        is_online: true,
        last_seen: Some(Utc::now()),
    }));
}

fn apply_presence(members: &mut HashMap<String, MemberPresence>, update: &Presence) {
    let Some(user_id) = update.user_id.clone() else {
        // The relay merges the sender id; an update without one is unusable.
        return;
    };
    members.insert(
        user_id.clone(),
        MemberPresence {
            user_id,
            user_name: Some(update.user_name.clone()),
            is_online: update.is_online,
            current_page: update.current_page.clone(),
            last_seen: update.last_seen,
        },
    );
}

fn apply_member_joined(members: &mut HashMap<String, MemberPresence>, event: &MemberEvent) {
    let Some(user_id) = event.user_id.clone() else {
        return;
    };
    let entry = members
        .entry(user_id.clone())
        .or_insert_with(|| MemberPresence {
            user_id,
            user_name: None,
            is_online: true,
            current_page: None,
            last_seen: None,
        });
    entry.is_online = true;
}

fn apply_member_gone(
    members: &mut HashMap<String, MemberPresence>,
    event: &MemberEvent,
    at: DateTime<Utc>,
) {
    let Some(user_id) = event.user_id.clone() else {
        return;
    };
    let entry = members
        .entry(user_id.clone())
        .or_insert_with(|| MemberPresence {
            user_id,
            user_name: None,
            is_online: false,
            current_page: None,
            last_seen: None,
        });
    entry.is_online = false;
    entry.last_seen = Some(at);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn presence(user_id: &str, page: Option<&str>, online: bool) -> Presence {
        Presence {
            user_id: Some(user_id.to_string()),
            user_name: format!("name-{user_id}"),
            current_page: page.map(str::to_string),
            is_online: online,
            last_seen: None,
        }
    }

    #[test]
    fn presence_updates_are_last_write_wins() {
        let mut members = HashMap::new();
        apply_presence(&mut members, &presence("u1", Some("Itinerary"), true));
        apply_presence(&mut members, &presence("u1", Some("Flights"), true));

        let entry = &members["u1"];
        assert_eq!(entry.current_page.as_deref(), Some("Flights"));
        assert!(entry.is_online);
        assert_eq!(members.len(), 1);
    }

    #[test]
    fn presence_without_user_id_is_ignored() {
        let mut members = HashMap::new();
        let mut update = presence("u1", None, true);
        update.user_id = None;
        apply_presence(&mut members, &update);
        assert!(members.is_empty());
    }

    #[test]
    fn member_joined_marks_online_without_erasing_details() {
        let mut members = HashMap::new();
        apply_presence(&mut members, &presence("u1", Some("Itinerary"), false));
        apply_member_joined(
            &mut members,
            &MemberEvent {
                user_id: Some("u1".into()),
                client_id: "cli_x".into(),
            },
        );

        let entry = &members["u1"];
        assert!(entry.is_online);
        // The page last reported survives the join event.
        assert_eq!(entry.current_page.as_deref(), Some("Itinerary"));
    }

    #[test]
    fn member_gone_marks_offline_with_last_seen() {
        let mut members = HashMap::new();
        apply_presence(&mut members, &presence("u1", None, true));

        let at = Utc::now();
        apply_member_gone(
            &mut members,
            &MemberEvent {
                user_id: Some("u1".into()),
                client_id: "cli_x".into(),
            },
            at,
        );

        let entry = &members["u1"];
        assert!(!entry.is_online);
        assert_eq!(entry.last_seen, Some(at));
    }

    #[test]
    fn member_gone_for_unknown_member_inserts_offline_entry() {
        let mut members = HashMap::new();
        apply_member_gone(
            &mut members,
            &MemberEvent {
                user_id: Some("u9".into()),
                client_id: "cli_x".into(),
            },
            Utc::now(),
        );
        assert!(!members["u9"].is_online);
    }
}
