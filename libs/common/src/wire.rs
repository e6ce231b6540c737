//! Wire protocol shared by the relay server and the transport client.
//!
//! Every frame is a JSON object `{ "type", "payload", "timestamp" }`. The
//! `type`/`payload` pair is modeled as an adjacently tagged enum so handler
//! code matches exhaustively instead of poking at an untyped bag. Domain
//! payloads the relay never interprets (`comment`, `itinerary-update`, ...)
//! stay opaque `serde_json::Value`s.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A complete wire frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(flatten)]
    pub body: Body,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Wrap a body with the current time.
    pub fn now(body: Body) -> Self {
        Self {
            body,
            timestamp: Utc::now(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }
}

/// The typed `type`/`payload` pair of a frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum Body {
    /// Server acknowledgement carrying the generated client id.
    Connected(ConnectedPayload),
    Ping(Blank),
    Pong(Blank),
    JoinTrip(JoinTrip),
    LeaveTrip(LeaveTrip),
    PresenceUpdate(Presence),
    MemberJoined(MemberEvent),
    MemberLeft(MemberEvent),
    MemberDisconnected(MemberEvent),
    Vote(Vote),
    Comment(Value),
    ItineraryUpdate(Value),
    PollVote(Value),
    TaskUpdate(Value),
}

impl Body {
    pub fn kind(&self) -> MessageKind {
        match self {
            Body::Connected(_) => MessageKind::Connected,
            Body::Ping(_) => MessageKind::Ping,
            Body::Pong(_) => MessageKind::Pong,
            Body::JoinTrip(_) => MessageKind::JoinTrip,
            Body::LeaveTrip(_) => MessageKind::LeaveTrip,
            Body::PresenceUpdate(_) => MessageKind::PresenceUpdate,
            Body::MemberJoined(_) => MessageKind::MemberJoined,
            Body::MemberLeft(_) => MessageKind::MemberLeft,
            Body::MemberDisconnected(_) => MessageKind::MemberDisconnected,
            Body::Vote(_) => MessageKind::Vote,
            Body::Comment(_) => MessageKind::Comment,
            Body::ItineraryUpdate(_) => MessageKind::ItineraryUpdate,
            Body::PollVote(_) => MessageKind::PollVote,
            Body::TaskUpdate(_) => MessageKind::TaskUpdate,
        }
    }

    pub fn ping() -> Self {
        Body::Ping(Blank {})
    }

    pub fn pong() -> Self {
        Body::Pong(Blank {})
    }
}

/// Discriminant of [`Body`], used as a handler-registration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Connected,
    Ping,
    Pong,
    JoinTrip,
    LeaveTrip,
    PresenceUpdate,
    MemberJoined,
    MemberLeft,
    MemberDisconnected,
    Vote,
    Comment,
    ItineraryUpdate,
    PollVote,
    TaskUpdate,
}

impl MessageKind {
    /// The wire-level `type` string.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Connected => "connected",
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::JoinTrip => "join-trip",
            MessageKind::LeaveTrip => "leave-trip",
            MessageKind::PresenceUpdate => "presence-update",
            MessageKind::MemberJoined => "member-joined",
            MessageKind::MemberLeft => "member-left",
            MessageKind::MemberDisconnected => "member-disconnected",
            MessageKind::Vote => "vote",
            MessageKind::Comment => "comment",
            MessageKind::ItineraryUpdate => "itinerary-update",
            MessageKind::PollVote => "poll-vote",
            MessageKind::TaskUpdate => "task-update",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Empty `{}` payload for ping/pong.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Blank {}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedPayload {
    pub client_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JoinTrip {
    pub trip_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
}

/// Payload is informational only; the relay leaves whatever room the sender
/// is actually in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct LeaveTrip {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trip_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    /// Filled in by the relay on rebroadcast; the sender may omit it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub user_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_page: Option<String>,
    pub is_online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

/// `member-joined`, `member-left`, and `member-disconnected` all carry this.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemberEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub client_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Vote {
    pub activity_id: String,
    pub member_id: String,
    pub vote_type: VoteChoice,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_name: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum VoteChoice {
    Love,
    Maybe,
    Skip,
}
