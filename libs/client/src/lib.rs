//! Client-side real-time stack for Waypoint trip collaboration: the
//! transport to the relay, plus the presence and voting layers built on it.

pub mod error;
pub mod presence;
pub mod transport;
pub mod voting;

pub use error::ClientError;
pub use presence::{MemberPresence, PresenceConfig, PresenceTracker};
pub use transport::{ReconnectPolicy, RelayClient, RelayConfig, Subscription};
pub use voting::{TallySource, VoteBoard, VoteCounts, VoteSummary};
pub use waypoint_common::{Body, Envelope, MessageKind, VoteChoice};
