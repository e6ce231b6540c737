use thiserror::Error;

/// Errors surfaced by [`RelayClient`](crate::RelayClient).
///
/// Everything else (parse failures, handler panics, heartbeat evictions)
/// is logged and absorbed; nothing in this crate throws into UI code.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// The dial failed at the socket level.
    #[error("connection failed: {0}")]
    Connect(String),
    /// The client was shut down and can no longer serve requests.
    #[error("client is shut down")]
    Closed,
}
