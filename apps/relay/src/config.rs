/// Relay configuration, loaded from environment variables.
///
/// The WebSocket path (`/ws`) is a fixed contract and deliberately not
/// configurable.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP server binds to.
    pub port: u16,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4000),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self { port: 4000 }
    }
}
