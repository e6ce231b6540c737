pub mod config;
pub mod relay;
pub mod routes;

use std::sync::Arc;

use config::Config;
use relay::fanout::RoomBroadcast;
use relay::registry::ClientRegistry;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<ClientRegistry>,
    pub broadcast: RoomBroadcast,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(ClientRegistry::new()),
            broadcast: RoomBroadcast::new(),
        }
    }
}
