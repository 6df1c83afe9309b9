use config::Config;
use sse::ConnectionRegistry;
use std::sync::Arc;

pub mod config;
pub mod logging;

// Service-level state shared by every request handler.
// Needs to implement Clone to be able to be passed into Router as State
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub config: Config,
}

impl AppState {
    pub fn new(app_config: Config, registry: &Arc<ConnectionRegistry>) -> Self {
        Self {
            registry: Arc::clone(registry),
            config: app_config,
        }
    }

    pub fn registry_ref(&self) -> &ConnectionRegistry {
        self.registry.as_ref()
    }
}
