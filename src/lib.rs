pub mod config;
pub mod connection;
pub mod controller;
pub mod error;
pub mod protocol;
pub mod pulse;
pub mod registry;
pub mod scheduler;
pub mod server;

#[cfg(test)]
mod tests;

use std::sync::Arc;

// Re-export core components
pub use crate::config::{Config, ConfigManager, RandomStrengthConfig};
pub use crate::connection::{Connection, ConnectionEvent, ConnectionSettings, ConnectionState};
pub use crate::controller::OutputController;
pub use crate::error::{RelayError, RelayResult};
pub use crate::protocol::{Channel, MessageType, WireMessage};
pub use crate::pulse::{PulseScript, PulseService, PulseStep, ScriptSource};
pub use crate::registry::RelayRegistry;
pub use crate::scheduler::{Scheduler, TaskFailure};
pub use crate::server::RelayServer;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Process-wide services shared by every connection
#[derive(Clone)]
pub struct RelayContext {
    pub scheduler: Scheduler,
    pub scripts: Arc<dyn ScriptSource>,
    pub config: ConfigManager,
    pub connection_settings: ConnectionSettings,
}

impl RelayContext {
    pub fn new(scheduler: Scheduler, scripts: Arc<dyn ScriptSource>, config: ConfigManager) -> Self {
        Self {
            scheduler,
            scripts,
            config,
            connection_settings: ConnectionSettings::default(),
        }
    }

    pub fn with_connection_settings(mut self, settings: ConnectionSettings) -> Self {
        self.connection_settings = settings;
        self
    }
}
