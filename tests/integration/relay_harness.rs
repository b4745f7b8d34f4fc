//! Relay server test harness
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::time::{sleep, timeout};

use coyote_relay::config::{Config, ServerConfig};
use coyote_relay::{
    ConfigManager, ConnectionSettings, PulseScript, PulseService, RandomStrengthConfig,
    RelayContext, RelayRegistry, RelayServer, Scheduler,
};

/// Test environment running a relay on an ephemeral port
pub struct RelayTestEnvironment {
    pub server: RelayServer,
    pub registry: Arc<RelayRegistry>,
    pub scheduler: Scheduler,
    pub addr: SocketAddr,
}

/// Short timings so tests don't sit through the production delays
pub fn test_connection_settings() -> ConnectionSettings {
    ConnectionSettings {
        bind_timeout: Duration::from_secs(2),
        heartbeat_interval: Duration::from_secs(1),
        settle_delay: Duration::from_millis(300),
    }
}

/// Randomized output pinned to one strength and a 100ms on-time
pub fn fixed_random_strength() -> RandomStrengthConfig {
    RandomStrengthConfig {
        min_strength: 5,
        max_strength: 5,
        min_interval: 0.1,
        max_interval: 0.1,
        b_channel_multiplier: None,
    }
}

impl RelayTestEnvironment {
    /// Start a relay; `None` keeps the output routine idle
    pub async fn start(random_strength: Option<RandomStrengthConfig>) -> Result<Self> {
        let scheduler = Scheduler::new();
        let scripts = Arc::new(PulseService::in_memory(vec![PulseScript::builtin_default()]));
        let config = ConfigManager::in_memory(Config {
            random_strength,
            ..Config::default()
        });

        let ctx = RelayContext::new(scheduler.clone(), scripts, config)
            .with_connection_settings(test_connection_settings());
        let registry = RelayRegistry::new(ctx);

        let mut server = RelayServer::new(
            ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            Arc::clone(&registry),
        );
        let addr = server.start().await?;

        Ok(Self {
            server,
            registry,
            scheduler,
            addr,
        })
    }

    /// Poll until `check` holds or five seconds pass
    pub async fn wait_until<F>(&self, mut check: F) -> bool
    where
        F: FnMut(&RelayRegistry) -> bool,
    {
        timeout(Duration::from_secs(5), async {
            while !check(&self.registry) {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .is_ok()
    }

    /// Stop everything
    pub async fn cleanup(mut self) -> Result<()> {
        self.server.stop().await?;
        self.registry.destroy_all().await;
        self.scheduler.stop().await;
        Ok(())
    }
}
