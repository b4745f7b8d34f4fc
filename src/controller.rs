//! Randomized strength and pulse routine driven over one connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::RandomStrengthConfig;
use crate::connection::Connection;
use crate::error::{RelayError, RelayResult};
use crate::protocol::Channel;
use crate::pulse::{self, PulseScript, ScriptSource};
use crate::scheduler::Scheduler;

/// Upper bound on burst repetitions per iteration
pub const MAX_BURST_REPEATS: usize = 50;

/// Back-off while there is nothing to play
pub const IDLE_WAIT: Duration = Duration::from_millis(200);

/// Extra wait after a burst before clearing it
pub const BURST_SETTLE: Duration = Duration::from_millis(200);

/// Shortest wall-clock time one iteration may take
pub const MIN_ITERATION: Duration = Duration::from_millis(200);

/// Drives a bound connection with randomized output
pub struct OutputController {
    connection: Arc<Connection>,
    scripts: Arc<dyn ScriptSource>,
    config: watch::Receiver<Option<RandomStrengthConfig>>,
    selected: RwLock<Option<String>>,
}

impl OutputController {
    pub fn new(
        connection: Arc<Connection>,
        scripts: Arc<dyn ScriptSource>,
        config: watch::Receiver<Option<RandomStrengthConfig>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            connection,
            scripts,
            config,
            selected: RwLock::new(None),
        })
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn client_id(&self) -> &str {
        self.connection.client_id()
    }

    /// Bind the underlying connection
    pub async fn initialize(&self) -> RelayResult<()> {
        self.connection.initialize().await
    }

    /// Play `id` from the next iteration on
    pub async fn select_pulse(&self, id: &str) -> RelayResult<()> {
        if self.scripts.get(id).is_none() {
            return Err(RelayError::PulseNotFound { id: id.to_string() });
        }
        info!(client_id = %self.client_id(), pulse_id = %id, "Pulse selected");
        *self.selected.write().await = Some(id.to_string());
        Ok(())
    }

    pub async fn selected_pulse(&self) -> Option<String> {
        self.selected.read().await.clone()
    }

    /// Hand the routine to the scheduler
    pub fn start(self: &Arc<Self>, scheduler: &Scheduler) {
        let name = format!("pulse-output-{}", self.client_id());
        scheduler.spawn(name, Arc::clone(self).run_routine());
    }

    /// Wait for the connection to end, then close it
    pub async fn run(&self) {
        self.connection.run().await;
    }

    pub async fn close(&self) {
        self.connection.close().await;
    }

    async fn run_routine(self: Arc<Self>) -> anyhow::Result<()> {
        match self.routine().await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(client_id = %self.client_id(), error = %e, "Error in pulse output task");
                Err(e.into())
            }
        }
    }

    fn current_config(&self) -> Option<RandomStrengthConfig> {
        *self.config.borrow()
    }

    /// Selected script, or the first listed one when nothing is selected
    async fn current_script(&self) -> Option<PulseScript> {
        let scripts = self.scripts.list_scripts();
        match self.selected.read().await.as_deref() {
            Some(id) => {
                let found = scripts.iter().find(|s| s.id == id).cloned();
                if found.is_none() {
                    warn!(client_id = %self.client_id(), pulse_id = %id, "Selected pulse no longer exists");
                }
                found
            }
            None => scripts.first().cloned(),
        }
    }

    #[instrument(skip(self), fields(client_id = %self.client_id()), level = "debug")]
    async fn routine(&self) -> RelayResult<()> {
        if self.connection.is_closed() {
            return Ok(());
        }
        if let Some(config) = self.current_config() {
            self.connection
                .set_strength(Channel::A, config.min_strength)
                .await?;
        }

        loop {
            let started = Instant::now();

            if self.connection.is_closed() {
                debug!(client_id = %self.client_id(), "Connection closed, stopping pulse output");
                return Ok(());
            }

            let Some(config) = self.current_config() else {
                sleep(IDLE_WAIT).await;
                continue;
            };
            let Some(script) = self.current_script().await else {
                sleep(IDLE_WAIT).await;
                continue;
            };
            let compiled = pulse::compile(&script);
            if compiled.is_empty() {
                trace!(pulse_id = %script.id, "Pulse compiles to nothing, idling");
                sleep(IDLE_WAIT).await;
                continue;
            }

            let drive_b = config.b_channel_multiplier.is_some();
            let on_ms = random_between(config.min_interval, config.max_interval) * 1000.0;

            let mut total_ms: u64 = 0;
            for _ in 0..MAX_BURST_REPEATS {
                trace!(client_id = %self.client_id(), pulse_id = %script.id, "Pulse output");
                self.connection
                    .send_pulse(Channel::A, compiled.frames.clone())
                    .await?;
                if drive_b {
                    self.connection
                        .send_pulse(Channel::B, compiled.frames.clone())
                        .await?;
                }

                total_ms += compiled.duration_ms;
                if total_ms as f64 > on_ms {
                    break;
                }
            }

            sleep(Duration::from_millis(total_ms) + BURST_SETTLE).await;

            self.connection.clear_pulse(Channel::A).await?;
            if drive_b {
                self.connection.clear_pulse(Channel::B).await?;
            }

            let strength = random_strength(config.min_strength, config.max_strength);
            self.connection.set_strength(Channel::A, strength).await?;
            if let Some(multiplier) = config.b_channel_multiplier {
                let strength_b = (strength as f64 * multiplier).floor() as u32;
                self.connection.set_strength(Channel::B, strength_b).await?;
            }
            debug!(client_id = %self.client_id(), strength, burst_ms = total_ms, "Output iteration done");

            let elapsed = started.elapsed();
            if elapsed < MIN_ITERATION {
                sleep(MIN_ITERATION - elapsed).await;
            }
        }
    }
}

/// Uniform in `[min, max]`, tolerant of swapped bounds
fn random_strength(min: u32, max: u32) -> u32 {
    let (low, high) = if min <= max { (min, max) } else { (max, min) };
    fastrand::u32(low..=high)
}

fn random_between(min: f64, max: f64) -> f64 {
    let (low, high) = if min <= max { (min, max) } else { (max, min) };
    low + fastrand::f64() * (high - low)
}
