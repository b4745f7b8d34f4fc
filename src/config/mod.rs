use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info};

use crate::error::{config_invalid, RelayResult};

// Default configuration values
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 5180;
const DEFAULT_PULSE_PATH: &str = "data/pulse.json";
const DEFAULT_CONFIG_PATH: &str = "config.json";
const DEFAULT_MIN_STRENGTH: u32 = 10;
const DEFAULT_MAX_STRENGTH: u32 = 20;
const DEFAULT_MIN_INTERVAL_SECONDS: f64 = 10.0;
const DEFAULT_MAX_INTERVAL_SECONDS: f64 = 15.0;

/// Main configuration struct for the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Pulse script source
    #[serde(default)]
    pub pulse: PulseConfig,
    /// Randomized output settings; `null` disables the routine
    #[serde(default = "default_random_strength")]
    pub random_strength: Option<RandomStrengthConfig>,
}

/// Listener configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PulseConfig {
    /// JSON file holding the pulse scripts
    #[serde(default = "default_pulse_path")]
    pub path: PathBuf,
}

/// Bounds for the randomized output routine
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RandomStrengthConfig {
    pub min_strength: u32,
    pub max_strength: u32,
    /// Seconds
    pub min_interval: f64,
    /// Seconds
    pub max_interval: f64,
    /// Channel B follows A scaled by this factor; absent means B is idle
    #[serde(default)]
    pub b_channel_multiplier: Option<f64>,
}

impl RandomStrengthConfig {
    pub fn validate(&self) -> RelayResult<()> {
        if self.min_strength > self.max_strength {
            return Err(config_invalid(
                "random_strength.min_strength",
                format!(
                    "min_strength {} is above max_strength {}",
                    self.min_strength, self.max_strength
                ),
            ));
        }
        for (key, value) in [
            ("random_strength.min_interval", self.min_interval),
            ("random_strength.max_interval", self.max_interval),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(config_invalid(key, format!("{value} is not a valid interval")));
            }
        }
        if self.min_interval > self.max_interval {
            return Err(config_invalid(
                "random_strength.min_interval",
                "min_interval is above max_interval",
            ));
        }
        if let Some(multiplier) = self.b_channel_multiplier {
            if !multiplier.is_finite() || multiplier <= 0.0 {
                return Err(config_invalid(
                    "random_strength.b_channel_multiplier",
                    format!("{multiplier} must be a positive number"),
                ));
            }
        }
        Ok(())
    }
}

// Default functions
fn default_host() -> String {
    std::env::var("COYOTE_RELAY_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string())
}

fn default_port() -> u16 {
    std::env::var("COYOTE_RELAY_PORT")
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

fn default_pulse_path() -> PathBuf {
    std::env::var("COYOTE_RELAY_PULSE_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_PULSE_PATH))
}

fn default_random_strength() -> Option<RandomStrengthConfig> {
    Some(RandomStrengthConfig::default())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            pulse: PulseConfig::default(),
            random_strength: default_random_strength(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for PulseConfig {
    fn default() -> Self {
        Self {
            path: default_pulse_path(),
        }
    }
}

impl Default for RandomStrengthConfig {
    fn default() -> Self {
        Self {
            min_strength: DEFAULT_MIN_STRENGTH,
            max_strength: DEFAULT_MAX_STRENGTH,
            min_interval: DEFAULT_MIN_INTERVAL_SECONDS,
            max_interval: DEFAULT_MAX_INTERVAL_SECONDS,
            b_channel_multiplier: None,
        }
    }
}

/// Manages configuration for the relay
///
/// The active `RandomStrengthConfig` is also published on a watch channel so
/// running controllers pick up changes on their next iteration.
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: Arc<RwLock<Config>>,
    config_path: Option<PathBuf>,
    random_strength: Arc<watch::Sender<Option<RandomStrengthConfig>>>,
}

impl ConfigManager {
    /// Load from `COYOTE_RELAY_CONFIG_PATH` (or `config.json`), creating it if missing
    pub async fn new() -> Result<Self> {
        let config_path = get_config_path();
        Self::from_path(config_path).await
    }

    pub async fn from_path(config_path: impl Into<PathBuf>) -> Result<Self> {
        let config_path = config_path.into();
        let config = load_or_create_config(&config_path).await?;
        Ok(Self::build(config, Some(config_path)))
    }

    /// Manager that never touches the filesystem
    pub fn in_memory(config: Config) -> Self {
        Self::build(config, None)
    }

    fn build(config: Config, config_path: Option<PathBuf>) -> Self {
        let (random_strength, _) = watch::channel(config.random_strength);
        Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
            random_strength: Arc::new(random_strength),
        }
    }

    /// Get a clone of the current configuration
    pub async fn get_config(&self) -> Config {
        self.config.read().await.clone()
    }

    pub fn random_strength(&self) -> Option<RandomStrengthConfig> {
        *self.random_strength.borrow()
    }

    /// Receiver marked changed on every randomized output update
    pub fn subscribe_random_strength(&self) -> watch::Receiver<Option<RandomStrengthConfig>> {
        self.random_strength.subscribe()
    }

    /// Replace the whole configuration
    pub async fn update_config(&self, new_config: Config) -> Result<()> {
        if let Some(random) = &new_config.random_strength {
            random.validate()?;
        }

        *self.config.write().await = new_config.clone();
        self.persist(&new_config).await?;
        self.random_strength.send_replace(new_config.random_strength);

        Ok(())
    }

    /// Change (or disable, with `None`) the randomized output settings
    pub async fn update_random_strength(&self, random: Option<RandomStrengthConfig>) -> Result<()> {
        if let Some(random) = &random {
            random.validate()?;
        }

        let snapshot = {
            let mut config = self.config.write().await;
            config.random_strength = random;
            config.clone()
        };
        self.persist(&snapshot).await?;

        info!(enabled = random.is_some(), "Random strength configuration updated");
        self.random_strength.send_replace(random);
        Ok(())
    }

    async fn persist(&self, config: &Config) -> Result<()> {
        match &self.config_path {
            Some(path) => save_config(path, config).await,
            None => Ok(()),
        }
    }
}

/// Get the path to the configuration file
fn get_config_path() -> PathBuf {
    std::env::var("COYOTE_RELAY_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Load configuration from file or create default
pub async fn load_or_create_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        let default_config = Config::default();
        save_config(path, &default_config).await?;
        info!("Created default configuration at {}", path.display());
        return Ok(default_config);
    }

    let config_str = fs::read_to_string(path).await?;
    let config: Config = serde_json::from_str(&config_str)?;
    if let Some(random) = &config.random_strength {
        random.validate()?;
    }
    debug!("Loaded configuration from {}", path.display());

    Ok(config)
}

/// Save configuration to file
async fn save_config(path: &Path, config: &Config) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }

    let config_str = serde_json::to_string_pretty(config)?;
    fs::write(path, config_str).await?;
    debug!("Saved configuration to {}", path.display());

    Ok(())
}
