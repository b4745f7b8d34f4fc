use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use super::PulseScript;
use crate::error::{config_invalid, RelayResult};

/// Shared, immutable snapshot of the script list
pub type ScriptList = Arc<Vec<PulseScript>>;

/// Where controllers get their pulse scripts from
#[async_trait]
pub trait ScriptSource: Send + Sync {
    /// Current scripts in display order
    fn list_scripts(&self) -> ScriptList;

    /// Look up one script by id
    fn get(&self, id: &str) -> Option<PulseScript> {
        self.list_scripts().iter().find(|s| s.id == id).cloned()
    }

    /// Receiver that is marked changed whenever the list is replaced
    fn on_scripts_changed(&self) -> watch::Receiver<ScriptList>;

    /// Re-read the backing definitions, returning the number of scripts
    async fn reload(&self) -> RelayResult<usize>;
}

/// Script source backed by a JSON file
pub struct PulseService {
    path: Option<PathBuf>,
    scripts: watch::Sender<ScriptList>,
}

impl PulseService {
    /// Service with a fixed in-memory list
    pub fn in_memory(scripts: Vec<PulseScript>) -> Self {
        let (scripts, _) = watch::channel(Arc::new(scripts));
        Self {
            path: None,
            scripts,
        }
    }

    /// Load scripts from `path`, falling back to the built-in default
    pub async fn load(path: impl Into<PathBuf>) -> RelayResult<Self> {
        let path = path.into();
        let scripts = read_scripts(&path).await?;
        info!(path = %path.display(), count = scripts.len(), "Pulse scripts loaded");
        let (scripts, _) = watch::channel(Arc::new(scripts));
        Ok(Self {
            path: Some(path),
            scripts,
        })
    }

    /// Swap the whole list and notify subscribers
    pub fn replace_scripts(&self, scripts: Vec<PulseScript>) {
        debug!(count = scripts.len(), "Replacing pulse scripts");
        self.scripts.send_replace(Arc::new(scripts));
    }
}

#[async_trait]
impl ScriptSource for PulseService {
    fn list_scripts(&self) -> ScriptList {
        self.scripts.borrow().clone()
    }

    fn on_scripts_changed(&self) -> watch::Receiver<ScriptList> {
        self.scripts.subscribe()
    }

    #[instrument(skip(self), level = "debug")]
    async fn reload(&self) -> RelayResult<usize> {
        let Some(path) = &self.path else {
            return Ok(self.list_scripts().len());
        };
        let scripts = read_scripts(path).await?;
        let count = scripts.len();
        self.replace_scripts(scripts);
        info!(path = %path.display(), count, "Pulse scripts reloaded");
        Ok(count)
    }
}

async fn read_scripts(path: &Path) -> RelayResult<Vec<PulseScript>> {
    if !path.exists() {
        warn!(path = %path.display(), "Pulse file not found, using built-in default");
        return Ok(vec![PulseScript::builtin_default()]);
    }

    let content = fs::read_to_string(path).await?;
    let raw: Vec<PulseScript> = serde_json::from_str(&content)
        .map_err(|e| config_invalid("pulse.path", format!("{}: {e}", path.display())))?;

    let scripts: Vec<PulseScript> = raw
        .into_iter()
        .filter(|script| match script.validate() {
            Ok(()) => true,
            Err(e) => {
                warn!(pulse_id = %script.id, error = %e, "Skipping invalid pulse script");
                false
            }
        })
        .collect();

    if scripts.is_empty() {
        warn!(path = %path.display(), "Pulse file has no usable scripts, using built-in default");
        return Ok(vec![PulseScript::builtin_default()]);
    }
    Ok(scripts)
}
