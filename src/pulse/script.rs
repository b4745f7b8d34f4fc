use serde::{Deserialize, Serialize};

use crate::error::{config_invalid, RelayResult};

/// One step of a pulse script
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PulseStep {
    /// Frame codes, each covering one 100ms window
    Pulse(Vec<String>),
    /// Pause in milliseconds; zero or negative means no pause
    Wait(i64),
}

/// A named, reusable output pattern
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PulseScript {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub script: Vec<PulseStep>,
}

impl PulseScript {
    pub fn new(id: impl Into<String>, name: impl Into<String>, script: Vec<PulseStep>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            script,
        }
    }

    /// Fallback used when no script file is available
    pub fn builtin_default() -> Self {
        Self::new(
            "default",
            "Default",
            vec![PulseStep::Pulse(vec!["0A0A0A0A00000000".to_string()])],
        )
    }

    /// Check step shapes and frame codes
    pub fn validate(&self) -> RelayResult<()> {
        if self.id.is_empty() {
            return Err(config_invalid("pulse.id", "script id must not be empty"));
        }
        for (index, step) in self.script.iter().enumerate() {
            if let PulseStep::Pulse(frames) = step {
                if frames.is_empty() {
                    return Err(config_invalid(
                        &format!("pulse.{}.script[{}]", self.id, index),
                        "waveform step has no frames",
                    ));
                }
                if let Some(bad) = frames.iter().find(|frame| !is_frame_code(frame)) {
                    return Err(config_invalid(
                        &format!("pulse.{}.script[{}]", self.id, index),
                        format!("'{bad}' is not a 16 hex digit frame"),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// A frame is 16 hex digits: four frequency bytes then four intensity bytes
pub fn is_frame_code(frame: &str) -> bool {
    frame.len() == 16 && frame.bytes().all(|b| b.is_ascii_hexdigit())
}
