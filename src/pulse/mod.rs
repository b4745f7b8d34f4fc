//! Pulse scripts and the waveform engine.

pub mod script;
pub mod service;
pub mod waveform;

pub use script::{PulseScript, PulseStep};
pub use service::{PulseService, ScriptSource};
pub use waveform::{compile, play, CompiledPulse};

/// Length of one frame in milliseconds
pub const PULSE_WINDOW_MS: u64 = 100;

/// Frame code used to fill wait steps in compiled output
pub const SILENT_FRAME: &str = "0000000000000000";
