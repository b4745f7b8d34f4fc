//! Compiles pulse scripts into frame bursts and plays them live.
//!
//! Two output modes exist. [`compile`] flattens a script into one burst,
//! padding waits with silent frames, so the whole pattern can be queued on
//! the device at once. [`play`] streams step by step and paces itself
//! against the clock instead.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::trace;

use super::{PulseScript, PulseStep, PULSE_WINDOW_MS, SILENT_FRAME};
use crate::error::RelayResult;

/// Flat frame sequence produced from a script
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledPulse {
    pub frames: Vec<String>,
    /// Always `PULSE_WINDOW_MS * frames.len()`
    pub duration_ms: u64,
}

impl CompiledPulse {
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Number of silent frames needed to cover a wait, rounded up
pub fn wait_frames(wait_ms: i64) -> u64 {
    if wait_ms <= 0 {
        return 0;
    }
    (wait_ms as u64).div_ceil(PULSE_WINDOW_MS)
}

pub fn compile(script: &PulseScript) -> CompiledPulse {
    let mut frames = Vec::new();

    for step in &script.script {
        match step {
            PulseStep::Pulse(step_frames) => frames.extend(step_frames.iter().cloned()),
            PulseStep::Wait(wait_ms) => {
                let count = wait_frames(*wait_ms) as usize;
                frames.extend(std::iter::repeat(SILENT_FRAME.to_string()).take(count));
            }
        }
    }

    let duration_ms = PULSE_WINDOW_MS * frames.len() as u64;
    CompiledPulse {
        frames,
        duration_ms,
    }
}

/// Stream a script through `emit`, one call per waveform step.
///
/// After each emission the remainder of the step's nominal duration is slept
/// off; waits are slept directly. Returns the elapsed time in milliseconds.
pub async fn play<F, Fut>(script: &PulseScript, mut emit: F) -> RelayResult<u64>
where
    F: FnMut(Vec<String>) -> Fut,
    Fut: Future<Output = RelayResult<()>>,
{
    let started = Instant::now();

    for step in &script.script {
        match step {
            PulseStep::Pulse(frames) => {
                let nominal = Duration::from_millis(PULSE_WINDOW_MS * frames.len() as u64);
                let step_start = Instant::now();
                emit(frames.clone()).await?;
                let cost = step_start.elapsed();
                if cost < nominal {
                    sleep(nominal - cost).await;
                }
            }
            PulseStep::Wait(wait_ms) if *wait_ms > 0 => {
                sleep(Duration::from_millis(*wait_ms as u64)).await;
            }
            PulseStep::Wait(_) => {}
        }
    }

    let elapsed = started.elapsed().as_millis() as u64;
    trace!(pulse_id = %script.id, elapsed_ms = elapsed, "Finished live pulse playback");
    Ok(elapsed)
}
