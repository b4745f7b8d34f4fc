//! Unit tests for script compilation and live playback

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::transport_closed;
use crate::pulse::waveform::wait_frames;
use crate::pulse::{compile, play, PulseScript, PulseStep, PULSE_WINDOW_MS, SILENT_FRAME};

fn frames(codes: &[&str]) -> PulseStep {
    PulseStep::Pulse(codes.iter().map(|c| c.to_string()).collect())
}

#[test]
fn test_wait_rounds_up() {
    assert_eq!(wait_frames(0), 0);
    assert_eq!(wait_frames(-250), 0);
    assert_eq!(wait_frames(1), 1);
    assert_eq!(wait_frames(100), 1);
    assert_eq!(wait_frames(101), 2);
    assert_eq!(wait_frames(150), 2);
    assert_eq!(wait_frames(1000), 10);
}

#[test]
fn test_empty_script_compiles_to_nothing() {
    let compiled = compile(&PulseScript::new("empty", "Empty", vec![]));
    assert!(compiled.is_empty());
    assert_eq!(compiled.duration_ms, 0);
}

#[test]
fn test_compile_mixes_frames_and_filler() {
    let script = PulseScript::new(
        "mix",
        "Mix",
        vec![
            frames(&["0A0A0A0A64646464", "0A0A0A0A32323232"]),
            PulseStep::Wait(250),
            frames(&["0A0A0A0A00000000"]),
            PulseStep::Wait(0),
            PulseStep::Wait(-10),
        ],
    );
    let before = script.clone();
    let compiled = compile(&script);

    assert_eq!(
        compiled.frames,
        vec![
            "0A0A0A0A64646464",
            "0A0A0A0A32323232",
            SILENT_FRAME,
            SILENT_FRAME,
            SILENT_FRAME,
            "0A0A0A0A00000000",
        ]
    );
    assert_eq!(compiled.duration_ms, 600);
    assert_eq!(script, before);
}

#[test]
fn test_duration_matches_frame_count() {
    let scripts = [
        vec![frames(&["0101010101010101"])],
        vec![PulseStep::Wait(99)],
        vec![PulseStep::Wait(1234), frames(&["0101010101010101"; 7])],
        vec![frames(&["0101010101010101"; 3]), PulseStep::Wait(-1), PulseStep::Wait(300)],
    ];
    for steps in scripts {
        let compiled = compile(&PulseScript::new("p", "p", steps));
        assert_eq!(compiled.duration_ms, PULSE_WINDOW_MS * compiled.frames.len() as u64);
    }
}

#[test]
fn test_builtin_default_is_valid() {
    let script = PulseScript::builtin_default();
    assert!(script.validate().is_ok());
    assert_eq!(compile(&script).frames, vec!["0A0A0A0A00000000"]);
}

#[tokio::test(start_paused = true)]
async fn test_play_paces_steps() {
    let script = PulseScript::new(
        "live",
        "Live",
        vec![
            frames(&["0101010101010101"; 3]),
            PulseStep::Wait(250),
            frames(&["0202020202020202"]),
        ],
    );
    let emitted = Arc::new(Mutex::new(Vec::new()));
    let start = tokio::time::Instant::now();

    let elapsed = play(&script, |step| {
        let emitted = Arc::clone(&emitted);
        async move {
            emitted.lock().unwrap().push((start.elapsed(), step.len()));
            Ok(())
        }
    })
    .await
    .unwrap();

    // 300ms of frames, 250ms pause, 100ms of frames; no filler is sent
    assert!((650..700).contains(&elapsed), "elapsed {elapsed}");
    let emitted = emitted.lock().unwrap().clone();
    assert_eq!(emitted.len(), 2);
    assert_eq!(emitted[0], (Duration::ZERO, 3));
    assert_eq!(emitted[1].1, 1);
    assert!(emitted[1].0 >= Duration::from_millis(550));
}

#[tokio::test(start_paused = true)]
async fn test_play_stops_on_emit_error() {
    let script = PulseScript::new(
        "fail",
        "Fail",
        vec![frames(&["0101010101010101"]), frames(&["0202020202020202"])],
    );
    let mut calls = 0;
    let result = play(&script, |_| {
        calls += 1;
        async { Err(transport_closed("gone")) }
    })
    .await;

    assert!(result.unwrap_err().is_transport_closed());
    assert_eq!(calls, 1);
}

#[tokio::test(start_paused = true)]
async fn test_play_empty_script() {
    let script = PulseScript::new("empty", "Empty", vec![]);
    let elapsed = play(&script, |_| async { Ok(()) }).await.unwrap();
    assert_eq!(elapsed, 0);
}
