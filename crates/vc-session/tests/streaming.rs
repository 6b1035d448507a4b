mod common;

use std::sync::Arc;

use common::{max_step, rms, seam_steps, settings, sine, sine_slope, slot, CountingFactory};
use serde_json::json;
use vc_core::{ChunkHandler, ErrorCode, VcError};
use vc_session::{PassthroughFactory, SessionState, VoiceChangerManager, VoiceChangerSession};

const BLOCK: usize = 960;

fn zero_crossings(samples: &[f32]) -> usize {
    samples
        .windows(2)
        .filter(|w| (w[0] < 0.0) != (w[1] < 0.0))
        .count()
}

#[test]
fn sine_stream_stays_continuous_and_keeps_its_level() {
    let mut session = VoiceChangerSession::new(settings(0.02, 0.2, 0.1), Arc::new(PassthroughFactory));
    session.load_model(slot()).unwrap();
    assert_eq!(session.block_size(), BLOCK);

    let mut outputs = Vec::new();
    for k in 0..50 {
        let chunk = sine(440.0, 0.5, k * BLOCK, BLOCK);
        let out = session.process(&chunk).unwrap();
        assert_eq!(out.audio.len(), BLOCK);
        assert!(out.timing.contains_key("inference"));
        assert!(out.timing.contains_key("main-process"));
        outputs.push(out.audio);
    }
    assert_eq!(session.state(), SessionState::Streaming);

    let tail: Vec<f32> = outputs[25..].concat();
    // No step, at a seam or inside a chunk, may beat the sine's own slope.
    let limit = 1.05 * sine_slope(440.0, 0.5);
    let worst_seam = seam_steps(&outputs[25..]).into_iter().fold(0.0, f32::max);
    assert!(worst_seam <= limit, "seam discontinuity: {worst_seam} > {limit}");
    assert!(max_step(&tail) <= limit, "step {} > {limit}", max_step(&tail));

    let expected = 0.5 / 2.0_f32.sqrt();
    let level = rms(&tail);
    assert!(
        (level - expected).abs() < 0.05 * expected,
        "output level {level} vs {expected}"
    );

    // 25 chunks of 20 ms = 0.5 s = 220 periods.
    let crossings = zero_crossings(&tail);
    assert!((435..=445).contains(&crossings), "{crossings} zero crossings");
}

#[test]
fn silent_input_is_gated_but_pitch_state_advances() {
    let factory = Arc::new(CountingFactory::default());
    let mut session = VoiceChangerSession::new(settings(0.02, 0.05, 0.1), factory.clone());
    session.load_model(slot()).unwrap();

    for _ in 0..5 {
        let out = session.process(&[0.0; BLOCK]).unwrap();
        assert_eq!(out.audio, vec![0.0; BLOCK]);
        assert_eq!(out.volume, 0.0);
    }

    let calls = factory.calls.lock().unwrap();
    assert_eq!(calls.window_lens.len(), 5);
    assert_eq!(calls.pitch_marks, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    let layout = session.layout().unwrap();
    assert!(calls.window_lens.iter().all(|&n| n == layout.convert_size));
    assert!(calls.pitch_lens.iter().all(|&n| n == layout.feature_count + 1));
}

#[test]
fn full_scale_input_passes_once_the_volume_window_fills() {
    let mut config = settings(0.02, 0.05, 0.1);
    config.silent_threshold = -1.0;
    let mut session = VoiceChangerSession::new(config, Arc::new(PassthroughFactory));
    session.load_model(slot()).unwrap();

    // Volume window is 320 + 800 samples at 16 kHz, i.e. under four chunks.
    let mut last = None;
    for _ in 0..8 {
        last = Some(session.process(&[1.0; BLOCK]).unwrap());
    }
    let last = last.unwrap();
    assert!(last.volume > 0.99, "volume {}", last.volume);
    assert!(last.audio.iter().any(|&s| s != 0.0));
}

#[test]
fn chunks_of_the_wrong_length_are_refused() {
    let mut session = VoiceChangerSession::new(settings(0.02, 0.05, 0.1), Arc::new(PassthroughFactory));
    session.load_model(slot()).unwrap();
    let err = session.process(&[0.0; BLOCK * 2]).unwrap_err();
    assert!(matches!(err, VcError::ChunkSize { expected: BLOCK, .. }));
    assert!(session.process(&[0.0; BLOCK]).is_ok());
}

#[test]
fn short_synthesis_becomes_tagged_silence_and_the_stream_recovers() {
    let factory = Arc::new(CountingFactory::default());
    let manager = VoiceChangerManager::new(
        settings(0.02, 0.05, 0.1),
        factory.clone(),
        vec![slot()],
    );
    manager.select_slot(0).unwrap();

    let chunk = sine(220.0, 0.5, 0, BLOCK);
    factory
        .truncate_next
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let failed = manager.on_audio(&chunk);
    assert_eq!(failed.audio, vec![0.0; BLOCK]);
    assert_eq!(failed.error.unwrap().code, ErrorCode::Processing);

    let recovered = manager.on_audio(&sine(220.0, 0.5, BLOCK, BLOCK));
    assert!(recovered.error.is_none());
    assert_eq!(recovered.audio.len(), BLOCK);
}

#[test]
fn missing_pipeline_reports_not_initialized() {
    let factory = Arc::new(CountingFactory::failing());
    let manager = VoiceChangerManager::new(
        settings(0.02, 0.05, 0.1),
        factory.clone(),
        vec![slot()],
    );
    manager.select_slot(0).unwrap();
    assert_eq!(factory.created(), 1);
    assert_eq!(
        manager.with_session(|s| s.state()),
        SessionState::Ready
    );

    let response = manager.on_audio(&[0.1; BLOCK]);
    let error = response.error.unwrap();
    assert_eq!(error.code, ErrorCode::NotInitialized);
    assert_eq!(error.code.as_str(), "ERR_PIPELINE_NOT_INITIALIZED");
    assert_eq!(response.audio.len(), BLOCK);
}

#[test]
fn recorder_captures_input_and_output() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = settings(0.02, 0.05, 0.1);
    config.record_io = true;
    config.record_dir = dir.path().to_string_lossy().into_owned();

    let mut session = VoiceChangerSession::new(config, Arc::new(PassthroughFactory));
    session.load_model(slot()).unwrap();
    for k in 0..4 {
        session.process(&sine(330.0, 0.4, k * BLOCK, BLOCK)).unwrap();
    }
    assert!(session.apply_setting("recordIO", json!(false)).unwrap());

    let input = hound::WavReader::open(dir.path().join("in.wav")).unwrap();
    assert_eq!(input.spec().sample_rate, 48_000);
    assert_eq!(input.spec().bits_per_sample, 16);
    assert_eq!(input.len() as usize, 4 * BLOCK);
    let output = hound::WavReader::open(dir.path().join("out.wav")).unwrap();
    assert_eq!(output.len() as usize, 4 * BLOCK);
}
