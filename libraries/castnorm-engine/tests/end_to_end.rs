//! Two-pass normalisation through the native engine

use castnorm_engine::{MemorySink, MemorySource, NativeEngine, WavEncoding, WavSink, WavSource};
use castnorm_loudness::{
    AudioFormat, AudioSink, NormalisationConfig, NormaliseState, Normaliser,
};
use ebur128::{EbuR128, Mode};
use std::f32::consts::PI;

const RATE: u32 = 48000;

fn integrated(samples: &[f32], channels: u16) -> f64 {
    let mut meter = EbuR128::new(u32::from(channels), RATE, Mode::I).unwrap();
    meter.add_frames_f32(samples).unwrap();
    meter.loudness_global().unwrap()
}

/// Mono tone scaled to `target_lufs`
fn tone_at(target_lufs: f64, seconds: f32) -> Vec<f32> {
    let frames = (RATE as f32 * seconds) as usize;
    let unit: Vec<f32> = (0..frames)
        .map(|i| 0.25 * (2.0 * PI * 440.0 * i as f32 / RATE as f32).sin())
        .collect();
    let gain = 10f64.powf((target_lufs - integrated(&unit, 1)) / 20.0) as f32;
    unit.into_iter().map(|s| s * gain).collect()
}

#[test]
fn test_tone_normalised_to_target() {
    let format = AudioFormat::new(RATE, 1);
    let mut source = MemorySource::new(format, tone_at(-18.0, 3.0));
    let mut sink = MemorySink::new();

    let mut normaliser = Normaliser::new(NativeEngine::new(), NormalisationConfig::default());
    let result = normaliser.normalise(&mut source, &mut sink, None).unwrap();

    assert_eq!(normaliser.state(), NormaliseState::Done);
    assert!(!result.skipped);
    assert!((result.input_i - (-18.0)).abs() < 0.1, "{}", result.input_i);
    assert!(result.within_target, "{:?}", result);
    assert!(result.gain_check.unwrap().needed);
    assert!(!result.limiter.needed);

    assert!(sink.is_committed());
    assert_eq!(sink.samples().len(), 3 * RATE as usize);
    assert!((integrated(&sink.samples(), 1) - (-16.0)).abs() < 0.5);
}

#[test]
fn test_second_run_needs_no_gain() {
    let format = AudioFormat::new(RATE, 1);
    let config = NormalisationConfig::default();

    let mut first = MemorySink::new();
    Normaliser::new(NativeEngine::new(), config.clone())
        .normalise(
            &mut MemorySource::new(format, tone_at(-23.0, 3.0)),
            &mut first,
            None,
        )
        .unwrap();

    let mut second = MemorySink::new();
    let result = Normaliser::new(NativeEngine::new(), config)
        .normalise(
            &mut MemorySource::new(format, first.samples()),
            &mut second,
            None,
        )
        .unwrap();

    assert!(!result.gain_check.unwrap().needed, "{:?}", result.gain_check);
    assert!(result.within_target);
}

#[test]
fn test_spiky_input_engages_limiter() {
    let format = AudioFormat::new(RATE, 1);
    let mut samples = tone_at(-30.0, 6.0);
    // Two short clicks near full scale
    for start in [RATE as usize, 4 * RATE as usize] {
        for sample in &mut samples[start..start + 8] {
            *sample = 0.9;
        }
    }

    let mut config = NormalisationConfig::default();
    config.tolerance_lu = 1.0;
    let mut sink = MemorySink::new();
    let result = Normaliser::new(NativeEngine::new(), config)
        .normalise(&mut MemorySource::new(format, samples), &mut sink, None)
        .unwrap();

    assert!(result.limiter.needed);
    assert!(!result.limiter.clamped);
    assert!(result.limiter_params.is_some());
    assert!(result.within_target, "{:?}", result);
    assert!(result.output_tp < 0.0, "output peak {}", result.output_tp);
}

#[test]
fn test_output_format_conversion() {
    let format = AudioFormat::new(RATE, 1);
    let mut config = NormalisationConfig::default();
    config.output.channels = Some(2);

    let mut sink = MemorySink::new();
    Normaliser::new(NativeEngine::new(), config)
        .normalise(
            &mut MemorySource::new(format, tone_at(-20.0, 2.0)),
            &mut sink,
            None,
        )
        .unwrap();

    assert_eq!(sink.format(), Some(AudioFormat::new(RATE, 2)));
    assert_eq!(sink.samples().len(), 2 * 2 * RATE as usize);
}

#[test]
fn test_wav_files_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("episode.wav");
    let output = dir.path().join("episode.normalised.wav");
    let format = AudioFormat::new(RATE, 1);

    let mut writer = WavSink::new(&input, WavEncoding::Pcm16);
    writer
        .write_frame(&castnorm_loudness::AudioFrame::new(format, tone_at(-20.0, 3.0)))
        .unwrap();
    writer.commit().unwrap();

    let mut source = WavSource::open(&input).unwrap();
    let mut sink = WavSink::new(&output, WavEncoding::Float32);
    let result = Normaliser::new(NativeEngine::new(), NormalisationConfig::default())
        .normalise(&mut source, &mut sink, None)
        .unwrap();
    assert!(result.within_target);

    // Re-measure the written file
    let mut check = MemorySink::new();
    let result = Normaliser::new(NativeEngine::new(), NormalisationConfig::default())
        .normalise(&mut WavSource::open(&output).unwrap(), &mut check, None)
        .unwrap();
    assert!((result.input_i - (-16.0)).abs() < 0.5, "{}", result.input_i);
}

#[test]
fn test_failed_run_keeps_existing_output() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out.wav");
    std::fs::write(&output, b"previous").unwrap();

    // Silence cannot be normalised
    let format = AudioFormat::new(RATE, 1);
    let mut sink = WavSink::new(&output, WavEncoding::Float32);
    let mut normaliser = Normaliser::new(NativeEngine::new(), NormalisationConfig::default());
    let result = normaliser.normalise(
        &mut MemorySource::new(format, vec![0.0; RATE as usize]),
        &mut sink,
        None,
    );

    assert!(result.is_err());
    assert_eq!(normaliser.state(), NormaliseState::Error);
    assert_eq!(std::fs::read(&output).unwrap(), b"previous");
}
