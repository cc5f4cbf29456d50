use super::codec::{decode_pcm16_base64, encode_wav, EncodedUtterance};
use super::recorder::{append_downmixed_samples, FrameDispatcher};
use super::resample::{
    adjust_frame_length, basic_resample, convert_frame_to_target, design_low_pass,
    downsampling_tap_count, low_pass_fir, resample, resample_linear,
};
use super::{
    ClassifierState, EnergyClassifier, EndReason, SegmentEvent, Segmenter, SegmenterConfig,
    SegmenterState, SpeechClassifier, Utterance, CLASSIFIER_RATE,
};
use crate::config::AppConfig;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::Parser;
use crossbeam_channel::bounded;
use std::f32::consts::PI;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const SPEECH: f32 = 0.9;
const SILENCE: f32 = 0.05;

fn frame(marker: f32) -> Vec<f32> {
    vec![marker; 4]
}

/// Feed `(count, probability)` runs and collect every event with its frame index.
fn drive(segmenter: &mut Segmenter, runs: &[(usize, f32)]) -> Vec<(u64, SegmentEvent)> {
    let mut events = Vec::new();
    for (count, probability) in runs {
        for _ in 0..*count {
            let index = segmenter.frames_seen();
            if let Some(event) = segmenter.push(frame(index as f32), *probability) {
                events.push((index, event));
            }
        }
    }
    events
}

fn utterances(events: &[(u64, SegmentEvent)]) -> Vec<Utterance> {
    events
        .iter()
        .filter_map(|(_, event)| match event {
            SegmentEvent::UtteranceComplete(utterance) => Some(utterance.clone()),
            SegmentEvent::SpeechStarted { .. } => None,
        })
        .collect()
}

#[test]
fn scenario_single_utterance_with_pre_and_post_roll() {
    let cfg = SegmenterConfig::default();
    let pre_roll = cfg.pre_roll_frames;
    let mut segmenter = Segmenter::new(cfg);
    let events = drive(&mut segmenter, &[(50, SILENCE), (5, SPEECH), (40, SILENCE)]);

    let starts: Vec<u64> = events
        .iter()
        .filter_map(|(_, event)| match event {
            SegmentEvent::SpeechStarted { frame_index } => Some(*frame_index),
            SegmentEvent::UtteranceComplete(_) => None,
        })
        .collect();
    assert_eq!(starts, vec![51]);

    let done = utterances(&events);
    assert_eq!(done.len(), 1);
    let utterance = &done[0];
    assert_eq!(utterance.reason, EndReason::Silence);
    assert_eq!(utterance.frame_count(), pre_roll + 4 + 18);
    assert_eq!(segmenter.state(), SegmenterState::Idle);
}

#[test]
fn pre_roll_covers_frames_before_confirmation() {
    let cfg = SegmenterConfig::default();
    let pre_roll = cfg.pre_roll_frames as u64;
    let mut segmenter = Segmenter::new(cfg);
    let events = drive(&mut segmenter, &[(60, SILENCE), (6, SPEECH), (30, SILENCE)]);
    let utterance = &utterances(&events)[0];

    // Confirmation is reached on frame 61 (second speech frame).
    assert_eq!(utterance.start_index, 61 - pre_roll);
    let first_marker = utterance.frames[0][0] as u64;
    assert_eq!(first_marker, 61 - pre_roll);
    let markers: Vec<u64> = utterance.frames.iter().map(|f| f[0] as u64).collect();
    for expected in (61 - pre_roll)..61 {
        assert!(markers.contains(&expected));
    }
    // The first speech frame (60) is part of the pre-roll, leaving one frame
    // less of leading silence than the pre-roll length.
    let leading_silence = markers.iter().take_while(|marker| **marker < 60).count();
    assert_eq!(leading_silence as u64, pre_roll - 1);
}

#[test]
fn end_boundary_is_first_frame_of_trailing_silence() {
    let mut segmenter = Segmenter::new(SegmenterConfig::default());
    let events = drive(&mut segmenter, &[(40, SILENCE), (10, SPEECH), (30, SILENCE)]);
    let done = utterances(&events);
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].end_index, 50);

    let finished_at = events
        .iter()
        .find_map(|(index, event)| match event {
            SegmentEvent::UtteranceComplete(_) => Some(*index),
            SegmentEvent::SpeechStarted { .. } => None,
        })
        .unwrap();
    assert_eq!(finished_at, 50 + 8 + 10 - 1);
}

#[test]
fn post_roll_is_configurable_and_trims_dead_air() {
    let cfg = SegmenterConfig {
        post_roll_frames: 3,
        pre_roll_frames: 5,
        ..SegmenterConfig::default()
    };
    let mut segmenter = Segmenter::new(cfg);
    let events = drive(&mut segmenter, &[(20, SILENCE), (6, SPEECH), (30, SILENCE)]);
    let utterance = &utterances(&events)[0];
    assert_eq!(utterance.start_index, 21 - 5);
    assert_eq!(utterance.end_index, 26);
    assert_eq!(utterance.frame_count(), (26 - 16) + 3);
    let last_marker = utterance.frames.last().unwrap()[0] as u64;
    assert_eq!(last_marker, 28);
}

#[test]
fn single_speech_frame_does_not_start_an_utterance() {
    let mut segmenter = Segmenter::new(SegmenterConfig::default());
    let events = drive(
        &mut segmenter,
        &[(10, SILENCE), (1, SPEECH), (10, SILENCE), (1, SPEECH), (40, SILENCE)],
    );
    assert!(events.is_empty());
    assert_eq!(segmenter.state(), SegmenterState::Idle);
}

#[test]
fn speech_during_end_confirmation_resumes_collecting() {
    let mut segmenter = Segmenter::new(SegmenterConfig::default());
    let events = drive(
        &mut segmenter,
        &[(35, SILENCE), (5, SPEECH), (12, SILENCE), (4, SPEECH), (30, SILENCE)],
    );
    let done = utterances(&events);
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].end_index, 35 + 5 + 12 + 4);
}

#[test]
fn max_duration_forces_an_end() {
    let cfg = SegmenterConfig {
        max_speech_frames: 40,
        ..SegmenterConfig::default()
    };
    let mut segmenter = Segmenter::new(cfg);
    let events = drive(&mut segmenter, &[(40, SILENCE), (100, SPEECH)]);
    let done = utterances(&events);
    assert!(!done.is_empty());
    assert_eq!(done[0].reason, EndReason::MaxDuration);
    assert_eq!(done[0].frame_count(), 40);
}

#[test]
fn reset_clears_progress() {
    let mut segmenter = Segmenter::new(SegmenterConfig::default());
    drive(&mut segmenter, &[(5, SILENCE), (3, SPEECH)]);
    assert_eq!(segmenter.state(), SegmenterState::Collecting);
    segmenter.reset();
    assert_eq!(segmenter.state(), SegmenterState::Idle);
    assert_eq!(segmenter.frames_seen(), 0);
}

#[test]
fn segmenter_config_from_pipeline_config_maps_fields() {
    let app = AppConfig::parse_from(["test-app"]);
    let cfg = SegmenterConfig::from(&app.voice_pipeline_config());
    assert_eq!(cfg.sample_rate, 16_000);
    assert_eq!(cfg.frame_samples, 512);
    assert_eq!(cfg.pre_roll_frames, 31);
    assert_eq!(cfg.speech_confirm_frames, 2);
    assert_eq!(cfg.min_silence_frames, 8);
    assert_eq!(cfg.end_buffer_frames, 10);
    assert_eq!(cfg.post_roll_frames, 18);
    assert_eq!(cfg.max_speech_frames, 5_625);
    assert!((cfg.speech_threshold - 0.6).abs() < f32::EPSILON);
}

#[test]
fn energy_classifier_scores_loud_frames_higher() {
    let mut classifier = EnergyClassifier::new(-40.0);
    let state = classifier.initial_state();
    let (state, quiet) = classifier
        .score(&[0.0005; 512], state, CLASSIFIER_RATE)
        .unwrap();
    let (_, loud) = classifier.score(&[0.3; 512], state, CLASSIFIER_RATE).unwrap();
    assert!(quiet < 0.1, "quiet={quiet}");
    assert!(loud > 0.9, "loud={loud}");
}

#[test]
fn energy_classifier_rejects_empty_frames() {
    let mut classifier = EnergyClassifier::new(-40.0);
    assert!(classifier
        .score(&[], ClassifierState::empty(), CLASSIFIER_RATE)
        .is_err());
}

#[test]
fn wav_encoding_produces_16_bit_mono() {
    let samples: Vec<f32> = (0..1600)
        .map(|n| (2.0 * PI * 440.0 * n as f32 / 16_000.0).sin() * 0.5)
        .collect();
    let wav = encode_wav(&samples, 16_000).unwrap();
    assert_eq!(&wav[..4], b"RIFF");
    assert_eq!(wav.len(), 44 + samples.len() * 2);

    let reader = hound::WavReader::new(std::io::Cursor::new(wav)).unwrap();
    let spec = reader.spec();
    assert_eq!(spec.channels, 1);
    assert_eq!(spec.sample_rate, 16_000);
    assert_eq!(spec.bits_per_sample, 16);
}

#[test]
fn encoded_utterance_exposes_data_url() {
    let wav = encode_wav(&[0.0; 16], 16_000).unwrap();
    let encoded = EncodedUtterance::from_wav(&wav, 16_000, 1, 0, 1, Default::default());
    assert!(encoded.data_url().starts_with("data:audio/wav;base64,UklGR"));
}

#[test]
fn pcm16_decoding_handles_extremes_and_odd_bytes() {
    let bytes = [0x00, 0x80, 0xff, 0x7f, 0x00, 0x00, 0x01];
    let samples = decode_pcm16_base64(&STANDARD.encode(bytes)).unwrap();
    assert_eq!(samples.len(), 3);
    assert_eq!(samples[0], -1.0);
    assert!((samples[1] - 0.99997).abs() < 1e-4);
    assert_eq!(samples[2], 0.0);
    assert!(decode_pcm16_base64("not base64!").is_err());
}

#[test]
fn downmixes_multi_channel_audio() {
    let mut buf = Vec::new();
    append_downmixed_samples(&mut buf, &[1.0f32, -1.0, 0.5, 0.5], 2, |sample| sample);
    assert_eq!(buf, vec![0.0, 0.5]);
}

#[test]
fn append_downmixed_samples_handles_partial_frame() {
    let mut buf = Vec::new();
    append_downmixed_samples(&mut buf, &[0.3f32, 0.3, 0.3, 0.9], 3, |sample| sample);
    assert_eq!(buf.len(), 2);
    assert!((buf[1] - 0.9).abs() < 1e-6);
}

#[test]
fn frame_dispatcher_emits_frames_and_tracks_drops() {
    let (tx, rx) = bounded::<Vec<f32>>(1);
    let dropped = Arc::new(AtomicUsize::new(0));
    let mut dispatcher = FrameDispatcher::new(2, tx, dropped.clone());

    dispatcher.push(&[1.0f32, 2.0, 3.0, 4.0], 1, |sample| sample);

    assert_eq!(rx.try_recv().expect("missing frame"), vec![1.0, 2.0]);
    assert_eq!(dropped.load(Ordering::Relaxed), 1);
}

#[test]
fn frame_dispatcher_accumulates_partial_frames() {
    let (tx, rx) = bounded::<Vec<f32>>(1);
    let dropped = Arc::new(AtomicUsize::new(0));
    let mut dispatcher = FrameDispatcher::new(3, tx, dropped);

    dispatcher.push(&[1.0f32, 2.0], 1, |sample| sample);
    assert!(rx.try_recv().is_err());

    dispatcher.push(&[3.0f32, 4.0], 1, |sample| sample);
    assert_eq!(rx.try_recv().expect("missing frame"), vec![1.0, 2.0, 3.0]);
}

#[test]
fn resample_returns_input_when_rates_match() {
    let input = vec![0.1f32, 0.2, 0.3];
    assert_eq!(resample(&input, 24_000, 24_000), input);
    assert!(resample(&[], 48_000, 16_000).is_empty());
}

#[test]
fn resample_passes_through_unsupported_rates() {
    let input = vec![0.1f32, 0.2, 0.3];
    assert_eq!(resample(&input, 1_000, 16_000), input);
    assert_eq!(basic_resample(&input, 48_000, 100), input);
}

#[test]
fn resample_scales_length_by_rate_ratio() {
    let input = vec![0.25f32; 2_400];
    let up = resample(&input, 24_000, 48_000);
    assert!((up.len() as i64 - 4_800).abs() <= 8, "len={}", up.len());
    let down = resample(&input, 48_000, 16_000);
    assert!((down.len() as i64 - 800).abs() <= 8, "len={}", down.len());
}

#[test]
fn basic_resample_downsamples_constant_signal() {
    let input = vec![0.5f32; 480];
    let output = basic_resample(&input, 48_000, 16_000);
    assert_eq!(output.len(), 160);
    let mid = output[80];
    assert!((mid - 0.5).abs() < 1e-3);
}

#[test]
fn resample_linear_interpolates_expected_values() {
    let output = resample_linear(&[0.0, 1.0], 2.0);
    assert_eq!(output, vec![0.0, 0.5, 1.0, 1.0]);
}

#[test]
fn downsampling_tap_count_is_odd_and_scaled() {
    let taps = downsampling_tap_count(48_000, 16_000);
    assert_eq!(taps % 2, 1);
    assert!(taps >= 11);
    assert!(downsampling_tap_count(1_600_000, 16_000) <= 129);
}

#[test]
fn design_low_pass_coeffs_are_normalized() {
    let coeffs = design_low_pass(0.2, 21);
    let sum: f32 = coeffs.iter().sum();
    assert!((sum - 1.0).abs() < 1e-4);
}

#[test]
fn low_pass_fir_preserves_dc_component() {
    let input = vec![1.0f32; 200];
    let output = low_pass_fir(&input, 48_000, 16_000, 21);
    assert!((output[100] - 1.0).abs() < 1e-3);
}

#[test]
fn adjust_frame_length_truncates_and_pads() {
    assert_eq!(adjust_frame_length(vec![0.1, 0.2, 0.3], 2), vec![0.1, 0.2]);
    assert_eq!(adjust_frame_length(vec![0.1, 0.2], 4), vec![0.1, 0.2, 0.2, 0.2]);
}

#[test]
fn convert_frame_to_target_produces_fixed_frames() {
    let frame = vec![0.2f32; 1_536];
    let converted = convert_frame_to_target(frame, 48_000, 16_000, 512);
    assert_eq!(converted.len(), 512);
    let same = convert_frame_to_target(vec![0.1; 500], 16_000, 16_000, 512);
    assert_eq!(same.len(), 512);
}
