//! Utterance segmentation state machine with hysteresis and pre/post roll.
//!
//! Consumes one scored frame at a time:
//!
//! ```text
//! Idle -> Confirming -> Collecting -> EndConfirming -> Idle
//! ```
//!
//! Onset needs `speech_confirm_frames` consecutive speech frames. The end needs
//! `min_silence_frames` consecutive silent frames to start confirming plus
//! `end_buffer_frames` more to commit. The committed end boundary is the first
//! frame of the trailing silence, not the frame where confirmation completed.
//!
//! Pre-roll counts back from the frame that confirms onset, not from the first
//! speech frame. With two confirm frames and 31 frames of pre-roll the
//! utterance starts 31 frames before the confirming frame, so the first speech
//! frame is one of the 31 and only 30 frames of leading silence are kept.

use super::{CLASSIFIER_RATE, DEFAULT_FRAME_SAMPLES};
use crate::config::VoicePipelineConfig;
use std::collections::VecDeque;
use std::time::Duration;

/// Tuning for the segmenter. Counts are in frames.
#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    pub sample_rate: u32,
    pub frame_samples: usize,
    pub speech_threshold: f32,
    pub speech_confirm_frames: usize,
    pub pre_roll_frames: usize,
    pub min_silence_frames: usize,
    pub end_buffer_frames: usize,
    pub post_roll_frames: usize,
    pub max_speech_frames: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            sample_rate: CLASSIFIER_RATE,
            frame_samples: DEFAULT_FRAME_SAMPLES,
            speech_threshold: 0.6,
            speech_confirm_frames: 2,
            pre_roll_frames: 31,
            min_silence_frames: 8,
            end_buffer_frames: 10,
            post_roll_frames: 18,
            max_speech_frames: 5_625,
        }
    }
}

impl From<&VoicePipelineConfig> for SegmenterConfig {
    fn from(cfg: &VoicePipelineConfig) -> Self {
        let frame_ms = frame_duration_ms(cfg.sample_rate, cfg.frame_samples);
        Self {
            sample_rate: cfg.sample_rate,
            frame_samples: cfg.frame_samples,
            speech_threshold: cfg.vad_threshold,
            speech_confirm_frames: cfg.speech_confirm_frames,
            pre_roll_frames: (cfg.pre_roll_ms as f64 / frame_ms) as usize,
            min_silence_frames: cfg.min_silence_frames,
            end_buffer_frames: cfg.end_buffer_frames,
            post_roll_frames: cfg.post_roll_frames,
            max_speech_frames: ((cfg.max_speech_ms as f64 / frame_ms) as usize).max(1),
        }
    }
}

fn frame_duration_ms(sample_rate: u32, frame_samples: usize) -> f64 {
    frame_samples as f64 * 1000.0 / f64::from(sample_rate.max(1))
}

impl SegmenterConfig {
    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(frame_duration_ms(self.sample_rate, self.frame_samples) / 1000.0)
    }

    fn ring_capacity(&self) -> usize {
        self.pre_roll_frames
            + self.speech_confirm_frames
            + self.max_speech_frames
            + self.post_roll_frames
    }

    fn idle_retention(&self) -> usize {
        self.pre_roll_frames + self.speech_confirm_frames.max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmenterState {
    Idle,
    Confirming,
    Collecting,
    EndConfirming,
}

impl SegmenterState {
    pub fn label(self) -> &'static str {
        match self {
            SegmenterState::Idle => "idle",
            SegmenterState::Confirming => "confirming",
            SegmenterState::Collecting => "collecting",
            SegmenterState::EndConfirming => "end_confirming",
        }
    }
}

/// Why an utterance was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Silence,
    MaxDuration,
}

impl EndReason {
    pub fn label(self) -> &'static str {
        match self {
            EndReason::Silence => "vad_silence",
            EndReason::MaxDuration => "max_duration",
        }
    }
}

/// A finished speech segment. Indices are absolute frame counts since `reset`.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub frames: Vec<Vec<f32>>,
    pub start_index: u64,
    /// Exclusive end of the speech itself (first frame of trailing silence).
    pub end_index: u64,
    pub duration: Duration,
    pub reason: EndReason,
}

impl Utterance {
    pub fn samples(&self) -> Vec<f32> {
        self.frames.iter().flatten().copied().collect()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

#[derive(Debug, Clone)]
pub enum SegmentEvent {
    /// Onset confirmed on `frame_index`.
    SpeechStarted { frame_index: u64 },
    UtteranceComplete(Utterance),
}

/// Bounded run of recent frames addressed by absolute index.
struct FrameRing {
    frames: VecDeque<Vec<f32>>,
    first_index: u64,
    capacity: usize,
}

impl FrameRing {
    fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            first_index: 0,
            capacity: capacity.max(1),
        }
    }

    fn push(&mut self, frame: Vec<f32>) {
        self.frames.push_back(frame);
        while self.frames.len() > self.capacity {
            self.frames.pop_front();
            self.first_index += 1;
        }
    }

    fn oldest_index(&self) -> u64 {
        self.first_index
    }

    /// Keep at most the newest `keep` frames.
    fn retain_newest(&mut self, keep: usize) {
        while self.frames.len() > keep {
            self.frames.pop_front();
            self.first_index += 1;
        }
    }

    /// Move frames `[start, end)` out of the ring, discarding anything older.
    fn take_range(&mut self, start: u64, end: u64) -> Vec<Vec<f32>> {
        while self.first_index < start && !self.frames.is_empty() {
            self.frames.pop_front();
            self.first_index += 1;
        }
        let count = end.saturating_sub(self.first_index) as usize;
        let count = count.min(self.frames.len());
        self.first_index += count as u64;
        self.frames.drain(..count).collect()
    }

    fn clear(&mut self, next_index: u64) {
        self.frames.clear();
        self.first_index = next_index;
    }
}

pub struct Segmenter {
    cfg: SegmenterConfig,
    state: SegmenterState,
    ring: FrameRing,
    next_index: u64,
    consecutive_speech: usize,
    consecutive_silence: usize,
    start_index: u64,
    end_candidate: u64,
}

impl Segmenter {
    pub fn new(cfg: SegmenterConfig) -> Self {
        let ring = FrameRing::new(cfg.ring_capacity());
        Self {
            cfg,
            state: SegmenterState::Idle,
            ring,
            next_index: 0,
            consecutive_speech: 0,
            consecutive_silence: 0,
            start_index: 0,
            end_candidate: 0,
        }
    }

    pub fn config(&self) -> &SegmenterConfig {
        &self.cfg
    }

    pub fn state(&self) -> SegmenterState {
        self.state
    }

    /// Number of frames consumed since the last reset.
    pub fn frames_seen(&self) -> u64 {
        self.next_index
    }

    pub fn reset(&mut self) {
        self.state = SegmenterState::Idle;
        self.next_index = 0;
        self.ring.clear(0);
        self.consecutive_speech = 0;
        self.consecutive_silence = 0;
        self.start_index = 0;
        self.end_candidate = 0;
    }

    /// Feed one frame and its speech probability.
    pub fn push(&mut self, frame: Vec<f32>, probability: f32) -> Option<SegmentEvent> {
        let index = self.next_index;
        self.next_index += 1;
        self.ring.push(frame);

        let is_speech = probability >= self.cfg.speech_threshold;
        if is_speech {
            self.consecutive_speech += 1;
            self.consecutive_silence = 0;
        } else {
            self.consecutive_silence += 1;
            self.consecutive_speech = 0;
        }

        match self.state {
            SegmenterState::Idle | SegmenterState::Confirming => {
                if !is_speech {
                    self.state = SegmenterState::Idle;
                    self.ring.retain_newest(self.cfg.idle_retention());
                    return None;
                }
                if self.consecutive_speech < self.cfg.speech_confirm_frames {
                    self.state = SegmenterState::Confirming;
                    return None;
                }
                self.state = SegmenterState::Collecting;
                // Counted from the confirming frame; earlier onset frames fall inside.
                self.start_index = index
                    .saturating_sub(self.cfg.pre_roll_frames as u64)
                    .max(self.ring.oldest_index());
                Some(SegmentEvent::SpeechStarted { frame_index: index })
            }
            SegmenterState::Collecting => {
                if !is_speech && self.consecutive_silence >= self.cfg.min_silence_frames {
                    self.state = SegmenterState::EndConfirming;
                    self.end_candidate = index + 1 - self.consecutive_silence as u64;
                }
                self.check_max_duration(index)
            }
            SegmenterState::EndConfirming => {
                if is_speech {
                    self.state = SegmenterState::Collecting;
                    return self.check_max_duration(index);
                }
                let needed = self.cfg.min_silence_frames + self.cfg.end_buffer_frames;
                if self.consecutive_silence >= needed {
                    return Some(self.finish(self.end_candidate, EndReason::Silence));
                }
                self.check_max_duration(index)
            }
        }
    }

    fn check_max_duration(&mut self, index: u64) -> Option<SegmentEvent> {
        let collected = index + 1 - self.start_index;
        if collected >= self.cfg.max_speech_frames as u64 {
            return Some(self.finish(index + 1, EndReason::MaxDuration));
        }
        None
    }

    fn finish(&mut self, end_index: u64, reason: EndReason) -> SegmentEvent {
        let payload_end = (end_index + self.cfg.post_roll_frames as u64).min(self.next_index);
        let frames = self.ring.take_range(self.start_index, payload_end);
        let samples = frames.iter().map(Vec::len).sum::<usize>();
        let duration =
            Duration::from_secs_f64(samples as f64 / f64::from(self.cfg.sample_rate.max(1)));
        let utterance = Utterance {
            frames,
            start_index: self.start_index,
            end_index,
            duration,
            reason,
        };
        self.state = SegmenterState::Idle;
        self.consecutive_speech = 0;
        self.consecutive_silence = 0;
        self.ring.retain_newest(self.cfg.idle_retention());
        SegmentEvent::UtteranceComplete(utterance)
    }
}
