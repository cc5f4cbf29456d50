//! Command-line parsing and validation helpers.

mod defaults;
mod validation;

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

pub use defaults::{
    default_vad_engine, DEFAULT_BARGE_IN_FADE_MS, DEFAULT_BASE_URL, DEFAULT_END_BUFFER_FRAMES,
    DEFAULT_FADE_OUT_MS, DEFAULT_FRAME_SAMPLES, DEFAULT_MAX_SPEECH_MS, DEFAULT_MIN_SILENCE_FRAMES,
    DEFAULT_MODEL, DEFAULT_OUTPUT_SAMPLE_RATE, DEFAULT_PLAYBACK_DRAIN_TIMEOUT_MS,
    DEFAULT_POST_ROLL_FRAMES, DEFAULT_PRE_ROLL_MS, DEFAULT_REQUEST_TIMEOUT_MS,
    DEFAULT_SAMPLE_RATE, DEFAULT_SPEECH_CONFIRM_FRAMES, DEFAULT_VAD_ENERGY_THRESHOLD_DB,
    DEFAULT_VAD_THRESHOLD, DEFAULT_VOICE,
};

/// CLI options for the voxduplex console. Validated values keep the pipeline in range.
#[derive(Debug, Parser, Clone)]
#[command(
    name = "voxduplex",
    about = "voxduplex full-duplex voice conversation",
    author,
    version
)]
pub struct AppConfig {
    /// API key for the conversational service
    #[arg(long = "api-key", env = "VOXDUPLEX_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Base URL of the OpenAI-compatible endpoint
    #[arg(long = "base-url", env = "VOXDUPLEX_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    /// Model name sent with every request
    #[arg(long, default_value = DEFAULT_MODEL)]
    pub model: String,

    /// Voice the model should answer with
    #[arg(long, default_value = DEFAULT_VOICE)]
    pub voice: String,

    /// Request timeout for the streaming call (milliseconds)
    #[arg(long = "request-timeout-ms", default_value_t = DEFAULT_REQUEST_TIMEOUT_MS)]
    pub request_timeout_ms: u64,

    /// Preferred audio input device name
    #[arg(long)]
    pub input_device: Option<String>,

    /// Preferred audio output device name
    #[arg(long)]
    pub output_device: Option<String>,

    /// Print detected audio input devices and exit
    #[arg(long = "list-input-devices", default_value_t = false)]
    pub list_input_devices: bool,

    /// Capture sample rate fed to the speech classifier (Hz)
    #[arg(long = "sample-rate", default_value_t = DEFAULT_SAMPLE_RATE)]
    pub sample_rate: u32,

    /// Samples per capture frame
    #[arg(long = "frame-samples", default_value_t = DEFAULT_FRAME_SAMPLES)]
    pub frame_samples: usize,

    /// Speech classifier implementation to use
    #[arg(long = "vad-engine", value_enum, default_value_t = default_vad_engine())]
    pub vad_engine: VadEngineKind,

    /// Speech probability at or above which a frame counts as speech. The
    /// earshot engine also picks its profile from it: >= 0.8 very aggressive,
    /// >= 0.6 aggressive, >= 0.4 low bitrate, otherwise quality
    #[arg(long = "vad-threshold", default_value_t = DEFAULT_VAD_THRESHOLD)]
    pub vad_threshold: f32,

    /// Level that scores 0.5 with the energy classifier (decibels)
    #[arg(
        long = "vad-energy-threshold-db",
        default_value_t = DEFAULT_VAD_ENERGY_THRESHOLD_DB,
        allow_negative_numbers = true
    )]
    pub vad_energy_threshold_db: f32,

    /// Silero ONNX model path (required for --vad-engine silero)
    #[arg(long = "silero-model-path")]
    pub silero_model_path: Option<PathBuf>,

    /// Consecutive speech frames required to confirm onset
    #[arg(long = "speech-confirm-frames", default_value_t = DEFAULT_SPEECH_CONFIRM_FRAMES)]
    pub speech_confirm_frames: usize,

    /// Audio kept ahead of the confirmed onset (milliseconds)
    #[arg(long = "pre-roll-ms", default_value_t = DEFAULT_PRE_ROLL_MS)]
    pub pre_roll_ms: u64,

    /// Consecutive silent frames before end confirmation starts
    #[arg(long = "min-silence-frames", default_value_t = DEFAULT_MIN_SILENCE_FRAMES)]
    pub min_silence_frames: usize,

    /// Further silent frames required to commit the end
    #[arg(long = "end-buffer-frames", default_value_t = DEFAULT_END_BUFFER_FRAMES)]
    pub end_buffer_frames: usize,

    /// Frames of trailing silence kept after the end boundary
    #[arg(long = "post-roll-frames", default_value_t = DEFAULT_POST_ROLL_FRAMES)]
    pub post_roll_frames: usize,

    /// Maximum utterance duration before a forced end (milliseconds)
    #[arg(long = "max-speech-ms", default_value_t = DEFAULT_MAX_SPEECH_MS)]
    pub max_speech_ms: u64,

    /// Sample rate of the assistant audio stream (Hz)
    #[arg(long = "output-sample-rate", default_value_t = DEFAULT_OUTPUT_SAMPLE_RATE)]
    pub output_sample_rate: u32,

    /// Fade-out applied on an explicit interrupt in fade mode (milliseconds)
    #[arg(long = "fade-out-ms", default_value_t = DEFAULT_FADE_OUT_MS)]
    pub fade_out_ms: u64,

    /// Fade-out applied when the user barges in, in fade mode (milliseconds)
    #[arg(long = "barge-in-fade-ms", default_value_t = DEFAULT_BARGE_IN_FADE_MS)]
    pub barge_in_fade_ms: u64,

    /// How playback stops when interrupted
    #[arg(long = "interrupt-mode", value_enum, default_value_t = InterruptMode::Hard)]
    pub interrupt_mode: InterruptMode,

    /// Upper bound on waiting for playback to drain after a turn (milliseconds)
    #[arg(
        long = "playback-drain-timeout-ms",
        default_value_t = DEFAULT_PLAYBACK_DRAIN_TIMEOUT_MS
    )]
    pub playback_drain_timeout_ms: u64,

    /// Save every utterance as a WAV file in this directory
    #[arg(long = "save-utterances", value_name = "DIR")]
    pub save_utterances: Option<PathBuf>,

    /// Print pipeline events as JSON lines on stdout
    #[arg(long = "json-events", default_value_t = false)]
    pub json_events: bool,

    /// Enable file logging (debug)
    #[arg(long = "logs", env = "VOXDUPLEX_LOGS", default_value_t = false)]
    pub logs: bool,

    /// Disable all file logging (overrides --logs and log env vars)
    #[arg(long = "no-logs", env = "VOXDUPLEX_NO_LOGS", default_value_t = false)]
    pub no_logs: bool,

    /// Allow logging transcript/content snippets (debug log only)
    #[arg(
        long = "log-content",
        env = "VOXDUPLEX_LOG_CONTENT",
        default_value_t = false
    )]
    pub log_content: bool,
}

/// Tunable parameters for capture, classification and segmentation.
#[derive(Debug, Clone)]
pub struct VoicePipelineConfig {
    pub sample_rate: u32,
    pub frame_samples: usize,
    pub vad_engine: VadEngineKind,
    pub vad_threshold: f32,
    pub vad_energy_threshold_db: f32,
    pub silero_model_path: Option<PathBuf>,
    pub speech_confirm_frames: usize,
    pub pre_roll_ms: u64,
    pub min_silence_frames: usize,
    pub end_buffer_frames: usize,
    pub post_roll_frames: usize,
    pub max_speech_ms: u64,
    pub save_utterances: Option<PathBuf>,
}

impl Default for VoicePipelineConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            frame_samples: DEFAULT_FRAME_SAMPLES,
            vad_engine: VadEngineKind::Energy,
            vad_threshold: DEFAULT_VAD_THRESHOLD,
            vad_energy_threshold_db: DEFAULT_VAD_ENERGY_THRESHOLD_DB,
            silero_model_path: None,
            speech_confirm_frames: DEFAULT_SPEECH_CONFIRM_FRAMES,
            pre_roll_ms: DEFAULT_PRE_ROLL_MS,
            min_silence_frames: DEFAULT_MIN_SILENCE_FRAMES,
            end_buffer_frames: DEFAULT_END_BUFFER_FRAMES,
            post_roll_frames: DEFAULT_POST_ROLL_FRAMES,
            max_speech_ms: DEFAULT_MAX_SPEECH_MS,
            save_utterances: None,
        }
    }
}

/// Available runtime-selectable speech classifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum VadEngineKind {
    Energy,
    Earshot,
    Silero,
}

impl VadEngineKind {
    pub fn label(self) -> &'static str {
        match self {
            VadEngineKind::Energy => "energy",
            VadEngineKind::Earshot => "earshot",
            VadEngineKind::Silero => "silero",
        }
    }
}

/// How playback is stopped on barge-in or interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum InterruptMode {
    Hard,
    Fade,
}

impl InterruptMode {
    pub fn label(self) -> &'static str {
        match self {
            InterruptMode::Hard => "hard",
            InterruptMode::Fade => "fade",
        }
    }
}
