use super::VadEngineKind;

pub const DEFAULT_BASE_URL: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";
pub const DEFAULT_MODEL: &str = "qwen-omni-turbo";
pub const DEFAULT_VOICE: &str = "Chelsie";
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 60_000;

pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;
pub const DEFAULT_FRAME_SAMPLES: usize = 512;
pub const DEFAULT_VAD_THRESHOLD: f32 = 0.6;
pub const DEFAULT_VAD_ENERGY_THRESHOLD_DB: f32 = -40.0;
pub const DEFAULT_SPEECH_CONFIRM_FRAMES: usize = 2;
pub const DEFAULT_PRE_ROLL_MS: u64 = 1_000;
pub const DEFAULT_MIN_SILENCE_FRAMES: usize = 8;
pub const DEFAULT_END_BUFFER_FRAMES: usize = 10;
pub const DEFAULT_POST_ROLL_FRAMES: usize = 18;
pub const DEFAULT_MAX_SPEECH_MS: u64 = 180_000;

pub const DEFAULT_OUTPUT_SAMPLE_RATE: u32 = 24_000;
pub const DEFAULT_FADE_OUT_MS: u64 = 150;
pub const DEFAULT_BARGE_IN_FADE_MS: u64 = 100;
pub const DEFAULT_PLAYBACK_DRAIN_TIMEOUT_MS: u64 = 30_000;

pub(super) const MAX_PRE_ROLL_MS: u64 = 10_000;
pub(super) const MAX_SPEECH_HARD_LIMIT_MS: u64 = 600_000;
pub(super) const MAX_FRAME_COUNT: usize = 500;
pub(super) const MAX_FADE_MS: u64 = 5_000;
pub(super) const MAX_DEVICE_NAME_LEN: usize = 256;

pub const fn default_vad_engine() -> VadEngineKind {
    #[cfg(feature = "vad_earshot")]
    {
        VadEngineKind::Earshot
    }
    #[cfg(not(feature = "vad_earshot"))]
    {
        VadEngineKind::Energy
    }
}
