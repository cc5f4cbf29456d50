use super::defaults::{
    MAX_DEVICE_NAME_LEN, MAX_FADE_MS, MAX_FRAME_COUNT, MAX_PRE_ROLL_MS, MAX_SPEECH_HARD_LIMIT_MS,
};
use super::{AppConfig, InterruptMode, VadEngineKind, VoicePipelineConfig};
use crate::bus::StopMode;
use crate::playback::PlaybackConfig;
use crate::service::ServiceConfig;
use crate::stages::GenerationConfig;
#[cfg(feature = "silero")]
use anyhow::Context;
use anyhow::{anyhow, bail, Result};
use clap::Parser;
use std::time::Duration;

impl AppConfig {
    /// Parse CLI arguments and validate them right away.
    pub fn parse_args() -> Result<Self> {
        let mut config = Self::parse();
        config.validate()?;
        Ok(config)
    }

    /// Check CLI values and normalize paths.
    pub fn validate(&mut self) -> Result<()> {
        if !(8_000..=48_000).contains(&self.sample_rate) {
            bail!(
                "--sample-rate must be between 8000 and 48000 Hz, got {}",
                self.sample_rate
            );
        }
        if !(80..=8_192).contains(&self.frame_samples) {
            bail!(
                "--frame-samples must be between 80 and 8192, got {}",
                self.frame_samples
            );
        }
        if !(0.0..=1.0).contains(&self.vad_threshold) {
            bail!(
                "--vad-threshold must be between 0.0 and 1.0, got {}",
                self.vad_threshold
            );
        }
        if !(-120.0..=0.0).contains(&self.vad_energy_threshold_db) {
            bail!(
                "--vad-energy-threshold-db must be between -120.0 and 0.0 dB, got {}",
                self.vad_energy_threshold_db
            );
        }
        if !(1..=MAX_FRAME_COUNT).contains(&self.speech_confirm_frames) {
            bail!(
                "--speech-confirm-frames must be between 1 and {MAX_FRAME_COUNT}, got {}",
                self.speech_confirm_frames
            );
        }
        if !(1..=MAX_FRAME_COUNT).contains(&self.min_silence_frames) {
            bail!(
                "--min-silence-frames must be between 1 and {MAX_FRAME_COUNT}, got {}",
                self.min_silence_frames
            );
        }
        if self.end_buffer_frames > MAX_FRAME_COUNT {
            bail!(
                "--end-buffer-frames must be at most {MAX_FRAME_COUNT}, got {}",
                self.end_buffer_frames
            );
        }
        // Post-roll can only contain frames received before the end is committed.
        let end_window = self.min_silence_frames + self.end_buffer_frames;
        if self.post_roll_frames > end_window {
            bail!(
                "--post-roll-frames ({}) cannot exceed --min-silence-frames + --end-buffer-frames ({end_window})",
                self.post_roll_frames
            );
        }
        if self.pre_roll_ms > MAX_PRE_ROLL_MS {
            bail!(
                "--pre-roll-ms must be at most {MAX_PRE_ROLL_MS} ms, got {}",
                self.pre_roll_ms
            );
        }
        let frame_ms = self.frame_samples as u64 * 1000 / u64::from(self.sample_rate);
        if self.max_speech_ms < frame_ms.max(1) || self.max_speech_ms > MAX_SPEECH_HARD_LIMIT_MS {
            bail!(
                "--max-speech-ms must be between one frame ({frame_ms} ms) and {MAX_SPEECH_HARD_LIMIT_MS} ms, got {}",
                self.max_speech_ms
            );
        }

        if !(8_000..=96_000).contains(&self.output_sample_rate) {
            bail!(
                "--output-sample-rate must be between 8000 and 96000 Hz, got {}",
                self.output_sample_rate
            );
        }
        if !(1..=MAX_FADE_MS).contains(&self.fade_out_ms) {
            bail!(
                "--fade-out-ms must be between 1 and {MAX_FADE_MS} ms, got {}",
                self.fade_out_ms
            );
        }
        if !(1..=MAX_FADE_MS).contains(&self.barge_in_fade_ms) {
            bail!(
                "--barge-in-fade-ms must be between 1 and {MAX_FADE_MS} ms, got {}",
                self.barge_in_fade_ms
            );
        }
        if !(100..=300_000).contains(&self.playback_drain_timeout_ms) {
            bail!(
                "--playback-drain-timeout-ms must be between 100 and 300000, got {}",
                self.playback_drain_timeout_ms
            );
        }
        if !(1_000..=600_000).contains(&self.request_timeout_ms) {
            bail!(
                "--request-timeout-ms must be between 1000 and 600000, got {}",
                self.request_timeout_ms
            );
        }

        let base_url = self.base_url.trim().trim_end_matches('/');
        if !(base_url.starts_with("https://") || base_url.starts_with("http://")) {
            bail!("--base-url must start with http:// or https://, got '{}'", self.base_url);
        }
        self.base_url = base_url.to_string();
        if self.model.trim().is_empty() {
            bail!("--model must not be empty");
        }
        if self.voice.trim().is_empty() {
            bail!("--voice must not be empty");
        }

        validate_device_name(self.input_device.as_deref(), "--input-device")?;
        validate_device_name(self.output_device.as_deref(), "--output-device")?;

        self.validate_vad_engine()?;

        if let Some(dir) = &self.save_utterances {
            if dir.exists() && !dir.is_dir() {
                bail!("--save-utterances '{}' is not a directory", dir.display());
            }
        }

        Ok(())
    }

    fn validate_vad_engine(&mut self) -> Result<()> {
        match self.vad_engine {
            VadEngineKind::Energy => {}
            VadEngineKind::Earshot => {
                #[cfg(not(feature = "vad_earshot"))]
                bail!("--vad-engine earshot requires building with the 'vad_earshot' feature");
                #[cfg(feature = "vad_earshot")]
                if self.sample_rate != 16_000 {
                    bail!(
                        "--vad-engine earshot requires --sample-rate 16000, got {}",
                        self.sample_rate
                    );
                }
            }
            VadEngineKind::Silero => {
                #[cfg(not(feature = "silero"))]
                bail!("--vad-engine silero requires building with the 'silero' feature");
                #[cfg(feature = "silero")]
                {
                    let expected = match self.sample_rate {
                        16_000 => 512,
                        8_000 => 256,
                        other => bail!(
                            "--vad-engine silero supports 8000 or 16000 Hz, got {other}"
                        ),
                    };
                    if self.frame_samples != expected {
                        bail!(
                            "--vad-engine silero needs --frame-samples {expected} at {} Hz",
                            self.sample_rate
                        );
                    }
                    let model = self
                        .silero_model_path
                        .as_ref()
                        .ok_or_else(|| anyhow!("--vad-engine silero requires --silero-model-path"))?;
                    let canonical = model.canonicalize().with_context(|| {
                        format!("failed to canonicalize silero model path '{}'", model.display())
                    })?;
                    self.silero_model_path = Some(canonical);
                }
            }
        }
        Ok(())
    }

    /// Snapshot the capture/VAD settings for the capture stage.
    pub fn voice_pipeline_config(&self) -> VoicePipelineConfig {
        VoicePipelineConfig {
            sample_rate: self.sample_rate,
            frame_samples: self.frame_samples,
            vad_engine: self.vad_engine,
            vad_threshold: self.vad_threshold,
            vad_energy_threshold_db: self.vad_energy_threshold_db,
            silero_model_path: self.silero_model_path.clone(),
            speech_confirm_frames: self.speech_confirm_frames,
            pre_roll_ms: self.pre_roll_ms,
            min_silence_frames: self.min_silence_frames,
            end_buffer_frames: self.end_buffer_frames,
            post_roll_frames: self.post_roll_frames,
            max_speech_ms: self.max_speech_ms,
            save_utterances: self.save_utterances.clone(),
        }
    }

    pub fn playback_config(&self) -> PlaybackConfig {
        PlaybackConfig {
            sample_rate: self.output_sample_rate,
            fade_duration: Duration::from_millis(self.fade_out_ms),
            drain_timeout: Duration::from_millis(self.playback_drain_timeout_ms),
        }
    }

    /// Stop modes used when the user barges in and when they interrupt explicitly.
    pub fn generation_config(&self) -> GenerationConfig {
        let (barge_in_stop, interrupt_stop) = match self.interrupt_mode {
            InterruptMode::Hard => (StopMode::Hard, StopMode::Hard),
            InterruptMode::Fade => (
                StopMode::Fade {
                    duration: Duration::from_millis(self.barge_in_fade_ms),
                },
                StopMode::Fade {
                    duration: Duration::from_millis(self.fade_out_ms),
                },
            ),
        };
        GenerationConfig {
            barge_in_stop,
            interrupt_stop,
            log_content: self.log_content,
        }
    }

    /// Service settings. Fails when no API key was supplied.
    pub fn service_config(&self) -> Result<ServiceConfig> {
        let api_key = self
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| anyhow!("an API key is required (--api-key or VOXDUPLEX_API_KEY)"))?;
        Ok(ServiceConfig {
            api_key: api_key.to_string(),
            base_url: self.base_url.clone(),
            model: self.model.clone(),
            voice: self.voice.clone(),
            timeout: Duration::from_millis(self.request_timeout_ms),
        })
    }
}

/// Device names are matched verbatim against cpal, so keep them short and printable.
pub(super) fn validate_device_name(name: Option<&str>, flag: &str) -> Result<()> {
    let Some(name) = name else {
        return Ok(());
    };
    if name.trim().is_empty() {
        bail!("{flag} must not be empty");
    }
    if name.len() > MAX_DEVICE_NAME_LEN || name.chars().any(char::is_control) {
        bail!("{flag} must be <={MAX_DEVICE_NAME_LEN} characters with no control characters");
    }
    Ok(())
}
