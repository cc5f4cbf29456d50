//! Earshot-powered speech classifier implementing `SpeechClassifier`.

use crate::audio::{ClassifierState, SpeechClassifier, CLASSIFIER_RATE};
use crate::config::VoicePipelineConfig;
use crate::error::PipelineError;
use earshot::{VoiceActivityDetector, VoiceActivityProfile};

/// Earshot consumes 10 ms blocks at 16 kHz.
const EARSHOT_BLOCK_SAMPLES: usize = 160;

/// Thin wrapper that adapts `earshot` to the crate's `SpeechClassifier` trait.
///
/// Earshot only answers speech/non-speech per block, so a frame's probability is
/// the share of its blocks classified as speech.
pub struct EarshotClassifier {
    detector: VoiceActivityDetector,
    scratch: Vec<i16>,
}

impl EarshotClassifier {
    /// `vad_threshold` does double duty: it picks the earshot profile here and
    /// is still the cutoff the segmenter applies to the block share.
    pub fn from_config(cfg: &VoicePipelineConfig) -> Self {
        let (profile, label) = profile_for(cfg.vad_threshold);
        tracing::debug!(threshold = cfg.vad_threshold, profile = label, "earshot profile");
        Self {
            detector: VoiceActivityDetector::new(profile),
            scratch: Vec::with_capacity(EARSHOT_BLOCK_SAMPLES),
        }
    }
}

fn profile_for(threshold: f32) -> (VoiceActivityProfile, &'static str) {
    match threshold {
        t if t >= 0.8 => (VoiceActivityProfile::VERY_AGGRESSIVE, "very_aggressive"),
        t if t >= 0.6 => (VoiceActivityProfile::AGGRESSIVE, "aggressive"),
        t if t >= 0.4 => (VoiceActivityProfile::LBR, "lbr"),
        _ => (VoiceActivityProfile::QUALITY, "quality"),
    }
}

impl SpeechClassifier for EarshotClassifier {
    fn name(&self) -> &'static str {
        "earshot"
    }

    fn initial_state(&mut self) -> ClassifierState {
        self.detector.reset();
        ClassifierState::empty()
    }

    fn score(
        &mut self,
        frame: &[f32],
        state: ClassifierState,
        sample_rate: u32,
    ) -> Result<(ClassifierState, f32), PipelineError> {
        if sample_rate != CLASSIFIER_RATE {
            return Err(PipelineError::Classifier(format!(
                "earshot needs {CLASSIFIER_RATE} Hz audio, got {sample_rate}"
            )));
        }
        if frame.is_empty() {
            return Err(PipelineError::Classifier("empty frame".to_string()));
        }

        let mut blocks = 0usize;
        let mut speech = 0usize;
        for block in frame.chunks(EARSHOT_BLOCK_SAMPLES) {
            self.scratch.clear();
            self.scratch.extend(
                block
                    .iter()
                    .map(|sample| (sample.clamp(-1.0, 1.0) * 32_767.0) as i16),
            );
            self.scratch.resize(EARSHOT_BLOCK_SAMPLES, 0);
            let is_speech = self
                .detector
                .predict_16khz(&self.scratch)
                .map_err(|err| PipelineError::Classifier(format!("earshot: {err:?}")))?;
            blocks += 1;
            if is_speech {
                speech += 1;
            }
        }
        Ok((state, speech as f32 / blocks as f32))
    }
}
