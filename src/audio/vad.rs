//! Speech classifiers scoring one frame at a time.
//!
//! A classifier is a stateful scoring function: it takes a frame and an opaque
//! state blob and returns the next blob plus a speech probability in `[0, 1]`.

use super::meter::rms_db;
use crate::error::PipelineError;

/// Opaque recurrent state carried between frames.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassifierState {
    values: Vec<f32>,
}

impl ClassifierState {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn into_values(self) -> Vec<f32> {
        self.values
    }
}

/// Voice-activity classifier used by the capture stage.
///
/// # Frame Size Contract
/// Frames are mono f32 at `sample_rate`, normally 512 samples at 16 kHz.
/// Implementations that need a different granularity split the frame
/// themselves.
pub trait SpeechClassifier: Send {
    fn name(&self) -> &'static str;

    /// Fresh state for a new capture stream. Also resets internal model state.
    fn initial_state(&mut self) -> ClassifierState;

    fn score(
        &mut self,
        frame: &[f32],
        state: ClassifierState,
        sample_rate: u32,
    ) -> Result<(ClassifierState, f32), PipelineError>;
}

/// Slope of the dB-to-probability curve (dB per logistic unit).
const ENERGY_SLOPE_DB: f32 = 3.0;

/// Lightweight fallback classifier that operates on RMS energy. Used when no
/// model-based classifier is available.
#[derive(Debug, Clone)]
pub struct EnergyClassifier {
    threshold_db: f32,
}

impl EnergyClassifier {
    /// `threshold_db` is the level that scores exactly 0.5.
    pub fn new(threshold_db: f32) -> Self {
        Self { threshold_db }
    }

    pub fn threshold_db(&self) -> f32 {
        self.threshold_db
    }
}

impl SpeechClassifier for EnergyClassifier {
    fn name(&self) -> &'static str {
        "energy"
    }

    fn initial_state(&mut self) -> ClassifierState {
        ClassifierState::empty()
    }

    fn score(
        &mut self,
        frame: &[f32],
        state: ClassifierState,
        _sample_rate: u32,
    ) -> Result<(ClassifierState, f32), PipelineError> {
        if frame.is_empty() {
            return Err(PipelineError::Classifier("empty frame".to_string()));
        }
        let db = rms_db(frame);
        let probability = 1.0 / (1.0 + (-(db - self.threshold_db) / ENERGY_SLOPE_DB).exp());
        Ok((state, probability))
    }
}
