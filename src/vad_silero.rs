//! Silero VAD (ONNX) speech classifier.
//!
//! The model is a recurrent network: every call takes the previous `[2, 1, 128]`
//! state tensor and returns the next one alongside the speech probability. The
//! state lives in `ClassifierState` so the capture stage owns it between frames.

use crate::audio::{ClassifierState, SpeechClassifier};
use crate::error::PipelineError;
use ort::{
    execution_providers::CPUExecutionProvider,
    session::{Session, SessionOutputs},
    value::Tensor,
};
use std::path::Path;

const STATE_LEN: usize = 2 * 128;

fn ort_error(context: &str, err: impl std::fmt::Display) -> PipelineError {
    PipelineError::Classifier(format!("silero {context}: {err}"))
}

pub struct SileroClassifier {
    session: Session,
}

impl SileroClassifier {
    /// Load the ONNX model from disk on the CPU execution provider.
    pub fn load(model_path: &Path) -> Result<Self, PipelineError> {
        let session = Session::builder()
            .map_err(|err| ort_error("session builder", err))?
            .with_execution_providers([CPUExecutionProvider::default().build()])
            .map_err(|err| ort_error("execution provider", err))?
            .commit_from_file(model_path)
            .map_err(|err| ort_error("model load", err))?;
        tracing::info!(model = %model_path.display(), "silero model loaded");
        Ok(Self { session })
    }
}

impl SpeechClassifier for SileroClassifier {
    fn name(&self) -> &'static str {
        "silero"
    }

    fn initial_state(&mut self) -> ClassifierState {
        ClassifierState::new(vec![0.0; STATE_LEN])
    }

    fn score(
        &mut self,
        frame: &[f32],
        state: ClassifierState,
        sample_rate: u32,
    ) -> Result<(ClassifierState, f32), PipelineError> {
        if sample_rate != 8_000 && sample_rate != 16_000 {
            return Err(PipelineError::Classifier(format!(
                "silero supports 8000 or 16000 Hz, got {sample_rate}"
            )));
        }
        if frame.is_empty() {
            return Err(PipelineError::Classifier("empty frame".to_string()));
        }
        let mut values = state.into_values();
        if values.len() != STATE_LEN {
            values = vec![0.0; STATE_LEN];
        }

        let input = Tensor::from_array(([1, frame.len()], frame.to_vec()))
            .map_err(|err| ort_error("input tensor", err))?;
        let state_tensor = Tensor::from_array(([2, 1, 128], values))
            .map_err(|err| ort_error("state tensor", err))?;
        let sr = Tensor::from_array(([0usize; 0], vec![i64::from(sample_rate)]))
            .map_err(|err| ort_error("sample rate tensor", err))?;

        let outputs: SessionOutputs = self
            .session
            .run(ort::inputs![
                "input" => input,
                "state" => state_tensor,
                "sr" => sr,
            ])
            .map_err(|err| ort_error("inference", err))?;

        let (_, output) = outputs["output"]
            .try_extract_tensor::<f32>()
            .map_err(|err| ort_error("output", err))?;
        let probability = output.first().copied().unwrap_or(0.0).clamp(0.0, 1.0);
        let (_, next) = outputs["stateN"]
            .try_extract_tensor::<f32>()
            .map_err(|err| ort_error("state output", err))?;

        Ok((ClassifierState::new(next.to_vec()), probability))
    }
}
