//! The three stages of a full-duplex voice conversation, front to back:
//! capture ("ears"), turn generation ("brain") and playback ("mouth").

mod capture;
mod generation;
mod playback;

pub use capture::{build_classifier, CaptureStage};
pub use generation::{GenerationConfig, GenerationStage};
pub use playback::PlaybackStage;

use crate::pipeline::{Pipeline, Stage};
use std::sync::Arc;

/// Wire the three stages into a pipeline. The handles stay usable for
/// inspection (meter, history, player state) after wiring.
pub fn voice_pipeline(
    ears: Arc<CaptureStage>,
    brain: Arc<GenerationStage>,
    mouth: Arc<PlaybackStage>,
) -> Pipeline {
    let stages: Vec<Arc<dyn Stage>> = vec![ears, brain, mouth];
    Pipeline::new(stages)
}
