//! Audio plumbing: devices, voice activity scoring, and utterance segmentation.
//!
//! Capture is normalized to 16 kHz mono f32 frames of a fixed size (512
//! samples, 32 ms) before it reaches the classifier. Assistant audio arrives as
//! 24 kHz PCM16 and is resampled to whatever the output device runs at.

/// Rate the speech classifier and the remote model expect for user audio.
pub const CLASSIFIER_RATE: u32 = 16_000;

/// Samples per capture frame at `CLASSIFIER_RATE`.
pub const DEFAULT_FRAME_SAMPLES: usize = 512;

/// Rate of the PCM16 audio streamed back by the model.
pub const ASSISTANT_AUDIO_RATE: u32 = 24_000;

mod codec;
mod device;
mod meter;
mod recorder;
mod resample;
mod segmenter;
mod speaker;
#[cfg(test)]
mod tests;
mod vad;

pub use codec::{decode_pcm16_base64, encode_wav, save_wav, EncodedUtterance};
pub use device::{
    list_input_devices, InputBackend, InputDeviceInfo, InputStream, OutputBackend, OutputStream,
};
pub use meter::LiveMeter;
pub use recorder::CpalInput;
pub use resample::resample;
pub use segmenter::{EndReason, SegmentEvent, Segmenter, SegmenterConfig, SegmenterState, Utterance};
pub use speaker::CpalOutput;
pub use vad::{ClassifierState, EnergyClassifier, SpeechClassifier};
