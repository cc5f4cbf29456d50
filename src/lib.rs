pub mod audio;
pub mod bus;
pub mod config;
pub mod error;
mod lock;
pub mod pipeline;
pub mod playback;
pub mod service;
pub mod stages;
pub mod telemetry;
#[cfg(feature = "vad_earshot")]
pub mod vad_earshot;
#[cfg(feature = "silero")]
pub mod vad_silero;

pub(crate) use lock::lock_or_recover;
pub use pipeline::{Pipeline, PipelineEvent, TurnState};
