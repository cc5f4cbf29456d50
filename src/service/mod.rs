//! Remote conversational service boundary.
//!
//! A turn request carries the whole conversation history; the reply is a
//! blocking iterator of chunks that interleave text, transcript and base64
//! audio deltas. `omni::OmniClient` speaks the OpenAI-compatible streaming
//! chat-completions dialect over SSE.

pub mod omni;
mod sse;

use crate::audio::EncodedUtterance;
use crate::error::PipelineError;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

pub use omni::OmniClient;
pub use sse::{SseEvent, SseReader};

/// One history item sent with every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryEntry {
    UserAudio(EncodedUtterance),
    UserText(String),
    AssistantText(String),
}

impl HistoryEntry {
    pub fn role(&self) -> &'static str {
        match self {
            HistoryEntry::UserAudio(_) | HistoryEntry::UserText(_) => "user",
            HistoryEntry::AssistantText(_) => "assistant",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Audio,
}

/// Everything needed to open one streaming reply.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub history: Vec<HistoryEntry>,
    pub modalities: Vec<Modality>,
    /// Overrides the client's configured voice.
    pub voice: Option<String>,
    pub audio_format: String,
}

impl TurnRequest {
    pub fn new(history: Vec<HistoryEntry>) -> Self {
        Self {
            history,
            modalities: vec![Modality::Text, Modality::Audio],
            voice: None,
            audio_format: "wav".to_string(),
        }
    }
}

/// One streamed delta. Every field is optional; usage-only chunks carry just the id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseChunk {
    pub request_id: Option<String>,
    pub text: Option<String>,
    /// Base64 PCM16 LE mono at the assistant audio rate.
    pub audio_b64: Option<String>,
    pub transcript: Option<String>,
}

pub type ChunkStream = Box<dyn Iterator<Item = Result<ResponseChunk, PipelineError>> + Send>;

/// Opaque streaming request/response service.
pub trait ConversationService: Send + Sync {
    fn open_stream(&self, request: &TurnRequest) -> Result<ChunkStream, PipelineError>;
}

/// Connection settings for `OmniClient`.
#[derive(Clone)]
pub struct ServiceConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub voice: String,
    pub timeout: Duration,
}

impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("voice", &self.voice)
            .field("timeout", &self.timeout)
            .finish()
    }
}
