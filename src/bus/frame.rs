use crate::audio::EncodedUtterance;
use crate::pipeline::PipelineEvent;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Delivery priority of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    /// Queued FIFO: audio and encoded payloads.
    Data,
    /// Queued FIFO: lifecycle commands that must keep their order relative to data.
    Control,
    /// Bypasses the queue and is handled synchronously by the receiving stage.
    Immediate,
}

impl FrameClass {
    pub fn label(self) -> &'static str {
        match self {
            FrameClass::Data => "data",
            FrameClass::Control => "control",
            FrameClass::Immediate => "immediate",
        }
    }
}

/// How the playback stage should silence itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    Hard,
    Fade { duration: Duration },
}

impl StopMode {
    pub fn label(self) -> &'static str {
        match self {
            StopMode::Hard => "hard",
            StopMode::Fade { .. } => "fade",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Synthetic start-of-stream signal injected by `Pipeline::start`.
    Begin,
    /// Speech onset confirmed by the capture stage.
    BargeIn,
    /// Explicit user stop request.
    Interrupt,
    /// Silence playback.
    Stop(StopMode),
    /// The turn tagged `session` has delivered all of its audio.
    EndOfTurn { session: u64 },
}

impl ControlCommand {
    pub fn label(&self) -> &'static str {
        match self {
            ControlCommand::Begin => "begin",
            ControlCommand::BargeIn => "barge_in",
            ControlCommand::Interrupt => "interrupt",
            ControlCommand::Stop(_) => "stop",
            ControlCommand::EndOfTurn { .. } => "end_of_turn",
        }
    }
}

/// One streamed piece of assistant audio (base64 PCM16 mono).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub session: u64,
    pub request_id: Option<String>,
    pub data_b64: String,
}

#[derive(Debug, Clone)]
pub enum Payload {
    Control(ControlCommand),
    /// One fixed-size mono frame at the classifier rate.
    CapturedAudio(Vec<f32>),
    UtteranceReady(EncodedUtterance),
    AssistantAudio(AudioChunk),
    Event(PipelineEvent),
}

impl Payload {
    pub fn label(&self) -> &'static str {
        match self {
            Payload::Control(command) => command.label(),
            Payload::CapturedAudio(_) => "captured_audio",
            Payload::UtteranceReady(_) => "utterance_ready",
            Payload::AssistantAudio(_) => "assistant_audio",
            Payload::Event(_) => "event",
        }
    }
}

/// Immutable message envelope. Ownership moves to the receiving stage.
#[derive(Debug, Clone)]
pub struct Frame {
    id: Uuid,
    class: FrameClass,
    payload: Payload,
    metadata: BTreeMap<String, String>,
    created_at: Instant,
}

impl Frame {
    pub fn new(class: FrameClass, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            class,
            payload,
            metadata: BTreeMap::new(),
            created_at: Instant::now(),
        }
    }

    pub fn data(payload: Payload) -> Self {
        Self::new(FrameClass::Data, payload)
    }

    pub fn control(command: ControlCommand) -> Self {
        Self::new(FrameClass::Control, Payload::Control(command))
    }

    pub fn immediate(payload: Payload) -> Self {
        Self::new(FrameClass::Immediate, payload)
    }

    pub fn event(event: PipelineEvent) -> Self {
        Self::new(FrameClass::Control, Payload::Event(event))
    }

    /// Attach a metadata entry while the frame is still being built.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Same frame (id, metadata, timestamp) delivered with a different priority.
    pub fn reclassify(self, class: FrameClass) -> Self {
        Self { class, ..self }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn class(&self) -> FrameClass {
        self.class
    }

    pub fn is_immediate(&self) -> bool {
        self.class == FrameClass::Immediate
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}
