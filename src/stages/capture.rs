//! Capture stage ("ears"): microphone producer, per-frame classification and
//! utterance segmentation.
//!
//! The producer thread owns the input stream and only enqueues raw frames;
//! scoring and segmentation run on the stage worker. The instant speech onset
//! is confirmed an `Immediate` barge-in goes downstream so the assistant stops
//! talking before the utterance is even known.

use crate::audio::{
    encode_wav, save_wav, ClassifierState, EncodedUtterance, EnergyClassifier, InputBackend,
    InputStream, LiveMeter, SegmentEvent, Segmenter, SegmenterConfig, SpeechClassifier, Utterance,
};
use crate::bus::{ControlCommand, Frame, Payload};
use crate::config::{VadEngineKind, VoicePipelineConfig};
use crate::error::PipelineError;
use crate::lock_or_recover;
use crate::pipeline::worker::WorkerHandle;
use crate::pipeline::{PipelineEvent, Stage, StageLink};
use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const OPEN_ATTEMPTS: u32 = 3;
const MAX_CONSECUTIVE_READ_FAILURES: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const READ_TIMEOUT: Duration = Duration::from_millis(100);
const PRODUCER_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Build the classifier selected by `cfg.vad_engine`.
pub fn build_classifier(cfg: &VoicePipelineConfig) -> Result<Box<dyn SpeechClassifier>> {
    match cfg.vad_engine {
        VadEngineKind::Energy => Ok(Box::new(EnergyClassifier::new(cfg.vad_energy_threshold_db))),
        VadEngineKind::Earshot => earshot_classifier(cfg),
        VadEngineKind::Silero => silero_classifier(cfg),
    }
}

#[cfg(feature = "vad_earshot")]
fn earshot_classifier(cfg: &VoicePipelineConfig) -> Result<Box<dyn SpeechClassifier>> {
    Ok(Box::new(crate::vad_earshot::EarshotClassifier::from_config(cfg)))
}

#[cfg(not(feature = "vad_earshot"))]
fn earshot_classifier(_cfg: &VoicePipelineConfig) -> Result<Box<dyn SpeechClassifier>> {
    anyhow::bail!("earshot VAD requires the 'vad_earshot' feature")
}

#[cfg(feature = "silero")]
fn silero_classifier(cfg: &VoicePipelineConfig) -> Result<Box<dyn SpeechClassifier>> {
    use anyhow::Context;
    let path = cfg
        .silero_model_path
        .as_deref()
        .context("--silero-model-path is required for the silero VAD")?;
    Ok(Box::new(crate::vad_silero::SileroClassifier::load(path)?))
}

#[cfg(not(feature = "silero"))]
fn silero_classifier(_cfg: &VoicePipelineConfig) -> Result<Box<dyn SpeechClassifier>> {
    anyhow::bail!("silero VAD requires the 'silero' feature")
}

struct Detector {
    classifier: Box<dyn SpeechClassifier>,
    state: Option<ClassifierState>,
    segmenter: Segmenter,
}

impl Detector {
    /// Score one frame. A classifier error counts as silence.
    fn score(&mut self, frame: &[f32], sample_rate: u32) -> f32 {
        let state = match self.state.take() {
            Some(state) => state,
            None => self.classifier.initial_state(),
        };
        match self.classifier.score(frame, state.clone(), sample_rate) {
            Ok((next, probability)) => {
                self.state = Some(next);
                probability
            }
            Err(err) => {
                tracing::warn!(
                    classifier = self.classifier.name(),
                    outcome = err.label(),
                    error = %err,
                    "frame treated as silence"
                );
                self.state = Some(state);
                0.0
            }
        }
    }
}

struct Producer {
    handle: WorkerHandle,
    running: Arc<AtomicBool>,
}

pub struct CaptureStage {
    input: Arc<dyn InputBackend>,
    config: VoicePipelineConfig,
    detector: Mutex<Detector>,
    meter: LiveMeter,
    producer: Mutex<Option<Producer>>,
}

impl CaptureStage {
    pub fn new(
        input: Arc<dyn InputBackend>,
        classifier: Box<dyn SpeechClassifier>,
        config: VoicePipelineConfig,
    ) -> Self {
        let segmenter = Segmenter::new(SegmenterConfig::from(&config));
        Self {
            input,
            config,
            detector: Mutex::new(Detector {
                classifier,
                state: None,
                segmenter,
            }),
            meter: LiveMeter::new(),
            producer: Mutex::new(None),
        }
    }

    /// Live input level, shared with the UI.
    pub fn meter(&self) -> LiveMeter {
        self.meter.clone()
    }

    fn begin(&self, link: &StageLink) -> Result<(), PipelineError> {
        {
            let mut detector = lock_or_recover(&self.detector, "capture_detector");
            let fresh = detector.classifier.initial_state();
            detector.state = Some(fresh);
            detector.segmenter.reset();
        }
        self.meter.reset();
        self.start_producer(link)
    }

    fn start_producer(&self, link: &StageLink) -> Result<(), PipelineError> {
        let mut producer = lock_or_recover(&self.producer, "capture_producer");
        if producer
            .as_ref()
            .is_some_and(|producer| !producer.handle.is_finished())
        {
            return Ok(());
        }
        let running = Arc::new(AtomicBool::new(true));
        let input = Arc::clone(&self.input);
        let link = link.clone();
        let flag = Arc::clone(&running);
        let sample_rate = self.config.sample_rate;
        let frame_samples = self.config.frame_samples;
        let handle = WorkerHandle::spawn("capture", move || {
            run_producer(input.as_ref(), sample_rate, frame_samples, &link, &flag)
        })
        .map_err(|err| PipelineError::Device(format!("failed to spawn capture thread: {err}")))?;
        *producer = Some(Producer { handle, running });
        Ok(())
    }

    fn stop_producer(&self) {
        let producer = lock_or_recover(&self.producer, "capture_producer").take();
        let Some(producer) = producer else {
            return;
        };
        producer.running.store(false, Ordering::Release);
        if let Err(err) = producer.handle.join_timeout(PRODUCER_JOIN_TIMEOUT) {
            tracing::warn!(error = %err, "abandoning capture thread");
        }
    }

    fn on_audio(&self, samples: Vec<f32>, link: &StageLink) -> Result<(), PipelineError> {
        self.meter.record(&samples);
        let event = {
            let mut detector = lock_or_recover(&self.detector, "capture_detector");
            let probability = detector.score(&samples, self.config.sample_rate);
            detector.segmenter.push(samples, probability)
        };
        match event {
            None => Ok(()),
            Some(SegmentEvent::SpeechStarted { frame_index }) => {
                link.send_downstream(Frame::immediate(Payload::Control(ControlCommand::BargeIn)));
                link.emit(PipelineEvent::SpeechStarted { frame_index });
                Ok(())
            }
            Some(SegmentEvent::UtteranceComplete(utterance)) => self.finish_utterance(utterance, link),
        }
    }

    fn finish_utterance(&self, utterance: Utterance, link: &StageLink) -> Result<(), PipelineError> {
        let frames = utterance.frame_count();
        let duration_ms = utterance.duration.as_millis() as u64;
        tracing::info!(
            frames,
            duration_ms,
            start = utterance.start_index,
            end = utterance.end_index,
            reason = utterance.reason.label(),
            "utterance finalized"
        );
        link.emit(PipelineEvent::SpeechEnded {
            frames,
            duration_ms,
        });

        let sample_rate = self.config.sample_rate;
        let wav = encode_wav(&utterance.samples(), sample_rate)?;
        if let Some(dir) = self.config.save_utterances.as_deref() {
            match save_wav(dir, &wav) {
                Ok(path) => tracing::info!(path = %path.display(), "utterance saved"),
                Err(err) => tracing::warn!(error = %err, "failed to save utterance"),
            }
        }
        let encoded = EncodedUtterance::from_wav(
            &wav,
            sample_rate,
            frames,
            utterance.start_index,
            utterance.end_index,
            utterance.duration,
        );
        link.send_downstream(Frame::immediate(Payload::UtteranceReady(encoded)));
        Ok(())
    }
}

impl Stage for CaptureStage {
    fn name(&self) -> &'static str {
        "capture"
    }

    fn process_frame(&self, frame: Frame, link: &StageLink) -> Result<(), PipelineError> {
        let class = frame.class();
        match frame.into_payload() {
            Payload::CapturedAudio(samples) => self.on_audio(samples, link),
            Payload::Control(ControlCommand::Begin) => self.begin(link),
            Payload::Control(command @ ControlCommand::Interrupt) => {
                link.send_downstream(Frame::immediate(Payload::Control(command)));
                Ok(())
            }
            Payload::Event(event) => {
                link.emit(event);
                Ok(())
            }
            other => {
                tracing::debug!(
                    stage = "capture",
                    payload = other.label(),
                    class = class.label(),
                    "ignoring frame"
                );
                Ok(())
            }
        }
    }

    fn on_stop(&self) {
        self.stop_producer();
    }
}

fn run_producer(
    input: &dyn InputBackend,
    sample_rate: u32,
    frame_samples: usize,
    link: &StageLink,
    running: &AtomicBool,
) {
    let Some(mut stream) = open_with_retry(input, sample_rate, frame_samples, link, running) else {
        return;
    };
    tracing::info!(device = %stream.device_name(), "capture started");

    let mut failures = 0u32;
    let mut backoff = INITIAL_BACKOFF;
    while running.load(Ordering::Acquire) && !link.context().is_cancelled() {
        match stream.read_frame(READ_TIMEOUT) {
            Ok(Some(samples)) => {
                failures = 0;
                backoff = INITIAL_BACKOFF;
                link.enqueue_self(Frame::data(Payload::CapturedAudio(samples)));
            }
            Ok(None) => {}
            Err(err) => {
                failures += 1;
                tracing::warn!(failures, error = %err, "capture read failed");
                if failures >= MAX_CONSECUTIVE_READ_FAILURES {
                    link.emit(PipelineEvent::CaptureFailed {
                        message: err.to_string(),
                    });
                    break;
                }
                if link.context().cancel_flag().wait_timeout(backoff) {
                    break;
                }
                backoff *= 2;
            }
        }
    }
    tracing::info!("capture stopped");
}

fn open_with_retry(
    input: &dyn InputBackend,
    sample_rate: u32,
    frame_samples: usize,
    link: &StageLink,
    running: &AtomicBool,
) -> Option<Box<dyn InputStream>> {
    let mut backoff = INITIAL_BACKOFF;
    let mut attempt = 1;
    loop {
        match input.open_input(sample_rate, frame_samples) {
            Ok(stream) => return Some(stream),
            Err(err) if attempt >= OPEN_ATTEMPTS => {
                tracing::error!(attempt, error = %err, "giving up on input device");
                link.emit(PipelineEvent::CaptureFailed {
                    message: err.to_string(),
                });
                return None;
            }
            Err(err) => {
                tracing::warn!(attempt, error = %err, "failed to open input device; retrying");
            }
        }
        if link.context().cancel_flag().wait_timeout(backoff) || !running.load(Ordering::Acquire) {
            return None;
        }
        backoff *= 2;
        attempt += 1;
    }
}
