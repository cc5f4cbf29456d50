//! Turn generation stage ("brain").
//!
//! A queued `UtteranceReady` runs one turn on the stage worker: the utterance
//! joins the history, the whole history goes out as one streaming request,
//! and the reply is applied chunk by chunk. Barge-in, explicit interrupts and
//! a superseding utterance arrive `Immediate` on another thread; they void the
//! in-flight turn by bumping the session id, and the consuming loop notices
//! within one poll interval.

use crate::audio::EncodedUtterance;
use crate::bus::{AudioChunk, ControlCommand, Frame, FrameClass, Payload, StopMode};
use crate::error::PipelineError;
use crate::lock_or_recover;
use crate::pipeline::worker::WorkerHandle;
use crate::pipeline::{PipelineEvent, Stage, StageLink};
use crate::service::{ChunkStream, ConversationService, HistoryEntry, ResponseChunk, TurnRequest};
use crossbeam_channel::{bounded, RecvTimeoutError};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Upper bound on how long the consumer waits before re-checking staleness.
const CHUNK_POLL_INTERVAL: Duration = Duration::from_millis(50);
const CHUNK_CHANNEL_CAPACITY: usize = 64;
const COMPLETED_IDS_CAP: usize = 100;
const COMPLETED_IDS_RETAIN: usize = 50;
const READER_JOIN_TIMEOUT: Duration = Duration::from_millis(100);

/// How playback is silenced when a turn is voided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationConfig {
    /// Used when the user starts speaking over the assistant.
    pub barge_in_stop: StopMode,
    /// Used for an explicit `Pipeline::interrupt()`.
    pub interrupt_stop: StopMode,
    /// Allow assistant text in debug logs.
    pub log_content: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            barge_in_stop: StopMode::Hard,
            interrupt_stop: StopMode::Hard,
            log_content: false,
        }
    }
}

/// Request ids whose remaining chunks must be ignored. Bounded: once it
/// grows past the cap only the newest ids are kept.
#[derive(Debug, Default)]
pub(crate) struct CompletedRequests {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl CompletedRequests {
    pub(crate) fn insert(&mut self, id: &str) {
        if !self.ids.insert(id.to_string()) {
            return;
        }
        self.order.push_back(id.to_string());
        if self.order.len() > COMPLETED_IDS_CAP {
            while self.order.len() > COMPLETED_IDS_RETAIN {
                if let Some(oldest) = self.order.pop_front() {
                    self.ids.remove(&oldest);
                }
            }
        }
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TurnOutcome {
    /// `reply` is what goes into the history, if anything was said.
    Completed { reply: Option<String> },
    Interrupted,
    Failed(String),
}

/// Accumulated state of one streamed reply.
#[derive(Debug)]
pub(crate) struct Turn {
    pub(crate) session: u64,
    pub(crate) request_id: Option<String>,
    text: String,
    transcript: String,
    pub(crate) interrupted: bool,
    pub(crate) error: Option<String>,
}

impl Turn {
    pub(crate) fn new(session: u64) -> Self {
        Self {
            session,
            request_id: None,
            text: String::new(),
            transcript: String::new(),
            interrupted: false,
            error: None,
        }
    }

    /// Accumulate the chunk's text and transcript deltas. Returns the delta
    /// to show, transcript first.
    pub(crate) fn absorb(&mut self, chunk: &ResponseChunk) -> Option<String> {
        let text = chunk.text.as_deref().filter(|t| !t.is_empty());
        let transcript = chunk.transcript.as_deref().filter(|t| !t.is_empty());
        if let Some(text) = text {
            self.text.push_str(text);
        }
        if let Some(transcript) = transcript {
            self.transcript.push_str(transcript);
        }
        transcript.or(text).map(str::to_string)
    }

    /// Consume the turn. The transcript wins over the raw text.
    pub(crate) fn finish(self) -> TurnOutcome {
        if self.interrupted {
            return TurnOutcome::Interrupted;
        }
        if let Some(error) = self.error {
            return TurnOutcome::Failed(error);
        }
        let reply = [self.transcript, self.text]
            .into_iter()
            .find(|candidate| !candidate.trim().is_empty());
        TurnOutcome::Completed { reply }
    }
}

#[derive(Debug, Clone)]
struct InFlight {
    session: u64,
    request_id: Option<String>,
}

pub struct GenerationStage {
    service: Arc<dyn ConversationService>,
    config: GenerationConfig,
    history: Mutex<Vec<HistoryEntry>>,
    completed: Mutex<CompletedRequests>,
    in_flight: Mutex<Option<InFlight>>,
    is_generating: AtomicBool,
}

/// Clears the in-flight markers on every exit path of a turn.
struct GeneratingGuard<'a> {
    stage: &'a GenerationStage,
    session: u64,
}

impl<'a> GeneratingGuard<'a> {
    fn enter(stage: &'a GenerationStage, session: u64) -> Self {
        let mut in_flight = lock_or_recover(&stage.in_flight, "generation_in_flight");
        *in_flight = Some(InFlight {
            session,
            request_id: None,
        });
        stage.is_generating.store(true, Ordering::Release);
        drop(in_flight);
        Self { stage, session }
    }
}

impl Drop for GeneratingGuard<'_> {
    fn drop(&mut self) {
        self.stage.leave_turn(self.session);
    }
}

impl GenerationStage {
    pub fn new(service: Arc<dyn ConversationService>, config: GenerationConfig) -> Self {
        Self {
            service,
            config,
            history: Mutex::new(Vec::new()),
            completed: Mutex::new(CompletedRequests::default()),
            in_flight: Mutex::new(None),
            is_generating: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    /// Snapshot of the conversation so far.
    pub fn history(&self) -> Vec<HistoryEntry> {
        lock_or_recover(&self.history, "generation_history").clone()
    }

    pub fn is_generating(&self) -> bool {
        self.is_generating.load(Ordering::Acquire)
    }

    /// Clear the in-flight markers if they still belong to `session`. A turn
    /// left over from before a restart must not clear the markers of a newer one.
    fn leave_turn(&self, session: u64) {
        let mut in_flight = lock_or_recover(&self.in_flight, "generation_in_flight");
        if in_flight.as_ref().is_some_and(|turn| turn.session != session) {
            return;
        }
        in_flight.take();
        self.is_generating.store(false, Ordering::Release);
    }

    fn mark_completed(&self, request_id: &str) {
        lock_or_recover(&self.completed, "generation_completed").insert(request_id);
    }

    fn is_completed(&self, request_id: &str) -> bool {
        lock_or_recover(&self.completed, "generation_completed").contains(request_id)
    }

    /// Void the in-flight turn, drop queued work and silence playback.
    fn preempt(&self, stop: StopMode, link: &StageLink, reason: &'static str) {
        let context = link.context();
        let previous = context.current_session();
        let session = context.bump_session();
        let in_flight = lock_or_recover(&self.in_flight, "generation_in_flight").clone();
        if let Some(id) = in_flight.as_ref().and_then(|turn| turn.request_id.as_deref()) {
            self.mark_completed(id);
        }
        let dropped = link.queue().drain();
        tracing::info!(reason, session, dropped, stop = stop.label(), "preempting generation");
        if let Some(turn) = in_flight.filter(|turn| turn.session == previous) {
            link.emit(PipelineEvent::TurnInterrupted {
                session: turn.session,
            });
        }
        link.send_downstream(Frame::immediate(Payload::Control(ControlCommand::Stop(stop))));
    }

    fn run_turn(&self, utterance: EncodedUtterance, link: &StageLink) -> Result<(), PipelineError> {
        let request = {
            let mut history = lock_or_recover(&self.history, "generation_history");
            history.push(HistoryEntry::UserAudio(utterance));
            TurnRequest::new(history.clone())
        };
        let session = link.context().current_session();
        let _guard = GeneratingGuard::enter(self, session);
        link.emit(PipelineEvent::TurnStarted { session });
        tracing::info!(session, history = request.history.len(), "turn started");

        let mut turn = Turn::new(session);
        match self.service.open_stream(&request) {
            Ok(stream) => self.consume(stream, &mut turn, link),
            Err(err) => {
                tracing::warn!(session, error = %err, "failed to open response stream");
                turn.error = Some(err.to_string());
            }
        }
        self.complete(turn, link);
        Ok(())
    }

    /// Pull chunks through a reader thread so a blocked HTTP read never delays
    /// the staleness checks by more than one poll interval.
    fn consume(&self, stream: ChunkStream, turn: &mut Turn, link: &StageLink) {
        let (tx, rx) = bounded(CHUNK_CHANNEL_CAPACITY);
        let reader = match WorkerHandle::spawn("response-reader", move || {
            for item in stream {
                if tx.send(item).is_err() {
                    break;
                }
            }
        }) {
            Ok(reader) => reader,
            Err(err) => {
                turn.error = Some(format!("failed to spawn response reader: {err}"));
                return;
            }
        };

        loop {
            if self.discard_if_stale(turn, link) {
                break;
            }
            match rx.recv_timeout(CHUNK_POLL_INTERVAL) {
                Ok(Ok(chunk)) => {
                    if let Some(id) = chunk.request_id.as_deref() {
                        self.note_request_id(turn, id);
                    }
                    if self.discard_if_stale(turn, link) {
                        break;
                    }
                    self.apply_chunk(chunk, turn, link);
                }
                Ok(Err(err)) => {
                    tracing::warn!(session = turn.session, error = %err, "response stream failed");
                    turn.error = Some(err.to_string());
                    break;
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        drop(rx);

        if turn.interrupted || turn.error.is_some() {
            // The reader exits on its next send; a blocked read is not waited for.
            tracing::debug!(worker = reader.name(), "detaching response reader");
        } else if let Err(err) = reader.join_timeout(READER_JOIN_TIMEOUT) {
            tracing::debug!(error = %err, "response reader still running");
        }
    }

    fn note_request_id(&self, turn: &mut Turn, id: &str) {
        if turn.request_id.is_some() {
            return;
        }
        turn.request_id = Some(id.to_string());
        if let Some(current) = lock_or_recover(&self.in_flight, "generation_in_flight")
            .as_mut()
            .filter(|current| current.session == turn.session)
        {
            current.request_id = Some(id.to_string());
        }
    }

    /// True when the turn's session was superseded, its request completed,
    /// or the pipeline is shutting down.
    fn discard_if_stale(&self, turn: &mut Turn, link: &StageLink) -> bool {
        let context = link.context();
        let request_done = turn
            .request_id
            .as_deref()
            .is_some_and(|id| self.is_completed(id));
        let cancelled = context.is_cancelled();
        if context.is_current(turn.session) && !request_done && !cancelled {
            return false;
        }
        turn.interrupted = true;
        let stale = PipelineError::StaleResponseDiscarded {
            session: turn.session,
            request_id: turn.request_id.clone().unwrap_or_default(),
        };
        tracing::debug!(session = turn.session, outcome = stale.label(), "{stale}");
        if !cancelled && !context.predates_run(turn.session) {
            link.send_downstream(Frame::immediate(Payload::Control(ControlCommand::Stop(
                self.config.barge_in_stop,
            ))));
        }
        true
    }

    fn apply_chunk(&self, chunk: ResponseChunk, turn: &mut Turn, link: &StageLink) {
        if let Some(delta) = turn.absorb(&chunk) {
            if self.config.log_content {
                tracing::debug!(session = turn.session, text = %delta, "assistant text");
            }
            link.emit(PipelineEvent::AssistantText {
                session: turn.session,
                text: delta,
            });
        }
        if let Some(data_b64) = chunk.audio_b64.filter(|audio| !audio.is_empty()) {
            link.send_downstream(Frame::data(Payload::AssistantAudio(AudioChunk {
                session: turn.session,
                request_id: turn.request_id.clone(),
                data_b64,
            })));
        }
    }

    fn complete(&self, turn: Turn, link: &StageLink) {
        let session = turn.session;
        if let Some(id) = turn.request_id.as_deref() {
            self.mark_completed(id);
        }
        self.leave_turn(session);
        if link.context().predates_run(session) {
            tracing::info!(session, "dropping turn left over from before a restart");
            return;
        }
        match turn.finish() {
            TurnOutcome::Completed { reply } => {
                if let Some(reply) = reply {
                    lock_or_recover(&self.history, "generation_history")
                        .push(HistoryEntry::AssistantText(reply));
                }
                link.send_downstream(Frame::control(ControlCommand::EndOfTurn { session }));
                tracing::info!(session, "turn completed");
                link.emit(PipelineEvent::TurnEnded {
                    session,
                    interrupted: false,
                    error: None,
                });
            }
            TurnOutcome::Interrupted => {
                tracing::info!(session, "turn interrupted");
                link.emit(PipelineEvent::TurnEnded {
                    session,
                    interrupted: true,
                    error: None,
                });
            }
            TurnOutcome::Failed(error) => {
                if link.context().is_current(session) {
                    link.send_downstream(Frame::immediate(Payload::Control(ControlCommand::Stop(
                        self.config.interrupt_stop,
                    ))));
                }
                link.emit(PipelineEvent::TurnEnded {
                    session,
                    interrupted: false,
                    error: Some(error),
                });
            }
        }
    }
}

impl Stage for GenerationStage {
    fn name(&self) -> &'static str {
        "generation"
    }

    fn process_frame(&self, frame: Frame, link: &StageLink) -> Result<(), PipelineError> {
        if frame.is_immediate() && matches!(frame.payload(), Payload::UtteranceReady(_)) {
            if self.is_generating() {
                self.preempt(self.config.barge_in_stop, link, "superseded");
            }
            link.enqueue_self(frame.reclassify(FrameClass::Control));
            return Ok(());
        }

        match frame.into_payload() {
            Payload::UtteranceReady(utterance) => self.run_turn(utterance, link),
            Payload::Control(ControlCommand::BargeIn) => {
                self.preempt(self.config.barge_in_stop, link, "barge_in");
                Ok(())
            }
            Payload::Control(ControlCommand::Interrupt) => {
                self.preempt(self.config.interrupt_stop, link, "interrupt");
                Ok(())
            }
            Payload::Event(event) => {
                link.emit(event);
                Ok(())
            }
            other => {
                tracing::debug!(stage = "generation", payload = other.label(), "ignoring frame");
                Ok(())
            }
        }
    }

    /// A turn still blocked in the service is abandoned with its worker.
    fn on_stop(&self) {
        let mut in_flight = lock_or_recover(&self.in_flight, "generation_in_flight");
        in_flight.take();
        self.is_generating.store(false, Ordering::Release);
    }
}
