//! Playback stage ("mouth"): feeds streamed assistant audio to the `Player`.

use crate::bus::{ControlCommand, Frame, Payload, StopMode};
use crate::error::PipelineError;
use crate::lock_or_recover;
use crate::pipeline::{PipelineEvent, Stage, StageLink};
use crate::playback::Player;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// How often `EndOfTurn` re-checks whether the device has drained.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

pub struct PlaybackStage {
    player: Player,
    /// Held across the session check and enqueue, and across a stop, so a
    /// chunk admitted before a session bump cannot land after the stop.
    gate: Mutex<()>,
}

impl PlaybackStage {
    pub fn new(player: Player) -> Self {
        Self {
            player,
            gate: Mutex::new(()),
        }
    }

    pub fn player(&self) -> &Player {
        &self.player
    }

    fn stop(&self, mode: StopMode, link: &StageLink) {
        let _gate = lock_or_recover(&self.gate, "playback_gate");
        let dropped = link.queue().drain();
        let audible = self.player.is_playing() && !self.player.is_stopping();
        match mode {
            StopMode::Hard => self.player.stop_immediately(),
            StopMode::Fade { duration } => {
                self.player.stop_with_fade(duration);
            }
        }
        tracing::debug!(mode = mode.label(), dropped, audible, "playback stop");
        if audible {
            link.emit(PipelineEvent::PlaybackInterrupted);
        }
    }

    /// Wait for the turn's audio to leave the device, unless the turn is voided first.
    fn finish_turn(&self, session: u64, link: &StageLink) {
        let context = link.context();
        let deadline = Instant::now() + self.player.config().drain_timeout;
        while !self.player.is_audio_complete() {
            if !context.is_current(session) || context.is_cancelled() {
                tracing::debug!(session, "turn voided before playback drained");
                return;
            }
            if Instant::now() >= deadline {
                tracing::warn!(session, "playback did not drain in time");
                break;
            }
            context.cancel_flag().wait_timeout(DRAIN_POLL_INTERVAL);
        }
        if context.is_current(session) {
            link.emit(PipelineEvent::PlaybackFinished { session });
        }
    }
}

impl Stage for PlaybackStage {
    fn name(&self) -> &'static str {
        "playback"
    }

    fn process_frame(&self, frame: Frame, link: &StageLink) -> Result<(), PipelineError> {
        match frame.into_payload() {
            Payload::AssistantAudio(chunk) => {
                let _gate = lock_or_recover(&self.gate, "playback_gate");
                if link.context().is_cancelled() {
                    return Ok(());
                }
                if !link.context().is_current(chunk.session) {
                    return Err(PipelineError::StaleResponseDiscarded {
                        session: chunk.session,
                        request_id: chunk.request_id.unwrap_or_default(),
                    });
                }
                if !self.player.enqueue(&chunk.data_b64)? {
                    tracing::debug!(session = chunk.session, "chunk refused while stopping");
                }
                Ok(())
            }
            Payload::Control(ControlCommand::Stop(mode)) => {
                self.stop(mode, link);
                Ok(())
            }
            Payload::Control(ControlCommand::EndOfTurn { session }) => {
                self.finish_turn(session, link);
                Ok(())
            }
            Payload::Event(event) => {
                link.emit(event);
                Ok(())
            }
            other => {
                tracing::debug!(stage = "playback", payload = other.label(), "ignoring frame");
                Ok(())
            }
        }
    }

    fn on_stop(&self) {
        let _gate = lock_or_recover(&self.gate, "playback_gate");
        self.player.stop_immediately();
    }
}
