//! Observer boundary: pipeline events and the coarse turn-taking state.
//!
//! Stages publish `PipelineEvent`s to the `EventHub`. The hub folds them into a
//! `TurnState`, notifies observers on every distinct transition, and fans the
//! raw events out to subscribers.

use crate::lock_or_recover;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::Serialize;
use std::sync::Mutex;

/// Events emitted by the stages (serialized as newline-delimited JSON by the CLI).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// Speech onset confirmed.
    SpeechStarted { frame_index: u64 },
    /// Utterance finalized and handed to generation.
    SpeechEnded { frames: usize, duration_ms: u64 },
    /// Capture gave up after repeated device failures.
    CaptureFailed { message: String },
    /// A remote request was opened.
    TurnStarted { session: u64 },
    /// Streamed assistant text (transcript preferred).
    AssistantText { session: u64, text: String },
    /// The in-flight turn was superseded or interrupted.
    TurnInterrupted { session: u64 },
    /// A turn finished, normally or not.
    TurnEnded {
        session: u64,
        interrupted: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Audible playback was cut short.
    PlaybackInterrupted,
    /// All audio of the turn reached the device.
    PlaybackFinished { session: u64 },
}

/// Coarse state reported to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Idle,
    Listening,
    UserSpeaking,
    Speaking,
    Interrupted,
}

impl TurnState {
    pub fn label(self) -> &'static str {
        match self {
            TurnState::Idle => "idle",
            TurnState::Listening => "listening",
            TurnState::UserSpeaking => "user_speaking",
            TurnState::Speaking => "speaking",
            TurnState::Interrupted => "interrupted",
        }
    }
}

/// Folds events into `TurnState` transitions, suppressing repeats.
#[derive(Debug)]
pub struct StateTracker {
    current: TurnState,
}

impl StateTracker {
    pub fn new() -> Self {
        Self {
            current: TurnState::Idle,
        }
    }

    pub fn current(&self) -> TurnState {
        self.current
    }

    /// Force a state; returns it only if it differs from the current one.
    pub fn set(&mut self, state: TurnState) -> Option<TurnState> {
        if self.current == state {
            return None;
        }
        self.current = state;
        Some(state)
    }

    /// Apply an event and return the resulting transitions, in order.
    pub fn apply(&mut self, event: &PipelineEvent) -> Vec<TurnState> {
        let targets: &[TurnState] = match event {
            PipelineEvent::SpeechStarted { .. } => &[TurnState::UserSpeaking],
            PipelineEvent::SpeechEnded { .. } => &[TurnState::Listening],
            PipelineEvent::TurnStarted { .. } => &[TurnState::Speaking],
            PipelineEvent::TurnInterrupted { .. } | PipelineEvent::PlaybackInterrupted => {
                if self.current == TurnState::Speaking {
                    &[TurnState::Interrupted]
                } else {
                    &[]
                }
            }
            PipelineEvent::TurnEnded {
                interrupted, error, ..
            } if *interrupted || error.is_some() => {
                if matches!(self.current, TurnState::Speaking | TurnState::Interrupted) {
                    &[TurnState::Interrupted, TurnState::Listening]
                } else {
                    &[]
                }
            }
            PipelineEvent::PlaybackFinished { .. } => {
                if self.current == TurnState::Speaking {
                    &[TurnState::Listening]
                } else {
                    &[]
                }
            }
            PipelineEvent::TurnEnded { .. }
            | PipelineEvent::AssistantText { .. }
            | PipelineEvent::CaptureFailed { .. } => &[],
        };
        targets
            .iter()
            .filter_map(|state| self.set(*state))
            .collect()
    }
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Receives every distinct `TurnState` transition.
///
/// Called on the publishing stage's thread with the hub locked: implementations
/// must return quickly and must not call back into the pipeline.
pub trait StateObserver: Send {
    fn on_state(&mut self, state: TurnState);
}

impl<F> StateObserver for F
where
    F: FnMut(TurnState) + Send,
{
    fn on_state(&mut self, state: TurnState) {
        self(state)
    }
}

/// Observer that forwards transitions into a bounded channel.
pub struct ChannelObserver {
    sender: Sender<TurnState>,
}

impl ChannelObserver {
    pub fn new(capacity: usize) -> (Self, Receiver<TurnState>) {
        let (sender, receiver) = bounded(capacity.max(1));
        (Self { sender }, receiver)
    }
}

impl StateObserver for ChannelObserver {
    fn on_state(&mut self, state: TurnState) {
        if let Err(TrySendError::Full(state)) = self.sender.try_send(state) {
            tracing::debug!(state = state.label(), "state observer channel full; dropping");
        }
    }
}

struct HubInner {
    tracker: StateTracker,
    observers: Vec<Box<dyn StateObserver>>,
    subscribers: Vec<Sender<PipelineEvent>>,
}

/// Collects events from every stage and notifies the UI side.
pub struct EventHub {
    inner: Mutex<HubInner>,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HubInner {
                tracker: StateTracker::new(),
                observers: Vec::new(),
                subscribers: Vec::new(),
            }),
        }
    }

    pub fn add_observer(&self, observer: Box<dyn StateObserver>) {
        lock_or_recover(&self.inner, "event_hub").observers.push(observer);
    }

    pub fn subscribe(&self, capacity: usize) -> Receiver<PipelineEvent> {
        let (sender, receiver) = bounded(capacity.max(1));
        lock_or_recover(&self.inner, "event_hub")
            .subscribers
            .push(sender);
        receiver
    }

    pub fn state(&self) -> TurnState {
        lock_or_recover(&self.inner, "event_hub").tracker.current()
    }

    pub fn publish(&self, event: PipelineEvent) {
        tracing::debug!(?event, "pipeline event");
        let mut inner = lock_or_recover(&self.inner, "event_hub");
        let transitions = inner.tracker.apply(&event);
        inner.subscribers.retain(|sender| match sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!("event subscriber lagging; dropping event");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
        for state in transitions {
            notify(&mut inner.observers, state);
        }
    }

    pub fn set_state(&self, state: TurnState) {
        let mut inner = lock_or_recover(&self.inner, "event_hub");
        if let Some(state) = inner.tracker.set(state) {
            notify(&mut inner.observers, state);
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

fn notify(observers: &mut [Box<dyn StateObserver>], state: TurnState) {
    tracing::info!(state = state.label(), "turn state changed");
    for observer in observers.iter_mut() {
        observer.on_state(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn turn_ended(interrupted: bool) -> PipelineEvent {
        PipelineEvent::TurnEnded {
            session: 1,
            interrupted,
            error: None,
        }
    }

    #[test]
    fn barge_in_during_speech_reports_interrupted_then_user_speaking() {
        let mut tracker = StateTracker::new();
        tracker.set(TurnState::Listening);
        assert_eq!(
            tracker.apply(&PipelineEvent::TurnStarted { session: 1 }),
            vec![TurnState::Speaking]
        );
        assert_eq!(
            tracker.apply(&PipelineEvent::TurnInterrupted { session: 1 }),
            vec![TurnState::Interrupted]
        );
        assert_eq!(
            tracker.apply(&PipelineEvent::SpeechStarted { frame_index: 90 }),
            vec![TurnState::UserSpeaking]
        );
        assert!(tracker.apply(&turn_ended(true)).is_empty());
    }

    #[test]
    fn explicit_interrupt_returns_to_listening() {
        let mut tracker = StateTracker::new();
        tracker.set(TurnState::Speaking);
        assert_eq!(
            tracker.apply(&turn_ended(true)),
            vec![TurnState::Interrupted, TurnState::Listening]
        );
    }

    #[test]
    fn repeated_states_are_deduplicated() {
        let mut tracker = StateTracker::new();
        assert_eq!(
            tracker.apply(&PipelineEvent::SpeechStarted { frame_index: 1 }),
            vec![TurnState::UserSpeaking]
        );
        assert!(tracker
            .apply(&PipelineEvent::SpeechStarted { frame_index: 2 })
            .is_empty());
        assert!(tracker.set(TurnState::UserSpeaking).is_none());
    }

    #[test]
    fn playback_finished_only_leaves_speaking() {
        let mut tracker = StateTracker::new();
        tracker.set(TurnState::UserSpeaking);
        assert!(tracker
            .apply(&PipelineEvent::PlaybackFinished { session: 1 })
            .is_empty());
        tracker.set(TurnState::Speaking);
        assert!(tracker.apply(&turn_ended(false)).is_empty());
        assert_eq!(
            tracker.apply(&PipelineEvent::PlaybackFinished { session: 1 }),
            vec![TurnState::Listening]
        );
    }

    #[test]
    fn hub_notifies_observers_and_subscribers() {
        let hub = EventHub::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        hub.add_observer(Box::new(move |state: TurnState| {
            sink.lock().unwrap().push(state.label());
        }));
        let events = hub.subscribe(8);
        hub.set_state(TurnState::Listening);
        hub.publish(PipelineEvent::SpeechStarted { frame_index: 3 });
        hub.publish(PipelineEvent::SpeechStarted { frame_index: 4 });

        assert_eq!(*seen.lock().unwrap(), vec!["listening", "user_speaking"]);
        assert_eq!(events.try_iter().count(), 2);
        assert_eq!(hub.state(), TurnState::UserSpeaking);
    }

    #[test]
    fn events_serialize_with_event_tag() {
        let json = serde_json::to_string(&PipelineEvent::TurnEnded {
            session: 3,
            interrupted: true,
            error: None,
        })
        .unwrap();
        assert_eq!(json, r#"{"event":"turn_ended","session":3,"interrupted":true}"#);
    }
}
