//! Bidirectional chain of stages sharing one `SessionContext`.
//!
//! Every stage owns a `FrameQueue` and a worker thread that drains it. Frames
//! travel through `StageLink`: queued frames wait their turn, `Immediate`
//! frames run the neighbour's handler right away in the sender's thread.
//!
//! # Lock ordering
//!
//! Immediate dispatch only flows downstream. Stages report back upstream and
//! to the UI through the `EventHub`, never through a synchronous upstream call,
//! so a handler that holds its own lock can never be re-entered by a neighbour.

mod context;
mod events;
#[cfg(test)]
mod tests;
pub(crate) mod worker;

pub use context::{CancelFlag, SessionContext};
pub use events::{ChannelObserver, EventHub, PipelineEvent, StateObserver, StateTracker, TurnState};

use crate::bus::{ControlCommand, Frame, FrameQueue, Payload};
use crate::error::PipelineError;
use crate::lock_or_recover;
use crossbeam_channel::Receiver;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use worker::WorkerHandle;

/// How long a stage worker waits for a frame before re-checking its flags.
pub const STAGE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Join budget for a stage worker on `stop()`.
pub const DEFAULT_STAGE_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// One step of the chain.
///
/// Handlers take `&self`: a stage may be entered concurrently by its own
/// worker (queued frames) and by an upstream thread (`Immediate` frames), so
/// mutable state lives behind the stage's own locks or atomics.
pub trait Stage: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn process_frame(&self, frame: Frame, link: &StageLink) -> Result<(), PipelineError>;

    /// Called from `Pipeline::stop` after the queue was drained, before the
    /// worker is joined. Must not block for long.
    fn on_stop(&self) {}
}

/// A stage's view of its neighbours and of the shared context.
#[derive(Clone)]
pub struct StageLink {
    index: usize,
    chain: Weak<Chain>,
    queue: FrameQueue,
    context: Arc<SessionContext>,
    hub: Arc<EventHub>,
}

impl StageLink {
    pub fn send_downstream(&self, frame: Frame) {
        self.deliver(self.index + 1, frame);
    }

    pub fn send_upstream(&self, frame: Frame) {
        match self.index.checked_sub(1) {
            Some(target) => self.deliver(target, frame),
            None => self.deliver_to_hub(frame),
        }
    }

    /// Queue a frame for this stage's own worker.
    pub fn enqueue_self(&self, frame: Frame) {
        self.queue.enqueue(frame);
    }

    /// Handle to this stage's queue for producer threads.
    pub fn queue(&self) -> &FrameQueue {
        &self.queue
    }

    /// Report an event straight to the observer hub.
    pub fn emit(&self, event: PipelineEvent) {
        self.hub.publish(event);
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.context
    }

    pub fn index(&self) -> usize {
        self.index
    }

    fn deliver(&self, target: usize, frame: Frame) {
        let Some(chain) = self.chain.upgrade() else {
            return;
        };
        match chain.slots.get(target) {
            Some(slot) => slot.accept(frame),
            None => self.deliver_to_hub(frame),
        }
    }

    fn deliver_to_hub(&self, frame: Frame) {
        match frame.into_payload() {
            Payload::Event(event) => self.hub.publish(event),
            other => tracing::debug!(
                from = self.index,
                payload = other.label(),
                "frame left the pipeline; dropping"
            ),
        }
    }
}

struct StageSlot {
    stage: Arc<dyn Stage>,
    link: StageLink,
    accepting: AtomicBool,
    worker: Mutex<Option<StageWorker>>,
}

/// One run of a stage worker. The flag is fresh per start so a worker
/// abandoned by an earlier stop never sees it raised again.
struct StageWorker {
    handle: WorkerHandle,
    running: Arc<AtomicBool>,
}

impl StageSlot {
    fn accept(&self, frame: Frame) {
        if !self.accepting.load(Ordering::Acquire) {
            tracing::debug!(
                stage = self.stage.name(),
                payload = frame.payload().label(),
                "stage not running; dropping frame"
            );
            return;
        }
        if frame.is_immediate() {
            dispatch_frame(self.stage.as_ref(), frame, &self.link);
        } else {
            self.link.queue.enqueue(frame);
        }
    }

    fn start(&self) -> Result<(), PipelineError> {
        let mut worker = lock_or_recover(&self.worker, "stage_worker");
        if worker.is_some() {
            return Ok(());
        }
        let running = Arc::new(AtomicBool::new(true));
        let stage = self.stage.clone();
        let link = self.link.clone();
        let flag = running.clone();
        let handle = WorkerHandle::spawn(format!("stage-{}", self.stage.name()), move || {
            run_stage_loop(stage, link, flag)
        })
        .map_err(|err| PipelineError::Device(format!("failed to spawn stage worker: {err}")))?;
        self.accepting.store(true, Ordering::Release);
        *worker = Some(StageWorker { handle, running });
        Ok(())
    }

    fn stop(&self, join_timeout: Duration) {
        self.accepting.store(false, Ordering::Release);
        let worker = lock_or_recover(&self.worker, "stage_worker").take();
        if let Some(worker) = &worker {
            worker.running.store(false, Ordering::Release);
        }
        let dropped = self.link.queue.drain();
        if dropped > 0 {
            tracing::debug!(stage = self.stage.name(), dropped, "discarded queued frames on stop");
        }
        self.stage.on_stop();
        if let Some(StageWorker { handle, .. }) = worker {
            let name = handle.name().to_string();
            match handle.join_timeout(join_timeout) {
                Ok(()) => tracing::debug!(worker = %name, "stage worker stopped"),
                Err(err) => tracing::warn!(worker = %name, error = %err, "abandoning stage worker"),
            }
        }
    }
}

fn run_stage_loop(stage: Arc<dyn Stage>, link: StageLink, running: Arc<AtomicBool>) {
    tracing::debug!(stage = stage.name(), "stage worker started");
    while running.load(Ordering::Acquire) && !link.context.is_cancelled() {
        let Some(frame) = link.queue.dequeue_blocking(STAGE_POLL_INTERVAL) else {
            continue;
        };
        dispatch_frame(stage.as_ref(), frame, &link);
    }
    tracing::debug!(stage = stage.name(), "stage worker exiting");
}

/// Run one handler, containing errors and panics so the caller keeps going.
fn dispatch_frame(stage: &dyn Stage, frame: Frame, link: &StageLink) {
    let payload = frame.payload().label();
    let class = frame.class().label();
    match panic::catch_unwind(AssertUnwindSafe(|| stage.process_frame(frame, link))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) if err.is_stale() => {
            tracing::debug!(stage = stage.name(), payload, outcome = err.label(), "{err}");
        }
        Ok(Err(err)) => {
            tracing::warn!(stage = stage.name(), payload, class, error = %err, "stage handler failed");
        }
        Err(_) => {
            tracing::error!(stage = stage.name(), payload, class, "stage handler panicked");
        }
    }
}

struct Chain {
    slots: Vec<StageSlot>,
}

/// Owner of the stage chain, the session context and the observer hub.
pub struct Pipeline {
    chain: Arc<Chain>,
    context: Arc<SessionContext>,
    hub: Arc<EventHub>,
    started: AtomicBool,
    join_timeout: Duration,
}

impl Pipeline {
    /// Wire `stages` front to back. The first stage receives `Begin` on start.
    pub fn new(stages: Vec<Arc<dyn Stage>>) -> Self {
        let context = Arc::new(SessionContext::new());
        let hub = Arc::new(EventHub::new());
        let chain = Arc::new_cyclic(|weak: &Weak<Chain>| Chain {
            slots: stages
                .into_iter()
                .enumerate()
                .map(|(index, stage)| StageSlot {
                    stage,
                    link: StageLink {
                        index,
                        chain: weak.clone(),
                        queue: FrameQueue::new(),
                        context: context.clone(),
                        hub: hub.clone(),
                    },
                    accepting: AtomicBool::new(false),
                    worker: Mutex::new(None),
                })
                .collect(),
        });
        Self {
            chain,
            context,
            hub,
            started: AtomicBool::new(false),
            join_timeout: DEFAULT_STAGE_JOIN_TIMEOUT,
        }
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.context
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.chain.slots.iter().map(|slot| slot.stage.name()).collect()
    }

    pub fn add_observer<O>(&self, observer: O)
    where
        O: StateObserver + 'static,
    {
        self.hub.add_observer(Box::new(observer));
    }

    /// Raw event feed. Events are dropped for a subscriber whose channel is full.
    pub fn subscribe(&self, capacity: usize) -> Receiver<PipelineEvent> {
        self.hub.subscribe(capacity)
    }

    pub fn state(&self) -> TurnState {
        self.hub.state()
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Start every stage front to back and inject `Begin` into the first one.
    pub fn start(&self) -> Result<(), PipelineError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.context.reset();
        for (started, slot) in self.chain.slots.iter().enumerate() {
            if let Err(err) = slot.start() {
                for slot in self.chain.slots[..started].iter().rev() {
                    slot.stop(self.join_timeout);
                }
                self.started.store(false, Ordering::Release);
                return Err(err);
            }
        }
        tracing::info!(stages = ?self.stage_names(), "pipeline started");
        self.hub.set_state(TurnState::Listening);
        self.send(Frame::immediate(Payload::Control(ControlCommand::Begin)));
        Ok(())
    }

    /// Cancel in-flight work and stop stages back to front. Idempotent.
    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        self.context.cancel();
        for slot in self.chain.slots.iter().rev() {
            slot.stop(self.join_timeout);
        }
        self.hub.set_state(TurnState::Idle);
        tracing::info!("pipeline stopped");
    }

    /// Explicit user stop: cancel the current turn and silence playback.
    pub fn interrupt(&self) {
        self.send(Frame::immediate(Payload::Control(ControlCommand::Interrupt)));
    }

    /// Hand a frame to the first stage.
    pub fn send(&self, frame: Frame) {
        match self.chain.slots.first() {
            Some(slot) => slot.accept(frame),
            None => tracing::debug!("pipeline has no stages; dropping frame"),
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
