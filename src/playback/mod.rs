//! Streamed assistant audio playback with immediate stop and fade-out.
//!
//! `Player` keeps a FIFO of decoded chunks. A single worker thread owns the
//! output stream: it drains the FIFO in small blocks, applies the fade
//! envelope when a smooth stop was requested, and idles on a condvar when there
//! is nothing to play.


use crate::audio::{decode_pcm16_base64, OutputBackend, OutputStream, ASSISTANT_AUDIO_RATE};
use crate::config::{DEFAULT_FADE_OUT_MS, DEFAULT_PLAYBACK_DRAIN_TIMEOUT_MS};
use crate::error::PipelineError;
use crate::lock_or_recover;
use crate::pipeline::worker::WorkerHandle;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Device write granularity.
const BLOCK_MS: u64 = 20;
/// Silence played before the stream is closed so the device does not click.
const TAIL_SILENCE_MS: u64 = 20;
/// Shortest fade applied to samples not yet written.
const MIN_FADE_MS: u64 = 5;
/// Upper bound for every idle or back-pressure wait.
const IDLE_WAIT: Duration = Duration::from_millis(5);
/// Extra time after a fade during which late chunks are still accepted.
const FADE_GRACE: Duration = Duration::from_millis(50);
/// Join budget for `stop_immediately`.
const STOP_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Rate of the incoming PCM16 stream.
    pub sample_rate: u32,
    /// Fade used by `Player::stop_with_default_fade`.
    pub fade_duration: Duration,
    /// Upper bound on waiting for playback to finish after a turn.
    pub drain_timeout: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: ASSISTANT_AUDIO_RATE,
            fade_duration: Duration::from_millis(DEFAULT_FADE_OUT_MS),
            drain_timeout: Duration::from_millis(DEFAULT_PLAYBACK_DRAIN_TIMEOUT_MS),
        }
    }
}

/// `g(p) = max(0, 1 - p²)` where `p` is the elapsed share of the fade.
pub fn fade_gain(progress: f32) -> f32 {
    (1.0 - progress * progress).max(0.0)
}

#[derive(Debug, Clone, Copy)]
struct FadeRequest {
    duration: Duration,
    requested_at: Instant,
}

#[derive(Debug, Default)]
struct PlaybackState {
    queue: VecDeque<Vec<f32>>,
    /// Audio is being written or is still audible on the device.
    is_playing: bool,
    should_stop: bool,
    /// Set while a smooth interrupt is in progress.
    fade: Option<FadeRequest>,
    /// Samples held by the worker that the device has not accepted yet.
    pending_local: usize,
    device_backlog: usize,
}

impl PlaybackState {
    fn reset(&mut self) {
        self.queue.clear();
        self.is_playing = false;
        self.should_stop = false;
        self.fade = None;
        self.pending_local = 0;
        self.device_backlog = 0;
    }

    fn hard_stop_pending(&self) -> bool {
        self.should_stop && self.fade.is_none()
    }

    /// The requested fade window has elapsed; the worker stops writing.
    fn fade_window_closed(&self, now: Instant) -> bool {
        self.fade
            .is_some_and(|fade| now.saturating_duration_since(fade.requested_at) >= fade.duration)
    }

    fn fade_expired(&self, now: Instant) -> bool {
        self.fade.is_some_and(|fade| {
            now.saturating_duration_since(fade.requested_at) > fade.duration + FADE_GRACE
        })
    }

    /// No data during a hard stop; during a fade only inside the grace window.
    fn accepts_chunk(&self, now: Instant) -> bool {
        !self.hard_stop_pending() && !self.fade_expired(now)
    }
}

struct Shared {
    state: Mutex<PlaybackState>,
    wake: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PlaybackState> {
        lock_or_recover(&self.state, "playback_state")
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, PlaybackState>) -> MutexGuard<'a, PlaybackState> {
        match self.wake.wait_timeout(guard, IDLE_WAIT) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }
}

/// Plays streamed assistant audio through one output stream at a time.
pub struct Player {
    backend: Arc<dyn OutputBackend>,
    config: PlaybackConfig,
    shared: Arc<Shared>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl Player {
    pub fn new(backend: Arc<dyn OutputBackend>, config: PlaybackConfig) -> Self {
        Self {
            backend,
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(PlaybackState::default()),
                wake: Condvar::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.config
    }

    /// Decode one base64 PCM16 chunk and queue it, starting the worker if needed.
    ///
    /// Returns `Ok(false)` when the chunk was refused because a stop is in
    /// progress.
    pub fn enqueue(&self, audio_b64: &str) -> Result<bool, PipelineError> {
        let samples = decode_pcm16_base64(audio_b64)?;
        if samples.is_empty() {
            return Ok(true);
        }
        {
            let mut state = self.shared.lock();
            if !state.accepts_chunk(Instant::now()) {
                tracing::debug!("playback stopping; chunk refused");
                return Ok(false);
            }
            state.queue.push_back(samples);
        }
        self.shared.wake.notify_all();
        self.ensure_worker()?;
        Ok(true)
    }

    fn ensure_worker(&self) -> Result<(), PipelineError> {
        let mut worker = lock_or_recover(&self.worker, "playback_worker");
        if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }
        if let Some(finished) = worker.take() {
            let _ = finished.join_timeout(STOP_JOIN_TIMEOUT);
        }
        let backend = Arc::clone(&self.backend);
        let shared = Arc::clone(&self.shared);
        let sample_rate = self.config.sample_rate;
        let handle = WorkerHandle::spawn("playback", move || {
            run_worker(backend.as_ref(), &shared, sample_rate)
        })
        .map_err(|err| PipelineError::Device(format!("spawn playback worker: {err}")))?;
        *worker = Some(handle);
        Ok(())
    }

    /// Stop now: drop queued audio, let the worker write a short silence and
    /// close the device. Safe to call repeatedly.
    pub fn stop_immediately(&self) {
        {
            let mut state = self.shared.lock();
            state.should_stop = true;
            state.fade = None;
            state.queue.clear();
        }
        self.shared.wake.notify_all();

        let handle = lock_or_recover(&self.worker, "playback_worker").take();
        if let Some(handle) = handle {
            if let Err(err) = handle.join_timeout(STOP_JOIN_TIMEOUT) {
                tracing::warn!(error = %err, "playback worker did not stop in time");
            }
        }
        self.shared.lock().reset();
    }

    /// Fade out whatever is queued over `duration`, then stop. Returns without
    /// waiting. Returns `false` when nothing was playing.
    pub fn stop_with_fade(&self, duration: Duration) -> bool {
        {
            let mut state = self.shared.lock();
            if state.hard_stop_pending() {
                return false;
            }
            let active = state.is_playing || !state.queue.is_empty() || state.pending_local > 0;
            if !active {
                return false;
            }
            if state.fade.is_none() {
                state.should_stop = true;
                state.fade = Some(FadeRequest {
                    duration,
                    requested_at: Instant::now(),
                });
            }
        }
        self.shared.wake.notify_all();
        true
    }

    pub fn stop_with_default_fade(&self) -> bool {
        self.stop_with_fade(self.config.fade_duration)
    }

    /// A hard stop or a fade is in progress.
    pub fn is_stopping(&self) -> bool {
        self.shared.lock().should_stop
    }

    pub fn is_playing(&self) -> bool {
        let state = self.shared.lock();
        state.is_playing || !state.queue.is_empty() || state.pending_local > 0
    }

    /// Nothing queued, nothing held by the worker and nothing left on the device.
    pub fn is_audio_complete(&self) -> bool {
        let state = self.shared.lock();
        state.queue.is_empty()
            && state.pending_local == 0
            && !state.is_playing
            && state.device_backlog == 0
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.stop_immediately();
    }
}

/// Per-sample fade bookkeeping in rendered samples.
struct FadeProgress {
    total: usize,
    done: usize,
}

impl FadeProgress {
    /// Spread the envelope over what is left of the window after the audio
    /// already on the device, so the last faded sample is heard when the
    /// window closes.
    fn within_window(
        request: FadeRequest,
        device_backlog: usize,
        sample_rate: u32,
        now: Instant,
    ) -> Self {
        let remaining = (request.requested_at + request.duration).saturating_duration_since(now);
        let window = (remaining.as_secs_f64() * f64::from(sample_rate)) as usize;
        let floor = (u64::from(sample_rate) * MIN_FADE_MS / 1000).max(1) as usize;
        Self {
            total: window.saturating_sub(device_backlog).max(floor),
            done: 0,
        }
    }

    fn apply(&mut self, block: &mut Vec<f32>) -> bool {
        let mut keep = block.len();
        for (idx, sample) in block.iter_mut().enumerate() {
            if self.done >= self.total {
                keep = idx;
                break;
            }
            *sample *= fade_gain(self.done as f32 / self.total as f32);
            self.done += 1;
        }
        block.truncate(keep);
        self.done >= self.total
    }
}

fn run_worker(backend: &dyn OutputBackend, shared: &Shared, sample_rate: u32) {
    let mut stream: Box<dyn OutputStream> = match backend.open_output(sample_rate) {
        Ok(stream) => stream,
        Err(err) => {
            tracing::error!(error = %err, "failed to open output stream");
            shared.lock().reset();
            return;
        }
    };
    tracing::debug!(device = %stream.device_name(), "playback worker started");

    let block_samples = (u64::from(sample_rate) * BLOCK_MS / 1000).max(1) as usize;
    let mut local: VecDeque<f32> = VecDeque::new();
    let mut out: Vec<f32> = Vec::with_capacity(block_samples);
    let mut fade: Option<FadeProgress> = None;
    let mut fade_finished = false;

    loop {
        if out.is_empty() {
            let mut state = shared.lock();
            if state.hard_stop_pending() {
                break;
            }
            while let Some(chunk) = state.queue.pop_front() {
                local.extend(chunk);
            }
            if fade.is_none() {
                if let Some(request) = state.fade {
                    fade = Some(FadeProgress::within_window(
                        request,
                        stream.buffered(),
                        sample_rate,
                        Instant::now(),
                    ));
                }
            }
            if local.is_empty() {
                if fade.is_some() {
                    // Queue drained before the fade elapsed.
                    state.pending_local = 0;
                    break;
                }
                let backlog = stream.buffered();
                state.device_backlog = backlog;
                state.is_playing = backlog > 0;
                state.pending_local = 0;
                drop(shared.wait(state));
                continue;
            }
            state.is_playing = true;
            let take = block_samples.min(local.len());
            out.extend(local.drain(..take));
            state.pending_local = local.len() + out.len();
            drop(state);

            if let Some(progress) = fade.as_mut() {
                fade_finished = progress.apply(&mut out);
            }
        } else {
            let state = shared.lock();
            if state.hard_stop_pending() || state.fade_window_closed(Instant::now()) {
                break;
            }
        }

        if !out.is_empty() {
            match stream.write(&out) {
                Ok(0) => {
                    // Device full; wait for the callback to drain it.
                    drop(shared.wait(shared.lock()));
                }
                Ok(accepted) => {
                    out.drain(..accepted.min(out.len()));
                    shared.lock().pending_local = local.len() + out.len();
                }
                Err(err) => {
                    tracing::warn!(error = %err, "output write failed");
                    break;
                }
            }
        }

        if fade_finished && out.is_empty() {
            break;
        }
    }

    let request = shared.lock().fade;
    match request {
        // Let the faded tail reach the speaker, but not past the fade window.
        Some(request) => drain_until(&*stream, request.requested_at + request.duration),
        None => stream.discard_buffered(),
    }
    let tail = Duration::from_millis(TAIL_SILENCE_MS);
    let silence = vec![0.0f32; (u64::from(sample_rate) * TAIL_SILENCE_MS / 1000) as usize];
    match stream.write(&silence) {
        Ok(accepted) if accepted > 0 => {
            drain_until(&*stream, Instant::now() + tail + IDLE_WAIT);
        }
        Ok(_) => {}
        Err(err) => tracing::debug!(error = %err, "tail silence not written"),
    }
    stream.close();

    let mut state = shared.lock();
    let faded = request.is_some();
    state.reset();
    drop(state);
    shared.wake.notify_all();
    tracing::debug!(faded, "playback worker stopped");
}

/// Wait for the device to play out its backlog, giving up at `deadline`.
fn drain_until(stream: &dyn OutputStream, deadline: Instant) {
    while stream.buffered() > 0 && Instant::now() < deadline {
        std::thread::sleep(IDLE_WAIT);
    }
}
