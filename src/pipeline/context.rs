use crate::lock_or_recover;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Pipeline-wide cancellation signal that blocking waits can park on.
#[derive(Debug, Default)]
pub struct CancelFlag {
    cancelled: AtomicBool,
    gate: Mutex<()>,
    wakeup: Condvar,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.cancelled.store(true, Ordering::Release);
        let _guard = lock_or_recover(&self.gate, "cancel_flag");
        self.wakeup.notify_all();
    }

    pub fn clear(&self) {
        self.cancelled.store(false, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Sleep for at most `timeout`, returning early (with `true`) once cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = lock_or_recover(&self.gate, "cancel_flag");
        if self.is_set() {
            return true;
        }
        let _ = self
            .wakeup
            .wait_timeout_while(guard, timeout, |_| !self.is_set());
        self.is_set()
    }
}

/// State shared by every stage of one pipeline.
///
/// `session_id` is a logical clock: anything tagged with an older value is
/// void. It only moves forward.
#[derive(Debug, Default)]
pub struct SessionContext {
    session_id: AtomicU64,
    run_floor: AtomicU64,
    cancel: CancelFlag,
    shared_state: Mutex<HashMap<String, String>>,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_session(&self) -> u64 {
        self.session_id.load(Ordering::Acquire)
    }

    /// Invalidate every in-flight turn. Returns the new session id.
    pub fn bump_session(&self) -> u64 {
        self.session_id.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn is_current(&self, session: u64) -> bool {
        self.current_session() == session
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_set()
    }

    pub(crate) fn cancel(&self) {
        self.cancel.set();
    }

    /// Prepare for a (re)start. After a stop the session moves forward, so
    /// work left over from the previous run is void in the new one.
    pub(crate) fn reset(&self) {
        if self.cancel.is_set() {
            let session = self.bump_session();
            self.run_floor.store(session, Ordering::Release);
        }
        self.cancel.clear();
    }

    /// True for sessions that belong to a run before the latest restart.
    pub fn predates_run(&self, session: u64) -> bool {
        session < self.run_floor.load(Ordering::Acquire)
    }

    pub fn set_shared(&self, key: impl Into<String>, value: impl Into<String>) {
        lock_or_recover(&self.shared_state, "shared_state").insert(key.into(), value.into());
    }

    pub fn shared(&self, key: &str) -> Option<String> {
        lock_or_recover(&self.shared_state, "shared_state")
            .get(key)
            .cloned()
    }
}
