use crate::error::PipelineError;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A named background thread that signals completion so joins can be bounded.
pub(crate) struct WorkerHandle {
    name: String,
    handle: JoinHandle<()>,
    done: Receiver<()>,
}

struct DoneSignal(Sender<()>);

impl Drop for DoneSignal {
    fn drop(&mut self) {
        let _ = self.0.try_send(());
    }
}

impl WorkerHandle {
    pub(crate) fn spawn<F>(name: impl Into<String>, body: F) -> io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let (done_tx, done) = bounded(1);
        let handle = thread::Builder::new()
            .name(format!("voxduplex-{name}"))
            .spawn(move || {
                let _signal = DoneSignal(done_tx);
                body();
            })?;
        Ok(Self { name, handle, done })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Join, giving up after `timeout`. A worker that misses the deadline is
    /// detached and reported as `ShutdownTimeout`.
    pub(crate) fn join_timeout(self, timeout: Duration) -> Result<(), PipelineError> {
        if thread::current().id() == self.handle.thread().id() {
            // Stopping from inside the worker itself; it exits once its loop sees the flag.
            return Ok(());
        }
        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if self.handle.join().is_err() {
                    tracing::warn!(worker = %self.name, "worker thread panicked");
                }
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => Err(PipelineError::ShutdownTimeout {
                worker: self.name,
                waited_ms: timeout.as_millis() as u64,
            }),
        }
    }
}
