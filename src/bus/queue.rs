use super::Frame;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

/// Unbounded multi-producer FIFO owned by one stage.
///
/// Clones share the same queue, so producer threads can hold a handle.
#[derive(Clone)]
pub struct FrameQueue {
    sender: Sender<Frame>,
    receiver: Receiver<Frame>,
}

impl FrameQueue {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }

    /// Never blocks.
    pub fn enqueue(&self, frame: Frame) {
        // Both ends live in `self`, so the channel cannot be disconnected here.
        let _ = self.sender.send(frame);
    }

    /// Wait up to `timeout` for the next frame.
    pub fn dequeue_blocking(&self, timeout: Duration) -> Option<Frame> {
        match self.receiver.recv_timeout(timeout) {
            Ok(frame) => Some(frame),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_dequeue(&self) -> Option<Frame> {
        self.receiver.try_recv().ok()
    }

    /// Discard everything currently queued and return how many frames were dropped.
    pub fn drain(&self) -> usize {
        self.receiver.try_iter().count()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new()
    }
}
