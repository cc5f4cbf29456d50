//! Frame bus primitives shared by every pipeline stage.
//!
//! A `Frame` is the only thing that crosses a stage boundary. `Data` and
//! `Control` frames wait in the receiving stage's `FrameQueue`; `Immediate`
//! frames skip the queue and run in the sender's thread.

mod frame;
mod queue;

pub use frame::{AudioChunk, ControlCommand, Frame, FrameClass, Payload, StopMode};
pub use queue::FrameQueue;
