//! Device seams. Streams are opened inside the thread that uses them, since
//! cpal streams cannot move between threads on every platform.

use crate::error::PipelineError;
use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait};
use std::time::Duration;

/// One entry of `--list-input-devices`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputDeviceInfo {
    pub index: usize,
    pub name: String,
    pub channels: u16,
}

/// List microphones so the CLI can expose a human-friendly selector.
pub fn list_input_devices() -> Result<Vec<InputDeviceInfo>> {
    let host = cpal::default_host();
    let devices = host.input_devices().context("no input devices available")?;
    let mut infos = Vec::new();
    for (index, device) in devices.enumerate() {
        let Ok(name) = device.name() else {
            continue;
        };
        let channels = device
            .default_input_config()
            .map(|config| config.channels())
            .unwrap_or(0);
        infos.push(InputDeviceInfo {
            index,
            name,
            channels,
        });
    }
    Ok(infos)
}

/// An open capture stream yielding fixed-size mono frames.
pub trait InputStream {
    fn device_name(&self) -> String;

    /// Wait up to `timeout` for the next frame. `Ok(None)` means nothing arrived yet.
    fn read_frame(&mut self, timeout: Duration) -> Result<Option<Vec<f32>>, PipelineError>;
}

pub trait InputBackend: Send + Sync {
    /// Open a stream producing `frame_samples`-long frames at `sample_rate`.
    fn open_input(
        &self,
        sample_rate: u32,
        frame_samples: usize,
    ) -> Result<Box<dyn InputStream>, PipelineError>;
}

/// An open playback stream fed with mono samples at the rate it was opened with.
pub trait OutputStream {
    fn device_name(&self) -> String;

    /// Queue samples without blocking. Returns how many were accepted; `0`
    /// means the device buffer is full and the caller should retry.
    fn write(&mut self, samples: &[f32]) -> Result<usize, PipelineError>;

    /// Samples accepted but not yet rendered.
    fn buffered(&self) -> usize;

    /// Drop samples accepted but not yet rendered.
    fn discard_buffered(&mut self) {}

    /// Stop the device. Anything still buffered is dropped.
    fn close(&mut self);
}

pub trait OutputBackend: Send + Sync {
    fn open_output(&self, sample_rate: u32) -> Result<Box<dyn OutputStream>, PipelineError>;
}
