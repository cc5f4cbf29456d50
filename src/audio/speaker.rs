//! Speaker playback via CPAL.
//!
//! The writer side pushes resampled mono samples into a shared FIFO; the
//! device callback pops them and fans each sample out to every channel,
//! rendering silence when the FIFO runs dry.

use super::device::{OutputBackend, OutputStream};
use super::resample::resample;
use crate::error::PipelineError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Device-side backlog limit, in milliseconds of audio. Audio in the FIFO can
/// no longer be faded, so this bounds how late a fade or stop is heard.
const MAX_BACKLOG_MS: u64 = 40;

#[derive(Debug, Clone, Default)]
pub struct CpalOutput {
    preferred_device: Option<String>,
}

impl CpalOutput {
    pub fn new(preferred_device: Option<String>) -> Self {
        Self { preferred_device }
    }

    fn select_device(&self) -> Result<cpal::Device, PipelineError> {
        let host = cpal::default_host();
        match self.preferred_device.as_deref() {
            Some(name) => {
                let mut devices = host
                    .output_devices()
                    .map_err(|err| PipelineError::Device(format!("no output devices: {err}")))?;
                devices
                    .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                    .ok_or_else(|| PipelineError::Device(format!("output device '{name}' not found")))
            }
            None => host
                .default_output_device()
                .ok_or_else(|| PipelineError::Device("no default output device available".to_string())),
        }
    }
}

type SharedFifo = Arc<Mutex<VecDeque<f32>>>;

fn backlog_limit(device_rate: u32) -> usize {
    (u64::from(device_rate) * MAX_BACKLOG_MS / 1000) as usize
}

/// A write is refused when it would push the FIFO past the backlog limit,
/// except into an empty FIFO so oversized blocks still get through.
fn fifo_admits(pending: usize, incoming: usize, max_backlog: usize) -> bool {
    pending == 0 || pending + incoming <= max_backlog
}

/// Pop one mono sample per device frame and copy it to every channel.
fn fill_output<T, F>(data: &mut [T], channels: usize, fifo: &SharedFifo, convert: F)
where
    T: Copy,
    F: Fn(f32) -> T,
{
    let silence = convert(0.0);
    let Ok(mut fifo) = fifo.try_lock() else {
        data.fill(silence);
        return;
    };
    for frame in data.chunks_mut(channels.max(1)) {
        let value = fifo.pop_front().map(&convert).unwrap_or(silence);
        frame.fill(value);
    }
}

impl OutputBackend for CpalOutput {
    fn open_output(&self, sample_rate: u32) -> Result<Box<dyn OutputStream>, PipelineError> {
        let device = self.select_device()?;
        let default_config = device
            .default_output_config()
            .map_err(|err| PipelineError::Device(format!("output config: {err}")))?;
        let format = default_config.sample_format();
        let device_config: StreamConfig = default_config.into();
        let device_rate = device_config.sample_rate.0;
        let channels = usize::from(device_config.channels.max(1));
        let device_name = device
            .name()
            .unwrap_or_else(|_| "unknown output device".to_string());

        tracing::info!(
            device = %device_name,
            ?format,
            device_rate,
            channels,
            source_rate = sample_rate,
            "opening output stream"
        );

        let fifo: SharedFifo = Arc::new(Mutex::new(VecDeque::new()));
        let err_fn = |err: cpal::StreamError| tracing::warn!(error = %err, "audio output stream error");
        let stream = match format {
            SampleFormat::F32 => {
                let fifo = fifo.clone();
                device.build_output_stream(
                    &device_config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        fill_output(data, channels, &fifo, |sample| sample)
                    },
                    err_fn,
                    None,
                )
            }
            SampleFormat::I16 => {
                let fifo = fifo.clone();
                device.build_output_stream(
                    &device_config,
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        fill_output(data, channels, &fifo, |sample| {
                            (sample.clamp(-1.0, 1.0) * 32_767.0) as i16
                        })
                    },
                    err_fn,
                    None,
                )
            }
            SampleFormat::U16 => {
                let fifo = fifo.clone();
                device.build_output_stream(
                    &device_config,
                    move |data: &mut [u16], _: &cpal::OutputCallbackInfo| {
                        fill_output(data, channels, &fifo, |sample| {
                            (sample.clamp(-1.0, 1.0) * 32_767.0 + 32_768.0) as u16
                        })
                    },
                    err_fn,
                    None,
                )
            }
            other => {
                return Err(PipelineError::Device(format!(
                    "unsupported sample format: {other:?}"
                )))
            }
        }
        .map_err(|err| PipelineError::Device(format!("build output stream: {err}")))?;

        stream
            .play()
            .map_err(|err| PipelineError::Device(format!("start output stream: {err}")))?;

        let max_backlog = backlog_limit(device_rate);
        Ok(Box::new(CpalOutputStream {
            stream: Some(stream),
            fifo,
            device_name,
            device_rate,
            source_rate: sample_rate,
            max_backlog,
        }))
    }
}

struct CpalOutputStream {
    stream: Option<cpal::Stream>,
    fifo: SharedFifo,
    device_name: String,
    device_rate: u32,
    source_rate: u32,
    max_backlog: usize,
}

impl OutputStream for CpalOutputStream {
    fn device_name(&self) -> String {
        self.device_name.clone()
    }

    fn write(&mut self, samples: &[f32]) -> Result<usize, PipelineError> {
        if self.stream.is_none() {
            return Err(PipelineError::Device("output stream closed".to_string()));
        }
        if samples.is_empty() {
            return Ok(0);
        }
        let converted = resample(samples, self.source_rate, self.device_rate);
        let mut fifo = crate::lock_or_recover(&self.fifo, "speaker_fifo");
        if !fifo_admits(fifo.len(), converted.len(), self.max_backlog) {
            return Ok(0);
        }
        fifo.extend(converted);
        Ok(samples.len())
    }

    fn buffered(&self) -> usize {
        let pending = crate::lock_or_recover(&self.fifo, "speaker_fifo").len();
        (pending as u64 * u64::from(self.source_rate) / u64::from(self.device_rate.max(1))) as usize
    }

    fn discard_buffered(&mut self) {
        crate::lock_or_recover(&self.fifo, "speaker_fifo").clear();
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(err) = stream.pause() {
                tracing::debug!(error = %err, "failed to pause output stream");
            }
        }
        crate::lock_or_recover(&self.fifo, "speaker_fifo").clear();
    }
}

impl Drop for CpalOutputStream {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backlog_stays_within_two_blocks() {
        assert_eq!(backlog_limit(24_000), 960);
        assert_eq!(backlog_limit(48_000), 1_920);
    }

    #[test]
    fn fifo_refuses_writes_past_the_backlog() {
        let limit = backlog_limit(48_000);
        assert!(fifo_admits(0, 4_800, limit));
        assert!(fifo_admits(960, 960, limit));
        assert!(!fifo_admits(960, 961, limit));
        assert!(!fifo_admits(limit, 1, limit));
    }
}
