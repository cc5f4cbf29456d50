//! System microphone capture via CPAL.
//!
//! Handles device selection, sample-format conversion, downmixing, and sample
//! rate normalization. Frames leave the callback through a bounded channel so
//! the audio thread never blocks.

use super::device::{InputBackend, InputStream};
use super::resample::convert_frame_to_target;
use crate::error::PipelineError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Device frames buffered between the audio callback and the reader.
const CAPTURE_CHANNEL_CAPACITY: usize = 64;

/// Downmix multi-channel input to mono while applying the provided converter.
pub(super) fn append_downmixed_samples<T, F>(
    buf: &mut Vec<f32>,
    data: &[T],
    channels: usize,
    mut convert: F,
) where
    T: Copy,
    F: FnMut(T) -> f32,
{
    if channels <= 1 {
        buf.extend(data.iter().copied().map(&mut convert));
        return;
    }

    // Average each interleaved frame to produce a mono representation.
    let mut acc = 0.0f32;
    let mut count = 0usize;
    for sample in data.iter().copied() {
        acc += convert(sample);
        count += 1;
        if count == channels {
            buf.push(acc / channels as f32);
            acc = 0.0;
            count = 0;
        }
    }
    if count > 0 {
        buf.push(acc / count as f32);
    }
}

/// Re-chunks callback buffers into fixed device-rate frames.
pub(super) struct FrameDispatcher {
    frame_samples: usize,
    pending: Vec<f32>,
    scratch: Vec<f32>,
    sender: Sender<Vec<f32>>,
    dropped: Arc<AtomicUsize>,
}

impl FrameDispatcher {
    pub(super) fn new(
        frame_samples: usize,
        sender: Sender<Vec<f32>>,
        dropped: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            frame_samples: frame_samples.max(1),
            pending: Vec::with_capacity(frame_samples),
            scratch: Vec::new(),
            sender,
            dropped,
        }
    }

    pub(super) fn push<T, F>(&mut self, data: &[T], channels: usize, convert: F)
    where
        T: Copy,
        F: FnMut(T) -> f32,
    {
        self.scratch.clear();
        append_downmixed_samples(&mut self.scratch, data, channels, convert);
        self.pending.extend_from_slice(&self.scratch);

        while self.pending.len() >= self.frame_samples {
            let frame: Vec<f32> = self.pending.drain(..self.frame_samples).collect();
            match self.sender.try_send(frame) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Disconnected(_)) => break,
            }
        }
    }
}

/// Opens the preferred (or default) microphone.
#[derive(Debug, Clone, Default)]
pub struct CpalInput {
    preferred_device: Option<String>,
}

impl CpalInput {
    pub fn new(preferred_device: Option<String>) -> Self {
        Self { preferred_device }
    }

    fn select_device(&self) -> Result<cpal::Device, PipelineError> {
        let host = cpal::default_host();
        match self.preferred_device.as_deref() {
            Some(name) => {
                let mut devices = host
                    .input_devices()
                    .map_err(|err| PipelineError::Device(format!("no input devices: {err}")))?;
                devices
                    .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                    .ok_or_else(|| PipelineError::Device(format!("input device '{name}' not found")))
            }
            None => host.default_input_device().ok_or_else(|| {
                PipelineError::Device(format!(
                    "no default input device available. {}",
                    mic_permission_hint()
                ))
            }),
        }
    }
}

impl InputBackend for CpalInput {
    fn open_input(
        &self,
        sample_rate: u32,
        frame_samples: usize,
    ) -> Result<Box<dyn InputStream>, PipelineError> {
        let device = self.select_device()?;
        let default_config = device
            .default_input_config()
            .map_err(|err| PipelineError::Device(format!("input config: {err}")))?;
        let format = default_config.sample_format();
        let device_config: StreamConfig = default_config.into();
        let device_rate = device_config.sample_rate.0;
        let channels = usize::from(device_config.channels.max(1));
        let device_name = device
            .name()
            .unwrap_or_else(|_| "unknown input device".to_string());
        let device_frame_samples = ((u64::from(device_rate) * frame_samples as u64)
            / u64::from(sample_rate.max(1)))
        .max(1) as usize;

        tracing::info!(
            device = %device_name,
            ?format,
            device_rate,
            channels,
            "opening input stream"
        );

        let (sender, receiver) = bounded::<Vec<f32>>(CAPTURE_CHANNEL_CAPACITY);
        let dropped = Arc::new(AtomicUsize::new(0));
        let dispatcher = Arc::new(Mutex::new(FrameDispatcher::new(
            device_frame_samples,
            sender,
            dropped.clone(),
        )));

        let err_fn = |err: cpal::StreamError| tracing::warn!(error = %err, "audio input stream error");
        let stream = match format {
            SampleFormat::F32 => {
                let dispatcher = dispatcher.clone();
                let dropped = dropped.clone();
                device.build_input_stream(
                    &device_config,
                    move |data: &[f32], _| {
                        if let Ok(mut pump) = dispatcher.try_lock() {
                            pump.push(data, channels, |sample| sample);
                        } else {
                            dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    },
                    err_fn,
                    None,
                )
            }
            SampleFormat::I16 => {
                let dispatcher = dispatcher.clone();
                let dropped = dropped.clone();
                device.build_input_stream(
                    &device_config,
                    move |data: &[i16], _| {
                        if let Ok(mut pump) = dispatcher.try_lock() {
                            pump.push(data, channels, |sample| sample as f32 / 32_768.0);
                        } else {
                            dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    },
                    err_fn,
                    None,
                )
            }
            SampleFormat::U16 => {
                let dispatcher = dispatcher.clone();
                let dropped = dropped.clone();
                device.build_input_stream(
                    &device_config,
                    move |data: &[u16], _| {
                        if let Ok(mut pump) = dispatcher.try_lock() {
                            pump.push(data, channels, |sample| {
                                (sample as f32 - 32_768.0) / 32_768.0
                            });
                        } else {
                            dropped.fetch_add(1, Ordering::Relaxed);
                        }
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
        .map_err(|err| PipelineError::Device(format!("build input stream: {err}")))?;

        stream
            .play()
            .map_err(|err| PipelineError::Device(format!("start input stream: {err}")))?;

        Ok(Box::new(CpalInputStream {
            stream,
            receiver,
            device_name,
            device_rate,
            sample_rate,
            frame_samples,
            dropped,
        }))
    }
}

struct CpalInputStream {
    stream: cpal::Stream,
    receiver: Receiver<Vec<f32>>,
    device_name: String,
    device_rate: u32,
    sample_rate: u32,
    frame_samples: usize,
    dropped: Arc<AtomicUsize>,
}

impl InputStream for CpalInputStream {
    fn device_name(&self) -> String {
        self.device_name.clone()
    }

    fn read_frame(&mut self, timeout: Duration) -> Result<Option<Vec<f32>>, PipelineError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(convert_frame_to_target(
                frame,
                self.device_rate,
                self.sample_rate,
                self.frame_samples,
            ))),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(PipelineError::Device(
                "audio stream disconnected".to_string(),
            )),
        }
    }
}

impl Drop for CpalInputStream {
    fn drop(&mut self) {
        if let Err(err) = self.stream.pause() {
            tracing::debug!(error = %err, "failed to pause input stream");
        }
        let dropped = self.dropped.load(Ordering::Relaxed);
        if dropped > 0 {
            tracing::info!(dropped, "capture frames dropped by the audio callback");
        }
    }
}

pub(super) fn mic_permission_hint() -> &'static str {
    #[cfg(target_os = "macos")]
    {
        "macOS: System Settings > Privacy & Security > Microphone (enable your terminal)."
    }
    #[cfg(target_os = "linux")]
    {
        "Linux: check PipeWire/PulseAudio permissions and ensure the device is not muted."
    }
    #[cfg(target_os = "windows")]
    {
        "Windows: Settings > Privacy & Security > Microphone (allow access for your terminal)."
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        "Check OS microphone permissions."
    }
}
