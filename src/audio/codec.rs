//! WAV/base64 encoding of user utterances and decoding of streamed PCM16.

use crate::error::PipelineError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::fs;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// An utterance ready to be sent to the conversational service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedUtterance {
    /// 16-bit mono WAV, base64 (standard alphabet).
    pub wav_base64: String,
    pub sample_rate: u32,
    pub frame_count: usize,
    pub start_index: u64,
    pub end_index: u64,
    pub duration: Duration,
}

/// Encode mono f32 samples as a 16-bit PCM WAV file in memory.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>, PipelineError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for sample in samples {
            writer.write_sample(f32_to_i16(*sample))?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

impl EncodedUtterance {
    pub fn from_wav(
        wav: &[u8],
        sample_rate: u32,
        frame_count: usize,
        start_index: u64,
        end_index: u64,
        duration: Duration,
    ) -> Self {
        Self {
            wav_base64: STANDARD.encode(wav),
            sample_rate,
            frame_count,
            start_index,
            end_index,
            duration,
        }
    }

    /// `data:` URL form accepted by OpenAI-compatible `input_audio` parts.
    pub fn data_url(&self) -> String {
        format!("data:audio/wav;base64,{}", self.wav_base64)
    }
}

/// Decode base64 little-endian PCM16 mono into f32 samples. A trailing odd
/// byte is ignored.
pub fn decode_pcm16_base64(data: &str) -> Result<Vec<f32>, PipelineError> {
    let bytes = STANDARD.decode(data.trim())?;
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32_768.0)
        .collect())
}

/// Write `wav` into `dir` under a timestamped name and return the path.
pub fn save_wav(dir: &Path, wav: &[u8]) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let path = dir.join(format!("utterance_{stamp}.wav"));
    fs::write(&path, wav)?;
    Ok(path)
}

fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16
}
