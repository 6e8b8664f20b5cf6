//! Audio chunk types and PCM helpers.

use serde::{Deserialize, Serialize};

/// Encoding of a chunk's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioFormat {
    /// 16-bit signed little-endian mono PCM.
    #[default]
    PcmS16Le,
    /// Opus packets; opaque to this crate, durations come from timestamps.
    Opus,
}

/// A piece of captured audio with stream timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioChunk {
    pub audio: Vec<u8>,
    /// Capture timestamp from the audio source.
    pub timestamp_ms: u64,
    /// Position of the first sample in the session's audio stream.
    pub start_ms: u64,
    pub end_ms: u64,
    pub sample_rate: u32,
    pub format: AudioFormat,
}

impl AudioChunk {
    pub fn new(
        audio: Vec<u8>,
        start_ms: u64,
        end_ms: u64,
        sample_rate: u32,
        format: AudioFormat,
    ) -> Self {
        Self {
            audio,
            timestamp_ms: start_ms,
            start_ms,
            end_ms,
            sample_rate,
            format,
        }
    }

    /// Builds a PCM chunk, deriving `end_ms` from the sample count.
    pub fn from_pcm16(samples: &[i16], sample_rate: u32, start_ms: u64) -> Self {
        let audio = pcm16_to_bytes(samples);
        let end_ms = start_ms + pcm_duration_ms(audio.len(), sample_rate);
        Self::new(audio, start_ms, end_ms, sample_rate, AudioFormat::PcmS16Le)
    }

    pub fn with_timestamp_ms(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }

    /// Decoded samples, for PCM chunks only.
    pub fn samples(&self) -> Option<Vec<i16>> {
        match self.format {
            AudioFormat::PcmS16Le => Some(bytes_to_pcm16(&self.audio)),
            AudioFormat::Opus => None,
        }
    }
}

/// Duration in milliseconds of `byte_len` bytes of 16-bit mono PCM.
pub fn pcm_duration_ms(byte_len: usize, sample_rate: u32) -> u64 {
    if sample_rate == 0 {
        return 0;
    }
    (byte_len as u64 / 2) * 1000 / sample_rate as u64
}

pub fn pcm16_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Trailing odd bytes are ignored.
pub fn bytes_to_pcm16(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Normalized RMS energy of `samples`, in `[0, 1]`.
pub fn calculate_rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples
        .iter()
        .map(|&sample| {
            let normalized = sample as f64 / i16::MAX as f64;
            normalized * normalized
        })
        .sum();

    let mean_square = sum_squares / samples.len() as f64;
    mean_square.sqrt() as f32
}
