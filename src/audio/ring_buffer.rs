//! Bounded per-session store of recent audio for secondary decode.
//!
//! Bounded two ways: chunks older than `ttl_ms` (by arrival time) are dropped,
//! then the oldest chunks are dropped until the buffered audio spans at most
//! `max_duration_ms`.

use crate::audio::chunk::{AudioChunk, AudioFormat};
use crate::clock::{Clock, elapsed_ms};
use crate::defaults;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RingBufferConfig {
    pub max_duration_ms: u64,
    pub ttl_ms: u64,
}

impl Default for RingBufferConfig {
    fn default() -> Self {
        Self {
            max_duration_ms: defaults::RING_BUFFER_MAX_DURATION_MS,
            ttl_ms: defaults::RING_BUFFER_TTL_MS,
        }
    }
}

/// Contiguous audio assembled from one or more buffered chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioRef {
    pub audio: Vec<u8>,
    pub start_ms: u64,
    pub end_ms: u64,
    pub sample_rate: u32,
    pub format: AudioFormat,
    pub chunk_count: usize,
}

impl AudioRef {
    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }
}

#[derive(Debug, Clone)]
struct StoredChunk {
    chunk: AudioChunk,
    received_at: Instant,
}

pub struct AudioRingBuffer {
    config: RingBufferConfig,
    chunks: VecDeque<StoredChunk>,
    clock: Arc<dyn Clock>,
}

impl AudioRingBuffer {
    pub fn new(config: RingBufferConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            chunks: VecDeque::new(),
            clock,
        }
    }

    pub fn add_chunk(&mut self, chunk: AudioChunk) {
        let now = self.clock.now();
        self.chunks.push_back(StoredChunk {
            chunk,
            received_at: now,
        });
        self.prune(now);
    }

    fn prune(&mut self, now: Instant) {
        let ttl_ms = self.config.ttl_ms;
        self.chunks
            .retain(|stored| elapsed_ms(stored.received_at, now) <= ttl_ms);

        while !self.chunks.is_empty()
            && (self.span_ms() > self.config.max_duration_ms
                || self.total_duration_ms() > self.config.max_duration_ms)
        {
            self.chunks.pop_front();
        }
    }

    /// Stream time from the earliest start to the latest end.
    pub fn span_ms(&self) -> u64 {
        let start = self.chunks.iter().map(|s| s.chunk.start_ms).min();
        let end = self.chunks.iter().map(|s| s.chunk.end_ms).max();
        match (start, end) {
            (Some(start), Some(end)) => end.saturating_sub(start),
            _ => 0,
        }
    }

    /// Sum of the buffered chunk durations.
    pub fn total_duration_ms(&self) -> u64 {
        self.chunks.iter().map(|s| s.chunk.duration_ms()).sum()
    }

    /// Concatenates every chunk overlapping `[start_ms, end_ms)`.
    ///
    /// Chunks whose format or sample rate differ from the first overlapping
    /// chunk are left out.
    pub fn get_audio_ref(&mut self, start_ms: u64, end_ms: u64) -> Option<AudioRef> {
        self.prune(self.clock.now());

        let mut overlapping = self
            .chunks
            .iter()
            .map(|s| &s.chunk)
            .filter(|c| c.start_ms < end_ms && c.end_ms > start_ms)
            .peekable();
        let first = overlapping.peek()?;
        let (format, sample_rate) = (first.format, first.sample_rate);

        let mut audio_ref = AudioRef {
            audio: Vec::new(),
            start_ms: first.start_ms,
            end_ms: first.end_ms,
            sample_rate,
            format,
            chunk_count: 0,
        };
        for chunk in overlapping.filter(|c| c.format == format && c.sample_rate == sample_rate) {
            audio_ref.audio.extend_from_slice(&chunk.audio);
            audio_ref.start_ms = audio_ref.start_ms.min(chunk.start_ms);
            audio_ref.end_ms = audio_ref.end_ms.max(chunk.end_ms);
            audio_ref.chunk_count += 1;
        }
        Some(audio_ref)
    }

    /// The last `duration_secs` of buffered audio.
    pub fn get_recent_audio_ref(&mut self, duration_secs: f64) -> Option<AudioRef> {
        self.prune(self.clock.now());
        let latest_end = self.chunks.iter().map(|s| s.chunk.end_ms).max()?;
        let window_ms = (duration_secs.max(0.0) * 1000.0) as u64;
        self.get_audio_ref(latest_end.saturating_sub(window_ms), latest_end)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }
}
