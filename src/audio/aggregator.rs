//! Assembles raw audio chunks into ASR-ready buffers.
//!
//! Audio accumulates per session until a boundary: manual cut, pause, an
//! upstream timeout, or the buffer outgrowing `max_buffer_duration_ms`. On
//! timeout-style boundaries PCM audio is cut at the quietest point near the
//! end, and the trailing part is carried into the next buffer as the pending
//! second half, unless it is too old or too long by then.

use crate::audio::chunk::{AudioChunk, AudioFormat, bytes_to_pcm16, calculate_rms, pcm_duration_ms};
use crate::audio::ring_buffer::{AudioRef, AudioRingBuffer, RingBufferConfig};
use crate::clock::{Clock, elapsed_ms};
use crate::defaults;
use crate::session::SessionRegistry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Energy is compared over frames of this length when looking for a cut point.
const SPLIT_FRAME_MS: u64 = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioAggregatorConfig {
    pub max_buffer_duration_ms: u64,
    pub pending_second_half_ttl_ms: u64,
    pub pending_second_half_max_duration_ms: u64,
    /// How far back from the end of the buffer to look for a quiet cut point.
    pub split_search_window_ms: u64,
    pub ring_buffer: RingBufferConfig,
}

impl Default for AudioAggregatorConfig {
    fn default() -> Self {
        Self {
            max_buffer_duration_ms: defaults::MAX_BUFFER_DURATION_MS,
            pending_second_half_ttl_ms: defaults::PENDING_SECOND_HALF_TTL_MS,
            pending_second_half_max_duration_ms: defaults::PENDING_SECOND_HALF_MAX_DURATION_MS,
            split_search_window_ms: defaults::SPLIT_SEARCH_WINDOW_MS,
            ring_buffer: RingBufferConfig::default(),
        }
    }
}

/// Boundary signals accompanying a chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFlags {
    pub is_manual_cut: bool,
    pub is_pause_triggered: bool,
    pub is_timeout_triggered: bool,
}

impl ChunkFlags {
    pub fn manual_cut() -> Self {
        Self {
            is_manual_cut: true,
            ..Self::default()
        }
    }

    pub fn pause() -> Self {
        Self {
            is_pause_triggered: true,
            ..Self::default()
        }
    }

    pub fn timeout() -> Self {
        Self {
            is_timeout_triggered: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizeReason {
    ManualCut,
    Pause,
    Timeout,
    MaxDuration,
    SessionFlush,
    /// A carried second half that was too old or too long to merge.
    StaleCarry,
    /// Incoming audio changed format or sample rate.
    FormatChange,
}

/// A buffer ready for the ASR stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledAudio {
    pub session_id: String,
    pub job_id: String,
    pub audio: Vec<u8>,
    pub start_ms: u64,
    pub end_ms: u64,
    pub sample_rate: u32,
    pub format: AudioFormat,
    pub reason: FinalizeReason,
    /// The buffer starts with audio carried over from the previous boundary.
    pub has_carry: bool,
    pub carried_duration_ms: u64,
}

impl AssembledAudio {
    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }
}

#[derive(Debug, Clone)]
struct PendingSecondHalf {
    audio: Vec<u8>,
    start_ms: u64,
    end_ms: u64,
    sample_rate: u32,
    format: AudioFormat,
    created_at: Instant,
}

impl PendingSecondHalf {
    fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }
}

struct SessionAudio {
    buffer: Vec<u8>,
    start_ms: Option<u64>,
    end_ms: u64,
    sample_rate: u32,
    format: AudioFormat,
    carried_duration_ms: u64,
    job_id: String,
    pending_second_half: Option<PendingSecondHalf>,
    ring: AudioRingBuffer,
}

impl SessionAudio {
    fn new(ring: AudioRingBuffer) -> Self {
        Self {
            buffer: Vec::new(),
            start_ms: None,
            end_ms: 0,
            sample_rate: defaults::SAMPLE_RATE,
            format: AudioFormat::default(),
            carried_duration_ms: 0,
            job_id: String::new(),
            pending_second_half: None,
            ring,
        }
    }

    fn has_buffer(&self) -> bool {
        self.start_ms.is_some()
    }

    fn buffered_ms(&self) -> u64 {
        self.start_ms
            .map_or(0, |start| self.end_ms.saturating_sub(start))
    }

    fn take(&mut self, session_id: &str, reason: FinalizeReason) -> Option<AssembledAudio> {
        let start_ms = self.start_ms.take()?;
        let carried_duration_ms = std::mem::take(&mut self.carried_duration_ms);
        Some(AssembledAudio {
            session_id: session_id.to_string(),
            job_id: self.job_id.clone(),
            audio: std::mem::take(&mut self.buffer),
            start_ms,
            end_ms: std::mem::take(&mut self.end_ms),
            sample_rate: self.sample_rate,
            format: self.format,
            reason,
            has_carry: carried_duration_ms > 0,
            carried_duration_ms,
        })
    }
}

fn carry_as_assembled(session_id: &str, job_id: &str, carry: PendingSecondHalf) -> AssembledAudio {
    AssembledAudio {
        session_id: session_id.to_string(),
        job_id: job_id.to_string(),
        audio: carry.audio,
        start_ms: carry.start_ms,
        end_ms: carry.end_ms,
        sample_rate: carry.sample_rate,
        format: carry.format,
        reason: FinalizeReason::StaleCarry,
        has_carry: true,
        carried_duration_ms: carry.end_ms.saturating_sub(carry.start_ms),
    }
}

/// Finds the byte offset of the quietest frame start within the last
/// `window_ms` of PCM audio, preferring the latest on ties. Never returns 0
/// or the full length.
fn quietest_split_offset(pcm: &[u8], sample_rate: u32, window_ms: u64) -> Option<usize> {
    let samples = bytes_to_pcm16(pcm);
    let frame_len = (sample_rate as u64 * SPLIT_FRAME_MS / 1000) as usize;
    if frame_len == 0 || samples.len() < frame_len * 2 {
        return None;
    }
    let window = (sample_rate as u64 * window_ms / 1000) as usize;
    let search_start = samples.len().saturating_sub(window).max(frame_len);

    let mut best: Option<(usize, f32)> = None;
    let mut frame_start = search_start;
    while frame_start + frame_len <= samples.len() {
        let energy = calculate_rms(&samples[frame_start..frame_start + frame_len]);
        if best.is_none_or(|(_, e)| energy <= e) {
            best = Some((frame_start, energy));
        }
        frame_start += frame_len;
    }
    best.map(|(sample, _)| sample * 2)
}

pub struct AudioAggregator {
    config: AudioAggregatorConfig,
    sessions: SessionRegistry<SessionAudio>,
}

impl AudioAggregator {
    pub fn new(config: AudioAggregatorConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            sessions: SessionRegistry::new(clock),
        }
    }

    pub fn config(&self) -> &AudioAggregatorConfig {
        &self.config
    }

    /// Adds a chunk to the session's buffer, returning any finalized buffers
    /// in emission order.
    pub fn process_chunk(
        &self,
        session_id: &str,
        job_id: &str,
        chunk: AudioChunk,
        flags: ChunkFlags,
    ) -> Vec<AssembledAudio> {
        let clock = self.sessions.clock().clone();
        let now = clock.now();
        let ring_config = self.config.ring_buffer.clone();

        self.sessions.with_session(
            session_id,
            || SessionAudio::new(AudioRingBuffer::new(ring_config, clock)),
            |session| self.apply_chunk(session, session_id, job_id, chunk, flags, now),
        )
    }

    fn apply_chunk(
        &self,
        session: &mut SessionAudio,
        session_id: &str,
        job_id: &str,
        chunk: AudioChunk,
        flags: ChunkFlags,
        now: Instant,
    ) -> Vec<AssembledAudio> {
        let mut emitted = Vec::new();
        session.ring.add_chunk(chunk.clone());

        let format_changed = session.has_buffer()
            && (session.format != chunk.format || session.sample_rate != chunk.sample_rate);
        if format_changed && let Some(out) = session.take(session_id, FinalizeReason::FormatChange) {
            emitted.push(out);
        }

        if let Some(carry) = session.pending_second_half.take() {
            let age_ms = elapsed_ms(carry.created_at, now);
            let compatible = carry.format == chunk.format && carry.sample_rate == chunk.sample_rate;
            if age_ms > self.config.pending_second_half_ttl_ms
                || carry.duration_ms() > self.config.pending_second_half_max_duration_ms
                || !compatible
                || session.has_buffer()
            {
                tracing::debug!(
                    session_id,
                    age_ms,
                    duration_ms = carry.duration_ms(),
                    "flushing carried audio on its own"
                );
                emitted.push(carry_as_assembled(session_id, &session.job_id, carry));
            } else {
                session.carried_duration_ms = carry.duration_ms();
                session.start_ms = Some(carry.start_ms);
                session.end_ms = carry.end_ms;
                session.buffer = carry.audio;
            }
        }

        if !session.has_buffer() {
            session.start_ms = Some(chunk.start_ms);
        }
        session.job_id = job_id.to_string();
        session.format = chunk.format;
        session.sample_rate = chunk.sample_rate;
        session.end_ms = session.end_ms.max(chunk.end_ms);
        session.buffer.extend_from_slice(&chunk.audio);

        let reason = if flags.is_manual_cut {
            Some(FinalizeReason::ManualCut)
        } else if flags.is_pause_triggered {
            Some(FinalizeReason::Pause)
        } else if flags.is_timeout_triggered {
            Some(FinalizeReason::Timeout)
        } else if session.buffered_ms() >= self.config.max_buffer_duration_ms {
            Some(FinalizeReason::MaxDuration)
        } else {
            None
        };

        if let Some(reason) = reason {
            let split = matches!(reason, FinalizeReason::Timeout | FinalizeReason::MaxDuration);
            if let Some(mut out) = session.take(session_id, reason) {
                if split && let Some(carry) = self.split_trailing(&mut out, now) {
                    session.pending_second_half = Some(carry);
                }
                emitted.push(out);
            }
        }
        emitted
    }

    /// Cuts PCM audio at its quietest trailing point, returning the tail.
    fn split_trailing(&self, out: &mut AssembledAudio, now: Instant) -> Option<PendingSecondHalf> {
        if out.format != AudioFormat::PcmS16Le {
            return None;
        }
        let offset = quietest_split_offset(&out.audio, out.sample_rate, self.config.split_search_window_ms)?;
        let tail = out.audio.split_off(offset);
        let split_ms = out.start_ms + pcm_duration_ms(offset, out.sample_rate);
        let carry = PendingSecondHalf {
            audio: tail,
            start_ms: split_ms,
            end_ms: out.end_ms,
            sample_rate: out.sample_rate,
            format: out.format,
            created_at: now,
        };
        out.end_ms = split_ms;
        Some(carry)
    }

    /// Emits whatever the session still holds: buffered audio, then any carry.
    pub fn flush_session(&self, session_id: &str) -> Vec<AssembledAudio> {
        self.sessions
            .with_existing(session_id, |session| {
                let mut emitted = Vec::new();
                if let Some(carry) = session.pending_second_half.take() {
                    emitted.push(carry_as_assembled(session_id, &session.job_id, carry));
                }
                if let Some(out) = session.take(session_id, FinalizeReason::SessionFlush) {
                    emitted.push(out);
                }
                emitted.sort_by_key(|a| a.start_ms);
                emitted
            })
            .unwrap_or_default()
    }

    pub fn has_pending_second_half(&self, session_id: &str) -> bool {
        self.sessions
            .with_existing(session_id, |s| s.pending_second_half.is_some())
            .unwrap_or(false)
    }

    pub fn audio_ref(&self, session_id: &str, start_ms: u64, end_ms: u64) -> Option<AudioRef> {
        self.sessions
            .with_existing(session_id, |s| s.ring.get_audio_ref(start_ms, end_ms))
            .flatten()
    }

    pub fn recent_audio(&self, session_id: &str, duration_secs: f64) -> Option<AudioRef> {
        self.sessions
            .with_existing(session_id, |s| s.ring.get_recent_audio_ref(duration_secs))
            .flatten()
    }

    pub fn remove_session(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id)
    }

    pub fn sweep_idle(&self, ttl_ms: u64) -> Vec<String> {
        self.sessions.sweep_idle(ttl_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;

    const RATE: u32 = 16_000;

    fn aggregator(clock: &MockClock) -> AudioAggregator {
        AudioAggregator::new(AudioAggregatorConfig::default(), Arc::new(clock.clone()))
    }

    /// `ms` of constant-amplitude PCM.
    fn tone(ms: u64, amplitude: i16, start_ms: u64) -> AudioChunk {
        let samples = vec![amplitude; (RATE as u64 * ms / 1000) as usize];
        AudioChunk::from_pcm16(&samples, RATE, start_ms)
    }

    #[test]
    fn test_buffers_until_manual_cut() {
        let clock = MockClock::new();
        let agg = aggregator(&clock);

        assert!(agg.process_chunk("s", "j1", tone(500, 1000, 0), ChunkFlags::default()).is_empty());
        let out = agg.process_chunk("s", "j1", tone(500, 1000, 500), ChunkFlags::manual_cut());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].reason, FinalizeReason::ManualCut);
        assert_eq!((out[0].start_ms, out[0].end_ms), (0, 1000));
        assert_eq!(out[0].audio.len(), 32_000);
        assert!(!out[0].has_carry);
        assert!(!agg.has_pending_second_half("s"));
    }

    #[test]
    fn test_timeout_splits_at_quietest_point_and_carries_tail() {
        let clock = MockClock::new();
        let agg = aggregator(&clock);

        agg.process_chunk("s", "j1", tone(1000, 8000, 0), ChunkFlags::default());
        agg.process_chunk("s", "j1", tone(100, 0, 1000), ChunkFlags::default());
        let out = agg.process_chunk("s", "j1", tone(400, 8000, 1100), ChunkFlags::timeout());

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].reason, FinalizeReason::Timeout);
        // Cut at the last silent frame; the trailing tone is carried.
        assert_eq!(out[0].end_ms, 1080);
        assert!(agg.has_pending_second_half("s"));

        let next = agg.process_chunk("s", "j2", tone(500, 8000, 1500), ChunkFlags::pause());
        assert_eq!(next.len(), 1);
        assert!(next[0].has_carry);
        assert_eq!(next[0].carried_duration_ms, 420);
        assert_eq!((next[0].start_ms, next[0].end_ms), (1080, 2000));
        assert_eq!(next[0].job_id, "j2");
    }

    #[test]
    fn test_stale_carry_is_flushed_independently() {
        let clock = MockClock::new();
        let agg = aggregator(&clock);

        agg.process_chunk("s", "j1", tone(1000, 8000, 0), ChunkFlags::default());
        agg.process_chunk("s", "j1", tone(100, 0, 1000), ChunkFlags::default());
        agg.process_chunk("s", "j1", tone(400, 8000, 1100), ChunkFlags::timeout());

        clock.advance_ms(defaults::PENDING_SECOND_HALF_TTL_MS + 1);
        let out = agg.process_chunk("s", "j2", tone(500, 8000, 20_000), ChunkFlags::manual_cut());
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].reason, FinalizeReason::StaleCarry);
        assert_eq!(out[0].start_ms, 1080);
        assert_eq!(out[1].reason, FinalizeReason::ManualCut);
        assert!(!out[1].has_carry);
        assert_eq!(out[1].start_ms, 20_000);
    }

    #[test]
    fn test_max_duration_forces_finalize() {
        let clock = MockClock::new();
        let agg = AudioAggregator::new(
            AudioAggregatorConfig {
                max_buffer_duration_ms: 2000,
                ..AudioAggregatorConfig::default()
            },
            Arc::new(clock.clone()),
        );
        assert!(agg.process_chunk("s", "j", tone(1000, 500, 0), ChunkFlags::default()).is_empty());
        let out = agg.process_chunk("s", "j", tone(1000, 500, 1000), ChunkFlags::default());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].reason, FinalizeReason::MaxDuration);
        assert_eq!(out[0].start_ms, 0);
        assert_eq!(out[0].end_ms, 1980);
        assert!(agg.has_pending_second_half("s"));
    }

    #[test]
    fn test_opus_is_never_split() {
        let clock = MockClock::new();
        let agg = aggregator(&clock);
        let chunk = AudioChunk::new(vec![1; 100], 0, 1000, 48_000, AudioFormat::Opus);
        let out = agg.process_chunk("s", "j", chunk, ChunkFlags::timeout());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].end_ms, 1000);
        assert!(!agg.has_pending_second_half("s"));
    }

    #[test]
    fn test_format_change_finalizes_previous_buffer() {
        let clock = MockClock::new();
        let agg = aggregator(&clock);
        agg.process_chunk("s", "j", tone(500, 100, 0), ChunkFlags::default());
        let opus = AudioChunk::new(vec![1; 10], 500, 700, 48_000, AudioFormat::Opus);
        let out = agg.process_chunk("s", "j", opus, ChunkFlags::default());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].reason, FinalizeReason::FormatChange);
        assert_eq!(out[0].format, AudioFormat::PcmS16Le);
    }

    #[test]
    fn test_flush_and_ring_buffer_access() {
        let clock = MockClock::new();
        let agg = aggregator(&clock);
        agg.process_chunk("s", "j", tone(1000, 100, 0), ChunkFlags::default());
        agg.process_chunk("s", "j", tone(1000, 100, 1000), ChunkFlags::default());

        let recent = agg.recent_audio("s", 1.0).unwrap();
        assert_eq!((recent.start_ms, recent.end_ms), (1000, 2000));
        assert_eq!(agg.audio_ref("s", 0, 2000).map(|r| r.chunk_count), Some(2));

        let flushed = agg.flush_session("s");
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].reason, FinalizeReason::SessionFlush);
        assert!(agg.flush_session("s").is_empty());
        assert!(agg.flush_session("unknown").is_empty());
        assert!(agg.remove_session("s"));
    }

    #[test]
    fn test_split_offset_finds_silence() {
        let mut samples = vec![5000i16; 16_000];
        for s in &mut samples[8000..8320] {
            *s = 0;
        }
        let bytes = crate::audio::chunk::pcm16_to_bytes(&samples);
        let offset = quietest_split_offset(&bytes, RATE, 1000).unwrap();
        assert_eq!(offset, 8000 * 2);
        assert!(quietest_split_offset(&bytes[..10], RATE, 1000).is_none());
    }
}
