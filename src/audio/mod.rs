//! Audio assembly: chunk buffering, the per-session ring buffer and secondary decode.

pub mod aggregator;
pub mod chunk;
pub mod ring_buffer;
pub mod secondary_decode;

pub use aggregator::{AssembledAudio, AudioAggregator, AudioAggregatorConfig, ChunkFlags, FinalizeReason};
pub use chunk::{AudioChunk, AudioFormat};
pub use ring_buffer::{AudioRef, AudioRingBuffer, RingBufferConfig};
pub use secondary_decode::{
    DecodeSkipReason, SecondaryDecodeConfig, SecondaryDecodeOutcome, SecondaryDecodeStats,
    SecondaryDecodeWorker, SecondaryDecoder,
};
