//! Aggregation decision engine: stream/commit decisions over ASR utterances.

pub mod decision;
pub mod dedup;
pub mod engine;
pub mod forward_merge;
pub mod state;
pub mod station;
pub mod tail;
pub mod types;

pub use decision::{AggregationTuning, CommitInput, decide_action, decide_commit};
pub use dedup::{DedupResult, dedup_merge_precise};
pub use engine::{AggregationConfig, AggregationEngine};
pub use forward_merge::{
    ForwardMergeConfig, ForwardMergeHandler, ForwardMergeOutput, LengthRoute, PendingMergeEntry,
};
pub use state::AggregatorState;
pub use station::{AggregatedUtterance, AggregationStation};
pub use tail::extract_commit_text;
pub use types::{
    AggregationMode, AggregationOutcome, CommitDecision, CommitReason, CommittedText, StreamAction,
    Utterance, UtteranceRecord,
};
