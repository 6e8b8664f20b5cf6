//! Data types flowing into and out of the aggregation engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One ASR recognition result with timing and quality metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Utterance {
    pub text: String,
    pub start_ms: u64,
    pub end_ms: u64,
    pub lang: String,
    /// Recognizer confidence, expected in `[0, 1]`.
    pub quality_score: f32,
    pub is_final: bool,
    pub is_manual_cut: bool,
    pub is_pause_triggered: bool,
}

impl Utterance {
    /// Creates a non-final utterance with full quality and no boundary flags.
    pub fn new(text: impl Into<String>, start_ms: u64, end_ms: u64) -> Self {
        Self {
            text: text.into(),
            start_ms,
            end_ms,
            lang: String::new(),
            quality_score: 1.0,
            is_final: false,
            is_manual_cut: false,
            is_pause_triggered: false,
        }
    }

    pub fn with_lang(mut self, lang: impl Into<String>) -> Self {
        self.lang = lang.into();
        self
    }

    pub fn with_quality(mut self, quality_score: f32) -> Self {
        self.quality_score = quality_score;
        self
    }

    pub fn final_result(mut self) -> Self {
        self.is_final = true;
        self
    }

    pub fn manual_cut(mut self) -> Self {
        self.is_manual_cut = true;
        self
    }

    pub fn pause_triggered(mut self) -> Self {
        self.is_pause_triggered = true;
        self
    }

    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }

    /// Quality score clamped to `[0, 1]`; NaN counts as zero.
    pub fn clamped_quality(&self) -> f32 {
        if self.quality_score.is_nan() {
            0.0
        } else {
            self.quality_score.clamp(0.0, 1.0)
        }
    }

    /// True when the utterance was explicitly terminated (manual cut or pause).
    pub fn ends_stream(&self) -> bool {
        self.is_manual_cut || self.is_pause_triggered
    }
}

/// An utterance as delivered by the ASR collaborator, with routing identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtteranceRecord {
    /// Missing or empty ids degrade to stateless passthrough.
    pub session_id: Option<String>,
    pub utterance_index: u64,
    pub job_id: String,
    pub utterance: Utterance,
    /// Upstream signalled that the audio segment was closed by a timeout.
    #[serde(default)]
    pub is_timeout_triggered: bool,
}

impl UtteranceRecord {
    pub fn new(session_id: impl Into<String>, utterance_index: u64, utterance: Utterance) -> Self {
        Self {
            session_id: Some(session_id.into()),
            utterance_index,
            job_id: format!("job-{}", utterance_index),
            utterance,
            is_timeout_triggered: false,
        }
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = job_id.into();
        self
    }

    pub fn timeout_triggered(mut self) -> Self {
        self.is_timeout_triggered = true;
        self
    }

    /// Session id if present and non-empty.
    pub fn session(&self) -> Option<&str> {
        self.session_id.as_deref().filter(|s| !s.trim().is_empty())
    }
}

/// Whether an utterance continues the current stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamAction {
    Merge,
    NewStream,
}

/// Result of the commit decision for one utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommitDecision {
    pub should_commit: bool,
    pub commit_by_manual_cut: bool,
    pub commit_by_timeout: bool,
    pub is_last_in_merged_group: bool,
}

/// Why a piece of text was committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitReason {
    /// Manual cut or detected pause.
    ManualCut,
    Timeout,
    Final,
    /// Length or commit-interval threshold reached.
    Threshold,
    /// A new stream started while the previous one still had pending text.
    StreamBoundary,
    SessionFlush,
    /// No session id; text passed through without aggregation.
    Passthrough,
}

/// Text finalized for downstream translation and synthesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedText {
    pub text: String,
    /// Index that carries the commit downstream (last of its merge group).
    pub utterance_index: u64,
    pub job_id: String,
    pub lang: String,
    pub quality: f32,
    pub reason: CommitReason,
    pub is_last_in_merged_group: bool,
    /// Every index whose text contributed, in arrival order.
    pub merged_indices: Vec<u64>,
    /// Text withheld from an earlier commit of `utterance_index`, released by a
    /// flush after that commit already went downstream.
    #[serde(default)]
    pub is_tail_carry: bool,
}

/// Everything the engine decided for one utterance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationOutcome {
    pub action: StreamAction,
    pub decision: CommitDecision,
    pub commits: Vec<CommittedText>,
    /// Indices whose downstream work is moot (merged away or deduplicated).
    pub superseded: Vec<u64>,
}

/// Tuning preset family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMode {
    /// Single speaker, relaxed gaps, longer commits.
    #[default]
    Offline,
    /// Multi-party room, tight gaps, faster commits.
    Room,
}

impl AggregationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationMode::Offline => "offline",
            AggregationMode::Room => "room",
        }
    }
}

impl fmt::Display for AggregationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "offline" => Ok(AggregationMode::Offline),
            "room" => Ok(AggregationMode::Room),
            other => Err(format!("unknown aggregation mode '{}'", other)),
        }
    }
}
