//! Task and outcome types for the sequential executor.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::time::Instant;

/// Downstream service a task is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceType {
    Asr,
    Nmt,
    Tts,
    SemanticRepair,
}

impl ServiceType {
    pub const ALL: [ServiceType; 4] = [
        ServiceType::Asr,
        ServiceType::Nmt,
        ServiceType::Tts,
        ServiceType::SemanticRepair,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Asr => "ASR",
            ServiceType::Nmt => "NMT",
            ServiceType::Tts => "TTS",
            ServiceType::SemanticRepair => "SEMANTIC_REPAIR",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "ASR" => Ok(ServiceType::Asr),
            "NMT" => Ok(ServiceType::Nmt),
            "TTS" => Ok(ServiceType::Tts),
            "SEMANTIC_REPAIR" => Ok(ServiceType::SemanticRepair),
            other => Err(format!("unknown service type '{}'", other)),
        }
    }
}

/// How a submitted task was resolved. Every submission resolves exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome<T> {
    Completed(T),
    /// Superseded by a merge, flushed away, or the session ended.
    Cancelled { reason: String },
    /// Waited longer than the executor's `max_wait_ms` for its turn.
    TimedOut,
    /// The index was already dispatched, resolved or is a duplicate.
    Stale,
}

impl<T> TaskOutcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, TaskOutcome::Completed(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskOutcome::Cancelled { .. })
    }

    pub fn completed(self) -> Option<T> {
        match self {
            TaskOutcome::Completed(value) => Some(value),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> TaskOutcome<U> {
        match self {
            TaskOutcome::Completed(value) => TaskOutcome::Completed(f(value)),
            TaskOutcome::Cancelled { reason } => TaskOutcome::Cancelled { reason },
            TaskOutcome::TimedOut => TaskOutcome::TimedOut,
            TaskOutcome::Stale => TaskOutcome::Stale,
        }
    }
}

/// A unit of downstream work ordered by `utterance_index` within its
/// `(session_id, service_type)` lane.
pub struct SequentialTask<F> {
    pub session_id: String,
    pub utterance_index: u64,
    pub job_id: String,
    pub service_type: ServiceType,
    pub execute: F,
    pub timestamp: Instant,
    /// Runs after the task that already took `utterance_index`.
    pub continuation: bool,
}

impl<F> SequentialTask<F> {
    pub fn new(
        session_id: impl Into<String>,
        utterance_index: u64,
        service_type: ServiceType,
        execute: F,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            utterance_index,
            job_id: format!("job-{}", utterance_index),
            service_type,
            execute,
            timestamp: Instant::now(),
            continuation: false,
        }
    }

    /// Marks the task as a follow-up to work already dispatched for its index.
    pub fn continuation(mut self) -> Self {
        self.continuation = true;
        self
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = job_id.into();
        self
    }
}

impl<F> fmt::Debug for SequentialTask<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequentialTask")
            .field("session_id", &self.session_id)
            .field("utterance_index", &self.utterance_index)
            .field("job_id", &self.job_id)
            .field("service_type", &self.service_type)
            .field("continuation", &self.continuation)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_type_round_trips_through_str() {
        for service in ServiceType::ALL {
            assert_eq!(service.as_str().parse::<ServiceType>(), Ok(service));
        }
        assert_eq!("semantic-repair".parse::<ServiceType>(), Ok(ServiceType::SemanticRepair));
        assert!("ocr".parse::<ServiceType>().is_err());
    }

    #[test]
    fn test_service_type_serializes_upper_case() {
        let json = serde_json::to_string(&ServiceType::SemanticRepair).unwrap();
        assert_eq!(json, "\"SEMANTIC_REPAIR\"");
    }

    #[test]
    fn test_outcome_helpers() {
        let done: TaskOutcome<u32> = TaskOutcome::Completed(2);
        assert!(done.is_completed());
        assert_eq!(done.clone().map(|v| v * 10), TaskOutcome::Completed(20));
        assert_eq!(done.completed(), Some(2));

        let cancelled: TaskOutcome<u32> = TaskOutcome::Cancelled {
            reason: "merged".into(),
        };
        assert!(cancelled.is_cancelled());
        assert_eq!(cancelled.completed(), None);
    }

    #[tokio::test]
    async fn test_task_debug_omits_closure() {
        let task = SequentialTask::new("s1", 4, ServiceType::Tts, || async { 1 }).with_job_id("j4");
        let rendered = format!("{:?}", task);
        assert!(rendered.contains("j4"));
        assert!(rendered.contains("Tts"));
    }
}
