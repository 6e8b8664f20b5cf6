//! Station wrapper running the aggregation engine on its own thread.

use crate::aggregation::engine::AggregationEngine;
use crate::aggregation::types::{AggregationOutcome, UtteranceRecord};
use crate::pipeline::{Station, StationError};
use std::sync::Arc;

/// An engine outcome tagged with the session it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedUtterance {
    pub session_id: Option<String>,
    pub utterance_index: u64,
    pub outcome: AggregationOutcome,
}

/// Feeds utterances to the engine in channel order.
///
/// Outcomes with neither commits nor superseded indices are not forwarded.
pub struct AggregationStation {
    engine: Arc<AggregationEngine>,
    flush_on_shutdown: Vec<String>,
}

impl AggregationStation {
    pub fn new(engine: Arc<AggregationEngine>) -> Self {
        Self {
            engine,
            flush_on_shutdown: Vec::new(),
        }
    }
}

impl Station for AggregationStation {
    type Input = UtteranceRecord;
    type Output = AggregatedUtterance;

    fn process(&mut self, input: UtteranceRecord) -> Result<Option<AggregatedUtterance>, StationError> {
        if input.utterance.end_ms < input.utterance.start_ms {
            return Err(StationError::Recoverable(format!(
                "utterance {} ends before it starts ({} < {})",
                input.utterance_index, input.utterance.end_ms, input.utterance.start_ms
            )));
        }

        let outcome = self.engine.process(&input);
        if let Some(session) = input.session()
            && !self.flush_on_shutdown.iter().any(|s| s == session)
        {
            self.flush_on_shutdown.push(session.to_string());
        }

        if outcome.commits.is_empty() && outcome.superseded.is_empty() {
            return Ok(None);
        }
        Ok(Some(AggregatedUtterance {
            session_id: input.session().map(str::to_string),
            utterance_index: input.utterance_index,
            outcome,
        }))
    }

    fn name(&self) -> &'static str {
        "Aggregation"
    }

    fn shutdown(&mut self) {
        for session in self.flush_on_shutdown.drain(..) {
            if let Some(commit) = self.engine.flush_session(&session) {
                tracing::debug!(
                    session_id = %session,
                    utterance_index = commit.utterance_index,
                    "pending text left at shutdown"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::engine::AggregationConfig;
    use crate::aggregation::types::Utterance;
    use crate::clock::MockClock;
    use crate::pipeline::{StationRunner, TracingReporter};
    use crossbeam_channel::bounded;

    #[test]
    fn test_station_preserves_arrival_order() {
        let engine = Arc::new(AggregationEngine::new(
            AggregationConfig::default(),
            Arc::new(MockClock::new()),
        ));
        let (in_tx, in_rx) = bounded(8);
        let (out_tx, out_rx) = bounded(8);
        let runner = StationRunner::spawn(
            AggregationStation::new(engine.clone()),
            in_rx,
            out_tx,
            Arc::new(TracingReporter),
        );

        in_tx
            .send(UtteranceRecord::new("s", 0, Utterance::new("good morning", 0, 800).manual_cut()))
            .unwrap();
        in_tx
            .send(UtteranceRecord::new("s", 1, Utterance::new("bad", 900, 500)))
            .unwrap();
        in_tx
            .send(UtteranceRecord::new("s", 2, Utterance::new("see you later", 900, 1500).final_result()))
            .unwrap();
        drop(in_tx);

        let outputs: Vec<AggregatedUtterance> = out_rx.iter().collect();
        runner.join().unwrap();

        let indices: Vec<u64> = outputs.iter().map(|o| o.utterance_index).collect();
        assert_eq!(indices, vec![0, 2]);
        assert_eq!(outputs[0].outcome.commits[0].text, "good morning");
        assert_eq!(outputs[1].outcome.commits[0].text, "see you later");
        assert_eq!(outputs[1].session_id.as_deref(), Some("s"));
    }
}
