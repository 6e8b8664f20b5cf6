//! End-to-end scenarios across the aggregation, merge, executor and GPU layers.

use std::sync::Arc;
use std::time::Instant;
use utterflow::aggregation::forward_merge::decide;
use utterflow::aggregation::{
    AggregationTuning, ForwardMergeConfig, StreamAction, decide_action, dedup_merge_precise,
};
use utterflow::gpu::{GpuArbiterConfig, SkipReason};
use utterflow::pipeline::{PipelineMode, StationRunner, TracingReporter};
use utterflow::{
    Config, EdgeNode, GpuArbiter, LeaseOutcome, LeaseRequest, MockClock, ServiceType, TaskOutcome,
    Utterance, UtteranceRecord,
};

fn tuning_500() -> AggregationTuning {
    AggregationTuning {
        silence_threshold_ms: 500,
        ..AggregationTuning::default()
    }
}

#[test]
fn scenario_a_short_gap_merges() {
    let last = Utterance::new("we are", 0, 1000);
    let current = Utterance::new("going home", 1200, 1900);
    assert_eq!(
        decide_action(Some(&last), &current, &tuning_500(), 1000),
        StreamAction::Merge
    );
}

#[test]
fn scenario_b_pause_overrides_timing() {
    let last = Utterance::new("we are", 0, 1000).pause_triggered();
    let current = Utterance::new("going home", 1200, 1900);
    assert_eq!(
        decide_action(Some(&last), &current, &tuning_500(), 1000),
        StreamAction::NewStream
    );
}

#[test]
fn scenario_c_two_chars_are_discarded() {
    let config = ForwardMergeConfig {
        min_length_to_keep: 6,
        ..ForwardMergeConfig::default()
    };
    assert!(decide(&config, "ab", false, Instant::now()).is_discard());
    assert!(decide(&config, "ab", true, Instant::now()).is_discard());
}

#[test]
fn scenario_d_overlap_is_stripped() {
    let result = dedup_merge_precise("hello ", "hello world");
    assert_eq!(result.text, "world");
    assert!(result.deduped);
    assert_eq!(result.overlap_chars, 6);

    let (merged, _) = utterflow::aggregation::dedup::append_deduped("hello ", "hello world", "en");
    assert_eq!(merged, "hello world");
}

#[tokio::test(start_paused = true)]
async fn scenario_e_full_gpu_queue_skips() {
    let arbiter = GpuArbiter::new(GpuArbiterConfig {
        default_queue_limit: 1,
        ..GpuArbiterConfig::default()
    });
    let _holder = arbiter.acquire(LeaseRequest::new(ServiceType::Asr)).await.unwrap();

    let waiting = {
        let arbiter = arbiter.clone();
        tokio::spawn(async move {
            arbiter
                .acquire(LeaseRequest::new(ServiceType::Tts).with_timeout_ms(60_000))
                .await
        })
    };
    tokio::task::yield_now().await;

    let outcome = arbiter.acquire(LeaseRequest::new(ServiceType::Nmt)).await.unwrap();
    assert!(matches!(
        outcome,
        LeaseOutcome::Skipped {
            reason: SkipReason::QueueFull
        }
    ));
    waiting.abort();
}

fn node(clock: &MockClock, mode: PipelineMode) -> EdgeNode {
    let mut config = Config::default();
    config.pipeline.mode = mode;
    config.aggregation.tuning = Some(tuning_500());
    EdgeNode::with_clock(config, Arc::new(clock.clone())).unwrap()
}

fn record(index: u64, utterance: Utterance) -> UtteranceRecord {
    UtteranceRecord::new("room-1", index, utterance.with_lang("en"))
}

#[tokio::test]
async fn committed_text_is_translated_in_order() {
    let clock = MockClock::new();
    let node = Arc::new(node(&clock, PipelineMode::Translate));

    let mut ready = Vec::new();
    let inputs = [
        Utterance::new("the meeting starts at nine tomorrow morning sharp", 0, 1500).final_result(),
        Utterance::new("please bring the quarterly report and the slides", 3000, 4500).final_result(),
        Utterance::new("and the budget spreadsheet as well if you can", 6000, 7500).final_result(),
    ];
    for (index, utterance) in inputs.into_iter().enumerate() {
        let report = node.handle_utterance(&record(index as u64, utterance));
        ready.extend(report.ready);
    }
    assert_eq!(ready.len(), 3);

    // Submit in reverse; completion still follows utterance order.
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for text in ready.into_iter().rev() {
        let node = node.clone();
        let order = order.clone();
        handles.push(tokio::spawn(async move {
            let index = text.utterance_index;
            node.dispatch("room-1", index, ServiceType::Nmt, move || async move {
                order.lock().push(index);
                format!("fr:{}", text.text)
            })
            .await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_completed());
    }
    assert_eq!(*order.lock(), vec![0, 1, 2]);
}

#[tokio::test]
async fn merged_away_indices_never_block_later_ones() {
    let clock = MockClock::new();
    let node = node(&clock, PipelineMode::TranslateAndSpeak);

    node.handle_utterance(&record(0, Utterance::new("so what I wanted", 0, 900)));
    node.handle_utterance(&record(1, Utterance::new("to say is that", 1000, 1800)));
    let report = node.handle_utterance(&record(
        2,
        Utterance::new("the release slips a week", 1900, 3000).manual_cut(),
    ));
    assert_eq!(report.outcome.superseded, vec![0, 1]);
    assert_eq!(report.ready.len(), 1);
    assert_eq!(report.ready[0].utterance_index, 2);

    // A late task for a merged-away index is cancelled, not run.
    let late = node
        .dispatch("room-1", 0, ServiceType::Tts, || async { "late" })
        .await;
    assert!(late.is_cancelled());

    let outcome = node
        .dispatch("room-1", 2, ServiceType::Tts, || async { "spoken" })
        .await;
    assert_eq!(outcome, TaskOutcome::Completed("spoken"));
}

#[test]
fn station_feeds_node_engine_in_arrival_order() {
    let clock = MockClock::new();
    let node = node(&clock, PipelineMode::AsrOnly);

    let (in_tx, in_rx) = crossbeam_channel::bounded(4);
    let (out_tx, out_rx) = crossbeam_channel::bounded(4);
    let runner = StationRunner::spawn(
        node.aggregation_station(),
        in_rx,
        out_tx,
        Arc::new(TracingReporter),
    );

    in_tx
        .send(record(0, Utterance::new("first sentence here", 0, 800).final_result()))
        .unwrap();
    in_tx
        .send(record(1, Utterance::new("second sentence here", 2000, 2800).final_result()))
        .unwrap();
    drop(in_tx);

    let texts: Vec<String> = out_rx
        .iter()
        .flat_map(|aggregated| aggregated.outcome.commits)
        .map(|commit| commit.text)
        .collect();
    runner.join().unwrap();

    assert_eq!(texts, vec!["first sentence here", "second sentence here"]);
}
