//! Orchestrator integration tests with a simulated patient
//!
//! Tones last a millisecond and pauses are zero, so full sessions run in
//! well under a second.

mod helpers;

use audiometer_common::events::{EventBus, TestEvent};
use audiometer_common::results::{parse_csv, CsvResultSink, ResultSink};
use audiometer_common::{
    Ear, NoResponseReason, SessionStatus, TestConfiguration, ThresholdOutcome, ThresholdRecord,
};
use audiometer_engine::latch::ResponseLatch;
use audiometer_engine::orchestrator::TestOrchestrator;
use audiometer_engine::Error;
use helpers::{fast_config, SimulatedPatient};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

fn orchestrator(config: TestConfiguration, latch: &Arc<ResponseLatch>) -> TestOrchestrator {
    TestOrchestrator::new(config, Arc::clone(latch), CancellationToken::new()).unwrap()
}

fn drain(rx: &mut broadcast::Receiver<TestEvent>) -> Vec<TestEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[test]
fn test_right_1000_and_left_8000_scenario() {
    let latch = Arc::new(ResponseLatch::new());
    let config = fast_config(&[1000, 8000], &[Ear::Right, Ear::Left]);
    let mut patient = SimulatedPatient::uniform(Arc::clone(&latch), Some(30))
        .with_threshold(Ear::Right, 1000, Some(25))
        .with_threshold(Ear::Left, 8000, None);

    let report = orchestrator(config, &latch).run(&mut patient).unwrap();

    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(report.progress, 1.0);
    assert_eq!(
        report.record_for(Ear::Right, 1000).map(|r| r.outcome),
        Some(ThresholdOutcome::Threshold { level_db: 25 })
    );
    assert_eq!(
        report.record_for(Ear::Left, 8000).map(|r| r.outcome),
        Some(ThresholdOutcome::NoResponse {
            reason: NoResponseReason::SafetyLimitReached
        })
    );
    assert!(patient.presentations.iter().all(|(_, _, level)| *level <= 80));
}

#[test]
fn test_every_combination_measured_once() {
    let latch = Arc::new(ResponseLatch::new());
    let mut config = fast_config(&[1000, 2000, 4000, 500], &[Ear::Right, Ear::Left]);
    config.randomize_ear_order = true;
    let mut patient = SimulatedPatient::uniform(Arc::clone(&latch), Some(35));

    let report = orchestrator(config, &latch)
        .with_seed(11)
        .run(&mut patient)
        .unwrap();

    assert_eq!(report.records.len(), 8);
    let combinations: HashSet<_> = report
        .records
        .iter()
        .map(|r| (r.ear, r.frequency_hz))
        .collect();
    assert_eq!(combinations.len(), 8);
    assert!(report.records.iter().all(|r| r.level() == Some(35)));

    // One ear is finished before the other starts
    let first_ear = patient.combinations[0].0;
    assert!(patient.combinations[..4].iter().all(|(ear, _)| *ear == first_ear));
    assert!(patient.combinations[4..].iter().all(|(ear, _)| *ear != first_ear));
}

#[test]
fn test_frequency_order_follows_configuration() {
    let latch = Arc::new(ResponseLatch::new());
    let config = fast_config(&[4000, 500, 1000], &[Ear::Left]);
    let mut patient = SimulatedPatient::uniform(Arc::clone(&latch), Some(20));

    orchestrator(config, &latch).run(&mut patient).unwrap();

    assert_eq!(
        patient.combinations,
        vec![(Ear::Left, 4000), (Ear::Left, 500), (Ear::Left, 1000)]
    );
}

#[test]
fn test_progress_is_monotonic_and_completes() {
    let latch = Arc::new(ResponseLatch::new());
    let config = fast_config(&[1000, 2000], &[Ear::Right, Ear::Left]);
    let events = EventBus::new(4096);
    let mut rx = events.subscribe();
    let mut patient = SimulatedPatient::uniform(Arc::clone(&latch), Some(10));

    let orchestrator = orchestrator(config, &latch).with_events(events);
    let snapshot = orchestrator.subscribe();
    orchestrator.run(&mut patient).unwrap();

    let progress: Vec<(usize, f64)> = drain(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            TestEvent::ProgressUpdated {
                completed,
                progress,
                ..
            } => Some((completed, progress)),
            _ => None,
        })
        .collect();

    assert!(progress.windows(2).all(|w| w[0].1 <= w[1].1));
    assert!(progress[..progress.len() - 1].iter().all(|(_, p)| *p < 1.0));
    assert_eq!(progress.last(), Some(&(4, 1.0)));

    let last = snapshot.borrow().clone();
    assert_eq!(last.status, SessionStatus::Completed);
    assert_eq!(last.progress, 1.0);
    assert!(last.finished_at.is_some());
}

#[test]
fn test_event_sequence() {
    let latch = Arc::new(ResponseLatch::new());
    let config = fast_config(&[1000], &[Ear::Right]);
    let events = EventBus::new(1024);
    let mut rx = events.subscribe();
    let mut patient = SimulatedPatient::uniform(Arc::clone(&latch), Some(25));

    orchestrator(config, &latch)
        .with_events(events)
        .run(&mut patient)
        .unwrap();

    let names: Vec<&str> = drain(&mut rx).iter().map(TestEvent::event_type).collect();
    assert_eq!(names.first(), Some(&"SessionStarted"));
    assert_eq!(names[1], "EarChanged");
    assert_eq!(names[2], "FrequencyChanged");
    assert_eq!(
        names.iter().filter(|n| **n == "TonePresented").count(),
        patient.presentations.len()
    );
    assert_eq!(names.last(), Some(&"SessionFinished"));
}

#[test]
fn test_cancellation_keeps_completed_records() {
    let latch = Arc::new(ResponseLatch::new());
    let cancel = CancellationToken::new();
    let config = fast_config(&[1000, 2000, 4000], &[Ear::Right, Ear::Left]);
    let mut patient = SimulatedPatient::uniform(Arc::clone(&latch), Some(25))
        .cancel_at_combination(2, cancel.clone());

    let report = TestOrchestrator::new(config, Arc::clone(&latch), cancel)
        .unwrap()
        .run(&mut patient)
        .unwrap();

    assert_eq!(report.status, SessionStatus::Cancelled);
    assert_eq!(report.records.len(), 2);
    assert!(report.record_for(Ear::Right, 4000).is_none());
    assert!(report.progress < 1.0);
    // The interrupted combination got exactly one tone
    let interrupted = patient
        .presentations
        .iter()
        .filter(|(ear, f, _)| *ear == Ear::Right && *f == 4000)
        .count();
    assert_eq!(interrupted, 1);
}

#[test]
fn test_stop_during_response_window_records_nothing() {
    let latch = Arc::new(ResponseLatch::new());
    let cancel = CancellationToken::new();
    let mut config = fast_config(&[1000], &[Ear::Right]);
    config.start_level_db = 80;
    config.tolerance_secs = 1.0;
    // Never hears; a missed window at the ceiling would end the search
    let mut patient =
        SimulatedPatient::uniform(Arc::clone(&latch), None).cancel_on_stop(cancel.clone());

    let report = TestOrchestrator::new(config, Arc::clone(&latch), cancel)
        .unwrap()
        .run(&mut patient)
        .unwrap();

    assert_eq!(report.status, SessionStatus::Cancelled);
    assert!(report.records.is_empty());
    assert_eq!(patient.presentations.len(), 1);
}

#[test]
fn test_device_error_fails_session() {
    let latch = Arc::new(ResponseLatch::new());
    let config = fast_config(&[1000, 2000], &[Ear::Right, Ear::Left]);
    let mut patient = SimulatedPatient::uniform(Arc::clone(&latch), Some(25)).fail_at_combination(1);

    let failure = orchestrator(config, &latch).run(&mut patient).unwrap_err();

    assert!(matches!(failure.error, Error::Device(_)));
    assert_eq!(failure.report.status, SessionStatus::Failed);
    assert_eq!(
        failure.report.records,
        vec![ThresholdRecord::threshold(Ear::Right, 1000, 25)]
    );
    assert!(failure.report.error.is_some());
}

#[test]
fn test_invalid_configuration_rejected() {
    let latch = Arc::new(ResponseLatch::new());
    let mut config = fast_config(&[1000], &[Ear::Right]);
    config.large_step_db = 0;

    let result = TestOrchestrator::new(config, latch, CancellationToken::new());
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_resume_skips_measured_combinations() {
    let latch = Arc::new(ResponseLatch::new());
    let config = fast_config(&[1000, 2000], &[Ear::Right, Ear::Left]);
    let prior = vec![
        ThresholdRecord::threshold(Ear::Right, 1000, 15),
        ThresholdRecord::no_response(Ear::Left, 2000, NoResponseReason::SafetyLimitReached),
        // Not part of this configuration
        ThresholdRecord::threshold(Ear::Left, 6000, 50),
    ];
    let mut patient = SimulatedPatient::uniform(Arc::clone(&latch), Some(40));

    let orchestrator = orchestrator(config, &latch).with_prior_records(&prior);
    assert_eq!(orchestrator.report().records.len(), 2);
    assert_eq!(orchestrator.report().progress, 0.5);

    let report = orchestrator.run(&mut patient).unwrap();

    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(report.records.len(), 4);
    assert_eq!(report.record_for(Ear::Right, 1000).and_then(|r| r.level()), Some(15));
    assert_eq!(
        patient.combinations,
        vec![(Ear::Right, 2000), (Ear::Left, 1000)]
    );
}

#[test]
fn test_resume_remeasures_out_of_range_levels() {
    let latch = Arc::new(ResponseLatch::new());
    let config = fast_config(&[1000, 2000], &[Ear::Right]);
    let prior = vec![
        ThresholdRecord::threshold(Ear::Right, 1000, 500),
        ThresholdRecord::threshold(Ear::Right, 2000, -10),
    ];
    let mut patient = SimulatedPatient::uniform(Arc::clone(&latch), Some(40));

    let orchestrator = orchestrator(config, &latch).with_prior_records(&prior);
    assert!(orchestrator.report().records.is_empty());
    assert_eq!(orchestrator.report().progress, 0.0);

    let report = orchestrator.run(&mut patient).unwrap();

    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(report.record_for(Ear::Right, 1000).and_then(|r| r.level()), Some(40));
    assert_eq!(report.record_for(Ear::Right, 2000).and_then(|r| r.level()), Some(40));
    assert_eq!(
        patient.combinations,
        vec![(Ear::Right, 1000), (Ear::Right, 2000)]
    );
}

#[test]
fn test_sink_receives_each_record() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(CsvResultSink::new(dir.path().join("result.csv")));
    let latch = Arc::new(ResponseLatch::new());
    let config = fast_config(&[1000, 4000], &[Ear::Left]);
    let mut patient = SimulatedPatient::uniform(Arc::clone(&latch), Some(45));

    orchestrator(config, &latch)
        .with_sink(Arc::clone(&sink) as Arc<dyn ResultSink>)
        .run(&mut patient)
        .unwrap();

    let csv = std::fs::read_to_string(sink.csv_path()).unwrap();
    assert_eq!(
        parse_csv(&csv).unwrap(),
        vec![
            ThresholdRecord::threshold(Ear::Left, 1000, 45),
            ThresholdRecord::threshold(Ear::Left, 4000, 45),
        ]
    );
    assert!(csv.ends_with("45,4000,left\r\n"));
}
