//! Result sink tests against a temporary results folder

use audiometer_common::results::{load_csv, load_prior_records, CsvResultSink, ResultSink};
use audiometer_common::{Ear, NoResponseReason, SessionReport, SessionStatus, ThresholdRecord};
use chrono::{Local, TimeZone};
use uuid::Uuid;

fn partial_report() -> SessionReport {
    let mut report = SessionReport::new(Uuid::new_v4(), Some("Jane/Doe".to_string()));
    report.status = SessionStatus::Cancelled;
    report.progress = 0.5;
    report.records = vec![
        ThresholdRecord::threshold(Ear::Right, 1000, 25),
        ThresholdRecord::no_response(Ear::Right, 4000, NoResponseReason::SafetyLimitReached),
    ];
    report
}

#[test]
fn test_sink_writes_subject_folder() {
    let dir = tempfile::tempdir().unwrap();
    let started = Local.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap();

    let sink = CsvResultSink::for_session(dir.path(), Some("Jane/Doe"), started).unwrap();
    assert_eq!(
        sink.csv_path(),
        dir.path().join("Jane_Doe").join("result_2024-05-01_09-30-00.csv")
    );

    sink.persist(&partial_report()).unwrap();
    assert!(sink.csv_path().exists());
    assert!(sink.summary_path().exists());
}

#[test]
fn test_partial_session_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let sink = CsvResultSink::new(dir.path().join("result.csv"));
    let report = partial_report();

    sink.persist(&report).unwrap();

    // CSV keeps confirmed thresholds only
    let records = load_csv(sink.csv_path()).unwrap();
    assert_eq!(records, vec![ThresholdRecord::threshold(Ear::Right, 1000, 25)]);

    // The JSON summary keeps everything, including status
    let summary: SessionReport =
        serde_json::from_str(&std::fs::read_to_string(sink.summary_path()).unwrap()).unwrap();
    assert_eq!(summary.records, report.records);
    assert_eq!(summary.status, SessionStatus::Cancelled);
}

#[test]
fn test_persist_overwrites_previous_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let sink = CsvResultSink::new(dir.path().join("result.csv"));
    let mut report = partial_report();

    sink.persist(&report).unwrap();
    report.records.push(ThresholdRecord::threshold(Ear::Left, 1000, 10));
    report.status = SessionStatus::Completed;
    sink.persist(&report).unwrap();

    let records = load_csv(sink.csv_path()).unwrap();
    assert_eq!(records.len(), 2);
    // No temporary files left behind
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn test_prior_records_prefer_summary() {
    let dir = tempfile::tempdir().unwrap();
    let sink = CsvResultSink::new(dir.path().join("result.csv"));
    sink.persist(&partial_report()).unwrap();

    // Summary present: NO_RESPONSE survives
    let records = load_prior_records(sink.csv_path()).unwrap();
    assert_eq!(records.len(), 2);

    // CSV only: thresholds alone
    std::fs::remove_file(sink.summary_path()).unwrap();
    let records = load_prior_records(sink.csv_path()).unwrap();
    assert_eq!(records, vec![ThresholdRecord::threshold(Ear::Right, 1000, 25)]);
}
