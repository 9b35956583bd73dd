//! Test orchestrator
//!
//! Runs the threshold search over every (ear, frequency) combination and
//! owns the session: status, records, progress. Runs on a blocking thread;
//! the outside world sees it only through
//! - a [`watch`] snapshot of the [`SessionReport`]
//! - [`TestEvent`]s on the [`EventBus`]
//! - the [`CancellationToken`] it was given
//!
//! Cancellation is cooperative: it is checked before every presentation and
//! during the tolerance wait, never in the middle of a tone.

use crate::audio::AudioStream;
use crate::error::{Error, Result};
use crate::finder::{find_threshold, Presenter, SearchParams};
use crate::latch::ResponseLatch;
use crate::window::{ToneWindow, WindowTiming};
use audiometer_common::events::{EventBus, TestEvent};
use audiometer_common::results::ResultSink;
use audiometer_common::{
    Ear, SessionReport, SessionStatus, TestConfiguration, ThresholdOutcome, ThresholdRecord,
};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// A session that ended FAILED, with everything measured before the error
#[derive(Debug)]
pub struct SessionFailure {
    pub report: SessionReport,
    pub error: Error,
}

impl std::fmt::Display for SessionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "session {} failed after {} record(s): {}",
            self.report.session_id,
            self.report.records.len(),
            self.error
        )
    }
}

impl std::error::Error for SessionFailure {}

/// Sequences threshold searches for one session
pub struct TestOrchestrator {
    config: TestConfiguration,
    latch: Arc<ResponseLatch>,
    cancel: CancellationToken,
    events: EventBus,
    snapshot: Arc<watch::Sender<SessionReport>>,
    report: SessionReport,
    sink: Option<Arc<dyn ResultSink>>,
    rng: StdRng,
}

impl TestOrchestrator {
    /// Validate the configuration and prepare a session
    ///
    /// # Errors
    /// [`Error::Config`] if the configuration is invalid; no session exists
    /// in that case.
    pub fn new(
        config: TestConfiguration,
        latch: Arc<ResponseLatch>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;
        let report = SessionReport::new(Uuid::new_v4(), None);
        let (snapshot, _) = watch::channel(report.clone());
        let snapshot = Arc::new(snapshot);
        Ok(Self {
            config,
            latch,
            cancel,
            events: EventBus::new(100),
            snapshot,
            report,
            sink: None,
            rng: StdRng::from_entropy(),
        })
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_subject(mut self, subject: Option<String>) -> Self {
        self.report.subject = subject;
        self.publish();
        self
    }

    /// Persist the session after every record and once finished
    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Deterministic ear order and pauses
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Carry over records of an interrupted session
    ///
    /// Combinations already measured are skipped and count as completed.
    /// Records for combinations outside this configuration, or with a level
    /// outside 0..=safety ceiling, are dropped and measured again.
    pub fn with_prior_records(mut self, records: &[ThresholdRecord]) -> Self {
        let ceiling = self.config.safety_ceiling_db;
        for record in records {
            let configured = self.config.ears.contains(&record.ear)
                && self.config.frequencies.contains(&record.frequency_hz);
            if !configured {
                warn!(
                    "Ignoring prior record {} ear {} Hz: not in this configuration",
                    record.ear, record.frequency_hz
                );
                continue;
            }
            if let Some(level) = record.level().filter(|l| !(0..=ceiling).contains(l)) {
                warn!(
                    "Ignoring prior record {} ear {} Hz: {} dBHL outside 0..={}",
                    record.ear, record.frequency_hz, level, ceiling
                );
                continue;
            }
            if self.report.record_for(record.ear, record.frequency_hz).is_none() {
                self.report.records.push(*record);
            }
        }
        self.update_progress();
        self.publish();
        self
    }

    pub fn session_id(&self) -> Uuid {
        self.report.session_id
    }

    /// Receiver for session snapshots
    pub fn subscribe(&self) -> watch::Receiver<SessionReport> {
        self.snapshot.subscribe()
    }

    /// Sender behind [`subscribe`](Self::subscribe), for publishing a
    /// final report if the session thread dies without finishing
    pub fn publisher(&self) -> Arc<watch::Sender<SessionReport>> {
        Arc::clone(&self.snapshot)
    }

    pub fn report(&self) -> &SessionReport {
        &self.report
    }

    /// completed / total, held below 1.0 until the session is COMPLETED
    fn update_progress(&mut self) {
        let total = self.config.combination_count();
        let completed = self.report.records.len();
        if completed < total {
            self.report.progress = completed as f64 / total as f64;
        }
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.report.clone());
    }

    fn persist(&self) {
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.persist(&self.report) {
                error!("Failed to persist session {}: {}", self.report.session_id, e);
            }
        }
    }

    /// Run the session to a terminal status
    ///
    /// CANCELLED and COMPLETED sessions are returned as `Ok`; a device error
    /// ends the session FAILED and is returned with the partial report.
    pub fn run<S: AudioStream + ?Sized>(
        mut self,
        stream: &mut S,
    ) -> std::result::Result<SessionReport, SessionFailure> {
        let mut ears = self.config.ears.clone();
        if self.config.randomize_ear_order {
            ears.shuffle(&mut self.rng);
        }
        let total = self.config.combination_count();

        info!(
            "Session {} started: ears {:?}, {} frequencies, {} already measured",
            self.report.session_id,
            ears,
            self.config.frequencies.len(),
            self.report.records.len()
        );
        self.publish();
        self.events.emit_lossy(TestEvent::SessionStarted {
            session_id: self.report.session_id,
            ear_order: ears.clone(),
            frequencies: self.config.frequencies.clone(),
            timestamp: Utc::now(),
        });

        let params = SearchParams::from(&self.config);
        let window = ToneWindow::new(
            Arc::clone(&self.latch),
            WindowTiming::from(&self.config),
            self.cancel.clone(),
            StdRng::seed_from_u64(self.rng.gen()),
        );
        let mut presenter = WindowPresenter {
            window,
            stream,
            events: self.events.clone(),
        };

        let mut outcome: Result<()> = Ok(());
        'ears: for ear in ears {
            let pending: Vec<u32> = self
                .config
                .frequencies
                .iter()
                .copied()
                .filter(|f| self.report.record_for(ear, *f).is_none())
                .collect();
            if pending.is_empty() {
                continue;
            }
            self.events.emit_lossy(TestEvent::EarChanged {
                ear,
                timestamp: Utc::now(),
            });

            for frequency_hz in pending {
                if self.cancel.is_cancelled() {
                    break 'ears;
                }
                self.events.emit_lossy(TestEvent::FrequencyChanged {
                    ear,
                    frequency_hz,
                    timestamp: Utc::now(),
                });

                match find_threshold(params, ear, frequency_hz, &mut presenter) {
                    Ok(Some(result)) => self.record(ear, frequency_hz, result, total),
                    Ok(None) => break 'ears,
                    Err(e) => {
                        outcome = Err(e);
                        break 'ears;
                    }
                }
            }
        }

        let status = match (&outcome, self.report.records.len() == total) {
            (Err(_), _) => SessionStatus::Failed,
            (Ok(()), true) => SessionStatus::Completed,
            (Ok(()), false) => SessionStatus::Cancelled,
        };
        self.finish(status, outcome.as_ref().err().map(|e| e.to_string()));

        match outcome {
            Ok(()) => Ok(self.report),
            Err(error) => Err(SessionFailure {
                report: self.report,
                error,
            }),
        }
    }

    /// End a session that could not start its audio output
    pub fn abort(mut self, error: Error) -> SessionFailure {
        error!("Session {} aborted: {}", self.report.session_id, error);
        self.finish(SessionStatus::Failed, Some(error.to_string()));
        SessionFailure {
            report: self.report,
            error,
        }
    }

    fn record(&mut self, ear: Ear, frequency_hz: u32, result: ThresholdOutcome, total: usize) {
        match result.level() {
            Some(level) => info!("Threshold {} ear {} Hz: {} dBHL", ear, frequency_hz, level),
            None => info!("Threshold {} ear {} Hz: no response", ear, frequency_hz),
        }

        self.report.records.push(ThresholdRecord {
            ear,
            frequency_hz,
            outcome: result,
        });
        let completed = self.report.records.len();
        self.update_progress();
        self.publish();
        self.persist();

        self.events.emit_lossy(TestEvent::ThresholdDetermined {
            ear,
            frequency_hz,
            outcome: result,
            timestamp: Utc::now(),
        });
        // The final update comes from `finish` once the status is COMPLETED
        if completed < total {
            self.events.emit_lossy(TestEvent::ProgressUpdated {
                completed,
                total,
                progress: self.report.progress,
                timestamp: Utc::now(),
            });
        }
    }

    fn finish(&mut self, status: SessionStatus, error: Option<String>) {
        if status == SessionStatus::Completed {
            self.report.progress = 1.0;
            let total = self.config.combination_count();
            self.events.emit_lossy(TestEvent::ProgressUpdated {
                completed: total,
                total,
                progress: 1.0,
                timestamp: Utc::now(),
            });
        }
        self.report.status = status;
        self.report.error = error;
        self.report.finished_at = Some(Utc::now());
        self.publish();
        self.persist();

        info!(
            "Session {} {} with {} record(s)",
            self.report.session_id,
            status,
            self.report.records.len()
        );
        self.events.emit_lossy(TestEvent::SessionFinished {
            session_id: self.report.session_id,
            status,
            records: self.report.records.len(),
            timestamp: Utc::now(),
        });
    }
}

/// Adapts a tone window and stream to the search driver
struct WindowPresenter<'a, S: AudioStream + ?Sized> {
    window: ToneWindow,
    stream: &'a mut S,
    events: EventBus,
}

impl<S: AudioStream + ?Sized> Presenter for WindowPresenter<'_, S> {
    fn present(&mut self, ear: Ear, frequency_hz: u32, level_db: i32) -> Result<Option<bool>> {
        let Some(heard) = self
            .window
            .present(&mut *self.stream, ear, frequency_hz, level_db)?
        else {
            return Ok(None);
        };
        self.events.emit_lossy(TestEvent::TonePresented {
            ear,
            frequency_hz,
            level_db,
            heard,
            timestamp: Utc::now(),
        });
        Ok(Some(heard))
    }

    fn is_cancelled(&self) -> bool {
        self.window.is_cancelled()
    }
}
