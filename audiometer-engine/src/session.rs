//! Session runner
//!
//! Starts an orchestrator on a blocking thread, wires it to the shared
//! state and persists the outcome (CSV + JSON summary while running,
//! SQLite history once finished). One session at a time. A session whose
//! thread panics is still persisted, as FAILED with the records it had.

use crate::audio::{AudioStream, ToneOutput};
use crate::error::{Error, Result};
use crate::orchestrator::TestOrchestrator;
use crate::state::{SessionHandle, SharedState};
use audiometer_common::config::OutputSettings;
use audiometer_common::events::TestEvent;
use audiometer_common::results::{CsvResultSink, ResultSink};
use audiometer_common::{db, SessionReport, SessionStatus, TestConfiguration, ThresholdRecord};
use chrono::{Local, Utc};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Opens the audio stream on the session thread
pub type StreamFactory =
    Arc<dyn Fn(&OutputSettings) -> Result<Box<dyn AudioStream>> + Send + Sync>;

/// Everything needed to start one session
#[derive(Debug, Clone, Default)]
pub struct SessionRequest {
    pub config: TestConfiguration,
    pub subject: Option<String>,
    /// Records of an interrupted session to resume
    pub prior_records: Vec<ThresholdRecord>,
    /// Fixed seed for ear order and pauses
    pub seed: Option<u64>,
}

/// Launches sessions and persists their results
#[derive(Clone)]
pub struct SessionRunner {
    stream_factory: StreamFactory,
    results_dir: Option<PathBuf>,
    db_pool: Option<SqlitePool>,
}

impl SessionRunner {
    pub fn new(stream_factory: StreamFactory) -> Self {
        Self {
            stream_factory,
            results_dir: None,
            db_pool: None,
        }
    }

    /// Runner playing tones through cpal
    pub fn with_sound_card() -> Self {
        Self::new(Arc::new(|settings: &OutputSettings| -> Result<Box<dyn AudioStream>> {
            let output = ToneOutput::open(settings)?;
            Ok(Box::new(output) as Box<dyn AudioStream>)
        }))
    }

    /// Write CSV results below this folder
    pub fn with_results_dir(mut self, dir: PathBuf) -> Self {
        self.results_dir = Some(dir);
        self
    }

    /// Record finished sessions in the history database
    pub fn with_database(mut self, pool: SqlitePool) -> Self {
        self.db_pool = Some(pool);
        self
    }

    pub fn db_pool(&self) -> Option<&SqlitePool> {
        self.db_pool.as_ref()
    }

    /// Start a session in the background
    ///
    /// # Errors
    /// - [`Error::Config`] if the configuration is invalid
    /// - [`Error::InvalidState`] if a session is already running
    /// - I/O errors creating the results folder; the session then ends
    ///   FAILED right away
    pub async fn start(&self, state: &Arc<SharedState>, request: SessionRequest) -> Result<Uuid> {
        let cancel = CancellationToken::new();
        let output_settings = request.config.output.clone();

        let mut orchestrator =
            TestOrchestrator::new(request.config, Arc::clone(&state.latch), cancel.clone())?
                .with_events(state.events.clone())
                .with_subject(request.subject.clone())
                .with_prior_records(&request.prior_records);
        if let Some(seed) = request.seed {
            orchestrator = orchestrator.with_seed(seed);
        }

        let session_id = orchestrator.session_id();
        let handle = SessionHandle {
            session_id,
            cancel,
            snapshot: orchestrator.subscribe(),
        };
        // From here on a stop request reaches this session
        if !state.begin_session(handle).await {
            return Err(Error::InvalidState("a session is already running".to_string()));
        }

        let mut sink = None;
        if let Some(dir) = &self.results_dir {
            match CsvResultSink::for_session(dir, request.subject.as_deref(), Local::now()) {
                Ok(csv) => sink = Some(Arc::new(csv)),
                Err(e) => {
                    let failure = orchestrator.abort(e.into());
                    state.end_session();
                    return Err(failure.error);
                }
            }
        }
        if let Some(sink) = &sink {
            orchestrator = orchestrator.with_sink(Arc::clone(sink) as Arc<dyn ResultSink>);
        }

        let publisher = orchestrator.publisher();
        let factory = Arc::clone(&self.stream_factory);
        let db_pool = self.db_pool.clone();
        let task_state = Arc::clone(state);

        // Held until the task is stored so a fast session cannot let the
        // next one store its task first
        let mut task_slot = state.task_slot().await;
        *task_slot = Some(tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || match factory(&output_settings) {
                Ok(mut stream) => orchestrator.run(&mut *stream),
                Err(e) => Err(orchestrator.abort(e)),
            })
            .await;

            let report = match result {
                Ok(Ok(report)) => report,
                Ok(Err(failure)) => {
                    error!("{}", failure);
                    failure.report
                }
                Err(e) => {
                    error!("Session {} thread panicked: {}", session_id, e);
                    fail_abandoned_session(&publisher, &task_state, sink.as_deref())
                }
            };

            if let Some(pool) = db_pool {
                let csv_path = sink.as_ref().map(|s| s.csv_path());
                match db::save_session(&pool, &report, csv_path).await {
                    Ok(()) => info!("Session {} saved to history", report.session_id),
                    Err(e) => warn!("Failed to save session history: {}", e),
                }
            }
            task_state.end_session();
        }));
        drop(task_slot);

        info!("Session {} launched", session_id);
        Ok(session_id)
    }
}

/// Mark a session whose thread died as FAILED and persist what it measured
fn fail_abandoned_session(
    publisher: &watch::Sender<SessionReport>,
    state: &SharedState,
    sink: Option<&CsvResultSink>,
) -> SessionReport {
    let mut report = publisher.borrow().clone();
    report.status = SessionStatus::Failed;
    report.error = Some("session thread panicked".to_string());
    report.finished_at = Some(Utc::now());
    publisher.send_replace(report.clone());

    if let Some(sink) = sink {
        if let Err(e) = sink.persist(&report) {
            error!("Failed to persist session {}: {}", report.session_id, e);
        }
    }
    state.events.emit_lossy(TestEvent::SessionFinished {
        session_id: report.session_id,
        status: report.status,
        records: report.records.len(),
        timestamp: Utc::now(),
    });
    report
}
