//! Test event types and EventBus
//!
//! Events are emitted by the test engine while a session runs and are
//! serialized for SSE transmission to connected clients.

use crate::types::{Ear, SessionStatus, ThresholdOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Test event types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum TestEvent {
    /// Session entered RUNNING
    SessionStarted {
        session_id: Uuid,
        /// Ear order after optional shuffling
        ear_order: Vec<Ear>,
        frequencies: Vec<u32>,
        timestamp: DateTime<Utc>,
    },

    /// Testing moved to another ear
    EarChanged {
        ear: Ear,
        timestamp: DateTime<Utc>,
    },

    /// Testing moved to another frequency
    FrequencyChanged {
        ear: Ear,
        frequency_hz: u32,
        timestamp: DateTime<Utc>,
    },

    /// One tone window completed
    TonePresented {
        ear: Ear,
        frequency_hz: u32,
        level_db: i32,
        heard: bool,
        timestamp: DateTime<Utc>,
    },

    /// A combination finished its search
    ThresholdDetermined {
        ear: Ear,
        frequency_hz: u32,
        outcome: ThresholdOutcome,
        timestamp: DateTime<Utc>,
    },

    /// Progress fraction changed
    ProgressUpdated {
        completed: usize,
        total: usize,
        progress: f64,
        timestamp: DateTime<Utc>,
    },

    /// Session reached a terminal status
    SessionFinished {
        session_id: Uuid,
        status: SessionStatus,
        records: usize,
        timestamp: DateTime<Utc>,
    },
}

impl TestEvent {
    /// Event name used as the SSE `event:` field
    pub fn event_type(&self) -> &'static str {
        match self {
            TestEvent::SessionStarted { .. } => "SessionStarted",
            TestEvent::EarChanged { .. } => "EarChanged",
            TestEvent::FrequencyChanged { .. } => "FrequencyChanged",
            TestEvent::TonePresented { .. } => "TonePresented",
            TestEvent::ThresholdDetermined { .. } => "ThresholdDetermined",
            TestEvent::ProgressUpdated { .. } => "ProgressUpdated",
            TestEvent::SessionFinished { .. } => "SessionFinished",
        }
    }
}

/// Event distribution bus
///
/// Uses tokio::broadcast internally: publishing never blocks the test
/// thread, slow subscribers observe `Lagged` instead.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TestEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<TestEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscriber is listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: TestEvent,
    ) -> Result<usize, broadcast::error::SendError<TestEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring the no-subscriber case
    pub fn emit_lossy(&self, event: TestEvent) {
        let _ = self.tx.send(event);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
