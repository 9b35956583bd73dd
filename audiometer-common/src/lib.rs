//! # Audiometer Common Library
//!
//! Shared code for the audiometer workspace:
//! - Test configuration loading and validation
//! - Threshold records and session reports
//! - Test event types (TestEvent enum) and EventBus
//! - Result file format (CSV + JSON summary)
//! - Audiogram interpretation
//! - Session history database

pub mod config;
#[cfg(feature = "sqlx")]
pub mod db;
pub mod error;
pub mod events;
pub mod interpretation;
pub mod results;
pub mod types;

pub use config::TestConfiguration;
pub use error::{Error, Result};
pub use types::{Ear, NoResponseReason, SessionReport, SessionStatus, ThresholdOutcome, ThresholdRecord};
