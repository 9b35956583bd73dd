//! Test helpers for audiometer-engine integration tests
//!
//! - SimulatedPatient: an [`AudioStream`] that answers through the latch
//! - fast_config: configurations with millisecond timing

#![allow(dead_code)]

pub mod patient;

pub use patient::SimulatedPatient;

use audiometer_common::{Ear, TestConfiguration};

/// Configuration with near-zero timing and fixed ear order
pub fn fast_config(frequencies: &[u32], ears: &[Ear]) -> TestConfiguration {
    TestConfiguration {
        frequencies: frequencies.to_vec(),
        ears: ears.to_vec(),
        tone_duration_secs: 0.001,
        tolerance_secs: 0.0,
        pause_min_secs: 0.0,
        pause_max_secs: 0.0,
        randomize_ear_order: false,
        ..TestConfiguration::default()
    }
}
