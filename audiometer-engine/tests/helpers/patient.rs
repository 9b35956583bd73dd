//! Simulated patient
//!
//! Presses the response latch while a tone is playing whenever the level
//! reaches the patient's threshold for that ear and frequency. Can cancel
//! the session or fail like an unplugged device when a given combination
//! starts, or cancel the moment a tone stops.

use audiometer_common::Ear;
use audiometer_engine::audio::AudioStream;
use audiometer_engine::latch::ResponseLatch;
use audiometer_engine::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct SimulatedPatient {
    latch: Arc<ResponseLatch>,
    thresholds: HashMap<(Ear, u32), Option<i32>>,
    default_threshold: Option<i32>,
    /// Every presentation as (ear, frequency, level)
    pub presentations: Vec<(Ear, u32, i32)>,
    /// Distinct combinations in the order they were first presented
    pub combinations: Vec<(Ear, u32)>,
    cancel_at: Option<(usize, CancellationToken)>,
    cancel_on_stop: Option<CancellationToken>,
    fail_at: Option<usize>,
    playing: bool,
}

impl SimulatedPatient {
    /// Patient hearing everything at or above `threshold` dBHL
    pub fn uniform(latch: Arc<ResponseLatch>, threshold: Option<i32>) -> Self {
        Self {
            latch,
            thresholds: HashMap::new(),
            default_threshold: threshold,
            presentations: Vec::new(),
            combinations: Vec::new(),
            cancel_at: None,
            cancel_on_stop: None,
            fail_at: None,
            playing: false,
        }
    }

    /// Override one combination; `None` never hears it
    pub fn with_threshold(mut self, ear: Ear, frequency_hz: u32, threshold: Option<i32>) -> Self {
        self.thresholds.insert((ear, frequency_hz), threshold);
        self
    }

    /// Cancel when the combination with this index (0-based) starts
    pub fn cancel_at_combination(mut self, index: usize, cancel: CancellationToken) -> Self {
        self.cancel_at = Some((index, cancel));
        self
    }

    /// Cancel right after the first tone ends, inside its response window
    pub fn cancel_on_stop(mut self, cancel: CancellationToken) -> Self {
        self.cancel_on_stop = Some(cancel);
        self
    }

    /// Fail `start` once the combination with this index (0-based) is reached
    pub fn fail_at_combination(mut self, index: usize) -> Self {
        self.fail_at = Some(index);
        self
    }

    fn threshold(&self, ear: Ear, frequency_hz: u32) -> Option<i32> {
        self.thresholds
            .get(&(ear, frequency_hz))
            .copied()
            .unwrap_or(self.default_threshold)
    }
}

impl AudioStream for SimulatedPatient {
    fn start(&mut self, ear: Ear, frequency_hz: u32, level_db: i32) -> Result<()> {
        assert!(!self.playing, "start while a tone is playing");

        if !self.combinations.contains(&(ear, frequency_hz)) {
            self.combinations.push((ear, frequency_hz));
        }
        let index = self.combinations.len() - 1;

        if self.fail_at == Some(index) {
            return Err(Error::Device("output device disappeared".to_string()));
        }
        if let Some((at, cancel)) = &self.cancel_at {
            if *at == index {
                cancel.cancel();
            }
        }

        self.playing = true;
        self.presentations.push((ear, frequency_hz, level_db));
        if self
            .threshold(ear, frequency_hz)
            .is_some_and(|threshold| level_db >= threshold)
        {
            self.latch.notify_pressed();
            self.latch.notify_released();
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.playing = false;
        if let Some(cancel) = &self.cancel_on_stop {
            cancel.cancel();
        }
        Ok(())
    }
}
