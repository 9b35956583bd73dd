//! Tone window
//!
//! One presentation: clear the latch, play the tone for the configured
//! duration, stop it, wait out the response tolerance if nothing was heard
//! yet, then read the latch. An inter-stimulus pause follows.
//!
//! Ordering:
//! - the latch is cleared strictly before `start`
//! - the latch is read strictly after `stop` plus the tolerance wait
//!
//! The hold itself is never interrupted; cancellation shortens only the
//! tolerance wait and the pause. A window whose tolerance wait was cut short
//! without a response has no result: the patient was never given the full
//! time to answer.

use crate::audio::AudioStream;
use crate::error::Result;
use crate::latch::ResponseLatch;
use audiometer_common::{Ear, TestConfiguration};
use rand::rngs::StdRng;
use rand::Rng;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Longest uninterrupted sleep while cancellation may arrive
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Timing of one presentation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowTiming {
    pub tone_duration: Duration,
    pub tolerance: Duration,
    pub pause_min: Duration,
    pub pause_max: Duration,
}

impl From<&TestConfiguration> for WindowTiming {
    fn from(config: &TestConfiguration) -> Self {
        let (pause_min, pause_max) = config.pause_range();
        Self {
            tone_duration: config.tone_duration(),
            tolerance: config.tolerance(),
            pause_min,
            pause_max,
        }
    }
}

/// Executes tone presentations against a latch and an audio stream
pub struct ToneWindow {
    latch: Arc<ResponseLatch>,
    timing: WindowTiming,
    cancel: CancellationToken,
    rng: StdRng,
}

impl ToneWindow {
    pub fn new(
        latch: Arc<ResponseLatch>,
        timing: WindowTiming,
        cancel: CancellationToken,
        rng: StdRng,
    ) -> Self {
        Self {
            latch,
            timing,
            cancel,
            rng,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Present one tone and report whether it was heard
    ///
    /// Returns `Ok(None)` if cancellation cut the tolerance wait short
    /// before any response; that window must not count as a miss.
    ///
    /// # Errors
    /// Device errors from `start` or `stop` propagate immediately; the
    /// latch is not read in that case.
    pub fn present<S: AudioStream + ?Sized>(
        &mut self,
        stream: &mut S,
        ear: Ear,
        frequency_hz: u32,
        level_db: i32,
    ) -> Result<Option<bool>> {
        self.latch.clear();

        stream.start(ear, frequency_hz, level_db)?;
        thread::sleep(self.timing.tone_duration);
        stream.stop()?;

        let interrupted = !self.latch.consume() && !self.wait_tolerance();

        let heard = self.latch.consume();
        if interrupted && !heard {
            trace!(
                "Window {} ear {} Hz {} dBHL interrupted by cancellation",
                ear,
                frequency_hz,
                level_db
            );
            return Ok(None);
        }
        trace!(
            "Window {} ear {} Hz {} dBHL: {}",
            ear,
            frequency_hz,
            level_db,
            if heard { "heard" } else { "not heard" }
        );

        self.pause();
        Ok(Some(heard))
    }

    /// Wait up to the tolerance for a late response, in short slices
    ///
    /// Returns false if cancellation ended the wait before the deadline.
    fn wait_tolerance(&self) -> bool {
        let deadline = Instant::now() + self.timing.tolerance;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            if self.cancel.is_cancelled() {
                return false;
            }
            let slice = (deadline - now).min(POLL_INTERVAL);
            if self.latch.wait_for_response(slice) {
                return true;
            }
        }
    }

    /// Inter-stimulus pause drawn uniformly from the pause range
    fn pause(&mut self) {
        let (min, max) = (self.timing.pause_min, self.timing.pause_max);
        let pause = if max > min {
            self.rng.gen_range(min..=max)
        } else {
            min
        };

        let deadline = Instant::now() + pause;
        while !self.cancel.is_cancelled() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(POLL_INTERVAL));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use rand::SeedableRng;

    #[derive(Debug, PartialEq)]
    enum Call {
        Start(i32, bool),
        Stop(bool),
    }

    /// Records calls together with the latch state seen at each call
    struct RecordingStream {
        latch: Arc<ResponseLatch>,
        calls: Vec<Call>,
        press_during_tone: bool,
        fail_start: bool,
    }

    impl AudioStream for RecordingStream {
        fn start(&mut self, _ear: Ear, _frequency_hz: u32, level_db: i32) -> Result<()> {
            if self.fail_start {
                return Err(Error::Device("unplugged".to_string()));
            }
            self.calls.push(Call::Start(level_db, self.latch.consume()));
            if self.press_during_tone {
                self.latch.notify_pressed();
                self.latch.notify_released();
            }
            Ok(())
        }

        fn stop(&mut self) -> Result<()> {
            self.calls.push(Call::Stop(self.latch.consume()));
            Ok(())
        }
    }

    fn timing(tolerance_ms: u64) -> WindowTiming {
        WindowTiming {
            tone_duration: Duration::from_millis(2),
            tolerance: Duration::from_millis(tolerance_ms),
            pause_min: Duration::ZERO,
            pause_max: Duration::ZERO,
        }
    }

    fn window(latch: &Arc<ResponseLatch>, timing: WindowTiming) -> ToneWindow {
        ToneWindow::new(
            Arc::clone(latch),
            timing,
            CancellationToken::new(),
            StdRng::seed_from_u64(7),
        )
    }

    fn stream(latch: &Arc<ResponseLatch>, press: bool) -> RecordingStream {
        RecordingStream {
            latch: Arc::clone(latch),
            calls: Vec::new(),
            press_during_tone: press,
            fail_start: false,
        }
    }

    #[test]
    fn test_stale_press_cleared_before_start() {
        let latch = Arc::new(ResponseLatch::new());
        latch.notify_pressed();

        let mut stream = stream(&latch, false);
        let heard = window(&latch, timing(0))
            .present(&mut stream, Ear::Right, 1000, 30)
            .unwrap();

        assert_eq!(heard, Some(false));
        assert_eq!(stream.calls, vec![Call::Start(30, false), Call::Stop(false)]);
    }

    #[test]
    fn test_press_during_tone_is_heard() {
        let latch = Arc::new(ResponseLatch::new());
        let mut stream = stream(&latch, true);
        let heard = window(&latch, timing(0))
            .present(&mut stream, Ear::Left, 500, 20)
            .unwrap();

        assert_eq!(heard, Some(true));
        assert_eq!(stream.calls.len(), 2);
    }

    #[test]
    fn test_late_press_within_tolerance() {
        let latch = Arc::new(ResponseLatch::new());
        let presser = Arc::clone(&latch);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            presser.notify_pressed();
        });

        let mut stream = stream(&latch, false);
        let started = Instant::now();
        let heard = window(&latch, timing(2000))
            .present(&mut stream, Ear::Right, 1000, 40)
            .unwrap();
        handle.join().unwrap();

        assert_eq!(heard, Some(true));
        assert!(started.elapsed() < Duration::from_millis(2000));
    }

    #[test]
    fn test_cancel_shortens_tolerance() {
        let latch = Arc::new(ResponseLatch::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut window = ToneWindow::new(
            Arc::clone(&latch),
            timing(5000),
            cancel,
            StdRng::seed_from_u64(1),
        );

        let mut stream = stream(&latch, false);
        let started = Instant::now();
        let heard = window.present(&mut stream, Ear::Right, 1000, 40).unwrap();

        // Cut short without a response: no result at all
        assert_eq!(heard, None);
        // The tone itself still played and was stopped
        assert_eq!(stream.calls.len(), 2);
        assert!(started.elapsed() < Duration::from_millis(1000));
    }

    #[test]
    fn test_cancelled_window_keeps_response() {
        let latch = Arc::new(ResponseLatch::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut window = ToneWindow::new(
            Arc::clone(&latch),
            timing(5000),
            cancel,
            StdRng::seed_from_u64(1),
        );

        let mut stream = stream(&latch, true);
        let heard = window.present(&mut stream, Ear::Left, 1000, 40).unwrap();
        assert_eq!(heard, Some(true));
    }

    #[test]
    fn test_zero_tolerance_is_never_interrupted() {
        let latch = Arc::new(ResponseLatch::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut window = ToneWindow::new(
            Arc::clone(&latch),
            timing(0),
            cancel,
            StdRng::seed_from_u64(1),
        );

        let mut stream = stream(&latch, false);
        let heard = window.present(&mut stream, Ear::Right, 1000, 40).unwrap();
        assert_eq!(heard, Some(false));
    }

    #[test]
    fn test_device_error_propagates() {
        let latch = Arc::new(ResponseLatch::new());
        let mut stream = stream(&latch, false);
        stream.fail_start = true;

        let result = window(&latch, timing(0)).present(&mut stream, Ear::Right, 1000, 40);
        assert!(matches!(result, Err(Error::Device(_))));
        assert!(stream.calls.is_empty());
    }
}
