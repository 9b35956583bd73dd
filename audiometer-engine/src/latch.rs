//! Response latch
//!
//! Single-slot record of "a response was registered since the last clear".
//! The input side (HTTP handler, console reader, hardware button) writes
//! through [`ResponseLatch::notify_pressed`] / [`ResponseLatch::notify_released`];
//! the tone window clears and reads it. Every operation is a short critical
//! section on one mutex, and waiting uses a condition variable so the lock
//! is never held while the test thread sleeps.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Kind of input transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Pressed,
    Released,
}

/// A press or release with the instant it was registered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseEvent {
    pub kind: ResponseKind,
    pub at: Instant,
}

#[derive(Debug, Default)]
struct LatchState {
    /// Set by a press, survives releases, reset only by `clear`
    response_seen: bool,
    /// Current physical state of the control
    pressed: bool,
    last_event: Option<ResponseEvent>,
}

/// Thread-safe response latch
#[derive(Debug, Default)]
pub struct ResponseLatch {
    state: Mutex<LatchState>,
    signal: Condvar,
}

impl ResponseLatch {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LatchState> {
        // A panicking writer cannot leave the bool half-written
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reset to "no response"; takes effect before this call returns
    pub fn clear(&self) {
        self.lock().response_seen = false;
    }

    /// Register a press; the latch stays set until the next `clear`
    pub fn notify_pressed(&self) {
        let mut state = self.lock();
        state.response_seen = true;
        state.pressed = true;
        state.last_event = Some(ResponseEvent {
            kind: ResponseKind::Pressed,
            at: Instant::now(),
        });
        drop(state);
        self.signal.notify_all();
    }

    /// Register a release; never resets the latch
    pub fn notify_released(&self) {
        let mut state = self.lock();
        state.pressed = false;
        state.last_event = Some(ResponseEvent {
            kind: ResponseKind::Released,
            at: Instant::now(),
        });
    }

    /// Non-resetting snapshot: was a response registered since the last clear
    pub fn consume(&self) -> bool {
        self.lock().response_seen
    }

    /// Whether the control is currently held down
    pub fn is_pressed(&self) -> bool {
        self.lock().pressed
    }

    /// Most recent press or release, if any
    pub fn last_event(&self) -> Option<ResponseEvent> {
        self.lock().last_event
    }

    /// Block until a response is registered or `timeout` elapses
    ///
    /// Returns the latch state at wake-up. The mutex is released while
    /// waiting.
    pub fn wait_for_response(&self, timeout: Duration) -> bool {
        let guard = self.lock();
        let (guard, _) = self
            .signal
            .wait_timeout_while(guard, timeout, |state| !state.response_seen)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.response_seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_clear_then_consume_is_false() {
        let latch = ResponseLatch::new();
        latch.clear();
        assert!(!latch.consume());
    }

    #[test]
    fn test_press_then_consume_is_true() {
        let latch = ResponseLatch::new();
        latch.clear();
        latch.notify_pressed();
        assert!(latch.consume());
        // Non-resetting read
        assert!(latch.consume());
    }

    #[test]
    fn test_stale_press_dropped_by_clear() {
        let latch = ResponseLatch::new();
        latch.notify_pressed();
        latch.clear();
        assert!(!latch.consume());
    }

    #[test]
    fn test_release_keeps_response() {
        let latch = ResponseLatch::new();
        latch.clear();
        latch.notify_pressed();
        assert!(latch.is_pressed());
        latch.notify_released();
        assert!(!latch.is_pressed());
        assert!(latch.consume());
        assert_eq!(latch.last_event().map(|e| e.kind), Some(ResponseKind::Released));
    }

    #[test]
    fn test_wait_times_out_without_press() {
        let latch = ResponseLatch::new();
        let started = Instant::now();
        assert!(!latch.wait_for_response(Duration::from_millis(30)));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_wait_wakes_on_press_from_other_thread() {
        let latch = Arc::new(ResponseLatch::new());
        let writer = Arc::clone(&latch);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            writer.notify_pressed();
        });

        let started = Instant::now();
        assert!(latch.wait_for_response(Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }
}
