//! Tone output
//!
//! [`AudioStream`] is the seam between the test engine and the sound card:
//! the tone window only ever calls `start` and `stop`. [`output::ToneOutput`]
//! implements it on top of cpal; tests substitute scripted streams.

pub mod output;
pub mod tone;

pub use output::ToneOutput;
pub use tone::{AudioFrame, ToneGenerator};

use crate::error::Result;
use audiometer_common::Ear;

/// Pure-tone playback device
///
/// Implementations must keep the channels isolated: a tone for one ear
/// leaves the other channel silent. Hardware failures are reported as
/// [`crate::Error::Device`].
pub trait AudioStream {
    /// Begin a tone on the channel of `ear`
    fn start(&mut self, ear: Ear, frequency_hz: u32, level_db: i32) -> Result<()>;

    /// End the current tone
    fn stop(&mut self) -> Result<()>;
}

impl<S: AudioStream + ?Sized> AudioStream for Box<S> {
    fn start(&mut self, ear: Ear, frequency_hz: u32, level_db: i32) -> Result<()> {
        (**self).start(ear, frequency_hz, level_db)
    }

    fn stop(&mut self) -> Result<()> {
        (**self).stop()
    }
}
