//! # Audiometer Engine
//!
//! Adaptive pure-tone threshold test:
//! - `finder` - modified ascending search for one (ear, frequency)
//! - `window` - one tone presentation against the response latch
//! - `orchestrator` - sequences searches over all combinations
//! - `audio` - cpal tone output behind the [`audio::AudioStream`] seam
//! - `session` / `state` - background sessions shared with the inputs
//! - `api` - HTTP control surface and SSE events

pub mod api;
pub mod audio;
pub mod error;
pub mod finder;
pub mod latch;
pub mod orchestrator;
pub mod session;
pub mod state;
pub mod window;

pub use error::{Error, Result};
pub use state::SharedState;
