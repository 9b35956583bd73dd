//! HTTP control API
//!
//! Remote control surface for the test engine: start/stop sessions,
//! register responses, read state and results, stream events over SSE.

pub mod handlers;
pub mod server;
pub mod sse;

pub use server::{build_router, run, AppContext};
