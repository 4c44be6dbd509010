//! Counter store client — thin adapter over Redis for the engine's
//! frequency, pacing, click and event counters plus PID controller state.

pub mod client;
pub mod keys;

pub use client::{CounterError, CounterStore};
