//! Decisioning engine — composes targeting, pacing, frequency, rate limits
//! and programmatic bids into a single ad selection per request.

pub mod engine;
pub mod filter;
pub mod ranking;
pub mod trace;

pub use engine::{AdSelection, DecisionEngine, SelectAdRequest, SelectionFailure};
pub use filter::{Candidate, SinglePassFilter};
pub use ranking::PriorityTable;
pub use trace::{SelectionTrace, TraceStep};
