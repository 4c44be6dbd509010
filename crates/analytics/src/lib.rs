//! Asynchronous analytics sink that batches delivery events and writes to
//! ClickHouse. Channel-based: event submission never blocks a request.

pub mod logger;

pub use logger::{AdEvent, AdEventKind, AnalyticsLogger};
