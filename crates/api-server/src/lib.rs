//! HTTP surface: the ad request endpoint, tracking pixels and operational
//! probes.

pub mod render;
pub mod rest;
pub mod server;
pub mod state;
pub mod tracking;

pub use server::{router, ApiServer};
pub use state::AppState;
