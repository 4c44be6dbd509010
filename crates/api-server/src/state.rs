//! Shared application state for HTTP handlers.

use adserve_analytics::AnalyticsLogger;
use adserve_core::config::TokenConfig;
use adserve_counters::CounterStore;
use adserve_engine::DecisionEngine;
use adserve_store::AdStore;
use adserve_targeting::TargetingResolver;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DecisionEngine>,
    pub store: Arc<AdStore>,
    pub counters: CounterStore,
    pub resolver: Arc<TargetingResolver>,
    pub analytics: Arc<AnalyticsLogger>,
    pub token: TokenConfig,
    /// Base URL embedded in tracking links.
    pub public_url: String,
    pub start_time: Instant,
}
