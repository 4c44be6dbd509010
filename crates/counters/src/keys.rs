//! Counter key namespace. Key shapes are shared by every process replica
//! serving the same publisher tenant, so they must not drift.

use std::time::Duration;

/// TTL applied to daily counters on first increment.
pub const DAILY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// The "today" component of daily keys, in the process time zone.
pub fn today() -> String {
    chrono::Local::now().format("%Y-%m-%d").to_string()
}

/// Per-user per-line-item exposure counter; TTL = the line item's
/// frequency window.
pub fn frequency(user_id: &str, line_item_id: i64) -> String {
    format!("freqcap:{user_id}:{line_item_id}")
}

/// Serve counter, incremented at selection time. Drives pacing.
pub fn serves(line_item_id: i64, today: &str) -> String {
    format!("pacing:serves:{line_item_id}:{today}")
}

/// Billable impression counter, incremented at pixel-fire time.
pub fn impressions(line_item_id: i64, today: &str) -> String {
    format!("pacing:impressions:{line_item_id}:{today}")
}

pub fn clicks(line_item_id: i64, today: &str) -> String {
    format!("clicks:lineitem:{line_item_id}:{today}")
}

pub fn custom_event(event_type: &str, line_item_id: i64, today: &str) -> String {
    format!("event:{event_type}:lineitem:{line_item_id}:{today}")
}

/// PID controller state, text-encoded floats.
pub fn pid_last_error(line_item_id: i64, today: &str) -> String {
    format!("pid:last:{line_item_id}:{today}")
}

pub fn pid_integral(line_item_id: i64, today: &str) -> String {
    format!("pid:int:{line_item_id}:{today}")
}
