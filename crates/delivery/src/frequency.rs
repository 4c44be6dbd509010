//! Per-user per-line-item exposure checks.
//!
//! The exposure counter is incremented at impression-pixel time, not here;
//! this evaluator only reads.

use adserve_core::types::LineItem;
use adserve_counters::{keys, CounterError, CounterStore};

pub struct FrequencyEvaluator {
    counters: CounterStore,
    default_cap: i64,
}

impl FrequencyEvaluator {
    pub fn new(counters: CounterStore, default_cap: i64) -> Self {
        Self {
            counters,
            default_cap,
        }
    }

    /// Decide from an already-fetched exposure count; missing means the
    /// user has never seen this line item in the window.
    pub fn under_cap(item: &LineItem, count: Option<i64>, default_cap: i64) -> bool {
        count.unwrap_or(0) < item.effective_frequency_cap(default_cap)
    }

    /// Single-item check; the filter batches these reads instead.
    pub async fn check(&self, user_id: &str, item: &LineItem) -> Result<bool, CounterError> {
        let count = self
            .counters
            .get_int(&keys::frequency(user_id, item.id))
            .await?;
        Ok(Self::under_cap(item, count, self.default_cap))
    }
}
