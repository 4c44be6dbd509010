//! Pacing evaluator — decides whether a line item may serve at a given
//! wall-clock instant.
//!
//! Read-only with respect to delivery counters: the engine increments the
//! serve counter only after a successful selection, so the next evaluation
//! observes the fresh value. The PID mode does persist its own controller
//! state (last error, integral) per evaluation.

use adserve_core::config::PacingConfig;
use adserve_core::types::{LineItem, PaceMode};
use adserve_counters::{keys, CounterError, CounterStore};
use chrono::{DateTime, Local, Timelike, Utc};

const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacingReason {
    Inactive,
    NotStarted,
    Expired,
    ClickCapReached,
    AsapDailyCapReached,
    EvenPacingThrottled,
    PidPacingThrottled,
}

impl PacingReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PacingReason::Inactive => "inactive",
            PacingReason::NotStarted => "not_started",
            PacingReason::Expired => "expired",
            PacingReason::ClickCapReached => "click_cap_reached",
            PacingReason::AsapDailyCapReached => "asap_daily_cap_reached",
            PacingReason::EvenPacingThrottled => "even_pacing_throttled",
            PacingReason::PidPacingThrottled => "pid_pacing_throttled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingDecision {
    pub eligible: bool,
    pub reason: Option<PacingReason>,
}

impl PacingDecision {
    pub fn eligible() -> Self {
        Self {
            eligible: true,
            reason: None,
        }
    }

    pub fn blocked(reason: PacingReason) -> Self {
        Self {
            eligible: false,
            reason: Some(reason),
        }
    }
}

/// Linear schedule quota: how many serves the EVEN mode allows after
/// `elapsed_secs` of the day. At elapsed 0 the quota is 0, so the day
/// starts ineligible by design of the schedule.
pub fn even_allowed(cap: i64, elapsed_secs: i64) -> i64 {
    cap * elapsed_secs / SECONDS_PER_DAY
}

/// One PID controller step against the linear schedule. Pure; the caller
/// persists `last_error` and `integral`.
pub fn pid_step(
    gains: &PacingConfig,
    cap: i64,
    elapsed_secs: i64,
    serves: i64,
    last_error: f64,
    integral: f64,
) -> PidStep {
    let target = cap as f64 * elapsed_secs as f64 / SECONDS_PER_DAY as f64;
    let error = target - serves as f64;
    let derivative = error - last_error;

    let windup_bound = 0.5 * cap as f64;
    let integral = (integral + error).clamp(-windup_bound, windup_bound);

    let control = gains.kp * error + gains.ki * integral + gains.kd * derivative;

    PidStep {
        control,
        last_error: error,
        integral,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PidStep {
    pub control: f64,
    pub last_error: f64,
    pub integral: f64,
}

pub struct PacingEvaluator {
    counters: CounterStore,
    gains: PacingConfig,
}

impl PacingEvaluator {
    pub fn new(counters: CounterStore, gains: PacingConfig) -> Self {
        Self { counters, gains }
    }

    /// Flight and click-cap pre-checks, applied before any pacing math.
    /// `daily_clicks` of `None` means the click counter was not fetched
    /// (no click cap configured) or is missing, both treated as zero.
    pub fn pre_check(
        item: &LineItem,
        now: DateTime<Utc>,
        daily_clicks: Option<i64>,
    ) -> Option<PacingReason> {
        if !item.active {
            return Some(PacingReason::Inactive);
        }
        if let Some(start) = item.start_at {
            if now < start {
                return Some(PacingReason::NotStarted);
            }
        }
        if let Some(end) = item.end_at {
            if now > end {
                return Some(PacingReason::Expired);
            }
        }
        if item.daily_click_cap > 0 && daily_clicks.unwrap_or(0) >= item.daily_click_cap {
            return Some(PacingReason::ClickCapReached);
        }
        None
    }

    /// Decide ASAP/EVEN eligibility from an already-fetched serve count.
    /// Pre-checks are the caller's responsibility (the batched filter path
    /// runs them against pipelined click counts). PID items must go through
    /// [`PacingEvaluator::evaluate_pid`] instead.
    pub fn evaluate_with_counts(
        item: &LineItem,
        elapsed_secs: i64,
        serves: i64,
    ) -> PacingDecision {
        let cap = item.daily_impression_cap;
        match item.pace_mode {
            PaceMode::Asap => {
                if cap > 0 && serves >= cap {
                    PacingDecision::blocked(PacingReason::AsapDailyCapReached)
                } else {
                    PacingDecision::eligible()
                }
            }
            PaceMode::Even => {
                if cap > 0 && serves >= even_allowed(cap, elapsed_secs) {
                    PacingDecision::blocked(PacingReason::EvenPacingThrottled)
                } else {
                    PacingDecision::eligible()
                }
            }
            // Stateful; routed separately so the controller runs at most
            // once per eligibility check.
            PaceMode::Pid => PacingDecision::eligible(),
        }
    }

    /// Run one PID controller step for `item` and decide eligibility. Reads
    /// and persists the day's controller state in the counter store, so it
    /// must be called at most once per eligibility check.
    pub async fn evaluate_pid(
        &self,
        item: &LineItem,
        serves: i64,
        today: &str,
        elapsed_secs: i64,
    ) -> Result<PacingDecision, CounterError> {
        let cap = item.daily_impression_cap;
        if cap == 0 {
            return Ok(PacingDecision::eligible());
        }
        if serves >= cap {
            return Ok(PacingDecision::blocked(PacingReason::PidPacingThrottled));
        }

        let last_key = keys::pid_last_error(item.id, today);
        let integral_key = keys::pid_integral(item.id, today);

        let last_error = self.counters.get_float(&last_key).await?.unwrap_or(0.0);
        let integral = self.counters.get_float(&integral_key).await?.unwrap_or(0.0);

        let step = pid_step(&self.gains, cap, elapsed_secs, serves, last_error, integral);

        self.counters
            .set_float(&last_key, step.last_error, keys::DAILY_TTL)
            .await?;
        self.counters
            .set_float(&integral_key, step.integral, keys::DAILY_TTL)
            .await?;

        if step.control <= 0.0 {
            Ok(PacingDecision::blocked(PacingReason::PidPacingThrottled))
        } else {
            Ok(PacingDecision::eligible())
        }
    }

    /// Full single-item evaluation: fetches the serve and click counters
    /// itself. Slow path; the filter batches these reads across candidates.
    pub async fn evaluate(
        &self,
        item: &LineItem,
        now: DateTime<Utc>,
    ) -> Result<PacingDecision, CounterError> {
        let today = keys::today();

        let clicks = if item.daily_click_cap > 0 {
            self.counters.get_int(&keys::clicks(item.id, &today)).await?
        } else {
            None
        };
        if let Some(reason) = Self::pre_check(item, now, clicks) {
            return Ok(PacingDecision::blocked(reason));
        }

        let serves = self
            .counters
            .get_int(&keys::serves(item.id, &today))
            .await?
            .unwrap_or(0);
        let elapsed_secs = elapsed_today_secs();

        match item.pace_mode {
            PaceMode::Pid => self.evaluate_pid(item, serves, &today, elapsed_secs).await,
            _ => Ok(Self::evaluate_with_counts(item, elapsed_secs, serves)),
        }
    }
}

/// Seconds since local midnight, matching the day boundary of the daily
/// counter keys.
pub fn elapsed_today_secs() -> i64 {
    Local::now().num_seconds_from_midnight() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn line_item(json: serde_json::Value) -> LineItem {
        serde_json::from_value(json).expect("line item deserializes")
    }

    fn base_item(pace: &str, cap: i64) -> LineItem {
        line_item(serde_json::json!({
            "id": 1,
            "campaign_id": 1,
            "publisher_id": 1,
            "name": "li",
            "active": true,
            "pace_mode": pace,
            "daily_impression_cap": cap,
        }))
    }

    #[test]
    fn test_pre_checks_in_order() {
        let now = Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap();

        let mut item = base_item("ASAP", 0);
        item.active = false;
        assert_eq!(
            PacingEvaluator::pre_check(&item, now, None),
            Some(PacingReason::Inactive)
        );

        let mut item = base_item("ASAP", 0);
        item.start_at = Some(Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap());
        assert_eq!(
            PacingEvaluator::pre_check(&item, now, None),
            Some(PacingReason::NotStarted)
        );

        let mut item = base_item("ASAP", 0);
        item.end_at = Some(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap());
        assert_eq!(
            PacingEvaluator::pre_check(&item, now, None),
            Some(PacingReason::Expired)
        );

        let mut item = base_item("ASAP", 0);
        item.daily_click_cap = 10;
        assert_eq!(
            PacingEvaluator::pre_check(&item, now, Some(10)),
            Some(PacingReason::ClickCapReached)
        );
        assert_eq!(PacingEvaluator::pre_check(&item, now, Some(9)), None);
        // Missing click counter counts as zero.
        assert_eq!(PacingEvaluator::pre_check(&item, now, None), None);
    }

    #[test]
    fn test_asap_cap() {
        let item = base_item("ASAP", 3);
        assert!(PacingEvaluator::evaluate_with_counts(&item, 0, 2).eligible);
        assert_eq!(
            PacingEvaluator::evaluate_with_counts(&item, 0, 3),
            PacingDecision::blocked(PacingReason::AsapDailyCapReached)
        );
    }

    #[test]
    fn test_asap_unlimited_ignores_count() {
        let item = base_item("ASAP", 0);
        assert!(PacingEvaluator::evaluate_with_counts(&item, 0, 1_000_000).eligible);
    }

    #[test]
    fn test_even_quota_is_linear() {
        assert_eq!(even_allowed(100, 0), 0);
        // 06:00 local -> a quarter of the day.
        assert_eq!(even_allowed(100, 6 * 3600), 25);
        assert_eq!(even_allowed(100, SECONDS_PER_DAY), 100);
    }

    #[test]
    fn test_even_at_six_hours() {
        let item = base_item("EVEN", 100);
        let elapsed = 6 * 3600;
        assert!(PacingEvaluator::evaluate_with_counts(&item, elapsed, 24).eligible);
        assert_eq!(
            PacingEvaluator::evaluate_with_counts(&item, elapsed, 25),
            PacingDecision::blocked(PacingReason::EvenPacingThrottled)
        );
    }

    #[test]
    fn test_even_day_start_is_ineligible() {
        let item = base_item("EVEN", 100);
        assert_eq!(
            PacingEvaluator::evaluate_with_counts(&item, 0, 0),
            PacingDecision::blocked(PacingReason::EvenPacingThrottled)
        );
    }

    #[test]
    fn test_even_eligibility_monotone_in_count() {
        let item = base_item("EVEN", 100);
        let elapsed = 12 * 3600;
        let mut last_eligible = true;
        for serves in 0..120 {
            let eligible =
                PacingEvaluator::evaluate_with_counts(&item, elapsed, serves).eligible;
            // Once ineligible, never eligible again at fixed time.
            assert!(last_eligible || !eligible);
            last_eligible = eligible;
        }
    }

    #[test]
    fn test_pid_behind_schedule_opens() {
        let gains = PacingConfig::default();
        // Halfway through the day, target 50, only 10 served.
        let step = pid_step(&gains, 100, 12 * 3600, 10, 0.0, 0.0);
        assert!(step.control > 0.0);
        assert_eq!(step.last_error, 40.0);
    }

    #[test]
    fn test_pid_ahead_of_schedule_throttles() {
        let gains = PacingConfig::default();
        // Early in the day, target ~4, already 60 served.
        let step = pid_step(&gains, 100, 3600, 60, 0.0, 0.0);
        assert!(step.control <= 0.0);
    }

    #[test]
    fn test_pid_integral_windup_clamped() {
        let gains = PacingConfig::default();
        let mut integral = 0.0;
        let mut last = 0.0;
        for _ in 0..100 {
            let step = pid_step(&gains, 100, SECONDS_PER_DAY, 0, last, integral);
            integral = step.integral;
            last = step.last_error;
        }
        assert!(integral <= 50.0);
        assert_eq!(integral, 50.0);
    }

    #[tokio::test]
    async fn test_pid_hard_cap_overrides_controller() {
        let counters = CounterStore::memory();
        let evaluator = PacingEvaluator::new(counters, PacingConfig::default());
        let item = base_item("PID", 100);

        // Even a wide-open controller cannot serve past the cap.
        let decision = evaluator
            .evaluate_pid(&item, 100, "2025-06-15", SECONDS_PER_DAY)
            .await
            .expect("counter store up");
        assert_eq!(
            decision,
            PacingDecision::blocked(PacingReason::PidPacingThrottled)
        );
    }

    #[tokio::test]
    async fn test_pid_unlimited_cap_skips_controller() {
        let counters = CounterStore::memory();
        let evaluator = PacingEvaluator::new(counters.clone(), PacingConfig::default());
        let item = base_item("PID", 0);

        let decision = evaluator
            .evaluate_pid(&item, 1_000_000, "2025-06-15", 3600)
            .await
            .expect("counter store up");
        assert!(decision.eligible);
        // No state is written for uncapped items.
        assert_eq!(
            counters
                .get_float(&keys::pid_integral(1, "2025-06-15"))
                .await
                .expect("get"),
            None
        );
    }

    #[tokio::test]
    async fn test_pid_persists_controller_state() {
        let counters = CounterStore::memory();
        let evaluator = PacingEvaluator::new(counters.clone(), PacingConfig::default());
        let item = base_item("PID", 100);

        // Halfway through the day with 10 serves: behind schedule, open.
        let decision = evaluator
            .evaluate_pid(&item, 10, "2025-06-15", 12 * 3600)
            .await
            .expect("counter store up");
        assert!(decision.eligible);

        // error = 50 - 10 = 40, integral = 40.
        assert_eq!(
            counters
                .get_float(&keys::pid_last_error(1, "2025-06-15"))
                .await
                .expect("get"),
            Some(40.0)
        );
        assert_eq!(
            counters
                .get_float(&keys::pid_integral(1, "2025-06-15"))
                .await
                .expect("get"),
            Some(40.0)
        );

        // A second check accumulates the integral from stored state.
        evaluator
            .evaluate_pid(&item, 10, "2025-06-15", 12 * 3600)
            .await
            .expect("counter store up");
        assert_eq!(
            counters
                .get_float(&keys::pid_integral(1, "2025-06-15"))
                .await
                .expect("get"),
            Some(50.0)
        );
    }

    #[test]
    fn test_pid_derivative_uses_last_error() {
        let gains = PacingConfig {
            kp: 0.0,
            ki: 0.0,
            kd: 1.0,
        };
        // Error now 40, was 50: derivative term is negative.
        let step = pid_step(&gains, 100, 12 * 3600, 10, 50.0, 0.0);
        assert_eq!(step.control, -10.0);
    }
}
