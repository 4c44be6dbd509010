//! Single-pass candidate filter.
//!
//! One local iteration applies the cheap predicates (line-item presence,
//! targeting, size/format); the survivors then get two batched counter
//! round trips, frequency first and pacing second. A counter-store outage
//! fails open: the list is returned with frequency and pacing unenforced,
//! and the outage is visible through metrics.

use crate::trace::SelectionTrace;
use adserve_core::error::{AdError, AdResult};
use adserve_core::types::{Creative, LineItem, PaceMode, TargetingContext};
use adserve_counters::{keys, CounterStore};
use adserve_delivery::frequency::FrequencyEvaluator;
use adserve_delivery::pacing::{elapsed_today_secs, PacingDecision, PacingEvaluator};
use adserve_store::Catalog;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A creative that survived filtering, with its resolved line item.
#[derive(Clone)]
pub struct Candidate {
    pub creative: Arc<Creative>,
    pub line_item: Arc<LineItem>,
}

impl Candidate {
    pub fn creative_id(&self) -> i64 {
        self.creative.id
    }

    pub fn line_item_id(&self) -> i64 {
        self.line_item.id
    }
}

/// Targeting rules: equality for country/region/device type, substring
/// containment for os/browser (a rule of "iOS" matches a context of
/// "iOS 15.1" but not the reverse), full subset match for key-values.
/// All comparisons are case-insensitive.
pub fn targeting_match(item: &LineItem, ctx: &TargetingContext) -> bool {
    if !equals_rule(&item.country, &ctx.country)
        || !equals_rule(&item.region, &ctx.region)
        || !equals_rule(&item.device_type, ctx.device_type.as_str())
    {
        return false;
    }
    if !contains_rule(&item.os, &ctx.os) || !contains_rule(&item.browser, &ctx.browser) {
        return false;
    }
    item.key_values.iter().all(|(key, want)| {
        ctx.key_values
            .get(key)
            .is_some_and(|have| have.eq_ignore_ascii_case(want))
    })
}

fn equals_rule(rule: &str, value: &str) -> bool {
    rule.is_empty() || rule.eq_ignore_ascii_case(value)
}

fn contains_rule(rule: &str, value: &str) -> bool {
    rule.is_empty() || value.to_lowercase().contains(&rule.to_lowercase())
}

pub struct FilterInput<'a> {
    pub catalog: &'a Catalog,
    pub creatives: &'a [Arc<Creative>],
    pub ctx: &'a TargetingContext,
    pub width: u32,
    pub height: u32,
    pub allowed_formats: &'a [String],
    pub user_id: &'a str,
}

pub struct SinglePassFilter {
    counters: CounterStore,
    pacing: PacingEvaluator,
    default_frequency_cap: i64,
}

impl SinglePassFilter {
    pub fn new(
        counters: CounterStore,
        pacing: PacingEvaluator,
        default_frequency_cap: i64,
    ) -> Self {
        Self {
            counters,
            pacing,
            default_frequency_cap,
        }
    }

    pub async fn run(
        &self,
        input: FilterInput<'_>,
        now: DateTime<Utc>,
        trace: &mut SelectionTrace,
    ) -> AdResult<Vec<Candidate>> {
        let prefiltered = self.local_pass(&input, trace);
        if prefiltered.is_empty() {
            return Ok(Vec::new());
        }

        // Batched frequency round trip.
        let freq_keys: Vec<String> = prefiltered
            .iter()
            .map(|c| keys::frequency(input.user_id, c.line_item_id()))
            .collect();
        let freq_counts = match self.counters.get_many(&freq_keys).await {
            Ok(counts) => counts,
            Err(e) => {
                debug!(error = %e, "Counter store unavailable; frequency and pacing unenforced");
                metrics::counter!("filter.counter_store_unavailable").increment(1);
                trace.step_with(
                    "single_pass_complete",
                    prefiltered.iter().map(Candidate::creative_id).collect(),
                    [("fail_open", "true".to_string())],
                );
                return Ok(prefiltered);
            }
        };
        let freq_ok: Vec<bool> = prefiltered
            .iter()
            .zip(&freq_counts)
            .map(|(c, count)| {
                FrequencyEvaluator::under_cap(&c.line_item, *count, self.default_frequency_cap)
            })
            .collect();

        // Batched pacing round trip over the distinct line items.
        let today = keys::today();
        let elapsed = elapsed_today_secs();
        let decisions = match self
            .pacing_decisions(&prefiltered, now, &today, elapsed)
            .await
        {
            Ok(decisions) => decisions,
            Err(e) => {
                debug!(error = %e, "Counter store unavailable; pacing unenforced");
                metrics::counter!("filter.counter_store_unavailable").increment(1);
                let survivors: Vec<Candidate> = prefiltered
                    .iter()
                    .zip(&freq_ok)
                    .filter(|(_, ok)| **ok)
                    .map(|(c, _)| c.clone())
                    .collect();
                trace.step_with(
                    "single_pass_complete",
                    survivors.iter().map(Candidate::creative_id).collect(),
                    [("fail_open", "pacing".to_string())],
                );
                return Ok(survivors);
            }
        };

        // Intersect both result maps with the pre-filtered list.
        let mut frequency_blocked = 0usize;
        let mut pacing_blocked: HashMap<&'static str, usize> = HashMap::new();
        let mut survivors = Vec::with_capacity(prefiltered.len());
        for (candidate, freq_ok) in prefiltered.iter().zip(&freq_ok) {
            if !freq_ok {
                frequency_blocked += 1;
                continue;
            }
            let decision = decisions
                .get(&candidate.line_item_id())
                .copied()
                .unwrap_or_else(PacingDecision::eligible);
            if !decision.eligible {
                if let Some(reason) = decision.reason {
                    *pacing_blocked.entry(reason.as_str()).or_default() += 1;
                }
                continue;
            }
            survivors.push(candidate.clone());
        }

        let mut details: Vec<(&'static str, String)> = vec![
            ("input", prefiltered.len().to_string()),
            ("output", survivors.len().to_string()),
            ("frequency_blocked", frequency_blocked.to_string()),
        ];
        for (reason, count) in &pacing_blocked {
            details.push((*reason, count.to_string()));
        }
        trace.step_with(
            "single_pass_complete",
            survivors.iter().map(Candidate::creative_id).collect(),
            details,
        );

        if survivors.is_empty() {
            metrics::counter!("filter.pacing_limit_reached").increment(1);
            return Err(AdError::PacingLimitReached);
        }
        Ok(survivors)
    }

    /// Step one: cheap local predicates in a single iteration.
    fn local_pass(&self, input: &FilterInput<'_>, trace: &mut SelectionTrace) -> Vec<Candidate> {
        let mut prefiltered = Vec::with_capacity(input.creatives.len());
        let mut dropped_line_item = 0usize;
        let mut dropped_targeting = 0usize;
        let mut dropped_size = 0usize;

        for creative in input.creatives {
            let Some(line_item) = input
                .catalog
                .get_line_item(creative.publisher_id, creative.line_item_id)
            else {
                dropped_line_item += 1;
                continue;
            };
            if !line_item.active {
                dropped_line_item += 1;
                continue;
            }
            if !targeting_match(line_item, input.ctx) {
                dropped_targeting += 1;
                continue;
            }
            if !self.size_format_match(input, creative) {
                dropped_size += 1;
                continue;
            }
            prefiltered.push(Candidate {
                creative: creative.clone(),
                line_item: line_item.clone(),
            });
        }

        trace.step_with(
            "prefilter",
            prefiltered.iter().map(Candidate::creative_id).collect(),
            [
                ("input", input.creatives.len().to_string()),
                ("dropped_line_item", dropped_line_item.to_string()),
                ("dropped_targeting", dropped_targeting.to_string()),
                ("dropped_size_format", dropped_size.to_string()),
            ],
        );
        prefiltered
    }

    fn size_format_match(&self, input: &FilterInput<'_>, creative: &Creative) -> bool {
        if input.width > 0 && creative.width != input.width {
            return false;
        }
        if input.height > 0 && creative.height != input.height {
            return false;
        }
        if !input.allowed_formats.is_empty()
            && !creative.format.is_empty()
            && !input.allowed_formats.contains(&creative.format)
        {
            return false;
        }
        true
    }

    /// Pacing decisions per distinct line item. Non-PID items share one
    /// pipeline fetching serve counts plus click counts for click-capped
    /// items; PID items are evaluated individually since the controller
    /// mutates stored state.
    async fn pacing_decisions(
        &self,
        prefiltered: &[Candidate],
        now: DateTime<Utc>,
        today: &str,
        elapsed: i64,
    ) -> Result<HashMap<i64, PacingDecision>, adserve_counters::CounterError> {
        let mut items: Vec<Arc<LineItem>> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for candidate in prefiltered {
            if seen.insert(candidate.line_item_id()) {
                items.push(candidate.line_item.clone());
            }
        }

        let (batched, stateful): (Vec<_>, Vec<_>) = items
            .into_iter()
            .partition(|item| item.pace_mode != PaceMode::Pid);

        let mut decisions = HashMap::new();

        if !batched.is_empty() {
            let mut pipeline_keys: Vec<String> = batched
                .iter()
                .map(|item| keys::serves(item.id, today))
                .collect();
            let click_capped: Vec<usize> = batched
                .iter()
                .enumerate()
                .filter(|(_, item)| item.daily_click_cap > 0)
                .map(|(idx, _)| idx)
                .collect();
            pipeline_keys.extend(
                click_capped
                    .iter()
                    .map(|idx| keys::clicks(batched[*idx].id, today)),
            );

            let counts = self.counters.get_many(&pipeline_keys).await?;
            let (serve_counts, click_counts) = counts.split_at(batched.len());
            let clicks_by_index: HashMap<usize, Option<i64>> = click_capped
                .iter()
                .zip(click_counts)
                .map(|(idx, count)| (*idx, *count))
                .collect();

            for (idx, item) in batched.iter().enumerate() {
                let clicks = clicks_by_index.get(&idx).copied().flatten();
                let decision = match PacingEvaluator::pre_check(item, now, clicks) {
                    Some(reason) => PacingDecision::blocked(reason),
                    None => PacingEvaluator::evaluate_with_counts(
                        item,
                        elapsed,
                        serve_counts[idx].unwrap_or(0),
                    ),
                };
                decisions.insert(item.id, decision);
            }
        }

        for item in stateful {
            let clicks = if item.daily_click_cap > 0 {
                self.counters.get_int(&keys::clicks(item.id, today)).await?
            } else {
                None
            };
            if let Some(reason) = PacingEvaluator::pre_check(&item, now, clicks) {
                decisions.insert(item.id, PacingDecision::blocked(reason));
                continue;
            }
            let serves = self
                .counters
                .get_int(&keys::serves(item.id, today))
                .await?
                .unwrap_or(0);
            let decision = self.pacing.evaluate_pid(&item, serves, today, elapsed).await?;
            decisions.insert(item.id, decision);
        }

        Ok(decisions)
    }
}
