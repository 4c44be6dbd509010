//! Priority-then-price ranking with randomized tie-breaking.
//!
//! Two-phase ordering: shuffle the working set uniformly at random, then
//! stable-sort by price descending, then stable-sort by tier rank
//! ascending. The stable sorts preserve the shuffle among exact ties, so
//! the combined effect is "priority first, price second, random third"
//! without leaning on any library's grouping behavior.

use crate::filter::Candidate;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;

/// Tier name to rank table, built once at startup from the configured
/// order. Lower rank means higher priority; unknown tiers sort after every
/// configured one.
#[derive(Debug, Clone)]
pub struct PriorityTable {
    ranks: HashMap<String, usize>,
    fallback: usize,
}

impl PriorityTable {
    pub fn new(tiers: &[String]) -> Self {
        let ranks: HashMap<String, usize> = tiers
            .iter()
            .enumerate()
            .map(|(rank, tier)| (tier.to_lowercase(), rank))
            .collect();
        let fallback = ranks.len();
        Self { ranks, fallback }
    }

    pub fn rank(&self, tier: &str) -> usize {
        self.ranks
            .get(&tier.to_lowercase())
            .copied()
            .unwrap_or(self.fallback)
    }
}

/// Order `(candidate, price)` pairs for selection; the head of the result
/// is the winner.
pub fn rank_candidates<R: Rng>(
    mut candidates: Vec<(Candidate, f64)>,
    priorities: &PriorityTable,
    rng: &mut R,
) -> Vec<(Candidate, f64)> {
    candidates.shuffle(rng);
    candidates.sort_by(|(_, a), (_, b)| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    candidates.sort_by_key(|(candidate, _)| priorities.rank(&candidate.line_item.priority));
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use adserve_core::types::{Creative, LineItem};
    use std::sync::Arc;

    fn tiers() -> PriorityTable {
        PriorityTable::new(&[
            "high".to_string(),
            "medium".to_string(),
            "low".to_string(),
        ])
    }

    fn candidate(creative_id: i64, line_item_id: i64, priority: &str) -> Candidate {
        let line_item: LineItem = serde_json::from_value(serde_json::json!({
            "id": line_item_id,
            "campaign_id": 1,
            "publisher_id": 1,
            "name": format!("li-{line_item_id}"),
            "active": true,
            "priority": priority,
        }))
        .expect("line item deserializes");
        let creative = Creative {
            id: creative_id,
            placement_id: "slot".to_string(),
            line_item_id,
            campaign_id: 1,
            publisher_id: 1,
            html: Some(String::new()),
            native: None,
            banner: None,
            width: 300,
            height: 250,
            format: String::new(),
            click_url: None,
        };
        Candidate {
            creative: Arc::new(creative),
            line_item: Arc::new(line_item),
        }
    }

    #[test]
    fn test_rank_table() {
        let table = tiers();
        assert_eq!(table.rank("high"), 0);
        assert_eq!(table.rank("HIGH"), 0);
        assert_eq!(table.rank("low"), 2);
        // Unknown tiers sort after every configured one.
        assert_eq!(table.rank("house"), 3);
    }

    #[test]
    fn test_price_decides_within_tier() {
        let table = tiers();
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let ranked = rank_candidates(
                vec![
                    (candidate(1, 1, "medium"), 4.0),
                    (candidate(2, 2, "medium"), 5.0),
                ],
                &table,
                &mut rng,
            );
            // Deterministic across runs: the 5.0 bid always leads.
            assert_eq!(ranked[0].0.creative_id(), 2);
        }
    }

    #[test]
    fn test_priority_beats_price() {
        let table = tiers();
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let ranked = rank_candidates(
                vec![
                    (candidate(1, 1, "medium"), 10.0),
                    (candidate(2, 2, "high"), 1.0),
                ],
                &table,
                &mut rng,
            );
            assert_eq!(ranked[0].0.creative_id(), 2);
        }
    }

    #[test]
    fn test_exact_ties_are_uniformly_random() {
        let table = tiers();
        let mut rng = rand::thread_rng();
        let mut first_wins = 0u32;
        let runs = 10_000;
        for _ in 0..runs {
            let ranked = rank_candidates(
                vec![
                    (candidate(1, 1, "medium"), 2.0),
                    (candidate(2, 2, "medium"), 2.0),
                ],
                &table,
                &mut rng,
            );
            if ranked[0].0.creative_id() == 1 {
                first_wins += 1;
            }
        }
        // Each side of the tie should win at least 40% of trials.
        let share = f64::from(first_wins) / f64::from(runs);
        assert!(share > 0.4 && share < 0.6, "tie share was {share}");
    }

    #[test]
    fn test_tier_concatenation_order() {
        let table = tiers();
        let mut rng = rand::thread_rng();
        let ranked = rank_candidates(
            vec![
                (candidate(1, 1, "low"), 9.0),
                (candidate(2, 2, "medium"), 3.0),
                (candidate(3, 3, "high"), 1.0),
                (candidate(4, 4, "medium"), 7.0),
            ],
            &table,
            &mut rng,
        );
        let order: Vec<i64> = ranked.iter().map(|(c, _)| c.creative_id()).collect();
        assert_eq!(order, vec![3, 4, 2, 1]);
    }
}
