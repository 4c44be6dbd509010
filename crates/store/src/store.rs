//! Process-wide snapshot of publishers, placements, campaigns, line items
//! and creatives.
//!
//! Readers clone an `Arc<Catalog>` under a briefly held read lock and then
//! work lock-free against an immutable snapshot; a reload builds a fresh
//! catalog off to the side and swaps the pointer, so readers in flight at
//! swap time complete against the prior snapshot. Spend and eCPM writes go
//! through the entities' atomic cells and never re-publish the snapshot.

use adserve_core::error::{AdError, AdResult};
use adserve_core::types::{Campaign, Creative, LineItem, Placement, Publisher};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// One immutable catalog generation.
#[derive(Debug, Default)]
pub struct Catalog {
    publishers: HashMap<i64, Publisher>,
    placements: HashMap<String, Placement>,
    campaigns: HashMap<i64, Campaign>,
    /// publisher id -> line item id -> line item.
    line_items: HashMap<i64, HashMap<i64, Arc<LineItem>>>,
    /// placement id -> creatives, resolved at build time.
    creatives: HashMap<String, Vec<Arc<Creative>>>,
}

impl Catalog {
    pub fn get_publisher(&self, id: i64) -> Option<&Publisher> {
        self.publishers.get(&id)
    }

    pub fn get_placement(&self, id: &str) -> Option<&Placement> {
        self.placements.get(id)
    }

    pub fn get_campaign(&self, id: i64) -> Option<&Campaign> {
        self.campaigns.get(&id)
    }

    pub fn get_line_item(&self, publisher_id: i64, id: i64) -> Option<&Arc<LineItem>> {
        self.line_items.get(&publisher_id)?.get(&id)
    }

    /// Walks every publisher; used only on slow paths (tracking hits).
    pub fn get_line_item_by_id(&self, id: i64) -> Option<&Arc<LineItem>> {
        self.line_items.values().find_map(|items| items.get(&id))
    }

    pub fn line_items_for_publisher(&self, publisher_id: i64) -> Vec<Arc<LineItem>> {
        self.line_items
            .get(&publisher_id)
            .map(|items| items.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Candidate creatives indexed by placement id.
    pub fn creatives_for_placement(&self, placement_id: &str) -> &[Arc<Creative>] {
        self.creatives
            .get(placement_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn line_item_count(&self) -> usize {
        self.line_items.values().map(HashMap::len).sum()
    }

    pub fn creative_count(&self) -> usize {
        self.creatives.values().map(Vec::len).sum()
    }

    /// Build a catalog generation, enforcing the referential invariants.
    fn build(
        line_items: Vec<LineItem>,
        campaigns: Vec<Campaign>,
        publishers: Vec<Publisher>,
        placements: Vec<Placement>,
        creatives: Vec<Creative>,
    ) -> AdResult<Self> {
        let publishers: HashMap<i64, Publisher> =
            publishers.into_iter().map(|p| (p.id, p)).collect();
        let placements: HashMap<String, Placement> = placements
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();
        let campaigns: HashMap<i64, Campaign> =
            campaigns.into_iter().map(|c| (c.id, c)).collect();

        let mut items_by_publisher: HashMap<i64, HashMap<i64, Arc<LineItem>>> = HashMap::new();
        for item in line_items {
            if !publishers.contains_key(&item.publisher_id) {
                return Err(AdError::Catalog(format!(
                    "line item {} references unknown publisher {}",
                    item.id, item.publisher_id
                )));
            }
            if let Some(campaign) = campaigns.get(&item.campaign_id) {
                if campaign.publisher_id != item.publisher_id {
                    return Err(AdError::Catalog(format!(
                        "line item {} and campaign {} belong to different publishers",
                        item.id, item.campaign_id
                    )));
                }
            } else {
                return Err(AdError::Catalog(format!(
                    "line item {} references unknown campaign {}",
                    item.id, item.campaign_id
                )));
            }
            if item.is_programmatic()
                && item
                    .programmatic_endpoint
                    .as_deref()
                    .map_or(true, str::is_empty)
            {
                return Err(AdError::Catalog(format!(
                    "programmatic line item {} has no endpoint",
                    item.id
                )));
            }
            if let (Some(start), Some(end)) = (item.start_at, item.end_at) {
                if start > end {
                    return Err(AdError::Catalog(format!(
                        "line item {} flight window is inverted",
                        item.id
                    )));
                }
            }
            if item.ecpm.get() < 0.0 {
                return Err(AdError::Catalog(format!(
                    "line item {} has negative ecpm",
                    item.id
                )));
            }
            items_by_publisher
                .entry(item.publisher_id)
                .or_default()
                .insert(item.id, Arc::new(item));
        }

        let mut creatives_by_placement: HashMap<String, Vec<Arc<Creative>>> = HashMap::new();
        for creative in creatives {
            let resolved = items_by_publisher
                .get(&creative.publisher_id)
                .and_then(|items| items.get(&creative.line_item_id));
            match resolved {
                Some(item) if item.campaign_id == creative.campaign_id => {}
                Some(_) => {
                    return Err(AdError::Catalog(format!(
                        "creative {} disagrees with its line item about the campaign",
                        creative.id
                    )));
                }
                None => {
                    // Deleted mid-export; skip rather than reject the batch.
                    warn!(
                        creative_id = creative.id,
                        line_item_id = creative.line_item_id,
                        "Dropping creative with unresolved line item"
                    );
                    continue;
                }
            }
            if !placements.contains_key(&creative.placement_id) {
                return Err(AdError::Catalog(format!(
                    "creative {} references unknown placement {}",
                    creative.id, creative.placement_id
                )));
            }
            creatives_by_placement
                .entry(creative.placement_id.clone())
                .or_default()
                .push(Arc::new(creative));
        }

        Ok(Self {
            publishers,
            placements,
            campaigns,
            line_items: items_by_publisher,
            creatives: creatives_by_placement,
        })
    }
}

/// Shared handle over the current catalog generation.
pub struct AdStore {
    snapshot: RwLock<Arc<Catalog>>,
}

impl Default for AdStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AdStore {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(Catalog::default())),
        }
    }

    /// The current generation. The returned snapshot is stable until the
    /// caller drops it, regardless of concurrent reloads.
    pub fn snapshot(&self) -> Arc<Catalog> {
        self.snapshot.read().clone()
    }

    pub fn get_publisher(&self, id: i64) -> Option<Publisher> {
        self.snapshot().get_publisher(id).cloned()
    }

    pub fn get_placement(&self, id: &str) -> Option<Placement> {
        self.snapshot().get_placement(id).cloned()
    }

    pub fn get_line_item(&self, publisher_id: i64, id: i64) -> Option<Arc<LineItem>> {
        self.snapshot().get_line_item(publisher_id, id).cloned()
    }

    pub fn get_line_item_by_id(&self, id: i64) -> Option<Arc<LineItem>> {
        self.snapshot().get_line_item_by_id(id).cloned()
    }

    pub fn get_line_items_by_publisher(&self, publisher_id: i64) -> Vec<Arc<LineItem>> {
        self.snapshot().line_items_for_publisher(publisher_id)
    }

    /// Validate and atomically publish a new catalog generation. On
    /// validation failure the prior snapshot stays in place.
    pub fn reload_all(
        &self,
        line_items: Vec<LineItem>,
        campaigns: Vec<Campaign>,
        publishers: Vec<Publisher>,
        placements: Vec<Placement>,
        creatives: Vec<Creative>,
    ) -> AdResult<()> {
        let catalog = Catalog::build(line_items, campaigns, publishers, placements, creatives)?;
        let line_items = catalog.line_item_count();
        let creatives = catalog.creative_count();

        *self.snapshot.write() = Arc::new(catalog);

        info!(
            line_items = line_items,
            creatives = creatives,
            "Catalog reloaded"
        );
        Ok(())
    }

    /// Set a line item's spend. Items deleted between selection and
    /// post-serve accounting silently no-op.
    pub fn update_line_item_spend(
        &self,
        publisher_id: i64,
        line_item_id: i64,
        spend: f64,
    ) -> AdResult<()> {
        if let Some(item) = self.snapshot().get_line_item(publisher_id, line_item_id) {
            item.spend.set(spend);
        }
        Ok(())
    }

    /// Add to a line item's spend, returning the new total when the item
    /// still exists.
    pub fn add_line_item_spend(
        &self,
        publisher_id: i64,
        line_item_id: i64,
        delta: f64,
    ) -> Option<f64> {
        self.snapshot()
            .get_line_item(publisher_id, line_item_id)
            .map(|item| item.spend.add(delta))
    }

    /// Bulk eCPM refresh used by the CTR recomputation path. Unknown ids
    /// are skipped.
    pub fn update_line_items_ecpm(&self, ecpm_by_id: &HashMap<i64, f64>) {
        let snapshot = self.snapshot();
        for items in snapshot.line_items.values() {
            for item in items.values() {
                if let Some(ecpm) = ecpm_by_id.get(&item.id) {
                    item.ecpm.set(*ecpm);
                }
            }
        }
    }
}
