//! JSON catalog bootstrap. The admin system of record lives elsewhere; this
//! loader feeds the store at startup and on the periodic reload tick.

use crate::store::AdStore;
use adserve_core::error::AdResult;
use adserve_core::types::{Campaign, Creative, LineItem, Placement, Publisher};
use anyhow::Context;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Default, Deserialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub publishers: Vec<Publisher>,
    #[serde(default)]
    pub placements: Vec<Placement>,
    #[serde(default)]
    pub campaigns: Vec<Campaign>,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
    #[serde(default)]
    pub creatives: Vec<Creative>,
}

impl CatalogFile {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading catalog file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parsing catalog file {}", path.display()))
    }

    /// Publish this file's contents as the store's next generation.
    pub fn apply(self, store: &AdStore) -> AdResult<()> {
        store.reload_all(
            self.line_items,
            self.campaigns,
            self.publishers,
            self.placements,
            self.creatives,
        )
    }
}
