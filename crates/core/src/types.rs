//! Catalog entities and the per-request targeting context.

use crate::util::AtomicF64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// A publisher tenant. Owns placements, campaigns, line items and creatives;
/// entities of one publisher are never visible to another.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Publisher {
    pub id: i64,
    pub name: String,
    pub domain: String,
    pub api_key: String,
    /// Custom event types accepted on the tracking surface. Empty rejects all.
    #[serde(default)]
    pub allowed_event_types: Vec<String>,
}

/// An ad slot on a publisher surface. The id is publisher-scoped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Placement {
    pub id: String,
    pub publisher_id: i64,
    pub width: u32,
    pub height: u32,
    /// Ordered format tags this slot accepts. Empty means unconstrained.
    #[serde(default)]
    pub allowed_formats: Vec<String>,
}

/// Reporting grouping only; carries no runtime policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: i64,
    pub publisher_id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum PaceMode {
    #[default]
    Asap,
    Even,
    Pid,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum BudgetType {
    #[default]
    Cpm,
    Cpc,
    Flat,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum LineItemType {
    #[default]
    Direct,
    Programmatic,
}

/// The unit of delivery configuration: targeting, pacing, budget, bidding
/// model and priority.
///
/// `spend` and `ecpm` are atomic cells so post-serve accounting and the CTR
/// recomputation path can write them through a shared snapshot reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItem {
    pub id: i64,
    pub campaign_id: i64,
    pub publisher_id: i64,
    pub name: String,
    #[serde(default)]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_at: Option<DateTime<Utc>>,
    /// 0 = unlimited.
    #[serde(default)]
    pub daily_impression_cap: i64,
    /// 0 = unlimited.
    #[serde(default)]
    pub daily_click_cap: i64,
    #[serde(default)]
    pub pace_mode: PaceMode,
    #[serde(default = "default_priority")]
    pub priority: String,
    /// 0 = use the engine-wide default.
    #[serde(default)]
    pub frequency_cap: i64,
    #[serde(default = "default_frequency_window_secs")]
    pub frequency_window_secs: u64,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub device_type: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub browser: String,
    /// Every entry must match the request context; empty = wildcard.
    #[serde(default)]
    pub key_values: HashMap<String, String>,
    pub active: bool,
    #[serde(default)]
    pub cpm: f64,
    #[serde(default)]
    pub cpc: f64,
    /// Effective CPM used for ranking: cpm for CPM items, cpc * ctr * 1000
    /// for CPC items. Refreshed in bulk by the CTR recomputation path.
    #[serde(default)]
    pub ecpm: AtomicF64,
    #[serde(default)]
    pub budget_type: BudgetType,
    #[serde(default)]
    pub budget_amount: f64,
    /// Monotonically non-decreasing during a process lifetime.
    #[serde(default)]
    pub spend: AtomicF64,
    #[serde(rename = "type", default)]
    pub kind: LineItemType,
    /// Required iff `kind` is PROGRAMMATIC.
    #[serde(default)]
    pub programmatic_endpoint: Option<String>,
    #[serde(default)]
    pub click_url: Option<String>,
}

fn default_priority() -> String {
    "medium".to_string()
}

fn default_frequency_window_secs() -> u64 {
    86_400
}

impl LineItem {
    pub fn is_programmatic(&self) -> bool {
        self.kind == LineItemType::Programmatic
    }

    /// Flight window check against `now`; an unset bound is open.
    pub fn in_flight(&self, now: DateTime<Utc>) -> bool {
        if let Some(start) = self.start_at {
            if now < start {
                return false;
            }
        }
        if let Some(end) = self.end_at {
            if now > end {
                return false;
            }
        }
        true
    }

    /// Per-user exposure cap, falling back to the engine default when unset.
    pub fn effective_frequency_cap(&self, default_cap: i64) -> i64 {
        if self.frequency_cap > 0 {
            self.frequency_cap
        } else {
            default_cap
        }
    }

    pub fn frequency_window(&self) -> Duration {
        Duration::from_secs(self.frequency_window_secs)
    }
}

/// A single banner asset; a banner creative carries an ordered list of these
/// and is composed into HTML server-side at response time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BannerAsset {
    pub url: String,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub alt: String,
}

/// The renderable unit selected by the engine. Exactly one of `html`,
/// `native`, `banner` is authoritative for the declared format. The creative
/// references its line item by id; the catalog snapshot resolves the pointer
/// at load time and recomputes it on reload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Creative {
    pub id: i64,
    pub placement_id: String,
    pub line_item_id: i64,
    pub campaign_id: i64,
    pub publisher_id: i64,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub native: Option<serde_json::Value>,
    #[serde(default)]
    pub banner: Option<Vec<BannerAsset>>,
    pub width: u32,
    pub height: u32,
    /// Format tag; empty means the creative declares none.
    #[serde(default)]
    pub format: String,
    /// Overrides the line item's click URL when set.
    #[serde(default)]
    pub click_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Desktop,
    Mobile,
    Tablet,
    #[default]
    Other,
}

impl DeviceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Desktop => "desktop",
            DeviceClass::Mobile => "mobile",
            DeviceClass::Tablet => "tablet",
            DeviceClass::Other => "other",
        }
    }
}

/// Normalized per-request targeting context produced by the resolver.
/// Bots are flagged and carried through; filtering them is caller policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetingContext {
    pub device_type: DeviceClass,
    /// Formatted as `Name major.minor.patch`, e.g. "iOS 15.1.0".
    pub os: String,
    pub browser: String,
    pub is_bot: bool,
    pub country: String,
    pub region: String,
    #[serde(default)]
    pub key_values: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn line_item() -> LineItem {
        serde_json::from_value(serde_json::json!({
            "id": 1,
            "campaign_id": 10,
            "publisher_id": 100,
            "name": "test",
            "active": true,
        }))
        .expect("minimal line item deserializes")
    }

    #[test]
    fn test_line_item_defaults() {
        let li = line_item();
        assert_eq!(li.pace_mode, PaceMode::Asap);
        assert_eq!(li.kind, LineItemType::Direct);
        assert_eq!(li.priority, "medium");
        assert_eq!(li.daily_impression_cap, 0);
        assert_eq!(li.effective_frequency_cap(3), 3);
        assert_eq!(li.frequency_window(), Duration::from_secs(86_400));
    }

    #[test]
    fn test_flight_window() {
        let mut li = line_item();
        let now = Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap();
        assert!(li.in_flight(now));

        li.start_at = Some(Utc.with_ymd_and_hms(2025, 6, 16, 0, 0, 0).unwrap());
        assert!(!li.in_flight(now));

        li.start_at = Some(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap());
        li.end_at = Some(Utc.with_ymd_and_hms(2025, 6, 10, 0, 0, 0).unwrap());
        assert!(!li.in_flight(now));
    }

    #[test]
    fn test_pace_mode_wire_names() {
        assert_eq!(
            serde_json::to_string(&PaceMode::Pid).expect("serialize"),
            "\"PID\""
        );
        let mode: PaceMode = serde_json::from_str("\"EVEN\"").expect("deserialize");
        assert_eq!(mode, PaceMode::Even);
    }
}
