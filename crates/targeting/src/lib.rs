//! Targeting resolver — converts a raw request (user-agent string, client
//! IP, custom key-values) into a normalized `TargetingContext`.
//!
//! Bots are flagged and carried through; whether to filter them is the
//! caller's policy.

mod device;
mod geo;

pub use device::classify_device;

use adserve_core::types::TargetingContext;
use anyhow::anyhow;
use fast_uaparser::{Device, OperatingSystem, UserAgent};
use geo::GeoReader;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::info;

/// The parser tables are process-global and load once.
fn init_ua_parser() -> anyhow::Result<()> {
    static INIT: OnceLock<Result<(), String>> = OnceLock::new();
    INIT.get_or_init(|| fast_uaparser::init().map(|_| ()).map_err(|e| e.to_string()))
        .clone()
        .map_err(|e| anyhow!("ua parser init: {e}"))
}

pub struct TargetingResolver {
    geo: Option<GeoReader>,
}

impl TargetingResolver {
    /// Initialize the UA parser tables and, when `geoip_db` is non-empty,
    /// open the MaxMind database.
    pub fn new(geoip_db: &str) -> anyhow::Result<Self> {
        init_ua_parser()?;

        let geo = if geoip_db.is_empty() {
            info!("GeoIP disabled; targeting contexts carry no geography");
            None
        } else {
            let reader = GeoReader::open(geoip_db)?;
            info!(path = %geoip_db, "GeoIP database loaded");
            Some(reader)
        };

        Ok(Self { geo })
    }

    pub fn resolve(
        &self,
        user_agent: &str,
        ip: &str,
        key_values: HashMap<String, String>,
    ) -> TargetingContext {
        let mut ctx = TargetingContext {
            key_values,
            ..TargetingContext::default()
        };

        if let Ok(parsed_ip) = ip.parse() {
            if let Some(geo) = &self.geo {
                let (country, region) = geo.lookup(parsed_ip);
                ctx.country = country;
                ctx.region = region;
            }
        }

        let device: Option<Device> = user_agent.parse().ok();
        let os: Option<OperatingSystem> = user_agent.parse().ok();
        let browser: Option<UserAgent> = user_agent.parse().ok();

        let device_family = device.as_ref().map(|d| d.family.as_str()).unwrap_or("");
        let os_family = os.as_ref().map(|o| o.family.as_str()).unwrap_or("");

        let (class, is_bot) = classify_device(device_family, os_family);
        ctx.device_type = class;
        ctx.is_bot = is_bot;

        if let Some(os) = os {
            ctx.os = format!(
                "{} {}",
                os.family,
                format_version(os.major, os.minor, os.patch)
            );
        }
        if let Some(browser) = browser {
            ctx.browser = format!(
                "{} {}",
                browser.family,
                format_version(browser.major, browser.minor, browser.patch)
            );
        }

        ctx
    }
}

fn format_version(
    major: Option<String>,
    minor: Option<String>,
    patch: Option<String>,
) -> String {
    format!(
        "{}.{}.{}",
        major.unwrap_or_else(|| "0".to_string()),
        minor.unwrap_or_else(|| "0".to_string()),
        patch.unwrap_or_else(|| "0".to_string())
    )
}
