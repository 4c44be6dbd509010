//! MaxMind GeoIP lookups for country and region codes.

use anyhow::Context;
use maxminddb::geoip2;
use std::net::IpAddr;
use std::path::Path;

pub struct GeoReader {
    reader: maxminddb::Reader<Vec<u8>>,
}

impl GeoReader {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let reader = maxminddb::Reader::open_readfile(path)
            .with_context(|| format!("opening GeoIP database {}", path.display()))?;
        Ok(Self { reader })
    }

    /// `(country, region)` ISO codes; empty strings when unknown.
    pub fn lookup(&self, ip: IpAddr) -> (String, String) {
        let Ok(city) = self.reader.lookup::<geoip2::City>(ip) else {
            return (String::new(), String::new());
        };

        let country = city
            .country
            .as_ref()
            .and_then(|c| c.iso_code)
            .unwrap_or("")
            .to_string();
        let region = city
            .subdivisions
            .as_ref()
            .and_then(|subs| subs.first())
            .and_then(|sub| sub.iso_code)
            .unwrap_or("")
            .to_string();

        (country, region)
    }
}
