//! OpenRTB-shaped wire types for the ad request surface.
//! Subset of fields relevant to placement-based decisioning.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Incoming ad request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdRequest {
    pub id: String,
    pub imp: Vec<Imp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<Device>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext: Option<RequestExt>,
}

/// One impression opportunity; `tagid` carries the placement id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Imp {
    pub id: String,
    #[serde(default)]
    pub tagid: String,
    /// 0 inherits the placement width.
    #[serde(default)]
    pub w: u32,
    /// 0 inherits the placement height.
    #[serde(default)]
    pub h: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct User {
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Device {
    #[serde(default)]
    pub ua: String,
    #[serde(default)]
    pub ip: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestExt {
    #[serde(default)]
    pub publisher_id: i64,
    #[serde(default)]
    pub kv: HashMap<String, String>,
}

/// Outgoing ad response. `nbr` is present with an empty `seatbid` on no-ad.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdResponse {
    pub id: String,
    #[serde(default)]
    pub seatbid: Vec<SeatBid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nbr: Option<i32>,
}

impl AdResponse {
    pub fn no_ad(request_id: String, reason: i32) -> Self {
        Self {
            id: request_id,
            seatbid: Vec::new(),
            nbr: Some(reason),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeatBid {
    pub bid: Vec<Bid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bid {
    pub id: String,
    pub impid: String,
    pub crid: String,
    pub cid: String,
    pub adm: String,
    pub price: f64,
    pub impurl: String,
    pub clkurl: String,
    pub evturl: String,
}

/// No-bid reason codes carried in `AdResponse.nbr`.
pub mod nobid {
    /// Generic no fill: the ranking set was empty after filters and bids.
    pub const NO_FILL: i32 = 0;
    /// Candidate filtering hit an internal limit (rate limiting).
    pub const TECHNICAL: i32 = 1;
    /// The request referenced an unknown placement or failed validation.
    pub const INVALID_REQUEST: i32 = 2;
    /// Every candidate was throttled by delivery pacing.
    pub const DAILY_CAP_REACHED: i32 = 9;
}

/// Minimal body POSTed to a programmatic line item's endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgrammaticBidRequest {
    pub id: String,
    pub imp: Vec<ProgrammaticImp>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgrammaticImp {
    pub id: String,
    pub w: u32,
    pub h: u32,
}

/// Bidder response shape; only the first seat's first bid is consulted.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProgrammaticBidResponse {
    #[serde(default)]
    pub seatbid: Vec<ProgrammaticSeatBid>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProgrammaticSeatBid {
    #[serde(default)]
    pub bid: Vec<ProgrammaticBid>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProgrammaticBid {
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub adm: String,
}

impl ProgrammaticBidResponse {
    /// First seat, first bid price; `None` when absent or non-positive.
    pub fn first_price(&self) -> Option<f64> {
        let bid = self.seatbid.first()?.bid.first()?;
        (bid.price > 0.0).then_some(bid.price)
    }
}
