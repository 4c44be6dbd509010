//! Programmatic bidder client — concurrent HTTP fan-out to line-item-owned
//! endpoints.
//!
//! Each callout gets an independent deadline, so one slow bidder cannot
//! delay the aggregate beyond it. A non-200 status, malformed body, missing
//! bid or non-positive price are all recorded as "no bid" for that line
//! item only; every fan-out is awaited before ranking proceeds.

use adserve_core::config::BiddingConfig;
use adserve_core::openrtb::{ProgrammaticBidRequest, ProgrammaticBidResponse, ProgrammaticImp};
use adserve_core::types::LineItem;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, warn};

pub struct ProgrammaticBidder {
    http: reqwest::Client,
    timeout: Duration,
}

impl ProgrammaticBidder {
    pub fn new(config: &BiddingConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            timeout: config.timeout(),
        }
    }

    /// Fan out one bid request per programmatic line item and collect the
    /// prices keyed by line item id. A line item that produced no bid maps
    /// to 0.0.
    pub async fn fetch_bids(
        &self,
        items: &[Arc<LineItem>],
        request_id: &str,
        imp_id: &str,
        width: u32,
        height: u32,
    ) -> HashMap<i64, f64> {
        let mut bids = HashMap::with_capacity(items.len());
        if items.is_empty() {
            return bids;
        }

        let body = ProgrammaticBidRequest {
            id: request_id.to_string(),
            imp: vec![ProgrammaticImp {
                id: imp_id.to_string(),
                w: width,
                h: height,
            }],
        };

        let mut callouts = JoinSet::new();
        for item in items {
            let Some(endpoint) = item.programmatic_endpoint.clone() else {
                bids.insert(item.id, 0.0);
                continue;
            };
            let http = self.http.clone();
            let timeout = self.timeout;
            let body = body.clone();
            let line_item_id = item.id;

            callouts.spawn(async move {
                let price = call_bidder(&http, &endpoint, &body, timeout, line_item_id).await;
                (line_item_id, price)
            });
        }

        while let Some(joined) = callouts.join_next().await {
            match joined {
                Ok((line_item_id, price)) => {
                    bids.insert(line_item_id, price);
                }
                Err(e) => {
                    warn!(error = %e, "Bidder callout task failed");
                }
            }
        }

        bids
    }
}

async fn call_bidder(
    http: &reqwest::Client,
    endpoint: &str,
    body: &ProgrammaticBidRequest,
    timeout: Duration,
    line_item_id: i64,
) -> f64 {
    let start = Instant::now();
    metrics::counter!("bidder.requests").increment(1);

    let result = http
        .post(endpoint)
        .timeout(timeout)
        .json(body)
        .send()
        .await;

    let price = match result {
        Ok(response) if response.status().is_success() => {
            match response.json::<ProgrammaticBidResponse>().await {
                Ok(parsed) => parsed.first_price().unwrap_or(0.0),
                Err(e) => {
                    debug!(line_item_id, error = %e, "Malformed bidder response");
                    0.0
                }
            }
        }
        Ok(response) => {
            debug!(line_item_id, status = %response.status(), "Bidder returned non-200");
            0.0
        }
        Err(e) => {
            debug!(line_item_id, error = %e, "Bidder callout failed");
            0.0
        }
    };

    metrics::histogram!("bidder.latency_ms").record(start.elapsed().as_millis() as f64);
    if price > 0.0 {
        metrics::counter!("bidder.bids").increment(1);
    } else {
        metrics::counter!("bidder.no_bids").increment(1);
    }

    price
}
