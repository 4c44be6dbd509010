//! CTR predictor client — optional, cached, bounded-latency lookup that
//! scales the effective CPM of CPC line items.
//!
//! The predictor can never block or fail a serve: on timeout or error the
//! client answers with a neutral prediction (boost 1.0).

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

pub use adserve_core::config::CtrConfig;

/// Prediction request; all fields key the cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CtrRequest {
    pub line_item_id: i64,
    pub device_type: String,
    pub country: String,
    pub hour_of_day: u8,
    pub day_of_week: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publisher_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct CtrPrediction {
    pub ctr_score: f64,
    pub confidence: f64,
    pub boost_multiplier: f64,
}

impl CtrPrediction {
    /// The do-nothing prediction used whenever the predictor is disabled,
    /// slow or unreachable.
    pub fn neutral() -> Self {
        Self {
            ctr_score: 0.0,
            confidence: 0.0,
            boost_multiplier: 1.0,
        }
    }
}

struct CacheEntry {
    prediction: CtrPrediction,
    inserted_at: Instant,
}

pub struct CtrPredictor {
    enabled: bool,
    http: reqwest::Client,
    url: String,
    timeout: Duration,
    cache: DashMap<CtrRequest, CacheEntry>,
    cache_ttl: Duration,
}

impl CtrPredictor {
    pub fn new(config: &CtrConfig) -> Self {
        Self {
            enabled: config.enabled && !config.predictor_url.is_empty(),
            http: reqwest::Client::new(),
            url: config.predictor_url.clone(),
            timeout: config.timeout(),
            cache: DashMap::new(),
            cache_ttl: config.cache_ttl(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Look up a prediction, serving from the in-process cache when fresh.
    /// Never fails upward.
    pub async fn predict(&self, request: &CtrRequest) -> CtrPrediction {
        if !self.enabled {
            return CtrPrediction::neutral();
        }

        if let Some(entry) = self.cache.get(request) {
            if entry.inserted_at.elapsed() < self.cache_ttl {
                metrics::counter!("ctr.cache_hits").increment(1);
                return entry.prediction;
            }
        }
        metrics::counter!("ctr.cache_misses").increment(1);

        match self.fetch(request).await {
            Some(prediction) => {
                self.cache.insert(
                    request.clone(),
                    CacheEntry {
                        prediction,
                        inserted_at: Instant::now(),
                    },
                );
                prediction
            }
            None => {
                metrics::counter!("ctr.fallbacks").increment(1);
                CtrPrediction::neutral()
            }
        }
    }

    async fn fetch(&self, request: &CtrRequest) -> Option<CtrPrediction> {
        let url = format!("{}/predict", self.url.trim_end_matches('/'));
        let call = self.http.post(&url).json(request).send();

        let response = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(response)) if response.status().is_success() => response,
            Ok(Ok(response)) => {
                debug!(status = %response.status(), "CTR predictor returned non-200");
                return None;
            }
            Ok(Err(e)) => {
                debug!(error = %e, "CTR predictor call failed");
                return None;
            }
            Err(_) => {
                debug!(timeout_ms = self.timeout.as_millis() as u64, "CTR predictor deadline exceeded");
                return None;
            }
        };

        match tokio::time::timeout(self.timeout, response.json::<CtrPrediction>()).await {
            Ok(Ok(prediction)) => Some(prediction),
            _ => None,
        }
    }

    /// Remove expired cache entries, returning how many were purged.
    pub fn purge_expired(&self) -> usize {
        let before = self.cache.len();
        let ttl = self.cache_ttl;
        self.cache.retain(|_, entry| entry.inserted_at.elapsed() < ttl);
        before - self.cache.len()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Spawn the background cleanup that purges expired entries on an
    /// interval.
    pub fn spawn_cache_cleanup(
        predictor: Arc<Self>,
        every: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            loop {
                tick.tick().await;
                let purged = predictor.purge_expired();
                if purged > 0 {
                    debug!(purged, "CTR cache cleanup");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn request(line_item_id: i64) -> CtrRequest {
        CtrRequest {
            line_item_id,
            device_type: "mobile".to_string(),
            country: "US".to_string(),
            hour_of_day: 14,
            day_of_week: 2,
            publisher_id: Some(1),
        }
    }

    fn predictor_config(url: &str, cache_ttl_secs: u64) -> CtrConfig {
        CtrConfig {
            enabled: true,
            predictor_url: url.to_string(),
            timeout_ms: 100,
            cache_ttl_secs,
        }
    }

    /// Stub predictor endpoint counting how many requests it served.
    async fn spawn_predictor_stub(hits: Arc<AtomicUsize>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                hits.fetch_add(1, Ordering::SeqCst);
                let mut buf = vec![0u8; 8192];
                let mut read = 0;
                loop {
                    let n = socket.read(&mut buf[read..]).await.unwrap_or(0);
                    read += n;
                    if n == 0 || buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let body = r#"{"ctr_score":0.042,"confidence":0.9,"boost_multiplier":1.4}"#;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_disabled_is_neutral() {
        let predictor = CtrPredictor::new(&CtrConfig::default());
        assert!(!predictor.enabled());
        assert_eq!(predictor.predict(&request(1)).await, CtrPrediction::neutral());
    }

    #[tokio::test]
    async fn test_unreachable_predictor_is_neutral() {
        let predictor = CtrPredictor::new(&predictor_config("http://127.0.0.1:9", 300));
        let prediction = predictor.predict(&request(1)).await;
        assert_eq!(prediction, CtrPrediction::neutral());
        // Failures are not cached.
        assert_eq!(predictor.cache_len(), 0);
    }

    #[tokio::test]
    async fn test_prediction_cached_per_key() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_predictor_stub(hits.clone()).await;
        let predictor = CtrPredictor::new(&predictor_config(&url, 300));

        let first = predictor.predict(&request(1)).await;
        assert_eq!(first.boost_multiplier, 1.4);
        let second = predictor.predict(&request(1)).await;
        assert_eq!(second, first);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(predictor.cache_len(), 1);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_predictor_stub(hits.clone()).await;
        // Zero TTL: everything is expired as soon as it lands.
        let predictor = CtrPredictor::new(&predictor_config(&url, 0));

        predictor.predict(&request(1)).await;
        assert_eq!(predictor.cache_len(), 1);
        assert_eq!(predictor.purge_expired(), 1);
        assert_eq!(predictor.cache_len(), 0);
    }
}
