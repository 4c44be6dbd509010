//! Channel-based analytics logger with a background ClickHouse batch writer.

use adserve_core::config::AnalyticsConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AdEventKind {
    Serve,
    NoAd,
    Impression,
    Click,
    Custom,
    Report,
}

/// One delivery event row.
#[derive(Debug, Clone, Serialize)]
pub struct AdEvent {
    pub event_id: Uuid,
    pub kind: AdEventKind,
    pub request_id: String,
    pub publisher_id: i64,
    pub placement_id: Option<String>,
    pub campaign_id: Option<i64>,
    pub line_item_id: Option<i64>,
    pub creative_id: Option<i64>,
    pub user_id: Option<String>,
    /// Custom event type for `Custom` rows.
    pub event_type: Option<String>,
    pub price: Option<f64>,
    pub latency_us: Option<u64>,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
}

impl AdEvent {
    pub fn new(kind: AdEventKind, request_id: impl Into<String>, publisher_id: i64) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            kind,
            request_id: request_id.into(),
            publisher_id,
            placement_id: None,
            campaign_id: None,
            line_item_id: None,
            creative_id: None,
            user_id: None,
            event_type: None,
            price: None,
            latency_us: None,
            node_id: String::new(),
            timestamp: Utc::now(),
        }
    }
}

/// Analytics logger handle. Submission is non-blocking: when the queue is
/// full the event is dropped and counted, never awaited.
pub struct AnalyticsLogger {
    sender: Option<mpsc::Sender<AdEvent>>,
    node_id: String,
}

impl AnalyticsLogger {
    /// Create the logger and spawn the background batch writer.
    pub async fn new(config: &AnalyticsConfig, node_id: String) -> anyhow::Result<Self> {
        let (sender, receiver) = mpsc::channel::<AdEvent>(100_000);

        let writer = BatchWriter::new(config).await?;
        let batch_size = config.batch_size;
        let max_batch_delay = std::time::Duration::from_millis(config.flush_interval_ms);

        tokio::spawn(writer.run(receiver, batch_size, max_batch_delay));

        info!("Analytics logger initialized with ClickHouse backend");

        Ok(Self {
            sender: Some(sender),
            node_id,
        })
    }

    /// A logger that drops every event. Used when the sink is unreachable
    /// at startup and in tests.
    pub fn disabled(node_id: String) -> Self {
        Self {
            sender: None,
            node_id,
        }
    }

    /// Queue an event for the background writer.
    pub fn log(&self, mut event: AdEvent) {
        event.node_id = self.node_id.clone();
        let Some(sender) = &self.sender else {
            return;
        };
        if let Err(e) = sender.try_send(event) {
            metrics::counter!("analytics.dropped").increment(1);
            warn!("Analytics event dropped: {e}");
        } else {
            metrics::counter!("analytics.queued").increment(1);
        }
    }
}

/// `ad_events` table definition. Daily partitions keyed for per-publisher
/// reporting scans; rows age out after 90 days.
const AD_EVENTS_DDL: &str = "\
CREATE TABLE IF NOT EXISTS ad_events (
    event_id     UUID,
    kind         LowCardinality(String),
    request_id   String,
    publisher_id Int64,
    placement_id Nullable(String),
    campaign_id  Nullable(Int64),
    line_item_id Nullable(Int64),
    creative_id  Nullable(Int64),
    user_id      Nullable(String),
    event_type   Nullable(String),
    price        Nullable(Float64),
    latency_us   Nullable(UInt64),
    node_id      String,
    timestamp    DateTime64(3)
)
ENGINE = MergeTree
PARTITION BY toDate(timestamp)
ORDER BY (publisher_id, kind, timestamp)
TTL toDateTime(timestamp) + INTERVAL 90 DAY";

/// Background writer draining the channel into ClickHouse inserts.
struct BatchWriter {
    client: clickhouse::Client,
}

impl BatchWriter {
    async fn new(config: &AnalyticsConfig) -> anyhow::Result<Self> {
        let client = clickhouse::Client::default()
            .with_url(&config.url)
            .with_database(&config.database);

        client.query(AD_EVENTS_DDL).execute().await?;
        info!("ClickHouse schema verified");

        Ok(Self { client })
    }

    /// Drain loop. Each batch is anchored at its first event: the writer
    /// blocks until something arrives, then keeps collecting until the
    /// batch is full or `max_delay` has passed since that first event, so a
    /// trickle of events still reaches ClickHouse within one delay window
    /// and an idle channel costs nothing. Returns when every sender is
    /// gone.
    async fn run(
        self,
        mut receiver: mpsc::Receiver<AdEvent>,
        batch_size: usize,
        max_delay: std::time::Duration,
    ) {
        while let Some(first) = receiver.recv().await {
            let mut batch = Vec::with_capacity(batch_size);
            batch.push(first);

            let deadline = tokio::time::Instant::now() + max_delay;
            while batch.len() < batch_size {
                match tokio::time::timeout_at(deadline, receiver.recv()).await {
                    Ok(Some(event)) => batch.push(event),
                    // Channel closed: write what we have and let the outer
                    // recv observe the close.
                    Ok(None) => break,
                    // Window elapsed with a partial batch.
                    Err(_) => break,
                }
            }

            self.write_batch(&batch).await;
        }
        debug!("Analytics writer draining complete");
    }

    async fn write_batch(&self, batch: &[AdEvent]) {
        let mut body = String::with_capacity(batch.len() * 256);
        let mut written = 0u64;
        for event in batch {
            match serde_json::to_string(event) {
                Ok(row) => {
                    body.push_str(&row);
                    body.push('\n');
                    written += 1;
                }
                Err(e) => {
                    metrics::counter!("analytics.serialize_errors").increment(1);
                    error!(error = %e, "Unserializable analytics event skipped");
                }
            }
        }
        if written == 0 {
            return;
        }

        let statement = format!("INSERT INTO ad_events FORMAT JSONEachRow\n{body}");
        match self.client.query(&statement).execute().await {
            Ok(()) => {
                metrics::counter!("analytics.flushed").increment(written);
            }
            Err(e) => {
                metrics::counter!("analytics.flush_errors").increment(1);
                error!(error = %e, rows = written, "Analytics batch insert failed");
            }
        }
    }
}
