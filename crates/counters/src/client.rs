//! Counter store client.
//!
//! The production backend is Redis; an embedded in-memory backend serves
//! single-node development and tests. Every failure collapses to a single
//! `Unavailable` error so callers can apply a uniform fail-open policy
//! instead of inspecting transport details.

use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum CounterError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
}

impl From<redis::RedisError> for CounterError {
    fn from(err: redis::RedisError) -> Self {
        CounterError::Unavailable(err.to_string())
    }
}

#[derive(Clone)]
enum Backend {
    Redis(ConnectionManager),
    Memory(Arc<Mutex<MemoryCounters>>),
}

/// Counter store handle. Cheap to clone; all methods take `&self`.
#[derive(Clone)]
pub struct CounterStore {
    backend: Backend,
}

impl CounterStore {
    /// Connect to Redis and verify connectivity with a PING.
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        info!(url = %url, "Connecting to counter store");

        let client = redis::Client::open(url)?;
        let mut conn = ConnectionManager::new(client).await?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!(response = %pong, "Counter store connection established");

        Ok(Self {
            backend: Backend::Redis(conn),
        })
    }

    /// Embedded process-local backend. Counters are not shared across
    /// replicas; intended for tests and single-node development.
    pub fn memory() -> Self {
        Self {
            backend: Backend::Memory(Arc::new(Mutex::new(MemoryCounters::default()))),
        }
    }

    /// Atomically increment `key`; when the resulting value is 1 the key is
    /// new and `ttl` is applied.
    pub async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, CounterError> {
        match &self.backend {
            Backend::Redis(conn) => {
                let mut conn = conn.clone();
                let value: i64 = conn.incr(key, 1).await?;
                if value == 1 {
                    conn.expire::<_, ()>(key, ttl.as_secs() as i64).await?;
                }
                Ok(value)
            }
            Backend::Memory(map) => Ok(map.lock().incr_with_ttl(key, ttl)),
        }
    }

    /// Read an integer counter. A missing key is `None`, never an error.
    pub async fn get_int(&self, key: &str) -> Result<Option<i64>, CounterError> {
        match &self.backend {
            Backend::Redis(conn) => {
                let mut conn = conn.clone();
                let value: Option<i64> = conn.get(key).await?;
                Ok(value)
            }
            Backend::Memory(map) => Ok(map.lock().get(key).and_then(|s| s.parse().ok())),
        }
    }

    /// Fetch a batch of integer counters in a single round trip. Results
    /// preserve submission order; a missing key is `None`, distinguishable
    /// from a stored zero.
    pub async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<i64>>, CounterError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        match &self.backend {
            Backend::Redis(conn) => {
                let mut conn = conn.clone();
                let mut pipe = redis::pipe();
                for key in keys {
                    pipe.get(key);
                }
                let values: Vec<Option<i64>> = pipe.query_async(&mut conn).await?;
                Ok(values)
            }
            Backend::Memory(map) => {
                let mut map = map.lock();
                Ok(keys
                    .iter()
                    .map(|key| map.get(key).and_then(|s| s.parse().ok()))
                    .collect())
            }
        }
    }

    /// Read a text-encoded float (PID controller state).
    pub async fn get_float(&self, key: &str) -> Result<Option<f64>, CounterError> {
        match &self.backend {
            Backend::Redis(conn) => {
                let mut conn = conn.clone();
                let raw: Option<String> = conn.get(key).await?;
                Ok(raw.and_then(|s| s.parse().ok()))
            }
            Backend::Memory(map) => Ok(map.lock().get(key).and_then(|s| s.parse().ok())),
        }
    }

    /// Store a text-encoded float with a TTL (PID controller state).
    pub async fn set_float(
        &self,
        key: &str,
        value: f64,
        ttl: Duration,
    ) -> Result<(), CounterError> {
        match &self.backend {
            Backend::Redis(conn) => {
                let mut conn = conn.clone();
                conn.set_ex::<_, _, ()>(key, value.to_string(), ttl.as_secs())
                    .await?;
                Ok(())
            }
            Backend::Memory(map) => {
                map.lock().set(key, value.to_string(), ttl);
                Ok(())
            }
        }
    }
}

#[derive(Debug, Default)]
struct MemoryCounters {
    entries: HashMap<String, MemoryEntry>,
}

#[derive(Debug)]
struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryCounters {
    fn incr_with_ttl(&mut self, key: &str, ttl: Duration) -> i64 {
        let current = self.get(key).and_then(|s| s.parse::<i64>().ok());
        match current {
            Some(value) => {
                let next = value + 1;
                if let Some(entry) = self.entries.get_mut(key) {
                    entry.value = next.to_string();
                }
                next
            }
            None => {
                self.entries.insert(
                    key.to_string(),
                    MemoryEntry {
                        value: "1".to_string(),
                        expires_at: Some(Instant::now() + ttl),
                    },
                );
                1
            }
        }
    }

    fn get(&mut self, key: &str) -> Option<String> {
        let entry = self.entries.get(key)?;
        if entry.expires_at.is_some_and(|at| at <= Instant::now()) {
            self.entries.remove(key);
            return None;
        }
        Some(self.entries[key].value.clone())
    }

    fn set(&mut self, key: &str, value: String, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value,
                expires_at: Some(Instant::now() + ttl),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_incr_applies_ttl_only_on_first_set() {
        let store = CounterStore::memory();
        assert_eq!(
            store
                .incr_with_ttl("k", Duration::from_secs(60))
                .await
                .expect("incr"),
            1
        );
        assert_eq!(
            store
                .incr_with_ttl("k", Duration::from_secs(60))
                .await
                .expect("incr"),
            2
        );
        assert_eq!(store.get_int("k").await.expect("get"), Some(2));
    }

    #[tokio::test]
    async fn test_missing_key_is_none_not_zero() {
        let store = CounterStore::memory();
        assert_eq!(store.get_int("absent").await.expect("get"), None);
    }

    #[tokio::test]
    async fn test_expired_key_reads_as_missing() {
        let store = CounterStore::memory();
        store
            .incr_with_ttl("gone", Duration::from_millis(1))
            .await
            .expect("incr");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.get_int("gone").await.expect("get"), None);
        // A fresh increment starts the counter over.
        assert_eq!(
            store
                .incr_with_ttl("gone", Duration::from_secs(60))
                .await
                .expect("incr"),
            1
        );
    }

    #[tokio::test]
    async fn test_pipeline_preserves_submission_order() {
        let store = CounterStore::memory();
        store
            .incr_with_ttl("a", Duration::from_secs(60))
            .await
            .expect("incr");
        store
            .incr_with_ttl("c", Duration::from_secs(60))
            .await
            .expect("incr");
        store
            .incr_with_ttl("c", Duration::from_secs(60))
            .await
            .expect("incr");

        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let values = store.get_many(&keys).await.expect("pipeline");
        assert_eq!(values, vec![Some(1), None, Some(2)]);
    }

    #[tokio::test]
    async fn test_float_round_trip() {
        let store = CounterStore::memory();
        store
            .set_float("pid", -12.5, Duration::from_secs(60))
            .await
            .expect("set");
        assert_eq!(store.get_float("pid").await.expect("get"), Some(-12.5));
        assert_eq!(store.get_float("absent").await.expect("get"), None);
    }
}
