//! Shared key-value store and job queue plumbing.
//!
//! The only cross-process state the fleet shares lives here: the ready
//! queue per task type, a delayed-retry set, per-job metadata records
//! (`job.<uid>`), published results (`result.<uid>`) and the CAPTCHA
//! coordination record (`audio_link_<origin>`). Access is last-writer-wins:
//! no locking, no transactions. Queue partitioning keeps same-key races
//! rare in practice.
//!
//! [`KvStore`] is the seam: production workers run against
//! [`RedisStore`], tests against [`MemoryStore`].

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::AsyncCommands;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;

    /// Append a payload to the tail of a ready queue.
    async fn push_ready(&self, queue: &str, payload: &str) -> Result<()>;

    /// Blocking-pop from the head of a ready queue, bounded by `timeout`.
    /// `None` on timeout.
    async fn pop_ready(&self, queue: &str, timeout: Duration) -> Result<Option<String>>;

    /// Park a payload until `due_at` (unix seconds) on the delayed set.
    async fn push_delayed(&self, queue: &str, payload: &str, due_at: f64) -> Result<()>;

    /// Remove and return every delayed payload whose due time has passed.
    async fn take_due_delayed(&self, queue: &str, now: f64) -> Result<Vec<String>>;
}

// ── Redis-backed store ───────────────────────────────────────────────────────

/// Production store over a multiplexed async Redis connection.
pub struct RedisStore {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .with_context(|| format!("invalid redis url {url}"))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .with_context(|| format!("cannot connect to redis at {url}"))?;
        Ok(Self { conn })
    }

    fn delayed_key(queue: &str) -> String {
        format!("{queue}:delayed")
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn push_ready(&self, queue: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(queue, payload).await?;
        Ok(())
    }

    async fn pop_ready(&self, queue: &str, timeout: Duration) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let popped: Option<(String, String)> =
            conn.blpop(queue, timeout.as_secs_f64()).await?;
        Ok(popped.map(|(_, payload)| payload))
    }

    async fn push_delayed(&self, queue: &str, payload: &str, due_at: f64) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(Self::delayed_key(queue), payload, due_at)
            .await?;
        Ok(())
    }

    async fn take_due_delayed(&self, queue: &str, now: f64) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let key = Self::delayed_key(queue);
        let due: Vec<String> = conn.zrangebyscore(&key, f64::MIN, now).await?;
        if !due.is_empty() {
            // Not atomic with the read; a duplicate pop between two workers is
            // a tolerated last-writer-wins race (see module docs).
            conn.zrem::<_, _, ()>(&key, &due).await?;
        }
        Ok(due)
    }
}

// ── In-memory store ──────────────────────────────────────────────────────────

/// Single-process stand-in used by the test-suite; mirrors RedisStore
/// semantics including the delayed set.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    kv: HashMap<String, String>,
    queues: HashMap<String, VecDeque<String>>,
    delayed: HashMap<String, Vec<(f64, String)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().unwrap().kv.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .kv
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.lock().unwrap().kv.remove(key);
        Ok(())
    }

    async fn push_ready(&self, queue: &str, payload: &str) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(payload.to_string());
        Ok(())
    }

    async fn pop_ready(&self, queue: &str, timeout: Duration) -> Result<Option<String>> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(payload) = self
                .inner
                .lock()
                .unwrap()
                .queues
                .get_mut(queue)
                .and_then(|q| q.pop_front())
            {
                return Ok(Some(payload));
            }
            if std::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn push_delayed(&self, queue: &str, payload: &str, due_at: f64) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .delayed
            .entry(queue.to_string())
            .or_default()
            .push((due_at, payload.to_string()));
        Ok(())
    }

    async fn take_due_delayed(&self, queue: &str, now: f64) -> Result<Vec<String>> {
        let mut inner = self.inner.lock().unwrap();
        let Some(entries) = inner.delayed.get_mut(queue) else {
            return Ok(Vec::new());
        };
        let mut due = Vec::new();
        entries.retain(|(due_at, payload)| {
            if *due_at <= now {
                due.push(payload.clone());
                false
            } else {
                true
            }
        });
        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_kv_roundtrip() {
        let store = MemoryStore::new();
        assert!(store.get("job.abc").await.unwrap().is_none());
        store.set("job.abc", "{}").await.unwrap();
        assert_eq!(store.get("job.abc").await.unwrap().as_deref(), Some("{}"));
        store.delete("job.abc").await.unwrap();
        assert!(store.get("job.abc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_store_queue_is_fifo() {
        let store = MemoryStore::new();
        store.push_ready("q", "a").await.unwrap();
        store.push_ready("q", "b").await.unwrap();
        let first = store.pop_ready("q", Duration::from_millis(50)).await.unwrap();
        let second = store.pop_ready("q", Duration::from_millis(50)).await.unwrap();
        assert_eq!(first.as_deref(), Some("a"));
        assert_eq!(second.as_deref(), Some("b"));
        let empty = store.pop_ready("q", Duration::from_millis(20)).await.unwrap();
        assert!(empty.is_none());
    }

    #[tokio::test]
    async fn delayed_entries_surface_only_when_due() {
        let store = MemoryStore::new();
        store.push_delayed("q", "later", 100.0).await.unwrap();
        store.push_delayed("q", "now", 10.0).await.unwrap();
        let due = store.take_due_delayed("q", 50.0).await.unwrap();
        assert_eq!(due, vec!["now".to_string()]);
        // The not-yet-due entry stays parked.
        let due = store.take_due_delayed("q", 50.0).await.unwrap();
        assert!(due.is_empty());
        let due = store.take_due_delayed("q", 150.0).await.unwrap();
        assert_eq!(due, vec!["later".to_string()]);
    }
}
