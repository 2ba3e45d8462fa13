//! In-memory checkpoint storage
//!
//! [`InMemoryCheckpointer`] keeps every thread's chain in a `RwLock<HashMap>`.
//! It is the ephemeral backend used to carry state across a single interrupt:
//! entries older than the configured TTL are evicted lazily on access. With no
//! TTL it doubles as the test backend.

use crate::checkpoint::{Checkpoint, Checkpointer};
use crate::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct StoredCheckpoint {
    checkpoint: Checkpoint,
    stored_at: Instant,
}

/// Thread-safe in-memory [`Checkpointer`] with optional TTL eviction
pub struct InMemoryCheckpointer {
    threads: RwLock<HashMap<String, Vec<StoredCheckpoint>>>,
    ttl: Option<Duration>,
}

impl InMemoryCheckpointer {
    /// Create a checkpointer that retains entries forever
    pub fn new() -> Self {
        Self {
            threads: RwLock::new(HashMap::new()),
            ttl: None,
        }
    }

    /// Create a checkpointer that evicts entries older than `ttl`
    ///
    /// The TTL must exceed the maximum interrupt horizon; an interrupted
    /// execution whose checkpoint was evicted can no longer be resumed.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            threads: RwLock::new(HashMap::new()),
            ttl: Some(ttl),
        }
    }

    /// Number of live threads (expired entries excluded)
    pub fn thread_count(&self) -> usize {
        let threads = self.threads.read();
        threads
            .values()
            .filter(|chain| chain.iter().any(|s| !self.expired(s)))
            .count()
    }

    /// Drop everything; test isolation helper
    pub fn clear(&self) {
        self.threads.write().clear();
    }

    fn expired(&self, stored: &StoredCheckpoint) -> bool {
        match self.ttl {
            Some(ttl) => stored.stored_at.elapsed() > ttl,
            None => false,
        }
    }

    fn evict_expired(&self, chain: &mut Vec<StoredCheckpoint>) {
        if self.ttl.is_some() {
            chain.retain(|s| !self.expired(s));
        }
    }
}

impl Default for InMemoryCheckpointer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Checkpointer for InMemoryCheckpointer {
    async fn save(&self, thread_id: &str, checkpoint: Checkpoint) -> Result<()> {
        let mut threads = self.threads.write();
        let chain = threads.entry(thread_id.to_string()).or_default();
        self.evict_expired(chain);
        chain.push(StoredCheckpoint {
            checkpoint,
            stored_at: Instant::now(),
        });
        Ok(())
    }

    async fn latest(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        let threads = self.threads.read();
        Ok(threads.get(thread_id).and_then(|chain| {
            chain
                .iter()
                .rev()
                .find(|s| !self.expired(s))
                .map(|s| s.checkpoint.clone())
        }))
    }

    async fn list(&self, thread_id: &str) -> Result<Vec<Checkpoint>> {
        let threads = self.threads.read();
        Ok(threads
            .get(thread_id)
            .map(|chain| {
                chain
                    .iter()
                    .filter(|s| !self.expired(s))
                    .map(|s| s.checkpoint.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        self.threads.write().remove(thread_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointSource;
    use serde_json::json;

    #[tokio::test]
    async fn test_save_and_latest() {
        let saver = InMemoryCheckpointer::new();
        let first = Checkpoint::new(None, 0, CheckpointSource::Seed, json!({"n": 1}));
        let second = Checkpoint::new(
            Some(first.checkpoint_id.clone()),
            1,
            CheckpointSource::Interrupt,
            json!({"n": 2}),
        );

        saver.save("t1", first).await.unwrap();
        saver.save("t1", second.clone()).await.unwrap();

        let latest = saver.latest("t1").await.unwrap().unwrap();
        assert_eq!(latest.checkpoint_id, second.checkpoint_id);
        assert_eq!(latest.blob["n"], 2);
    }

    #[tokio::test]
    async fn test_list_in_order() {
        let saver = InMemoryCheckpointer::new();
        for step in 0..3 {
            let cp = Checkpoint::new(None, step, CheckpointSource::Wave, json!({"step": step}));
            saver.save("t1", cp).await.unwrap();
        }
        let chain = saver.list("t1").await.unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[0].step, 0);
        assert_eq!(chain[2].step, 2);
    }

    #[tokio::test]
    async fn test_threads_are_isolated() {
        let saver = InMemoryCheckpointer::new();
        let cp = Checkpoint::new(None, 0, CheckpointSource::Seed, json!({}));
        saver.save("a", cp).await.unwrap();

        assert!(saver.latest("b").await.unwrap().is_none());
        assert_eq!(saver.thread_count(), 1);
    }

    #[tokio::test]
    async fn test_delete_thread() {
        let saver = InMemoryCheckpointer::new();
        let cp = Checkpoint::new(None, 0, CheckpointSource::Seed, json!({}));
        saver.save("a", cp).await.unwrap();
        saver.delete_thread("a").await.unwrap();
        assert!(saver.latest("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ttl_eviction() {
        let saver = InMemoryCheckpointer::with_ttl(Duration::from_millis(0));
        let cp = Checkpoint::new(None, 0, CheckpointSource::Interrupt, json!({}));
        saver.save("a", cp).await.unwrap();
        // Zero TTL: entry is already expired on the next read.
        std::thread::sleep(Duration::from_millis(5));
        assert!(saver.latest("a").await.unwrap().is_none());
    }
}
