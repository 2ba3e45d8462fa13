//! Job queue abstraction and in-memory implementation
//!
//! Jobs are opaque JSON payloads with a deterministic id; enqueueing an id
//! that is already live is a no-op, which is what makes the scheduler's
//! at-most-one-occurrence guarantee hold. Delivery is at-least-once and FIFO
//! within a queue under uncontended conditions; delayed enqueues fire within
//! one timer tick of their due time.

use crate::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// An opaque queue entry with a deterministic id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub payload: Value,
}

impl Job {
    pub fn new(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }
}

/// Queue operations used by dispatch, the scheduler, and the worker pool
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue immediately; returns false when the id is already live
    async fn enqueue(&self, queue: &str, job: Job) -> Result<bool>;

    /// Enqueue after a delay; returns false when the id is already live
    async fn enqueue_in(&self, queue: &str, delay: Duration, job: Job) -> Result<bool>;

    /// Blocking pop across a set of queues, in listed priority order
    async fn dequeue(&self, queues: &[String]) -> Result<Job>;

    /// Jobs currently waiting out a delay on a queue
    async fn list_scheduled(&self, queue: &str) -> Result<Vec<Job>>;

    /// Best-effort cancel of a live job; returns false on miss
    async fn cancel(&self, job_id: &str) -> Result<bool>;
}

struct LiveJob {
    queue: String,
    job: Job,
    /// Set while the job waits out an `enqueue_in` delay
    delayed: bool,
}

struct DelayedEntry {
    due: Instant,
    queue: String,
    job_id: String,
}

/// In-process [`JobQueue`] backed by per-queue ready lists and a shared
/// delayed list promoted on timer expiry
pub struct InMemoryJobQueue {
    ready: DashMap<String, Mutex<VecDeque<Job>>>,
    delayed: Mutex<Vec<DelayedEntry>>,
    live: DashMap<String, LiveJob>,
    notify: Notify,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self {
            ready: DashMap::new(),
            delayed: Mutex::new(Vec::new()),
            live: DashMap::new(),
            notify: Notify::new(),
        }
    }

    fn push_ready(&self, queue: &str, job: Job) {
        self.ready
            .entry(queue.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::new()))
            .lock()
            .push_back(job);
        self.notify.notify_waiters();
    }

    /// Move due delayed entries onto their ready lists
    fn promote_due(&self) {
        let now = Instant::now();
        let due: Vec<DelayedEntry> = {
            let mut delayed = self.delayed.lock();
            let mut due = Vec::new();
            let mut index = 0;
            while index < delayed.len() {
                if delayed[index].due <= now {
                    due.push(delayed.swap_remove(index));
                } else {
                    index += 1;
                }
            }
            due
        };
        for entry in due {
            // A missing live record means the job was cancelled while
            // waiting out its delay.
            let Some(mut live) = self.live.get_mut(&entry.job_id) else {
                continue;
            };
            live.delayed = false;
            let job = live.job.clone();
            drop(live);
            self.push_ready(&entry.queue, job);
        }
    }

    /// Earliest pending delayed due time, if any
    fn next_due(&self) -> Option<Instant> {
        self.delayed.lock().iter().map(|e| e.due).min()
    }

    fn try_pop(&self, queues: &[String]) -> Option<Job> {
        for queue in queues {
            let Some(entry) = self.ready.get(queue) else {
                continue;
            };
            let mut list = entry.lock();
            while let Some(job) = list.pop_front() {
                // Dequeue consumes the live entry; from here the job is the
                // worker's responsibility (at-least-once).
                if self.live.remove(&job.id).is_some() {
                    return Some(job);
                }
                // Cancelled while ready: drop and keep popping.
            }
        }
        None
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, queue: &str, job: Job) -> Result<bool> {
        if self.live.contains_key(&job.id) {
            debug!(job_id = %job.id, "enqueue skipped: id already live");
            return Ok(false);
        }
        self.live.insert(
            job.id.clone(),
            LiveJob {
                queue: queue.to_string(),
                job: job.clone(),
                delayed: false,
            },
        );
        self.push_ready(queue, job);
        Ok(true)
    }

    async fn enqueue_in(&self, queue: &str, delay: Duration, job: Job) -> Result<bool> {
        if self.live.contains_key(&job.id) {
            debug!(job_id = %job.id, "delayed enqueue skipped: id already live");
            return Ok(false);
        }
        self.live.insert(
            job.id.clone(),
            LiveJob {
                queue: queue.to_string(),
                job: job.clone(),
                delayed: true,
            },
        );
        self.delayed.lock().push(DelayedEntry {
            due: Instant::now() + delay,
            queue: queue.to_string(),
            job_id: job.id,
        });
        // Wake dequeuers so they recompute their sleep horizon.
        self.notify.notify_waiters();
        Ok(true)
    }

    async fn dequeue(&self, queues: &[String]) -> Result<Job> {
        loop {
            // Register interest before checking, so a push landing between
            // the check and the await is not lost.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.promote_due();
            if let Some(job) = self.try_pop(queues) {
                return Ok(job);
            }
            match self.next_due() {
                Some(due) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(due) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn list_scheduled(&self, queue: &str) -> Result<Vec<Job>> {
        Ok(self
            .live
            .iter()
            .filter(|entry| entry.delayed && entry.queue == queue)
            .map(|entry| entry.job.clone())
            .collect())
    }

    async fn cancel(&self, job_id: &str) -> Result<bool> {
        Ok(self.live.remove(job_id).is_some())
    }
}

/// Handles jobs popped by the worker pool
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Job) -> Result<()>;
}

/// Spawn `count` workers consuming `queues` until shutdown
pub fn spawn_workers(
    queue: Arc<dyn JobQueue>,
    queues: Vec<String>,
    count: usize,
    handler: Arc<dyn JobHandler>,
    shutdown: CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    (0..count)
        .map(|worker_id| {
            let queue = queue.clone();
            let queues = queues.clone();
            let handler = handler.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                debug!(worker_id, "worker started");
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        popped = queue.dequeue(&queues) => match popped {
                            Ok(job) => {
                                let job_id = job.id.clone();
                                if let Err(err) = handler.handle(job).await {
                                    error!(worker_id, job_id = %job_id, error = %err, "job failed");
                                }
                            }
                            Err(err) => {
                                error!(worker_id, error = %err, "dequeue failed");
                                break;
                            }
                        },
                    }
                }
                debug!(worker_id, "worker stopped");
            })
        })
        .collect()
}
