//! Self-rescheduling interval scheduler with crash recovery
//!
//! Each active job lives in the job queue at most once, under the
//! deterministic key `sched-{id}-n{repeat_done}-rc{retry_done}`; the queue's
//! duplicate-id no-op is what makes firings at-most-once per step. A firing
//! dispatches the schedule trigger event, optionally awaits the execution,
//! advances the counters, and re-enqueues itself for the next due time.
//! Failures back off exponentially, capped at ten intervals, until
//! `retry_max` is exhausted and the job goes `dead`.

use crate::db::models::{ExecutionStatus, ScheduledJobRow, ScheduledJobStatus};
use crate::db::repositories::scheduled_job_repo::{NewScheduledJob, ScheduledJobRepository};
use crate::db::DatabasePool;
use crate::queue::{Job, JobQueue};
use crate::{EngineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Queue consumed for scheduled firings
pub const QUEUE_SCHEDULER: &str = "scheduler";

/// Deterministic queue key for one firing of a scheduled job
pub fn scheduled_job_key(id: i64, repeat_done: i64, retry_done: i64) -> String {
    format!("sched-{id}-n{repeat_done}-rc{retry_done}")
}

/// Callback into the engine that fires a job's trigger
#[async_trait]
pub trait ScheduleTarget: Send + Sync {
    /// Dispatch the schedule trigger event for this job. When the job
    /// awaits completion, resolve with the execution's terminal status;
    /// detached jobs may report `Completed` immediately after dispatch.
    async fn fire(&self, job: &ScheduledJobRow) -> Result<ExecutionStatus>;
}

/// Owns scheduled-job lifecycle: creation, firing, recovery, pause/resume
pub struct Scheduler {
    pool: DatabasePool,
    queue: Arc<dyn JobQueue>,
}

impl Scheduler {
    pub fn new(pool: DatabasePool, queue: Arc<dyn JobQueue>) -> Self {
        Self { pool, queue }
    }

    fn fire_job(job_id: i64, key: String) -> Job {
        Job::new(key, json!({"op": "scheduled_fire", "job_id": job_id}))
    }

    /// Create a job and enqueue its first firing immediately
    pub async fn create_job(&self, new: NewScheduledJob) -> Result<ScheduledJobRow> {
        let row = ScheduledJobRepository::create(&self.pool, new).await?;
        self.queue
            .enqueue(
                QUEUE_SCHEDULER,
                Self::fire_job(row.id, scheduled_job_key(row.id, 0, 0)),
            )
            .await?;
        info!(job_id = row.id, interval = row.interval_seconds, "scheduled job created");
        Ok(row)
    }

    /// Handle one firing popped from the queue
    pub async fn on_fire(&self, job_id: i64, target: &dyn ScheduleTarget) -> Result<()> {
        let Some(job) = ScheduledJobRepository::get(&self.pool, job_id).await? else {
            warn!(job_id, "fired job no longer exists");
            return Ok(());
        };
        if job.status() != Some(ScheduledJobStatus::Active) {
            // A pause can miss the outstanding delayed entry; the persisted
            // status is authoritative and the stale firing is rejected here.
            debug!(job_id, status = %job.status, "stale firing rejected");
            return Ok(());
        }

        let last_run = Utc::now();
        ScheduledJobRepository::record_run_start(&self.pool, job_id, &last_run.to_rfc3339())
            .await?;

        let fired = target.fire(&job).await;
        match fired {
            Ok(ExecutionStatus::Completed) => self.after_success(&job, last_run).await,
            Ok(status) => {
                self.after_failure(&job, format!("execution ended {status}"))
                    .await
            }
            Err(err) => self.after_failure(&job, err.to_string()).await,
        }
    }

    async fn after_success(&self, job: &ScheduledJobRow, last_run: DateTime<Utc>) -> Result<()> {
        let next_run = last_run + ChronoDuration::seconds(job.interval_seconds);
        let updated = ScheduledJobRepository::record_success(
            &self.pool,
            job.id,
            Some(&next_run.to_rfc3339()),
        )
        .await?;

        if updated.repeat_count > 0 && updated.repeat_done >= updated.repeat_count {
            ScheduledJobRepository::set_status(
                &self.pool,
                job.id,
                ScheduledJobStatus::Active,
                ScheduledJobStatus::Done,
            )
            .await?;
            info!(job_id = job.id, repeats = updated.repeat_done, "scheduled job done");
            return Ok(());
        }

        let delay = (next_run - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        self.queue
            .enqueue_in(
                QUEUE_SCHEDULER,
                delay,
                Self::fire_job(job.id, scheduled_job_key(job.id, updated.repeat_done, 0)),
            )
            .await?;
        Ok(())
    }

    async fn after_failure(&self, job: &ScheduledJobRow, error: String) -> Result<()> {
        let updated = ScheduledJobRepository::record_failure(&self.pool, job.id, &error).await?;

        if updated.retry_done > updated.retry_max {
            ScheduledJobRepository::set_status(
                &self.pool,
                job.id,
                ScheduledJobStatus::Active,
                ScheduledJobStatus::Dead,
            )
            .await?;
            warn!(job_id = job.id, error = %error, "scheduled job retries exhausted");
            return Err(EngineError::General(format!(
                "scheduled job {} is dead: {error}",
                job.id
            )));
        }

        let backoff_secs = (job.interval_seconds as u64)
            .saturating_mul(2u64.saturating_pow(updated.retry_done as u32))
            .min(10 * job.interval_seconds as u64);
        ScheduledJobRepository::set_next_run_at(
            &self.pool,
            job.id,
            Some(&(Utc::now() + ChronoDuration::seconds(backoff_secs as i64)).to_rfc3339()),
        )
        .await?;
        self.queue
            .enqueue_in(
                QUEUE_SCHEDULER,
                Duration::from_secs(backoff_secs),
                Self::fire_job(
                    job.id,
                    scheduled_job_key(job.id, updated.repeat_done, updated.retry_done),
                ),
            )
            .await?;
        debug!(job_id = job.id, backoff_secs, "scheduled job retrying");
        Ok(())
    }

    /// Startup scan: re-enqueue active jobs under their current keys.
    /// Jobs already present in the queue are no-ops thanks to the
    /// deterministic ids.
    pub async fn recover(&self) -> Result<usize> {
        let mut recovered = 0usize;
        for job in ScheduledJobRepository::list_active(&self.pool).await? {
            let key = scheduled_job_key(job.id, job.repeat_done, job.retry_done);
            let due = job
                .next_run_at
                .as_deref()
                .and_then(|s| s.parse::<DateTime<Utc>>().ok());
            let enqueued = match due {
                Some(due) if due > Utc::now() => {
                    let delay = (due - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    self.queue
                        .enqueue_in(QUEUE_SCHEDULER, delay, Self::fire_job(job.id, key))
                        .await?
                }
                _ => {
                    self.queue
                        .enqueue(QUEUE_SCHEDULER, Self::fire_job(job.id, key))
                        .await?
                }
            };
            if enqueued {
                recovered += 1;
            }
        }
        info!(recovered, "scheduled job recovery complete");
        Ok(recovered)
    }

    /// Pause an active job, cancelling its outstanding firing best-effort
    pub async fn pause(&self, job_id: i64) -> Result<bool> {
        let Some(job) = ScheduledJobRepository::get(&self.pool, job_id).await? else {
            return Ok(false);
        };
        let transitioned = ScheduledJobRepository::set_status(
            &self.pool,
            job_id,
            ScheduledJobStatus::Active,
            ScheduledJobStatus::Paused,
        )
        .await?;
        if transitioned {
            let key = scheduled_job_key(job.id, job.repeat_done, job.retry_done);
            let _ = self.queue.cancel(&key).await?;
        }
        Ok(transitioned)
    }

    /// Resume a paused job and enqueue its next firing immediately
    pub async fn resume(&self, job_id: i64) -> Result<bool> {
        let Some(job) = ScheduledJobRepository::get(&self.pool, job_id).await? else {
            return Ok(false);
        };
        let transitioned = ScheduledJobRepository::set_status(
            &self.pool,
            job_id,
            ScheduledJobStatus::Paused,
            ScheduledJobStatus::Active,
        )
        .await?;
        if transitioned {
            self.queue
                .enqueue(
                    QUEUE_SCHEDULER,
                    Self::fire_job(
                        job.id,
                        scheduled_job_key(job.id, job.repeat_done, job.retry_done),
                    ),
                )
                .await?;
        }
        Ok(transitioned)
    }
}
