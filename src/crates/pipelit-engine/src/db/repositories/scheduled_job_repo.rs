//! Scheduled job repository

use crate::db::connection::{now_rfc3339, DatabasePool};
use crate::db::models::{ScheduledJobRow, ScheduledJobStatus};
use serde_json::Value;

/// Fields supplied when creating a scheduled job
#[derive(Debug, Clone)]
pub struct NewScheduledJob {
    pub workflow_id: String,
    pub trigger_node_id: String,
    pub interval_seconds: i64,
    /// Zero repeats forever
    pub repeat_count: i64,
    pub retry_max: i64,
    pub await_completion: bool,
    pub payload: Option<Value>,
}

/// Repository for scheduled jobs
pub struct ScheduledJobRepository;

impl ScheduledJobRepository {
    pub async fn create(
        pool: &DatabasePool,
        new: NewScheduledJob,
    ) -> Result<ScheduledJobRow, sqlx::Error> {
        let now = now_rfc3339();
        let payload = new.payload.as_ref().map(|v| v.to_string());
        sqlx::query_as::<_, ScheduledJobRow>(
            "INSERT INTO scheduled_jobs (workflow_id, trigger_node_id, interval_seconds,
                 repeat_count, retry_max, status, await_completion, payload,
                 created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, 'active', ?, ?, ?, ?)
             RETURNING *",
        )
        .bind(&new.workflow_id)
        .bind(&new.trigger_node_id)
        .bind(new.interval_seconds)
        .bind(new.repeat_count)
        .bind(new.retry_max)
        .bind(new.await_completion as i64)
        .bind(&payload)
        .bind(&now)
        .bind(&now)
        .fetch_one(pool)
        .await
    }

    pub async fn get(pool: &DatabasePool, id: i64) -> Result<Option<ScheduledJobRow>, sqlx::Error> {
        sqlx::query_as::<_, ScheduledJobRow>("SELECT * FROM scheduled_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// All jobs currently in `active` status
    pub async fn list_active(pool: &DatabasePool) -> Result<Vec<ScheduledJobRow>, sqlx::Error> {
        sqlx::query_as::<_, ScheduledJobRow>(
            "SELECT * FROM scheduled_jobs WHERE status = 'active' ORDER BY id",
        )
        .fetch_all(pool)
        .await
    }

    /// Compare-and-set status transition
    pub async fn set_status(
        pool: &DatabasePool,
        id: i64,
        from: ScheduledJobStatus,
        to: ScheduledJobStatus,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE scheduled_jobs SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(to.as_str())
        .bind(now_rfc3339())
        .bind(id)
        .bind(from.as_str())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Stamp the start of a firing
    pub async fn record_run_start(
        pool: &DatabasePool,
        id: i64,
        last_run_at: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE scheduled_jobs SET last_run_at = ?, updated_at = ? WHERE id = ?")
            .bind(last_run_at)
            .bind(now_rfc3339())
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// A successful firing: advance the repeat counter, reset retries,
    /// stamp the next due time
    pub async fn record_success(
        pool: &DatabasePool,
        id: i64,
        next_run_at: Option<&str>,
    ) -> Result<ScheduledJobRow, sqlx::Error> {
        sqlx::query_as::<_, ScheduledJobRow>(
            "UPDATE scheduled_jobs
             SET repeat_done = repeat_done + 1, retry_done = 0, next_run_at = ?,
                 last_error = NULL, updated_at = ?
             WHERE id = ?
             RETURNING *",
        )
        .bind(next_run_at)
        .bind(now_rfc3339())
        .bind(id)
        .fetch_one(pool)
        .await
    }

    /// A failed firing: advance the retry counter and keep the error
    pub async fn record_failure(
        pool: &DatabasePool,
        id: i64,
        error: &str,
    ) -> Result<ScheduledJobRow, sqlx::Error> {
        sqlx::query_as::<_, ScheduledJobRow>(
            "UPDATE scheduled_jobs
             SET retry_done = retry_done + 1, last_error = ?, updated_at = ?
             WHERE id = ?
             RETURNING *",
        )
        .bind(error)
        .bind(now_rfc3339())
        .bind(id)
        .fetch_one(pool)
        .await
    }

    /// Stamp the next due time without touching counters (recovery path)
    pub async fn set_next_run_at(
        pool: &DatabasePool,
        id: i64,
        next_run_at: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE scheduled_jobs SET next_run_at = ?, updated_at = ? WHERE id = ?")
            .bind(next_run_at)
            .bind(now_rfc3339())
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DatabaseConnection;

    fn new_job() -> NewScheduledJob {
        NewScheduledJob {
            workflow_id: "wf-1".to_string(),
            trigger_node_id: "sched".to_string(),
            interval_seconds: 60,
            repeat_count: 3,
            retry_max: 1,
            await_completion: true,
            payload: Some(serde_json::json!({"k": "v"})),
        }
    }

    #[tokio::test]
    async fn test_create_and_counters() {
        let conn = DatabaseConnection::new("sqlite::memory:").await.unwrap();
        let pool = conn.pool();

        let job = ScheduledJobRepository::create(pool, new_job()).await.unwrap();
        assert_eq!(job.status(), Some(ScheduledJobStatus::Active));
        assert_eq!(job.repeat_done, 0);
        assert!(job.awaits_completion());
        assert_eq!(job.payload_value()["k"], "v");

        let job = ScheduledJobRepository::record_success(pool, job.id, Some("2026-01-01T00:00:00Z"))
            .await
            .unwrap();
        assert_eq!(job.repeat_done, 1);
        assert_eq!(job.retry_done, 0);

        let job = ScheduledJobRepository::record_failure(pool, job.id, "boom").await.unwrap();
        assert_eq!(job.retry_done, 1);
        assert_eq!(job.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_status_cas() {
        let conn = DatabaseConnection::new("sqlite::memory:").await.unwrap();
        let pool = conn.pool();
        let job = ScheduledJobRepository::create(pool, new_job()).await.unwrap();

        assert!(ScheduledJobRepository::set_status(
            pool,
            job.id,
            ScheduledJobStatus::Active,
            ScheduledJobStatus::Paused
        )
        .await
        .unwrap());
        // Stale transition loses.
        assert!(!ScheduledJobRepository::set_status(
            pool,
            job.id,
            ScheduledJobStatus::Active,
            ScheduledJobStatus::Done
        )
        .await
        .unwrap());

        let active = ScheduledJobRepository::list_active(pool).await.unwrap();
        assert!(active.is_empty());
    }
}
