//! Execution repository

use crate::db::connection::{now_rfc3339, DatabasePool};
use crate::db::models::{ExecutionRow, ExecutionStatus};
use serde_json::Value;
use uuid::Uuid;

/// Fields supplied when creating an execution record
#[derive(Debug, Clone, Default)]
pub struct NewExecution {
    pub workflow_id: String,
    pub trigger_node_id: String,
    pub trigger_payload: Value,
    pub parent_execution_id: Option<String>,
    pub parent_node_id: Option<String>,
    pub epic_id: Option<String>,
    pub depth: i64,
    pub correlation_id: Option<String>,
}

/// Repository for execution records
pub struct ExecutionRepository;

impl ExecutionRepository {
    /// Create a pending execution record
    pub async fn create(
        pool: &DatabasePool,
        new: NewExecution,
    ) -> Result<ExecutionRow, sqlx::Error> {
        let now = now_rfc3339();
        let id = Uuid::new_v4().to_string();
        let payload = serde_json::to_string(&new.trigger_payload).unwrap_or_else(|_| "null".into());
        sqlx::query_as::<_, ExecutionRow>(
            "INSERT INTO executions (id, workflow_id, trigger_node_id, status, trigger_payload,
                 parent_execution_id, parent_node_id, epic_id, depth, correlation_id,
                 created_at, updated_at)
             VALUES (?, ?, ?, 'pending', ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING *",
        )
        .bind(&id)
        .bind(&new.workflow_id)
        .bind(&new.trigger_node_id)
        .bind(&payload)
        .bind(&new.parent_execution_id)
        .bind(&new.parent_node_id)
        .bind(&new.epic_id)
        .bind(new.depth)
        .bind(&new.correlation_id)
        .bind(&now)
        .bind(&now)
        .fetch_one(pool)
        .await
    }

    /// Get an execution by id
    pub async fn get(pool: &DatabasePool, id: &str) -> Result<Option<ExecutionRow>, sqlx::Error> {
        sqlx::query_as::<_, ExecutionRow>("SELECT * FROM executions WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// List executions of a workflow, newest first
    pub async fn list_by_workflow(
        pool: &DatabasePool,
        workflow_id: &str,
    ) -> Result<Vec<ExecutionRow>, sqlx::Error> {
        sqlx::query_as::<_, ExecutionRow>(
            "SELECT * FROM executions WHERE workflow_id = ? ORDER BY created_at DESC",
        )
        .bind(workflow_id)
        .fetch_all(pool)
        .await
    }

    /// List executions by status
    pub async fn list_by_status(
        pool: &DatabasePool,
        status: ExecutionStatus,
    ) -> Result<Vec<ExecutionRow>, sqlx::Error> {
        sqlx::query_as::<_, ExecutionRow>(
            "SELECT * FROM executions WHERE status = ? ORDER BY created_at DESC",
        )
        .bind(status.as_str())
        .fetch_all(pool)
        .await
    }

    /// Transition pending/interrupted -> running; false when lost the race
    pub async fn mark_running(pool: &DatabasePool, id: &str) -> Result<bool, sqlx::Error> {
        let now = now_rfc3339();
        let result = sqlx::query(
            "UPDATE executions
             SET status = 'running', started_at = COALESCE(started_at, ?), updated_at = ?
             WHERE id = ? AND status IN ('pending', 'interrupted')",
        )
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Transition running -> completed with the final output
    pub async fn mark_completed(
        pool: &DatabasePool,
        id: &str,
        final_output: Option<&Value>,
    ) -> Result<bool, sqlx::Error> {
        let now = now_rfc3339();
        let output = final_output.map(|v| v.to_string());
        let result = sqlx::query(
            "UPDATE executions
             SET status = 'completed', completed_at = ?, final_output = ?, updated_at = ?
             WHERE id = ? AND status = 'running'",
        )
        .bind(&now)
        .bind(&output)
        .bind(&now)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Transition to failed from any non-terminal status
    pub async fn mark_failed(
        pool: &DatabasePool,
        id: &str,
        error: &str,
        error_code: &str,
    ) -> Result<bool, sqlx::Error> {
        let now = now_rfc3339();
        let result = sqlx::query(
            "UPDATE executions
             SET status = 'failed', completed_at = ?, error = ?, error_code = ?, updated_at = ?
             WHERE id = ? AND status IN ('pending', 'running', 'interrupted')",
        )
        .bind(&now)
        .bind(error)
        .bind(error_code)
        .bind(&now)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Transition running -> interrupted
    pub async fn mark_interrupted(pool: &DatabasePool, id: &str) -> Result<bool, sqlx::Error> {
        let now = now_rfc3339();
        let result = sqlx::query(
            "UPDATE executions SET status = 'interrupted', updated_at = ?
             WHERE id = ? AND status = 'running'",
        )
        .bind(&now)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Optimistic cancel from any non-terminal status
    pub async fn mark_cancelled(pool: &DatabasePool, id: &str) -> Result<bool, sqlx::Error> {
        let now = now_rfc3339();
        let result = sqlx::query(
            "UPDATE executions SET status = 'cancelled', completed_at = ?, updated_at = ?
             WHERE id = ? AND status IN ('pending', 'running', 'interrupted')",
        )
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Refresh the liveness timestamp of a running execution
    pub async fn touch(pool: &DatabasePool, id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE executions SET updated_at = ? WHERE id = ?")
            .bind(now_rfc3339())
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Accumulate token and money spend on the execution row
    pub async fn add_usage(
        pool: &DatabasePool,
        id: &str,
        tokens: i64,
        usd: f64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE executions
             SET spent_tokens = spent_tokens + ?, spent_usd = spent_usd + ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(tokens)
        .bind(usd)
        .bind(now_rfc3339())
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Running executions whose last liveness update predates `cutoff`
    /// (RFC3339); candidates for zombie promotion
    pub async fn running_stale_since(
        pool: &DatabasePool,
        cutoff: &str,
    ) -> Result<Vec<ExecutionRow>, sqlx::Error> {
        sqlx::query_as::<_, ExecutionRow>(
            "SELECT * FROM executions WHERE status = 'running' AND updated_at < ?",
        )
        .bind(cutoff)
        .fetch_all(pool)
        .await
    }
}
