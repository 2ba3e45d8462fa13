//! Node log repository

use crate::db::connection::DatabasePool;
use crate::db::models::NodeLogRow;
use pipelit_core::NodeLogEntry;

/// Repository for append-only node logs
pub struct NodeLogRepository;

impl NodeLogRepository {
    /// Append one entry produced by the executor
    pub async fn append(
        pool: &DatabasePool,
        execution_id: &str,
        entry: &NodeLogEntry,
    ) -> Result<(), sqlx::Error> {
        let output = entry.output.as_ref().map(|v| v.to_string());
        sqlx::query(
            "INSERT INTO node_logs (execution_id, node_id, status, output, error, error_code,
                 duration_ms, timestamp, token_input, token_output, token_cost_usd)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(execution_id)
        .bind(&entry.node_id)
        .bind(entry.status.as_str())
        .bind(&output)
        .bind(&entry.error)
        .bind(&entry.error_code)
        .bind(entry.duration_ms)
        .bind(entry.timestamp.to_rfc3339())
        .bind(entry.token_usage.map(|u| u.input_tokens as i64))
        .bind(entry.token_usage.map(|u| u.output_tokens as i64))
        .bind(entry.token_usage.map(|u| u.cost_usd))
        .execute(pool)
        .await?;
        Ok(())
    }

    /// All entries for an execution in append order
    pub async fn list_by_execution(
        pool: &DatabasePool,
        execution_id: &str,
    ) -> Result<Vec<NodeLogRow>, sqlx::Error> {
        sqlx::query_as::<_, NodeLogRow>(
            "SELECT * FROM node_logs WHERE execution_id = ? ORDER BY id",
        )
        .bind(execution_id)
        .fetch_all(pool)
        .await
    }

    /// Sum of recorded token usage across an execution's entries
    pub async fn total_tokens(
        pool: &DatabasePool,
        execution_id: &str,
    ) -> Result<i64, sqlx::Error> {
        let row: (Option<i64>,) = sqlx::query_as(
            "SELECT SUM(COALESCE(token_input, 0) + COALESCE(token_output, 0))
             FROM node_logs WHERE execution_id = ?",
        )
        .bind(execution_id)
        .fetch_one(pool)
        .await?;
        Ok(row.0.unwrap_or(0))
    }
}
