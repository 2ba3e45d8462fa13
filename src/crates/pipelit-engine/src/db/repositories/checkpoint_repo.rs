//! Durable checkpoint repository

use crate::db::connection::DatabasePool;
use crate::db::models::CheckpointRow;
use pipelit_checkpoint::{Checkpoint, CheckpointSource};

/// Repository for the durable checkpoint table
pub struct CheckpointRepository;

impl CheckpointRepository {
    pub async fn insert(
        pool: &DatabasePool,
        thread_id: &str,
        checkpoint: &Checkpoint,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO checkpoints (thread_id, checkpoint_id, parent_checkpoint_id, step,
                 source, blob, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(thread_id)
        .bind(&checkpoint.checkpoint_id)
        .bind(&checkpoint.parent_checkpoint_id)
        .bind(checkpoint.step)
        .bind(checkpoint.source.as_str())
        .bind(checkpoint.blob.to_string())
        .bind(checkpoint.created_at.to_rfc3339())
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn latest(
        pool: &DatabasePool,
        thread_id: &str,
    ) -> Result<Option<CheckpointRow>, sqlx::Error> {
        sqlx::query_as::<_, CheckpointRow>(
            "SELECT * FROM checkpoints WHERE thread_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(thread_id)
        .fetch_optional(pool)
        .await
    }

    pub async fn list(
        pool: &DatabasePool,
        thread_id: &str,
    ) -> Result<Vec<CheckpointRow>, sqlx::Error> {
        sqlx::query_as::<_, CheckpointRow>(
            "SELECT * FROM checkpoints WHERE thread_id = ? ORDER BY id",
        )
        .bind(thread_id)
        .fetch_all(pool)
        .await
    }

    pub async fn delete_thread(pool: &DatabasePool, thread_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM checkpoints WHERE thread_id = ?")
            .bind(thread_id)
            .execute(pool)
            .await?;
        Ok(())
    }
}

/// Decode a stored row back into the checkpoint form
pub fn row_to_checkpoint(row: &CheckpointRow) -> Result<Checkpoint, serde_json::Error> {
    Ok(Checkpoint {
        checkpoint_id: row.checkpoint_id.clone(),
        parent_checkpoint_id: row.parent_checkpoint_id.clone(),
        step: row.step,
        source: CheckpointSource::parse(&row.source).unwrap_or(CheckpointSource::Interrupt),
        created_at: row
            .created_at
            .parse()
            .unwrap_or_else(|_| chrono::Utc::now()),
        blob: serde_json::from_str(&row.blob)?,
    })
}
