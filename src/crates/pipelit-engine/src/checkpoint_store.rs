//! Durable SQLite checkpoint backend
//!
//! Implements the core [`Checkpointer`] trait over the engine's checkpoint
//! table, giving conversation memory that survives process restarts.

use crate::db::repositories::checkpoint_repo::{row_to_checkpoint, CheckpointRepository};
use crate::db::DatabasePool;
use async_trait::async_trait;
use pipelit_checkpoint::{Checkpoint, CheckpointError, Checkpointer};

/// [`Checkpointer`] backed by the engine's SQLite pool
pub struct SqliteCheckpointer {
    pool: DatabasePool,
}

impl SqliteCheckpointer {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

fn backend_err(err: sqlx::Error) -> CheckpointError {
    CheckpointError::Backend(err.to_string())
}

#[async_trait]
impl Checkpointer for SqliteCheckpointer {
    async fn save(
        &self,
        thread_id: &str,
        checkpoint: Checkpoint,
    ) -> pipelit_checkpoint::Result<()> {
        CheckpointRepository::insert(&self.pool, thread_id, &checkpoint)
            .await
            .map_err(backend_err)
    }

    async fn latest(&self, thread_id: &str) -> pipelit_checkpoint::Result<Option<Checkpoint>> {
        let row = CheckpointRepository::latest(&self.pool, thread_id)
            .await
            .map_err(backend_err)?;
        match row {
            Some(row) => {
                let checkpoint =
                    row_to_checkpoint(&row).map_err(|err| CheckpointError::Corrupt {
                        thread_id: thread_id.to_string(),
                        message: err.to_string(),
                    })?;
                Ok(Some(checkpoint))
            }
            None => Ok(None),
        }
    }

    async fn list(&self, thread_id: &str) -> pipelit_checkpoint::Result<Vec<Checkpoint>> {
        let rows = CheckpointRepository::list(&self.pool, thread_id)
            .await
            .map_err(backend_err)?;
        rows.iter()
            .map(|row| {
                row_to_checkpoint(row).map_err(|err| CheckpointError::Corrupt {
                    thread_id: thread_id.to_string(),
                    message: err.to_string(),
                })
            })
            .collect()
    }

    async fn delete_thread(&self, thread_id: &str) -> pipelit_checkpoint::Result<()> {
        CheckpointRepository::delete_thread(&self.pool, thread_id)
            .await
            .map_err(backend_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DatabaseConnection;
    use pipelit_checkpoint::CheckpointSource;
    use serde_json::json;

    #[tokio::test]
    async fn test_persists_across_checkpointer_instances() {
        let conn = DatabaseConnection::new("sqlite::memory:").await.unwrap();

        let saver = SqliteCheckpointer::new(conn.pool().clone());
        let cp = Checkpoint::new(None, 0, CheckpointSource::Seed, json!({"memory": "kept"}));
        saver.save("user:chat:wf", cp).await.unwrap();

        // A new instance over the same pool sees the chain.
        let other = SqliteCheckpointer::new(conn.pool().clone());
        let latest = other.latest("user:chat:wf").await.unwrap().unwrap();
        assert_eq!(latest.blob["memory"], "kept");
        assert_eq!(other.list("user:chat:wf").await.unwrap().len(), 1);
    }
}
