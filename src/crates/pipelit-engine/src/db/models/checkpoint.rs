//! Durable checkpoint row model

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One checkpoint in a thread's chain, as stored
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CheckpointRow {
    pub id: i64,
    pub thread_id: String,
    pub checkpoint_id: String,
    pub parent_checkpoint_id: Option<String>,
    pub step: i64,
    pub source: String,
    /// Opaque JSON blob; never interpreted by the engine
    pub blob: String,
    pub created_at: String,
}
