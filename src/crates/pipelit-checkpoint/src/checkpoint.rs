//! Core checkpoint data structures and the storage trait
//!
//! A [`Checkpoint`] records one snapshot in a thread's history: its id, an
//! optional parent id (forming a chain), the step counter at capture time,
//! the [`CheckpointSource`] that produced it, and the opaque blob. Backends
//! implement [`Checkpointer`] to store and retrieve them.
//!
//! # Thread ids
//!
//! The thread id is the canonical grouping key. For conversation memory it is
//! derived from `(user_identity, channel_identity, workflow_id)` via
//! [`thread_id`]; for interrupt/resume snapshots the engine uses an
//! execution-scoped key. The checkpoint layer never interprets the key.

use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Origin of a checkpoint within an execution's lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointSource {
    /// Initial state seeded from the trigger payload
    Seed,
    /// Snapshot taken between topological waves
    Wave,
    /// Snapshot taken when the execution suspended on an interrupt
    Interrupt,
    /// Snapshot written when a suspended execution was resumed
    Resume,
}

impl CheckpointSource {
    /// String form stored by persistent backends
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointSource::Seed => "seed",
            CheckpointSource::Wave => "wave",
            CheckpointSource::Interrupt => "interrupt",
            CheckpointSource::Resume => "resume",
        }
    }

    /// Parse the stored string form
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "seed" => Some(CheckpointSource::Seed),
            "wave" => Some(CheckpointSource::Wave),
            "interrupt" => Some(CheckpointSource::Interrupt),
            "resume" => Some(CheckpointSource::Resume),
            _ => None,
        }
    }
}

impl std::fmt::Display for CheckpointSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One snapshot in a thread's checkpoint chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique checkpoint identifier (UUID string)
    pub checkpoint_id: String,

    /// Previous checkpoint in the chain, if any
    pub parent_checkpoint_id: Option<String>,

    /// Step counter at capture time
    pub step: i64,

    /// What produced this checkpoint
    pub source: CheckpointSource,

    /// Capture timestamp (UTC)
    pub created_at: DateTime<Utc>,

    /// Opaque snapshot payload; never inspected by the checkpoint layer
    pub blob: Value,
}

impl Checkpoint {
    /// Create a checkpoint with a fresh id and the current timestamp
    pub fn new(parent: Option<String>, step: i64, source: CheckpointSource, blob: Value) -> Self {
        Self {
            checkpoint_id: Uuid::new_v4().to_string(),
            parent_checkpoint_id: parent,
            step,
            source,
            created_at: Utc::now(),
            blob,
        }
    }
}

/// Canonical thread id for conversation memory
///
/// The same user talking to the same workflow on the same channel continues
/// the same thread across executions.
pub fn thread_id(user_identity: &str, channel_identity: &str, workflow_id: &str) -> String {
    format!("{user_identity}:{channel_identity}:{workflow_id}")
}

/// Storage backend for checkpoint chains
///
/// Implementations own their concurrency discipline; callers may invoke these
/// methods from any task. Deletion happens only on explicit user action, so
/// the trait exposes it separately from the save/load path.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// Append a checkpoint to a thread's chain
    async fn save(&self, thread_id: &str, checkpoint: Checkpoint) -> Result<()>;

    /// The most recent checkpoint for a thread, if any
    async fn latest(&self, thread_id: &str) -> Result<Option<Checkpoint>>;

    /// All checkpoints for a thread, oldest first
    async fn list(&self, thread_id: &str) -> Result<Vec<Checkpoint>>;

    /// Drop a thread's entire chain
    async fn delete_thread(&self, thread_id: &str) -> Result<()>;
}
