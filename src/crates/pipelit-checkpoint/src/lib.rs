//! Checkpoint abstractions for the pipelit execution core
//!
//! A checkpoint is an opaque snapshot of execution state keyed by a *thread id*.
//! Two kinds of backend exist behind the same [`Checkpointer`] trait:
//!
//! - **Durable** backends persist across process restarts and back conversation
//!   memory (the same user talking to the same workflow continues the same
//!   thread). The SQLite implementation lives in `pipelit-engine`.
//! - **Ephemeral** backends carry state across a single interrupt
//!   (human confirmation, sub-workflow delegation, timed delay) and may evict
//!   entries after a TTL. See [`InMemoryCheckpointer`].
//!
//! Blobs are opaque to this crate: callers serialize whatever they need into
//! a [`serde_json::Value`] and get it back verbatim.

pub mod checkpoint;
pub mod memory;

pub use checkpoint::{Checkpoint, CheckpointSource, Checkpointer, thread_id};
pub use memory::InMemoryCheckpointer;

use thiserror::Error;

/// Errors raised by checkpoint backends
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// The stored blob could not be decoded back into a state snapshot
    #[error("checkpoint corrupt for thread {thread_id}: {message}")]
    Corrupt { thread_id: String, message: String },

    /// Serialization of a blob failed
    #[error("checkpoint serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend storage failure (database down, pool exhausted, ...)
    #[error("checkpoint backend error: {0}")]
    Backend(String),
}

/// Result type for checkpoint operations
pub type Result<T> = std::result::Result<T, CheckpointError>;
