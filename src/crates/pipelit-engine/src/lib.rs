//! Persistence, scheduling, and trigger dispatch around the pipelit core
//!
//! This crate wraps the execution core with everything an embedder needs to
//! run workflows durably: SQLite-backed records (executions, node logs,
//! scheduled jobs, epics, workflows, checkpoints), the job queue and worker
//! pool, trigger resolution and dispatch, the self-rescheduling interval
//! scheduler with crash recovery, cost accounting with budget gates, and
//! the [`Engine`] facade that wires it all together.

pub mod checkpoint_store;
pub mod config;
pub mod cost;
pub mod db;
pub mod engine;
pub mod queue;
pub mod scheduler;
pub mod trigger;

pub use checkpoint_store::SqliteCheckpointer;
pub use config::EngineConfig;
pub use cost::CostAccountant;
pub use engine::{CompletionSignal, Engine};
pub use queue::{spawn_workers, InMemoryJobQueue, Job, JobHandler, JobQueue};
pub use scheduler::{scheduled_job_key, ScheduleTarget, Scheduler, QUEUE_SCHEDULER};
pub use trigger::{
    DispatchContext, TriggerDispatch, TriggerEvent, TriggerResolver, QUEUE_EXECUTIONS,
    QUEUE_INTERACTIVE,
};

use thiserror::Error;

/// Errors raised by the engine layer
#[derive(Debug, Error)]
pub enum EngineError {
    /// A record lookup came up empty
    #[error("not found: {0}")]
    NotFound(String),

    /// A status transition was rejected (stale compare-and-set)
    #[error("invalid state transition for {entity}: {from} -> {to}")]
    InvalidTransition {
        entity: String,
        from: String,
        to: String,
    },

    /// No trigger matched an inbound event
    #[error("no trigger matched event kind '{0}'")]
    NoTriggerMatched(String),

    /// Database failure
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Core compilation or execution failure
    #[error(transparent)]
    Core(#[from] pipelit_core::CoreError),

    /// Checkpoint backend failure
    #[error(transparent)]
    Checkpoint(#[from] pipelit_checkpoint::CheckpointError),

    /// Serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General engine failure
    #[error("engine error: {0}")]
    General(String),
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
