//! Graph compilation and execution engine for pipelit workflows
//!
//! This crate is the execution core of pipelit: it compiles a stored
//! workflow graph into an executable [`Plan`] given a firing trigger, runs
//! nodes with correct data flow, ordering, and concurrency, broadcasts live
//! status over the [`EventBus`], and supports interrupt/resume through the
//! checkpoint layer.
//!
//! # Architecture
//!
//! ```text
//! WorkflowSnapshot ──compile──▶ Plan ──run──▶ Executor
//!        │                        │              │
//!   EdgeValidator            PortRegistry        ├─▶ Runnable (per node)
//!   (per mutation)         (component types)     ├─▶ StateStore merge
//!                                                ├─▶ EventBus fan-out
//!                                                └─▶ Checkpointer (suspend)
//! ```
//!
//! All per-type behavior flows through the [`PortRegistry`] and the
//! [`Runnable`] contract; the executor never switches on component types.
//! Suspension happens only at sentinel boundaries ([`NodeOutcome`]), which
//! lets the same design run on any async substrate.

pub mod compile;
pub mod components;
pub mod error;
pub mod events;
pub mod executor;
pub mod graph;
pub mod ports;
pub mod runnable;
pub mod state;
pub mod switch;
pub mod template;
pub mod validate;

pub use compile::{compile, LoopFrame, NodeBuild, Plan, RouteMap};
pub use components::{fn_component, register_builtins};
pub use error::{CoreError, ErrorCode, Result};
pub use events::{
    execution_channel, workflow_channel, EventBus, InterruptReason, NodeStatus, StatusEvent,
};
pub use executor::{
    interrupt_thread_id, BudgetGate, ChildSpawn, Executor, ExecutorOptions, NoBudget,
    NodeLogEntry, ResumeRequest, RunOutcome, RunReport,
};
pub use graph::{Edge, EdgeClass, Node, NodeConfig, NodeId, SubComponentKind, WorkflowSnapshot,
    FALLBACK_ROUTE};
pub use ports::{ComponentDef, ComponentFlags, DataType, PortRegistry, PortSpec};
pub use runnable::{
    CapabilityRef, CredentialResolver, FnRunnable, NoCredentials, NodeOutcome,
    ResolvedCapabilities, ResolvedConfig, RunContext, Runnable,
};
pub use state::{ExecutionState, LoopScope, NodeUpdate, TokenUsage};
pub use switch::{evaluate_rules, RuleOperator, SwitchRule};
pub use validate::{validate_edge, validate_workflow};
