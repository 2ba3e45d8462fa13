//! The execution driver
//!
//! Drives a compiled [`Plan`]: schedules ready nodes in topological waves
//! (wave-mates run concurrently), selects conditional branches from emitted
//! routes, drives loop frames, suspends on interrupt sentinels with a
//! checkpoint, enforces the budget gate, and emits status events throughout.
//!
//! Scheduling is cooperative within one execution and fully parallel across
//! executions (the engine's worker pool drives many executors at once). All
//! state mutation funnels through the wave-merge step, which applies updates
//! in deterministic order: the earliest-completing emitter's route wins,
//! state patches apply in node-id lexicographic order.

use crate::compile::{LoopFrame, Plan};
use crate::error::{CoreError, ErrorCode, Result};
use crate::events::{EventBus, InterruptReason, NodeStatus, StatusEvent};
use crate::graph::{NodeId, FALLBACK_ROUTE};
use crate::runnable::{CredentialResolver, NodeOutcome, ResolvedConfig, RunContext};
use crate::state::{ExecutionState, LoopScope, NodeUpdate, TokenUsage};
use crate::template;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use pipelit_checkpoint::{Checkpoint, CheckpointSource, Checkpointer};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Budget enforcement hook; the engine's cost accountant implements this
#[async_trait]
pub trait BudgetGate: Send + Sync {
    /// Called before each wave; an error aborts the execution
    async fn check(&self, execution_id: &str) -> Result<()>;

    /// Called once per node that emitted token usage
    async fn charge(&self, execution_id: &str, node_id: &str, usage: &TokenUsage) -> Result<()>;
}

/// Gate for embedders without cost accounting; everything passes
pub struct NoBudget;

#[async_trait]
impl BudgetGate for NoBudget {
    async fn check(&self, _execution_id: &str) -> Result<()> {
        Ok(())
    }

    async fn charge(&self, _execution_id: &str, _node_id: &str, _usage: &TokenUsage) -> Result<()> {
        Ok(())
    }
}

/// Tunables for one executor instance
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// How long in-flight work may finish after a cancel request
    pub cancellation_grace: Duration,

    /// Raise template failures instead of rendering leniently
    pub strict_templates: bool,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            cancellation_grace: Duration::from_secs(5),
            strict_templates: false,
        }
    }
}

/// Request to continue a suspended execution
#[derive(Debug, Clone, Default)]
pub struct ResumeRequest {
    /// Human-supplied input for a confirmation node
    pub input: Option<String>,

    /// A completed child workflow's final output: `(parent node, output)`
    pub child_result: Option<(NodeId, Value)>,

    /// A failed child workflow: `(parent node, error message)`
    pub child_error: Option<(NodeId, String)>,
}

/// Child workflow the engine must spawn for a suspended parent
#[derive(Debug, Clone)]
pub struct ChildSpawn {
    pub workflow_slug: String,
    pub payload: Value,
    pub parent_node_id: NodeId,
}

/// How one run segment ended
#[derive(Debug)]
pub enum RunOutcome {
    Completed {
        final_output: Option<Value>,
    },
    Interrupted {
        reason: InterruptReason,
        pending_child: Option<ChildSpawn>,
        delay_seconds: Option<f64>,
    },
    Failed {
        error_code: String,
        message: String,
    },
    Cancelled,
}

/// One append-only node log record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeLogEntry {
    pub node_id: NodeId,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub duration_ms: i64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
}

/// Result of one run segment: the outcome plus everything to persist
#[derive(Debug)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub node_logs: Vec<NodeLogEntry>,
    pub duration_ms: i64,
    pub state: ExecutionState,
}

/// Ephemeral checkpoint thread for an execution's interrupt snapshots
pub fn interrupt_thread_id(execution_id: &str) -> String {
    format!("exec:{execution_id}")
}

/// Where a suspended execution resumes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
enum Pending {
    /// Suspended by `interrupt_before`; the node has not run
    BeforeNode { node_id: NodeId },
    /// Suspended after success by `interrupt_after`
    AfterNode { node_id: NodeId },
    /// Waiting for human input at this node
    AwaitInput { node_id: NodeId },
    /// Waiting for a child workflow spawned by this node
    AwaitChild { node_id: NodeId },
    /// Waiting out a timed delay requested by this node
    Delay { node_id: NodeId, seconds: f64 },
}

/// Loop position captured when a body suspends
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LoopProgress {
    loop_id: NodeId,
    items: Vec<Value>,
    index: usize,
    results: Vec<Value>,
    outer_scope: Option<LoopScope>,
}

/// Everything serialized into an interrupt checkpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RunSnapshot {
    state: ExecutionState,
    statuses: HashMap<NodeId, NodeStatus>,
    /// Chosen route per emitter that completed
    routes: HashMap<NodeId, String>,
    /// Nodes whose `interrupt_before` pause was already taken
    #[serde(default)]
    passed_before: HashSet<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pending: Option<Pending>,
    /// Outermost-first loop positions when suspended inside a body
    #[serde(default)]
    loop_stack: Vec<LoopProgress>,
    step: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_checkpoint_id: Option<String>,
}

enum RegionResult {
    Completed,
    Suspended {
        reason: InterruptReason,
        child: Option<ChildSpawn>,
        delay_seconds: Option<f64>,
    },
    Failed(CoreError),
    Cancelled,
}

struct WaveResult {
    node_id: NodeId,
    duration_ms: i64,
    result: Result<NodeOutcome>,
}

/// Drives one execution of a compiled plan
pub struct Executor {
    plan: Arc<Plan>,
    bus: Arc<EventBus>,
    ephemeral: Arc<dyn Checkpointer>,
    credentials: Arc<dyn CredentialResolver>,
    budget: Arc<dyn BudgetGate>,
    cancel: CancellationToken,
    options: ExecutorOptions,
}

impl Executor {
    pub fn new(
        plan: Arc<Plan>,
        bus: Arc<EventBus>,
        ephemeral: Arc<dyn Checkpointer>,
        credentials: Arc<dyn CredentialResolver>,
    ) -> Self {
        Self {
            plan,
            bus,
            ephemeral,
            credentials,
            budget: Arc::new(NoBudget),
            cancel: CancellationToken::new(),
            options: ExecutorOptions::default(),
        }
    }

    pub fn with_budget(mut self, budget: Arc<dyn BudgetGate>) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    /// Token callers use to request cancellation of this execution
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run (or resume) the execution to its next boundary
    pub async fn run(
        &self,
        execution_id: &str,
        trigger_payload: Value,
        resume: Option<ResumeRequest>,
    ) -> Result<RunReport> {
        let started = Instant::now();
        let mut driver = Driver {
            exec: self,
            execution_id,
            snap: RunSnapshot::default(),
            logs: Vec::new(),
            resume_target: None,
            child_failed: None,
        };

        match resume {
            Some(request) => {
                if let Err(err) = driver.rehydrate(request).await {
                    let report = driver.finish_failed(err, started).await;
                    return Ok(report);
                }
            }
            None => {
                driver.snap.state = ExecutionState::seeded(trigger_payload);
            }
        }

        let outer = self.plan.outer_nodes();
        let result = driver.drive_region(&outer).await;
        driver.settle(result, started).await
    }
}

struct Driver<'a> {
    exec: &'a Executor,
    execution_id: &'a str,
    snap: RunSnapshot,
    logs: Vec<NodeLogEntry>,
    /// Node whose suspension this resume answers; clears `resume_input`
    /// once it completes
    resume_target: Option<NodeId>,
    /// Child failure to surface as this node's failure
    child_failed: Option<(NodeId, String)>,
}

impl<'a> Driver<'a> {
    fn plan(&self) -> &Plan {
        &self.exec.plan
    }

    fn emit(&self, event: StatusEvent) {
        self.exec
            .bus
            .emit(&self.exec.plan.workflow_slug, self.execution_id, event);
    }

    fn emit_node_status(&self, node_id: &str, status: NodeStatus) {
        self.emit(StatusEvent::NodeStatus {
            execution_id: self.execution_id.to_string(),
            node_id: node_id.to_string(),
            status,
            output: None,
            error: None,
            error_code: None,
            token_usage: None,
        });
    }

    fn log_status(
        &mut self,
        node_id: &str,
        status: NodeStatus,
        output: Option<Value>,
        error: Option<(String, String)>,
        duration_ms: i64,
        token_usage: Option<TokenUsage>,
    ) {
        let (error_msg, error_code) = match error {
            Some((code, message)) => (Some(message), Some(code)),
            None => (None, None),
        };
        self.logs.push(NodeLogEntry {
            node_id: node_id.to_string(),
            status,
            output: output.clone(),
            error: error_msg.clone(),
            error_code: error_code.clone(),
            duration_ms,
            timestamp: Utc::now(),
            token_usage,
        });
        self.emit(StatusEvent::NodeStatus {
            execution_id: self.execution_id.to_string(),
            node_id: node_id.to_string(),
            status,
            output,
            error: error_msg,
            error_code,
            token_usage,
        });
    }

    // ---- resume ---------------------------------------------------------

    async fn rehydrate(&mut self, request: ResumeRequest) -> Result<()> {
        let thread = interrupt_thread_id(self.execution_id);
        let checkpoint = self
            .exec
            .ephemeral
            .latest(&thread)
            .await?
            .ok_or_else(|| {
                CoreError::Checkpoint(pipelit_checkpoint::CheckpointError::Corrupt {
                    thread_id: thread.clone(),
                    message: "no checkpoint for suspended execution".to_string(),
                })
            })?;

        self.snap = serde_json::from_value(checkpoint.blob.clone()).map_err(|err| {
            CoreError::Checkpoint(pipelit_checkpoint::CheckpointError::Corrupt {
                thread_id: thread,
                message: err.to_string(),
            })
        })?;
        self.snap.last_checkpoint_id = Some(checkpoint.checkpoint_id.clone());

        if let Some(input) = request.input {
            self.snap.state.resume_input = Some(input);
        }
        if let Some((node_id, output)) = request.child_result {
            self.snap
                .state
                .subworkflow_results
                .insert(node_id, output);
        }
        self.child_failed = request.child_error;

        match self.snap.pending.take() {
            Some(Pending::BeforeNode { node_id }) => {
                self.snap.passed_before.insert(node_id);
            }
            Some(Pending::AfterNode { .. }) => {}
            Some(Pending::AwaitInput { node_id }) | Some(Pending::AwaitChild { node_id }) => {
                self.resume_target = Some(node_id);
            }
            Some(Pending::Delay { node_id, seconds }) => {
                // The delay elapsed; the node completes with no outputs.
                self.snap.statuses.insert(node_id.clone(), NodeStatus::Success);
                self.snap
                    .state
                    .record_node_output(&node_id, &NodeUpdate::default());
                self.log_status(
                    &node_id,
                    NodeStatus::Success,
                    Some(json!({"delayed_seconds": seconds})),
                    None,
                    0,
                    None,
                );
            }
            None => {}
        }
        info!(execution_id = %self.execution_id, "rehydrated execution from checkpoint");
        Ok(())
    }

    // ---- settle ---------------------------------------------------------

    async fn settle(mut self, result: RegionResult, started: Instant) -> Result<RunReport> {
        let duration_ms = started.elapsed().as_millis() as i64;
        let outcome = match result {
            RegionResult::Completed => {
                let final_output = self.final_output();
                self.emit(StatusEvent::ExecutionCompleted {
                    execution_id: self.execution_id.to_string(),
                    status: "completed".to_string(),
                    duration_ms,
                    final_output: final_output.clone(),
                });
                RunOutcome::Completed { final_output }
            }
            RegionResult::Suspended {
                reason,
                child,
                delay_seconds,
            } => {
                if let Err(err) = self.save_checkpoint().await {
                    return Ok(self.finish_failed(err, started).await);
                }
                self.emit(StatusEvent::ExecutionInterrupted {
                    execution_id: self.execution_id.to_string(),
                    reason,
                });
                RunOutcome::Interrupted {
                    reason,
                    pending_child: child,
                    delay_seconds,
                }
            }
            RegionResult::Failed(err) => return Ok(self.finish_failed(err, started).await),
            RegionResult::Cancelled => {
                self.emit(StatusEvent::ExecutionCancelled {
                    execution_id: self.execution_id.to_string(),
                });
                RunOutcome::Cancelled
            }
        };

        Ok(RunReport {
            outcome,
            node_logs: std::mem::take(&mut self.logs),
            duration_ms,
            state: self.snap.state,
        })
    }

    async fn finish_failed(mut self, err: CoreError, started: Instant) -> RunReport {
        let duration_ms = started.elapsed().as_millis() as i64;
        let error_code = err.code_str();
        let message = err.to_string();
        self.emit(StatusEvent::ExecutionFailed {
            execution_id: self.execution_id.to_string(),
            error: message.clone(),
            error_code: error_code.clone(),
        });
        RunReport {
            outcome: RunOutcome::Failed {
                error_code,
                message,
            },
            node_logs: std::mem::take(&mut self.logs),
            duration_ms,
            state: self.snap.state,
        }
    }

    async fn save_checkpoint(&mut self) -> Result<()> {
        let blob = serde_json::to_value(&self.snap)?;
        let checkpoint = Checkpoint::new(
            self.snap.last_checkpoint_id.clone(),
            self.snap.step,
            CheckpointSource::Interrupt,
            blob,
        );
        let id = checkpoint.checkpoint_id.clone();
        self.exec
            .ephemeral
            .save(&interrupt_thread_id(self.execution_id), checkpoint)
            .await?;
        self.snap.last_checkpoint_id = Some(id);
        Ok(())
    }

    // ---- scheduling -----------------------------------------------------

    /// Drive one region (the outer graph or a loop body) to a boundary
    fn drive_region<'b>(
        &'b mut self,
        region: &'b HashSet<NodeId>,
    ) -> BoxFuture<'b, RegionResult> {
        async move {
            loop {
                if self.exec.cancel.is_cancelled() {
                    return RegionResult::Cancelled;
                }

                // Surface a child workflow failure as its parent node's
                // failure before scheduling anything else.
                if let Some((node_id, message)) = self.child_failed.take() {
                    let err = CoreError::node_failed(
                        &node_id,
                        ErrorCode::RuntimeNodeFailure.as_str(),
                        format!("child workflow failed: {message}"),
                    );
                    self.snap.statuses.insert(node_id.clone(), NodeStatus::Failed);
                    self.log_status(
                        &node_id,
                        NodeStatus::Failed,
                        None,
                        Some((err.code_str(), err.to_string())),
                        0,
                        None,
                    );
                    return RegionResult::Failed(err);
                }

                self.propagate_skips(region);
                let ready = self.compute_ready(region);
                if ready.is_empty() {
                    return RegionResult::Completed;
                }

                // interrupt_before suspends the whole execution before any
                // wave-mate runs.
                for node_id in &ready {
                    let Ok(build) = self.plan().node(node_id) else {
                        continue;
                    };
                    if build.interrupt_before && !self.snap.passed_before.contains(node_id) {
                        self.snap.pending = Some(Pending::BeforeNode {
                            node_id: node_id.clone(),
                        });
                        return RegionResult::Suspended {
                            reason: InterruptReason::HumanConfirmation,
                            child: None,
                            delay_seconds: None,
                        };
                    }
                }

                if let Err(err) = self.exec.budget.check(self.execution_id).await {
                    return RegionResult::Failed(err);
                }

                let (loops, plain): (Vec<NodeId>, Vec<NodeId>) = ready
                    .into_iter()
                    .partition(|id| self.plan().nodes.get(id).map(|n| n.is_loop).unwrap_or(false));

                if !plain.is_empty() {
                    match self.run_wave(plain).await {
                        Some(result) => return result,
                        None => continue,
                    }
                }

                // Loops run one at a time; their descendants serialize on
                // the loop's completion anyway.
                if let Some(loop_id) = loops.into_iter().next() {
                    match self.execute_loop(&loop_id).await {
                        Some(result) => return result,
                        None => continue,
                    }
                }
            }
        }
        .boxed()
    }

    /// In-edges of `node_id` restricted to `region`:
    /// `(all_resolved, any_satisfied, has_in_edges)`
    fn edge_resolution(&self, region: &HashSet<NodeId>, node_id: &str) -> (bool, bool, bool) {
        let mut has_edges = false;
        let mut all_resolved = true;
        let mut any_satisfied = false;

        for pred in self
            .plan()
            .data_preds
            .get(node_id)
            .into_iter()
            .flatten()
            .filter(|p| region.contains(*p))
        {
            has_edges = true;
            match self.snap.statuses.get(pred) {
                Some(status) if status.is_terminal() => {
                    if *status == NodeStatus::Success {
                        any_satisfied = true;
                    }
                }
                _ => all_resolved = false,
            }
        }

        for (emitter, condition) in self
            .plan()
            .cond_preds
            .get(node_id)
            .into_iter()
            .flatten()
            .filter(|(e, _)| region.contains(e))
        {
            has_edges = true;
            match self.snap.statuses.get(emitter) {
                Some(NodeStatus::Success) => {
                    if self.branch_taken(emitter, condition) {
                        any_satisfied = true;
                    }
                }
                Some(status) if status.is_terminal() => {}
                _ => all_resolved = false,
            }
        }

        (all_resolved, any_satisfied, has_edges)
    }

    /// Whether the emitter's chosen route traverses the edge labelled
    /// `condition`; the `__other__` fallback is taken when no branch matches
    fn branch_taken(&self, emitter: &str, condition: &str) -> bool {
        let Some(route) = self.snap.routes.get(emitter) else {
            return false;
        };
        let Some(map) = self.plan().route_map.get(emitter) else {
            return false;
        };
        if map.branches.contains_key(route) {
            condition == route
        } else {
            condition == FALLBACK_ROUTE && !map.fallback.is_empty()
        }
    }

    /// Mark nodes whose every in-path is dead as skipped, to fixpoint
    fn propagate_skips(&mut self, region: &HashSet<NodeId>) {
        loop {
            let mut newly_skipped: Vec<NodeId> = Vec::new();
            for node_id in region {
                if self.snap.statuses.get(node_id).map(|s| s.is_terminal()) == Some(true) {
                    continue;
                }
                let (all_resolved, any_satisfied, has_edges) =
                    self.edge_resolution(region, node_id);
                if has_edges && all_resolved && !any_satisfied {
                    newly_skipped.push(node_id.clone());
                }
            }
            if newly_skipped.is_empty() {
                return;
            }
            newly_skipped.sort_unstable();
            for node_id in newly_skipped {
                self.snap.statuses.insert(node_id.clone(), NodeStatus::Skipped);
                self.log_status(&node_id, NodeStatus::Skipped, None, None, 0, None);
            }
        }
    }

    /// Nodes whose inputs are ready, sorted for determinism
    fn compute_ready(&self, region: &HashSet<NodeId>) -> Vec<NodeId> {
        let mut ready: Vec<NodeId> = region
            .iter()
            .filter(|node_id| {
                match self.snap.statuses.get(*node_id) {
                    Some(status) if status.is_terminal() => return false,
                    Some(NodeStatus::Running) => return false,
                    _ => {}
                }
                let (all_resolved, any_satisfied, has_edges) =
                    self.edge_resolution(region, node_id);
                !has_edges || (all_resolved && any_satisfied)
            })
            .cloned()
            .collect();
        ready.sort_unstable();
        ready
    }

    // ---- node execution -------------------------------------------------

    /// Render a node's templated config against the current state
    fn resolve_config(&self, node_id: &str) -> Result<ResolvedConfig> {
        let build = self.plan().node(node_id)?;
        let system_prompt = match &build.system_prompt {
            Some(prompt) if self.exec.options.strict_templates => {
                template::try_render(prompt, &self.snap.state)?
            }
            Some(prompt) => template::render(prompt, &self.snap.state),
            None => String::new(),
        };
        let mut extra = Map::new();
        for (key, value) in &build.extra {
            extra.insert(key.clone(), self.render_value(value));
        }
        Ok(ResolvedConfig {
            system_prompt,
            extra,
        })
    }

    fn render_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) if s.contains("{{") || s.contains("{%") => {
                Value::String(template::render(s, &self.snap.state))
            }
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.render_value(v)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.render_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Run one wave of plain nodes concurrently; `None` means keep going
    async fn run_wave(&mut self, wave: Vec<NodeId>) -> Option<RegionResult> {
        let mut configs: HashMap<NodeId, ResolvedConfig> = HashMap::new();
        for node_id in &wave {
            match self.resolve_config(node_id) {
                Ok(config) => {
                    configs.insert(node_id.clone(), config);
                }
                Err(err) => return Some(RegionResult::Failed(err)),
            }
        }

        for node_id in &wave {
            self.snap
                .statuses
                .insert(node_id.clone(), NodeStatus::Running);
            self.emit_node_status(node_id, NodeStatus::Running);
        }
        self.snap.step += 1;

        let results = {
            let state = &self.snap.state;
            let mut futures = FuturesUnordered::new();
            for node_id in &wave {
                let build = match self.plan().node(node_id) {
                    Ok(build) => build,
                    Err(_) => continue,
                };
                let config = &configs[node_id];
                futures.push(run_one(
                    self.execution_id,
                    build,
                    config,
                    state,
                    &self.exec.credentials,
                    &self.exec.cancel,
                ));
            }

            let mut collected: Vec<WaveResult> = Vec::with_capacity(wave.len());
            let cancelled = loop {
                tokio::select! {
                    next = futures.next() => match next {
                        Some(result) => collected.push(result),
                        None => break false,
                    },
                    _ = self.exec.cancel.cancelled() => break true,
                }
            };
            if cancelled {
                // Bounded grace for in-flight work; stragglers are dropped.
                let grace = self.exec.options.cancellation_grace;
                let _ = tokio::time::timeout(grace, async {
                    while let Some(result) = futures.next().await {
                        collected.push(result);
                    }
                })
                .await;
            }
            drop(futures);
            (collected, cancelled)
        };
        let (collected, cancelled) = results;

        let merge = self.merge_wave(collected).await;
        if cancelled {
            return Some(RegionResult::Cancelled);
        }
        merge
    }

    /// Apply a completed wave's results; `None` means keep scheduling
    async fn merge_wave(&mut self, completed: Vec<WaveResult>) -> Option<RegionResult> {
        // The earliest-completing emitter's route becomes the global route.
        let global_route = completed.iter().find_map(|r| match &r.result {
            Ok(NodeOutcome::Outputs(update)) => update.route.clone(),
            _ => None,
        });

        let mut successes: Vec<(&WaveResult, &NodeUpdate)> = Vec::new();
        let mut failures: Vec<(&WaveResult, String)> = Vec::new();
        let mut suspends: Vec<&WaveResult> = Vec::new();
        for result in &completed {
            match &result.result {
                Ok(NodeOutcome::Outputs(update)) => successes.push((result, update)),
                Ok(_) => suspends.push(result),
                Err(err) => failures.push((result, err.to_string())),
            }
        }

        // State patches apply in node-id lexicographic order: the last
        // writer within the wave wins deterministically.
        successes.sort_by(|a, b| a.0.node_id.cmp(&b.0.node_id));
        for (result, update) in &successes {
            self.snap.state.record_node_output(&result.node_id, update);
            if let Some(route) = &update.route {
                self.snap
                    .routes
                    .insert(result.node_id.clone(), route.clone());
            }
            self.snap
                .statuses
                .insert(result.node_id.clone(), NodeStatus::Success);

            if let Some(usage) = &update.token_usage {
                if let Err(err) = self
                    .exec
                    .budget
                    .charge(self.execution_id, &result.node_id, usage)
                    .await
                {
                    warn!(error = %err, node_id = %result.node_id, "failed to charge token usage");
                }
            }

            let preview = self.snap.state.node_outputs.get(&result.node_id).cloned();
            self.log_status(
                &result.node_id,
                NodeStatus::Success,
                preview,
                None,
                result.duration_ms,
                update.token_usage,
            );

            if self.resume_target.as_deref() == Some(result.node_id.as_str()) {
                self.snap.state.resume_input = None;
                self.resume_target = None;
            }
        }
        if let Some(route) = global_route {
            self.snap.state.route = Some(route);
        }

        if !failures.is_empty() {
            failures.sort_by(|a, b| a.0.node_id.cmp(&b.0.node_id));
            for (result, message) in &failures {
                let code = match &result.result {
                    Err(err) => err.code_str(),
                    Ok(_) => ErrorCode::RuntimeNodeFailure.as_str().to_string(),
                };
                self.snap
                    .statuses
                    .insert(result.node_id.clone(), NodeStatus::Failed);
                self.log_status(
                    &result.node_id,
                    NodeStatus::Failed,
                    None,
                    Some((code, message.clone())),
                    result.duration_ms,
                    None,
                );
            }
            let (first, message) = &failures[0];
            return Some(RegionResult::Failed(CoreError::node_failed(
                &first.node_id,
                match &first.result {
                    Err(err) => err.code_str(),
                    Ok(_) => ErrorCode::RuntimeNodeFailure.as_str().to_string(),
                },
                message.clone(),
            )));
        }

        if !suspends.is_empty() {
            suspends.sort_by(|a, b| a.node_id.cmp(&b.node_id));
            for result in &suspends {
                self.snap
                    .statuses
                    .insert(result.node_id.clone(), NodeStatus::Waiting);
                self.log_status(&result.node_id, NodeStatus::Waiting, None, None, 0, None);
            }
            let first = suspends[0];
            let (pending, reason, child, delay) = match &first.result {
                Ok(NodeOutcome::SuspendForInput { .. }) => (
                    Pending::AwaitInput {
                        node_id: first.node_id.clone(),
                    },
                    InterruptReason::HumanConfirmation,
                    None,
                    None,
                ),
                Ok(NodeOutcome::SuspendForChild {
                    workflow_slug,
                    payload,
                }) => (
                    Pending::AwaitChild {
                        node_id: first.node_id.clone(),
                    },
                    InterruptReason::Subworkflow,
                    Some(ChildSpawn {
                        workflow_slug: workflow_slug.clone(),
                        payload: payload.clone(),
                        parent_node_id: first.node_id.clone(),
                    }),
                    None,
                ),
                Ok(NodeOutcome::Delay { seconds }) => (
                    Pending::Delay {
                        node_id: first.node_id.clone(),
                        seconds: *seconds,
                    },
                    InterruptReason::Delay,
                    None,
                    Some(*seconds),
                ),
                _ => return Some(RegionResult::Failed(CoreError::Execution(
                    "suspend bookkeeping desynchronized".to_string(),
                ))),
            };
            self.snap.pending = Some(pending);
            return Some(RegionResult::Suspended {
                reason,
                child,
                delay_seconds: delay,
            });
        }

        // interrupt_after on any node that just succeeded.
        for (result, _) in &successes {
            let Ok(build) = self.plan().node(&result.node_id) else {
                continue;
            };
            if build.interrupt_after {
                self.snap.pending = Some(Pending::AfterNode {
                    node_id: result.node_id.clone(),
                });
                return Some(RegionResult::Suspended {
                    reason: InterruptReason::HumanConfirmation,
                    child: None,
                    delay_seconds: None,
                });
            }
        }

        None
    }

    // ---- loops ----------------------------------------------------------

    /// Drive one loop node through its iterations
    async fn execute_loop(&mut self, loop_id: &str) -> Option<RegionResult> {
        let frame = match self.plan().loops.get(loop_id) {
            Some(frame) => frame.clone(),
            None => {
                return Some(RegionResult::Failed(CoreError::Execution(format!(
                    "node '{loop_id}' has no loop frame"
                ))))
            }
        };

        self.snap
            .statuses
            .insert(loop_id.to_string(), NodeStatus::Running);
        self.emit_node_status(loop_id, NodeStatus::Running);
        let started = Instant::now();

        // Resume mid-loop when the suspended position belongs to this loop.
        let mut progress = if self
            .snap
            .loop_stack
            .first()
            .map(|p| p.loop_id == loop_id)
            .unwrap_or(false)
        {
            self.snap.loop_stack.remove(0)
        } else {
            LoopProgress {
                loop_id: loop_id.to_string(),
                items: self.resolve_items(&frame),
                index: 0,
                results: Vec::new(),
                outer_scope: self.snap.state.loop_scope.clone(),
            }
        };

        let on_error_continue = self
            .plan()
            .nodes
            .get(loop_id)
            .and_then(|n| n.extra.get("on_error"))
            .and_then(|v| v.as_str())
            .map(|s| s == "continue")
            .unwrap_or(false);

        while progress.index < progress.items.len() {
            if self.exec.cancel.is_cancelled() {
                return Some(RegionResult::Cancelled);
            }
            self.snap.state.loop_scope = Some(LoopScope {
                current: progress.items[progress.index].clone(),
                index: progress.index as u64,
            });

            let body_result = self.drive_region(&frame.body_nodes).await;
            match body_result {
                RegionResult::Completed => {
                    // A single-keyed terminal output appends its bare value;
                    // multi-keyed outputs append the whole object.
                    let output = frame
                        .terminal
                        .as_ref()
                        .and_then(|t| self.snap.state.node_outputs.get(t).cloned())
                        .map(|output| match &output {
                            Value::Object(map) if map.len() == 1 => {
                                map.values().next().cloned().unwrap_or(Value::Null)
                            }
                            _ => output,
                        })
                        .unwrap_or(Value::Null);
                    progress.results.push(output);
                }
                RegionResult::Failed(err) => {
                    if on_error_continue {
                        debug!(
                            loop_id,
                            index = progress.index,
                            error = %err,
                            "loop iteration failed, continuing"
                        );
                    } else {
                        self.snap
                            .statuses
                            .insert(loop_id.to_string(), NodeStatus::Failed);
                        self.log_status(
                            loop_id,
                            NodeStatus::Failed,
                            None,
                            Some((err.code_str(), err.to_string())),
                            started.elapsed().as_millis() as i64,
                            None,
                        );
                        return Some(RegionResult::Failed(err));
                    }
                }
                RegionResult::Suspended {
                    reason,
                    child,
                    delay_seconds,
                } => {
                    // Record our position so resume re-enters this iteration.
                    self.snap.loop_stack.insert(0, progress);
                    self.snap
                        .statuses
                        .insert(loop_id.to_string(), NodeStatus::Waiting);
                    return Some(RegionResult::Suspended {
                        reason,
                        child,
                        delay_seconds,
                    });
                }
                RegionResult::Cancelled => return Some(RegionResult::Cancelled),
            }

            // Reset the body for the next iteration.
            progress.index += 1;
            for body_node in &frame.body_nodes {
                self.snap.statuses.remove(body_node);
                self.snap.routes.remove(body_node);
            }
        }

        self.snap.state.loop_scope = progress.outer_scope.clone();
        let update = NodeUpdate::from_raw(json!({
            "results": progress.results,
            "count": progress.results.len(),
        }));
        self.snap.state.record_node_output(loop_id, &update);
        self.snap
            .statuses
            .insert(loop_id.to_string(), NodeStatus::Success);
        let preview = self.snap.state.node_outputs.get(loop_id).cloned();
        self.log_status(
            loop_id,
            NodeStatus::Success,
            preview,
            None,
            started.elapsed().as_millis() as i64,
            None,
        );
        None
    }

    /// A loop's iterable: the `items` input port wins, then the
    /// `(items_source, items_field)` config pair. Non-lists are wrapped as
    /// singletons; null or absent iterates zero times.
    fn resolve_items(&self, frame: &LoopFrame) -> Vec<Value> {
        let raw = if let Some((source, port)) = &frame.items_input {
            let outputs = self.snap.state.node_outputs.get(source);
            match outputs {
                Some(Value::Object(map)) => {
                    if !port.is_empty() {
                        map.get(port).cloned().unwrap_or(Value::Null)
                    } else {
                        ["items", "results", "output"]
                            .iter()
                            .find_map(|key| map.get(*key).cloned())
                            .or_else(|| {
                                (map.len() == 1)
                                    .then(|| map.values().next().cloned())
                                    .flatten()
                            })
                            .unwrap_or(Value::Null)
                    }
                }
                _ => Value::Null,
            }
        } else if let Some((source, field)) = &frame.items_config {
            self.snap
                .state
                .lookup(&format!("{source}.{field}"))
                .unwrap_or(Value::Null)
        } else {
            Value::Null
        };

        match raw {
            Value::Null => Vec::new(),
            Value::Array(items) => items,
            other => vec![other],
        }
    }

    // ---- completion -----------------------------------------------------

    /// Final output: the visible outputs of leaf nodes that succeeded.
    /// A single leaf's outputs are returned directly; multiple leaves are
    /// keyed by node id.
    fn final_output(&self) -> Option<Value> {
        let mut leaves: Vec<&NodeId> = self
            .plan()
            .nodes
            .keys()
            .filter(|id| !self.plan().body_owner.contains_key(*id))
            .filter(|id| self.snap.statuses.get(*id) == Some(&NodeStatus::Success))
            .filter(|id| {
                let no_data_succs = self
                    .plan()
                    .data_succs
                    .get(*id)
                    .map(|s| s.is_empty())
                    .unwrap_or(true);
                let no_branches = !self.plan().route_map.contains_key(*id);
                no_data_succs && no_branches
            })
            .collect();
        leaves.sort_unstable();

        match leaves.len() {
            0 => None,
            1 => self.snap.state.node_outputs.get(leaves[0].as_str()).cloned(),
            _ => {
                let mut map = Map::new();
                for leaf in leaves {
                    if let Some(output) = self.snap.state.node_outputs.get(leaf.as_str()) {
                        map.insert(leaf.clone(), output.clone());
                    }
                }
                Some(Value::Object(map))
            }
        }
    }
}

/// Execute one node's runnable, honoring its per-type timeout
async fn run_one(
    execution_id: &str,
    build: &crate::compile::NodeBuild,
    config: &ResolvedConfig,
    state: &ExecutionState,
    credentials: &Arc<dyn CredentialResolver>,
    cancel: &CancellationToken,
) -> WaveResult {
    let started = Instant::now();
    let ctx = RunContext {
        execution_id,
        node_id: &build.node_id,
        config,
        state,
        capabilities: &build.capabilities,
        credentials,
        cancel,
    };

    let result = match build.timeout_ms {
        Some(timeout_ms) => {
            match tokio::time::timeout(Duration::from_millis(timeout_ms), build.runnable.run(ctx))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(CoreError::NodeTimeout {
                    node_id: build.node_id.clone(),
                    timeout_ms,
                }),
            }
        }
        None => build.runnable.run(ctx).await,
    };

    WaveResult {
        node_id: build.node_id.clone(),
        duration_ms: started.elapsed().as_millis() as i64,
        result,
    }
}
