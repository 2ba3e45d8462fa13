//! The engine facade
//!
//! Wires the execution core to its durable surroundings: compiles and runs
//! executions off the job queue, routes inbound trigger events, spawns and
//! resumes child workflows, reaps zombies, and exposes the in-process
//! surface callers use (`dispatch_event`, `dispatch_chat`,
//! `cancel_execution`, `resume_execution`, `recover_scheduled_jobs`).

use crate::checkpoint_store::SqliteCheckpointer;
use crate::config::EngineConfig;
use crate::cost::CostAccountant;
use crate::db::models::{ExecutionRow, ExecutionStatus, ScheduledJobRow};
use crate::db::repositories::scheduled_job_repo::NewScheduledJob;
use crate::db::repositories::{
    ExecutionRepository, NodeLogRepository, WorkflowRepository,
};
use crate::db::{DatabaseConnection, DatabasePool};
use crate::queue::{spawn_workers, InMemoryJobQueue, Job, JobHandler, JobQueue};
use crate::scheduler::{ScheduleTarget, Scheduler, QUEUE_SCHEDULER};
use crate::trigger::{
    DispatchContext, TriggerDispatch, TriggerEvent, TriggerResolver, QUEUE_EXECUTIONS,
    QUEUE_INTERACTIVE,
};
use crate::{EngineError, Result};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use pipelit_checkpoint::{Checkpointer, InMemoryCheckpointer};
use pipelit_core::{
    compile, execution_channel, register_builtins, CredentialResolver, ErrorCode, EventBus,
    Executor, ExecutorOptions, NoCredentials, PortRegistry, ResumeRequest, RunOutcome,
    StatusEvent, WorkflowSnapshot,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Terminal result delivered to completion waiters
pub type CompletionSignal = (ExecutionStatus, Option<Value>);

/// The assembled engine; cheap to clone
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    pool: DatabasePool,
    registry: Arc<PortRegistry>,
    bus: Arc<EventBus>,
    queue: Arc<dyn JobQueue>,
    ephemeral: Arc<dyn Checkpointer>,
    credentials: Arc<dyn CredentialResolver>,
    cost: Arc<CostAccountant>,
    scheduler: Scheduler,
    dispatch: TriggerDispatch,
    cancel_tokens: DashMap<String, CancellationToken>,
    waiters: DashMap<String, Vec<oneshot::Sender<CompletionSignal>>>,
    shutdown: CancellationToken,
}

impl Engine {
    /// Assemble an engine over a fresh database connection
    ///
    /// The built-in control-flow components are registered unless the
    /// caller's registry already carries them.
    pub async fn new(
        config: EngineConfig,
        mut registry: PortRegistry,
        credentials: Arc<dyn CredentialResolver>,
    ) -> Result<Self> {
        let conn = DatabaseConnection::new(&config.database_url).await?;
        let pool = conn.pool().clone();

        if !registry.contains("trigger_chat") {
            register_builtins(&mut registry)?;
        }

        let queue: Arc<dyn JobQueue> = Arc::new(InMemoryJobQueue::new());
        let ephemeral: Arc<dyn Checkpointer> =
            Arc::new(InMemoryCheckpointer::with_ttl(config.ephemeral_ttl()));
        let cost = Arc::new(CostAccountant::new(pool.clone()));
        let scheduler = Scheduler::new(pool.clone(), queue.clone());
        let dispatch = TriggerDispatch::new(pool.clone(), queue.clone());

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                pool,
                registry: Arc::new(registry),
                bus: Arc::new(EventBus::default()),
                queue,
                ephemeral,
                credentials,
                cost,
                scheduler,
                dispatch,
                cancel_tokens: DashMap::new(),
                waiters: DashMap::new(),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Convenience constructor without a credential store
    pub async fn with_defaults(config: EngineConfig) -> Result<Self> {
        Self::new(config, PortRegistry::new(), Arc::new(NoCredentials)).await
    }

    /// Spawn the worker pool and the zombie sweeper
    pub fn start(&self) {
        let handler: Arc<dyn JobHandler> = Arc::new(self.clone());
        spawn_workers(
            self.inner.queue.clone(),
            vec![
                QUEUE_INTERACTIVE.to_string(),
                QUEUE_EXECUTIONS.to_string(),
                QUEUE_SCHEDULER.to_string(),
            ],
            self.inner.config.worker_count,
            handler,
            self.inner.shutdown.clone(),
        );

        let engine = self.clone();
        tokio::spawn(async move {
            let period = Duration::from_secs(engine.inner.config.zombie_sweep_interval_secs);
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = engine.inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = engine.sweep_zombies().await {
                            error!(error = %err, "zombie sweep failed");
                        }
                    }
                }
            }
        });
        info!(workers = self.inner.config.worker_count, "engine started");
    }

    /// Stop workers and background tasks; in-flight executions get their
    /// cancellation signal through the queue draining
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.inner.pool
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    pub fn registry(&self) -> &Arc<PortRegistry> {
        &self.inner.registry
    }

    pub fn durable_checkpointer(&self) -> SqliteCheckpointer {
        SqliteCheckpointer::new(self.inner.pool.clone())
    }

    /// The record-creating dispatcher, for callers that thread their own
    /// context (epic ownership, parent linkage)
    pub fn dispatcher(&self) -> &TriggerDispatch {
        &self.inner.dispatch
    }

    // ---- public surface -------------------------------------------------

    /// Route an inbound trigger event; returns the execution id when a
    /// trigger fired
    pub async fn dispatch_event(&self, event: TriggerEvent) -> Result<String> {
        if let TriggerEvent::Chat {
            workflow_slug,
            text,
            trigger_node_id,
            ..
        } = &event
        {
            let (execution_id, _) = self
                .dispatch_chat(workflow_slug, text, trigger_node_id.as_deref())
                .await?;
            return Ok(execution_id);
        }

        // A manual event naming its trigger bypasses the resolver walk.
        if let TriggerEvent::Manual {
            trigger_node_id: Some(node_id),
            ..
        } = &event
        {
            let workflows = self.active_workflows().await?;
            for workflow in &workflows {
                if workflow
                    .node(node_id)
                    .map(|n| n.component_type == "trigger_manual")
                    .unwrap_or(false)
                {
                    return self
                        .inner
                        .dispatch
                        .dispatch(
                            workflow,
                            node_id,
                            event.kind(),
                            event.payload(),
                            DispatchContext::default(),
                        )
                        .await;
                }
            }
            return Err(EngineError::NoTriggerMatched(event.kind().to_string()));
        }

        let workflows = self.active_workflows().await?;
        let Some((workflow, trigger_node_id)) = TriggerResolver::resolve(&event, &workflows)
        else {
            return Err(EngineError::NoTriggerMatched(event.kind().to_string()));
        };
        self.inner
            .dispatch
            .dispatch(
                workflow,
                &trigger_node_id,
                event.kind(),
                event.payload(),
                DispatchContext::default(),
            )
            .await
    }

    /// Dispatch a chat message directly against a workflow and return a
    /// receiver for the final output
    pub async fn dispatch_chat(
        &self,
        workflow_slug: &str,
        text: &str,
        trigger_node_id: Option<&str>,
    ) -> Result<(String, oneshot::Receiver<CompletionSignal>)> {
        let row = WorkflowRepository::get_by_slug(&self.inner.pool, workflow_slug)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("workflow '{workflow_slug}'")))?;
        let snapshot = row.snapshot()?;

        let trigger = match trigger_node_id {
            Some(node_id) => snapshot
                .node(node_id)
                .filter(|n| n.component_type == "trigger_chat")
                .map(|n| n.id.clone())
                .ok_or_else(|| {
                    EngineError::NotFound(format!("chat trigger '{node_id}' in '{workflow_slug}'"))
                })?,
            None => snapshot
                .nodes
                .iter()
                .find(|n| n.component_type == "trigger_chat")
                .map(|n| n.id.clone())
                .ok_or_else(|| {
                    EngineError::NoTriggerMatched(format!("chat in '{workflow_slug}'"))
                })?,
        };

        let execution = self
            .inner
            .dispatch
            .create_execution(
                &snapshot,
                &trigger,
                json!({"text": text}),
                DispatchContext::default(),
            )
            .await?;
        // Register before enqueueing so a fast worker cannot win the race.
        let rx = self.register_waiter(&execution.id);
        self.inner.dispatch.enqueue_run(&execution.id, "chat").await?;
        Ok((execution.id, rx))
    }

    /// Request cancellation of a pending or running execution
    pub async fn cancel_execution(&self, execution_id: &str) -> Result<bool> {
        let transitioned_pending = {
            let row = ExecutionRepository::get(&self.inner.pool, execution_id)
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("execution '{execution_id}'")))?;
            row.status() == Some(ExecutionStatus::Pending)
        };

        if let Some(token) = self.inner.cancel_tokens.get(execution_id) {
            token.cancel();
        }

        let transitioned =
            ExecutionRepository::mark_cancelled(&self.inner.pool, execution_id).await?;
        if transitioned && transitioned_pending {
            // Never reached a worker; emit the terminal event ourselves.
            self.inner.bus.publish(
                &execution_channel(execution_id),
                StatusEvent::ExecutionCancelled {
                    execution_id: execution_id.to_string(),
                },
            );
            self.notify_waiters(execution_id, ExecutionStatus::Cancelled, None);
        }
        Ok(transitioned)
    }

    /// Resume an interrupted execution with optional human input
    pub async fn resume_execution(
        &self,
        execution_id: &str,
        user_input: Option<String>,
    ) -> Result<()> {
        let row = ExecutionRepository::get(&self.inner.pool, execution_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("execution '{execution_id}'")))?;
        if row.status() != Some(ExecutionStatus::Interrupted) {
            return Err(EngineError::InvalidTransition {
                entity: format!("execution {execution_id}"),
                from: row.status.clone(),
                to: "running".to_string(),
            });
        }
        self.inner
            .dispatch
            .dispatch_resume(execution_id, json!({"input": user_input}), None)
            .await?;
        Ok(())
    }

    /// Startup crash recovery for scheduled jobs
    pub async fn recover_scheduled_jobs(&self) -> Result<usize> {
        self.inner.scheduler.recover().await
    }

    /// Create a scheduled job and enqueue its first firing
    pub async fn create_scheduled_job(&self, new: NewScheduledJob) -> Result<ScheduledJobRow> {
        self.inner.scheduler.create_job(new).await
    }

    pub async fn pause_scheduled_job(&self, job_id: i64) -> Result<bool> {
        self.inner.scheduler.pause(job_id).await
    }

    pub async fn resume_scheduled_job(&self, job_id: i64) -> Result<bool> {
        self.inner.scheduler.resume(job_id).await
    }

    /// Await an execution's terminal status
    pub async fn wait_for_completion(&self, execution_id: &str) -> Result<CompletionSignal> {
        let rx = self.register_waiter(execution_id);
        // Re-check after registering: the execution may already be terminal.
        if let Some(row) = ExecutionRepository::get(&self.inner.pool, execution_id).await? {
            if let Some(status) = row.status().filter(|s| s.is_terminal()) {
                self.take_waiters(execution_id);
                return Ok((status, row.final_output_value()));
            }
        }
        rx.await
            .map_err(|_| EngineError::General("completion waiter dropped".to_string()))
    }

    // ---- internals ------------------------------------------------------

    fn register_waiter(&self, execution_id: &str) -> oneshot::Receiver<CompletionSignal> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .waiters
            .entry(execution_id.to_string())
            .or_default()
            .push(tx);
        rx
    }

    fn take_waiters(&self, execution_id: &str) -> Vec<oneshot::Sender<CompletionSignal>> {
        self.inner
            .waiters
            .remove(execution_id)
            .map(|(_, waiters)| waiters)
            .unwrap_or_default()
    }

    fn notify_waiters(&self, execution_id: &str, status: ExecutionStatus, output: Option<Value>) {
        for waiter in self.take_waiters(execution_id) {
            let _ = waiter.send((status, output.clone()));
        }
    }

    async fn active_workflows(&self) -> Result<Vec<WorkflowSnapshot>> {
        let rows = WorkflowRepository::list_active(&self.inner.pool).await?;
        let mut snapshots = Vec::with_capacity(rows.len());
        for row in rows {
            match row.snapshot() {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(err) => warn!(workflow_id = %row.id, error = %err, "unparseable workflow"),
            }
        }
        Ok(snapshots)
    }

    /// Promote stale running executions to failed; returns the reap count
    pub async fn sweep_zombies(&self) -> Result<usize> {
        let cutoff = (Utc::now()
            - ChronoDuration::seconds(self.inner.config.zombie_threshold_secs as i64))
        .to_rfc3339();
        let stale = ExecutionRepository::running_stale_since(&self.inner.pool, &cutoff).await?;
        let mut reaped = 0usize;
        for row in stale {
            let message = "execution exceeded the zombie threshold";
            if ExecutionRepository::mark_failed(
                &self.inner.pool,
                &row.id,
                message,
                ErrorCode::Zombie.as_str(),
            )
            .await?
            {
                warn!(execution_id = %row.id, "zombie execution reaped");
                self.inner.bus.publish(
                    &execution_channel(&row.id),
                    StatusEvent::ExecutionFailed {
                        execution_id: row.id.clone(),
                        error: message.to_string(),
                        error_code: ErrorCode::Zombie.as_str().to_string(),
                    },
                );
                self.notify_waiters(&row.id, ExecutionStatus::Failed, None);
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    /// Run (or resume) one execution end to end, persisting everything
    async fn run_execution(
        &self,
        execution_id: &str,
        resume: Option<ResumeRequest>,
    ) -> Result<()> {
        let Some(row) = ExecutionRepository::get(&self.inner.pool, execution_id).await? else {
            warn!(execution_id, "run job for missing execution");
            return Ok(());
        };
        if row.status().map(|s| s.is_terminal()).unwrap_or(false) {
            debug!(execution_id, status = %row.status, "skipping terminal execution");
            return Ok(());
        }
        if !ExecutionRepository::mark_running(&self.inner.pool, execution_id).await? {
            debug!(execution_id, "lost the run race, skipping");
            return Ok(());
        }

        let workflow_row = WorkflowRepository::get_by_id(&self.inner.pool, &row.workflow_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("workflow '{}'", row.workflow_id)))?;
        let snapshot = workflow_row.snapshot()?;

        let plan = match compile(&snapshot, &row.trigger_node_id, &self.inner.registry) {
            Ok(plan) => Arc::new(plan),
            Err(err) => {
                self.finish_failed(&row, &snapshot, &err.to_string(), &err.code_str())
                    .await?;
                self.inner.bus.emit(
                    &snapshot.slug,
                    execution_id,
                    StatusEvent::ExecutionFailed {
                        execution_id: execution_id.to_string(),
                        error: err.to_string(),
                        error_code: err.code_str(),
                    },
                );
                return Ok(());
            }
        };

        let executor = Executor::new(
            plan,
            self.inner.bus.clone(),
            self.inner.ephemeral.clone(),
            self.inner.credentials.clone(),
        )
        .with_budget(self.inner.cost.clone())
        .with_options(ExecutorOptions {
            cancellation_grace: self.inner.config.cancellation_grace(),
            strict_templates: self.inner.config.strict_templates,
        });
        self.inner
            .cancel_tokens
            .insert(execution_id.to_string(), executor.cancellation_token());

        // Keep the liveness timestamp fresh while the run is in flight.
        let ticker_pool = self.inner.pool.clone();
        let ticker_id = execution_id.to_string();
        let ticker_stop = CancellationToken::new();
        let ticker_guard = ticker_stop.clone();
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = ticker_guard.cancelled() => break,
                    _ = interval.tick() => {
                        let _ = ExecutionRepository::touch(&ticker_pool, &ticker_id).await;
                    }
                }
            }
        });

        let report = executor
            .run(execution_id, row.trigger_payload_value(), resume)
            .await;

        ticker_stop.cancel();
        let _ = ticker.await;
        self.inner.cancel_tokens.remove(execution_id);

        let report = match report {
            Ok(report) => report,
            Err(err) => {
                self.finish_failed(&row, &snapshot, &err.to_string(), &err.code_str())
                    .await?;
                return Ok(());
            }
        };

        for entry in &report.node_logs {
            NodeLogRepository::append(&self.inner.pool, execution_id, entry).await?;
        }

        match report.outcome {
            RunOutcome::Completed { final_output } => {
                ExecutionRepository::mark_completed(
                    &self.inner.pool,
                    execution_id,
                    final_output.as_ref(),
                )
                .await?;
                self.notify_waiters(
                    execution_id,
                    ExecutionStatus::Completed,
                    final_output.clone(),
                );
                if let (Some(parent_id), Some(parent_node)) =
                    (&row.parent_execution_id, &row.parent_node_id)
                {
                    self.inner
                        .dispatch
                        .dispatch_resume(
                            parent_id,
                            json!({
                                "child_result": {
                                    "node_id": parent_node,
                                    "output": final_output.unwrap_or(Value::Null),
                                }
                            }),
                            None,
                        )
                        .await?;
                }
            }
            RunOutcome::Failed {
                error_code,
                message,
            } => {
                self.finish_failed(&row, &snapshot, &message, &error_code).await?;
            }
            RunOutcome::Interrupted {
                reason,
                pending_child,
                delay_seconds,
            } => {
                ExecutionRepository::mark_interrupted(&self.inner.pool, execution_id).await?;
                debug!(execution_id, reason = reason.as_str(), "execution interrupted");
                if let Some(child) = pending_child {
                    self.spawn_child(&row, &snapshot, child).await?;
                }
                if let Some(seconds) = delay_seconds {
                    self.inner
                        .dispatch
                        .dispatch_resume(
                            execution_id,
                            json!({}),
                            Some(Duration::from_secs_f64(seconds.max(0.0))),
                        )
                        .await?;
                }
            }
            RunOutcome::Cancelled => {
                ExecutionRepository::mark_cancelled(&self.inner.pool, execution_id).await?;
                self.notify_waiters(execution_id, ExecutionStatus::Cancelled, None);
            }
        }
        Ok(())
    }

    /// Persist a failure, notify, propagate to the parent, and spawn the
    /// error-trigger shadow execution when the workflow carries one
    async fn finish_failed(
        &self,
        row: &ExecutionRow,
        snapshot: &WorkflowSnapshot,
        message: &str,
        error_code: &str,
    ) -> Result<()> {
        ExecutionRepository::mark_failed(&self.inner.pool, &row.id, message, error_code).await?;
        self.notify_waiters(&row.id, ExecutionStatus::Failed, None);

        if error_code == ErrorCode::BudgetExceeded.as_str() {
            if let Some(epic_id) = &row.epic_id {
                self.inner.cost.fail_epic(epic_id).await?;
            }
        }

        if let (Some(parent_id), Some(parent_node)) =
            (&row.parent_execution_id, &row.parent_node_id)
        {
            self.inner
                .dispatch
                .dispatch_resume(
                    parent_id,
                    json!({
                        "child_error": {
                            "node_id": parent_node,
                            "message": message,
                        }
                    }),
                    None,
                )
                .await?;
            return Ok(());
        }

        // Shadow execution against the workflow's error-trigger subgraph.
        // A failing shadow execution is terminal: it never re-triggers.
        let fired_from_error_trigger = snapshot
            .node(&row.trigger_node_id)
            .map(|n| n.component_type == "trigger_error")
            .unwrap_or(false);
        if fired_from_error_trigger {
            return Ok(());
        }
        let Some(error_trigger) = snapshot
            .nodes
            .iter()
            .find(|n| n.component_type == "trigger_error")
        else {
            return Ok(());
        };
        let payload = json!({
            "source_node_id": row.trigger_node_id,
            "source_node_type": snapshot
                .node(&row.trigger_node_id)
                .map(|n| n.component_type.clone()),
            "execution_id": row.id,
            "message": message,
            "error_code": error_code,
            "timestamp": Utc::now().to_rfc3339(),
        });
        let shadow_id = self
            .inner
            .dispatch
            .dispatch(
                snapshot,
                &error_trigger.id,
                "error",
                payload,
                DispatchContext {
                    epic_id: row.epic_id.clone(),
                    ..DispatchContext::default()
                },
            )
            .await?;
        info!(failed_execution = %row.id, shadow_execution = %shadow_id, "error-trigger shadow spawned");
        Ok(())
    }

    /// Create and enqueue the child execution of a suspended parent
    async fn spawn_child(
        &self,
        parent: &ExecutionRow,
        parent_snapshot: &WorkflowSnapshot,
        child: pipelit_core::ChildSpawn,
    ) -> Result<()> {
        let depth = parent.depth + 1;
        if depth > self.inner.config.recursion_ceiling as i64 {
            self.inner
                .dispatch
                .dispatch_resume(
                    &parent.id,
                    json!({
                        "child_error": {
                            "node_id": child.parent_node_id,
                            "message": format!(
                                "{}: sub-workflow depth {depth} exceeds the ceiling",
                                ErrorCode::RecursionLimit.as_str()
                            ),
                        }
                    }),
                    None,
                )
                .await?;
            return Ok(());
        }

        let child_row = WorkflowRepository::get_by_slug(&self.inner.pool, &child.workflow_slug)
            .await?;
        let Some(child_row) = child_row else {
            self.inner
                .dispatch
                .dispatch_resume(
                    &parent.id,
                    json!({
                        "child_error": {
                            "node_id": child.parent_node_id,
                            "message": format!("unknown workflow '{}'", child.workflow_slug),
                        }
                    }),
                    None,
                )
                .await?;
            return Ok(());
        };
        let child_snapshot = child_row.snapshot()?;

        let trigger = child_snapshot
            .nodes
            .iter()
            .find(|n| n.component_type == "trigger_workflow")
            .or_else(|| {
                child_snapshot.nodes.iter().find(|n| {
                    self.inner
                        .registry
                        .get(&n.component_type)
                        .map(|d| d.is_trigger)
                        .unwrap_or(false)
                })
            });
        let Some(trigger) = trigger else {
            self.inner
                .dispatch
                .dispatch_resume(
                    &parent.id,
                    json!({
                        "child_error": {
                            "node_id": child.parent_node_id,
                            "message": format!("workflow '{}' has no trigger", child.workflow_slug),
                        }
                    }),
                    None,
                )
                .await?;
            return Ok(());
        };

        let payload = json!({
            "source_workflow_id": parent_snapshot.id,
            "source_node_id": child.parent_node_id,
            "payload": child.payload,
        });
        let child_id = self
            .inner
            .dispatch
            .dispatch(
                &child_snapshot,
                &trigger.id,
                "workflow",
                payload,
                DispatchContext {
                    parent_execution_id: Some(parent.id.clone()),
                    parent_node_id: Some(child.parent_node_id.clone()),
                    epic_id: parent.epic_id.clone(),
                    depth,
                    ..DispatchContext::default()
                },
            )
            .await?;
        debug!(parent = %parent.id, child = %child_id, "child workflow dispatched");
        Ok(())
    }
}

#[async_trait]
impl JobHandler for Engine {
    async fn handle(&self, job: Job) -> Result<()> {
        let op = job.payload.get("op").and_then(|v| v.as_str()).unwrap_or("");
        match op {
            "run_execution" => {
                let execution_id = job
                    .payload
                    .get("execution_id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| EngineError::General("run job missing execution_id".into()))?;
                self.run_execution(execution_id, None).await
            }
            "resume_execution" => {
                let execution_id = job
                    .payload
                    .get("execution_id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| EngineError::General("resume job missing execution_id".into()))?;
                let resume = job.payload.get("resume").cloned().unwrap_or(json!({}));
                let request = ResumeRequest {
                    input: resume
                        .get("input")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string()),
                    child_result: resume.get("child_result").and_then(|v| {
                        Some((
                            v.get("node_id")?.as_str()?.to_string(),
                            v.get("output").cloned().unwrap_or(Value::Null),
                        ))
                    }),
                    child_error: resume.get("child_error").and_then(|v| {
                        Some((
                            v.get("node_id")?.as_str()?.to_string(),
                            v.get("message")?.as_str()?.to_string(),
                        ))
                    }),
                };
                self.run_execution(execution_id, Some(request)).await
            }
            "scheduled_fire" => {
                let job_id = job
                    .payload
                    .get("job_id")
                    .and_then(|v| v.as_i64())
                    .ok_or_else(|| EngineError::General("fire job missing job_id".into()))?;
                self.inner.scheduler.on_fire(job_id, self).await
            }
            other => {
                warn!(op = other, job_id = %job.id, "unknown job op");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl ScheduleTarget for Engine {
    async fn fire(&self, job: &ScheduledJobRow) -> Result<ExecutionStatus> {
        let event = TriggerEvent::Schedule {
            scheduled_job_id: job.id,
            payload: job.payload_value(),
        };
        let workflows = self.active_workflows().await?;
        let Some((workflow, trigger_node_id)) = TriggerResolver::resolve(&event, &workflows)
        else {
            return Err(EngineError::NoTriggerMatched("schedule".to_string()));
        };

        let execution = self
            .inner
            .dispatch
            .create_execution(
                workflow,
                &trigger_node_id,
                event.payload(),
                DispatchContext::default(),
            )
            .await?;

        if !job.awaits_completion() {
            self.inner.dispatch.enqueue_run(&execution.id, "schedule").await?;
            return Ok(ExecutionStatus::Completed);
        }

        // Run inline rather than through the queue: the firing itself came
        // off a worker, and parking that worker on its own queue could
        // starve a single-worker pool.
        self.run_execution(&execution.id, None).await?;
        let row = ExecutionRepository::get(&self.inner.pool, &execution.id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("execution '{}'", execution.id)))?;
        Ok(row.status().unwrap_or(ExecutionStatus::Failed))
    }
}
