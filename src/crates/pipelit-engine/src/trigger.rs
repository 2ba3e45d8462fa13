//! Trigger resolution and dispatch
//!
//! [`TriggerResolver`] is a pure mapping from an inbound event to the
//! `(workflow, trigger node)` pair that should fire: for each active
//! workflow it walks trigger nodes of the matching component type in node
//! order and applies the per-trigger match rules from the node's config.
//! Chat events are not resolved here; callers dispatch them directly
//! against a named workflow. Side effects (record creation, enqueueing)
//! live in [`TriggerDispatch`].

use crate::db::repositories::execution_repo::{ExecutionRepository, NewExecution};
use crate::db::DatabasePool;
use crate::queue::{Job, JobQueue};
use crate::Result;
use pipelit_core::WorkflowSnapshot;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// Queue consumed for ordinary executions
pub const QUEUE_EXECUTIONS: &str = "executions";
/// Queue consumed ahead of [`QUEUE_EXECUTIONS`] for chat and manual runs
pub const QUEUE_INTERACTIVE: &str = "interactive";

/// An inbound event that may fire a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerEvent {
    TelegramMessage {
        user_id: i64,
        chat_id: i64,
        message_id: i64,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bot_token_ref: Option<String>,
    },
    Schedule {
        scheduled_job_id: i64,
        payload: Value,
    },
    Manual {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        trigger_node_id: Option<String>,
    },
    Workflow {
        source_workflow_id: String,
        source_node_id: String,
        payload: Value,
    },
    Error {
        source_node_id: String,
        source_node_type: String,
        execution_id: String,
        message: String,
        error_code: String,
        timestamp: String,
    },
    Chat {
        workflow_slug: String,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        trigger_node_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
    },
}

impl TriggerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            TriggerEvent::TelegramMessage { .. } => "telegram-message",
            TriggerEvent::Schedule { .. } => "schedule",
            TriggerEvent::Manual { .. } => "manual",
            TriggerEvent::Workflow { .. } => "workflow",
            TriggerEvent::Error { .. } => "error",
            TriggerEvent::Chat { .. } => "chat",
        }
    }

    /// The trigger component type this event binds to
    pub fn component_type(&self) -> &'static str {
        match self {
            TriggerEvent::TelegramMessage { .. } => "trigger_telegram",
            TriggerEvent::Schedule { .. } => "trigger_schedule",
            TriggerEvent::Manual { .. } => "trigger_manual",
            TriggerEvent::Workflow { .. } => "trigger_workflow",
            TriggerEvent::Error { .. } => "trigger_error",
            TriggerEvent::Chat { .. } => "trigger_chat",
        }
    }

    /// The payload seeded into execution state as `trigger`
    pub fn payload(&self) -> Value {
        match self {
            TriggerEvent::TelegramMessage {
                user_id,
                chat_id,
                message_id,
                text,
                bot_token_ref,
            } => json!({
                "user_id": user_id,
                "chat_id": chat_id,
                "message_id": message_id,
                "text": text,
                "bot_token_ref": bot_token_ref,
            }),
            TriggerEvent::Schedule {
                scheduled_job_id,
                payload,
            } => json!({
                "scheduled_job_id": scheduled_job_id,
                "payload": payload,
            }),
            TriggerEvent::Manual { text, .. } => json!({"text": text}),
            TriggerEvent::Workflow {
                source_workflow_id,
                source_node_id,
                payload,
            } => json!({
                "source_workflow_id": source_workflow_id,
                "source_node_id": source_node_id,
                "payload": payload,
            }),
            TriggerEvent::Error {
                source_node_id,
                source_node_type,
                execution_id,
                message,
                error_code,
                timestamp,
            } => json!({
                "source_node_id": source_node_id,
                "source_node_type": source_node_type,
                "execution_id": execution_id,
                "message": message,
                "error_code": error_code,
                "timestamp": timestamp,
            }),
            TriggerEvent::Chat { text, .. } => json!({"text": text}),
        }
    }
}

/// Pure event-to-trigger mapping
pub struct TriggerResolver;

impl TriggerResolver {
    /// Walk active workflows in order and return the first matching
    /// `(workflow index, trigger node id)`
    pub fn resolve<'a>(
        event: &TriggerEvent,
        workflows: &'a [WorkflowSnapshot],
    ) -> Option<(&'a WorkflowSnapshot, String)> {
        if matches!(event, TriggerEvent::Chat { .. }) {
            // Chat is dispatched directly against a named workflow.
            return None;
        }
        let component_type = event.component_type();
        for workflow in workflows {
            for node in workflow
                .nodes
                .iter()
                .filter(|n| n.component_type == component_type)
            {
                if Self::node_matches(event, &node.config.extra) {
                    debug!(
                        workflow = %workflow.slug,
                        node_id = %node.id,
                        kind = event.kind(),
                        "trigger resolved"
                    );
                    return Some((workflow, node.id.clone()));
                }
            }
        }
        None
    }

    /// Apply a trigger node's match rules to an event
    fn node_matches(event: &TriggerEvent, extra: &serde_json::Map<String, Value>) -> bool {
        match event {
            TriggerEvent::TelegramMessage { user_id, text, .. } => {
                if let Some(allowed) = extra.get("allowed_user_ids").and_then(|v| v.as_array()) {
                    let permitted = allowed.iter().any(|v| v.as_i64() == Some(*user_id));
                    if !permitted {
                        return false;
                    }
                }
                if let Some(command) = extra.get("command").and_then(|v| v.as_str()) {
                    if !text.starts_with(command) {
                        return false;
                    }
                }
                if let Some(pattern) = extra.get("pattern").and_then(|v| v.as_str()) {
                    match Regex::new(pattern) {
                        Ok(regex) if regex.is_match(text) => {}
                        _ => return false,
                    }
                }
                true
            }
            TriggerEvent::Schedule {
                scheduled_job_id, ..
            } => {
                // Schedule triggers must be pinned to their job.
                extra.get("scheduled_job_id").and_then(|v| v.as_i64())
                    == Some(*scheduled_job_id)
            }
            TriggerEvent::Manual {
                trigger_node_id, ..
            } => {
                // An explicit node hint is checked by the caller against the
                // node id; without one, any manual trigger matches.
                trigger_node_id.is_none()
            }
            TriggerEvent::Workflow {
                source_workflow_id, ..
            } => match extra.get("source_workflow").and_then(|v| v.as_str()) {
                Some(pinned) => pinned == source_workflow_id,
                None => true,
            },
            TriggerEvent::Error { .. } => true,
            TriggerEvent::Chat { .. } => false,
        }
    }
}

/// Creates execution records and enqueues their run jobs
pub struct TriggerDispatch {
    pool: DatabasePool,
    queue: Arc<dyn JobQueue>,
}

/// Extra context threaded through dispatch for child and chat executions
#[derive(Debug, Clone, Default)]
pub struct DispatchContext {
    pub parent_execution_id: Option<String>,
    pub parent_node_id: Option<String>,
    pub epic_id: Option<String>,
    pub depth: i64,
    pub correlation_id: Option<String>,
}

impl TriggerDispatch {
    pub fn new(pool: DatabasePool, queue: Arc<dyn JobQueue>) -> Self {
        Self { pool, queue }
    }

    /// Create a pending execution record without enqueueing it yet
    ///
    /// Callers that need to observe completion (chat correlation) register
    /// their waiter between this and [`enqueue_run`](Self::enqueue_run).
    pub async fn create_execution(
        &self,
        workflow: &WorkflowSnapshot,
        trigger_node_id: &str,
        payload: Value,
        context: DispatchContext,
    ) -> Result<crate::db::models::ExecutionRow> {
        let row = ExecutionRepository::create(
            &self.pool,
            NewExecution {
                workflow_id: workflow.id.clone(),
                trigger_node_id: trigger_node_id.to_string(),
                trigger_payload: payload,
                parent_execution_id: context.parent_execution_id,
                parent_node_id: context.parent_node_id,
                epic_id: context.epic_id,
                depth: context.depth,
                correlation_id: context.correlation_id,
            },
        )
        .await?;
        Ok(row)
    }

    /// Enqueue the run job for a created execution
    pub async fn enqueue_run(&self, execution_id: &str, event_kind: &str) -> Result<()> {
        let queue_name = match event_kind {
            "chat" | "manual" => QUEUE_INTERACTIVE,
            _ => QUEUE_EXECUTIONS,
        };
        self.queue
            .enqueue(
                queue_name,
                Job::new(
                    format!("exec-{execution_id}"),
                    json!({"op": "run_execution", "execution_id": execution_id}),
                ),
            )
            .await?;
        debug!(execution_id, queue = queue_name, "execution dispatched");
        Ok(())
    }

    /// Create a pending execution record and enqueue its run job;
    /// returns the execution id
    pub async fn dispatch(
        &self,
        workflow: &WorkflowSnapshot,
        trigger_node_id: &str,
        event_kind: &str,
        payload: Value,
        context: DispatchContext,
    ) -> Result<String> {
        let row = self
            .create_execution(workflow, trigger_node_id, payload, context)
            .await?;
        self.enqueue_run(&row.id, event_kind).await?;
        Ok(row.id)
    }

    /// Enqueue a resume job for a suspended execution
    pub async fn dispatch_resume(
        &self,
        execution_id: &str,
        resume_payload: Value,
        delay: Option<std::time::Duration>,
    ) -> Result<bool> {
        let job = Job::new(
            format!("resume-{execution_id}-{}", uuid::Uuid::new_v4()),
            json!({
                "op": "resume_execution",
                "execution_id": execution_id,
                "resume": resume_payload,
            }),
        );
        match delay {
            Some(delay) => self.queue.enqueue_in(QUEUE_EXECUTIONS, delay, job).await,
            None => self.queue.enqueue(QUEUE_EXECUTIONS, job).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipelit_core::{Node, NodeConfig};

    fn trigger_node(id: &str, component_type: &str, extra: Value) -> Node {
        let mut config = NodeConfig::default();
        if let Value::Object(map) = extra {
            config.extra = map;
        }
        Node {
            id: id.to_string(),
            component_type: component_type.to_string(),
            config,
            position: None,
        }
    }

    fn workflow(slug: &str, nodes: Vec<Node>) -> WorkflowSnapshot {
        WorkflowSnapshot {
            id: format!("wf-{slug}"),
            slug: slug.to_string(),
            name: slug.to_string(),
            nodes,
            edges: vec![],
        }
    }

    #[test]
    fn test_telegram_match_rules() {
        let workflows = vec![workflow(
            "tg",
            vec![trigger_node(
                "t1",
                "trigger_telegram",
                json!({"allowed_user_ids": [7], "command": "/run"}),
            )],
        )];

        let matching = TriggerEvent::TelegramMessage {
            user_id: 7,
            chat_id: 1,
            message_id: 1,
            text: "/run now".to_string(),
            bot_token_ref: None,
        };
        let (wf, node_id) = TriggerResolver::resolve(&matching, &workflows).unwrap();
        assert_eq!(wf.slug, "tg");
        assert_eq!(node_id, "t1");

        let wrong_user = TriggerEvent::TelegramMessage {
            user_id: 8,
            chat_id: 1,
            message_id: 1,
            text: "/run now".to_string(),
            bot_token_ref: None,
        };
        assert!(TriggerResolver::resolve(&wrong_user, &workflows).is_none());

        let wrong_command = TriggerEvent::TelegramMessage {
            user_id: 7,
            chat_id: 1,
            message_id: 1,
            text: "hello".to_string(),
            bot_token_ref: None,
        };
        assert!(TriggerResolver::resolve(&wrong_command, &workflows).is_none());
    }

    #[test]
    fn test_schedule_requires_job_pin() {
        let workflows = vec![workflow(
            "cron",
            vec![
                trigger_node("s1", "trigger_schedule", json!({"scheduled_job_id": 5})),
                trigger_node("s2", "trigger_schedule", json!({"scheduled_job_id": 9})),
            ],
        )];

        let event = TriggerEvent::Schedule {
            scheduled_job_id: 9,
            payload: json!({}),
        };
        let (_, node_id) = TriggerResolver::resolve(&event, &workflows).unwrap();
        assert_eq!(node_id, "s2");

        let unpinned = TriggerEvent::Schedule {
            scheduled_job_id: 404,
            payload: json!({}),
        };
        assert!(TriggerResolver::resolve(&unpinned, &workflows).is_none());
    }

    #[test]
    fn test_chat_is_not_resolved() {
        let workflows = vec![workflow(
            "chatty",
            vec![trigger_node("c1", "trigger_chat", json!({}))],
        )];
        let event = TriggerEvent::Chat {
            workflow_slug: "chatty".to_string(),
            text: "hi".to_string(),
            trigger_node_id: None,
            correlation_id: None,
        };
        assert!(TriggerResolver::resolve(&event, &workflows).is_none());
    }

    #[test]
    fn test_first_workflow_wins() {
        let workflows = vec![
            workflow("one", vec![trigger_node("m1", "trigger_manual", json!({}))]),
            workflow("two", vec![trigger_node("m2", "trigger_manual", json!({}))]),
        ];
        let event = TriggerEvent::Manual {
            text: Some("go".to_string()),
            trigger_node_id: None,
        };
        let (wf, _) = TriggerResolver::resolve(&event, &workflows).unwrap();
        assert_eq!(wf.slug, "one");
    }

    #[test]
    fn test_event_payloads() {
        let event = TriggerEvent::Chat {
            workflow_slug: "s".to_string(),
            text: "question".to_string(),
            trigger_node_id: None,
            correlation_id: Some("corr".to_string()),
        };
        assert_eq!(event.payload()["text"], "question");
        assert_eq!(event.kind(), "chat");
        assert_eq!(event.component_type(), "trigger_chat");
    }
}
