//! In-process status event fan-out
//!
//! The [`EventBus`] is a pub/sub keyed by channel name. The executor
//! publishes to `workflow:{slug}` and `execution:{id}`; the transport layer
//! subscribes and forwards over its own wire. Publishing is non-blocking and
//! never applies back-pressure to execution: a slow subscriber simply lags
//! and loses events. Status events are hints, not state of record.

use crate::state::TokenUsage;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Terminal and transient node statuses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Waiting,
    Success,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Running => "running",
            NodeStatus::Waiting => "waiting",
            NodeStatus::Success => "success",
            NodeStatus::Failed => "failed",
            NodeStatus::Skipped => "skipped",
        }
    }

    /// Terminal statuses appear in node logs exactly once per node
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Success | NodeStatus::Failed | NodeStatus::Skipped
        )
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an execution suspended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptReason {
    HumanConfirmation,
    Subworkflow,
    Delay,
}

impl InterruptReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterruptReason::HumanConfirmation => "human_confirmation",
            InterruptReason::Subworkflow => "subworkflow",
            InterruptReason::Delay => "delay",
        }
    }
}

/// Status events published during an execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusEvent {
    NodeStatus {
        execution_id: String,
        node_id: String,
        status: NodeStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token_usage: Option<TokenUsage>,
    },
    ExecutionCompleted {
        execution_id: String,
        status: String,
        duration_ms: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        final_output: Option<Value>,
    },
    ExecutionFailed {
        execution_id: String,
        error: String,
        error_code: String,
    },
    ExecutionInterrupted {
        execution_id: String,
        reason: InterruptReason,
    },
    ExecutionCancelled {
        execution_id: String,
    },
}

/// Channel name for a workflow's event stream
pub fn workflow_channel(slug: &str) -> String {
    format!("workflow:{slug}")
}

/// Channel name for one execution's event stream
pub fn execution_channel(execution_id: &str) -> String {
    format!("execution:{execution_id}")
}

/// In-process pub/sub keyed by channel name
pub struct EventBus {
    channels: DashMap<String, broadcast::Sender<StatusEvent>>,
    capacity: usize,
}

impl EventBus {
    /// Create a bus; `capacity` bounds each channel's lag buffer
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity,
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<StatusEvent> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Publish to one channel; a send with no subscribers is not an error
    pub fn publish(&self, channel: &str, event: StatusEvent) {
        if let Some(sender) = self.channels.get(channel) {
            let _ = sender.send(event);
        }
    }

    /// Publish an execution event to both of its channels
    pub fn emit(&self, workflow_slug: &str, execution_id: &str, event: StatusEvent) {
        self.publish(&workflow_channel(workflow_slug), event.clone());
        self.publish(&execution_channel(execution_id), event);
    }

    /// Subscribe to a channel, creating it on first use
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<StatusEvent> {
        self.sender(channel).subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
