//! Execution record model

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle status of an execution record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Interrupted,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Interrupted => "interrupted",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ExecutionStatus::Pending),
            "running" => Some(ExecutionStatus::Running),
            "interrupted" => Some(ExecutionStatus::Interrupted),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            "cancelled" => Some(ExecutionStatus::Cancelled),
            _ => None,
        }
    }

    /// True for statuses that can no longer change
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One run of a workflow from a single firing trigger
///
/// Timestamps are RFC3339 text due to SQLite type limitations; JSON columns
/// (`trigger_payload`, `final_output`) are serialized text.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExecutionRow {
    pub id: String,
    pub workflow_id: String,
    pub trigger_node_id: String,
    pub status: String,
    pub trigger_payload: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub final_output: Option<String>,
    pub parent_execution_id: Option<String>,
    pub parent_node_id: Option<String>,
    pub epic_id: Option<String>,
    /// Sub-workflow nesting depth, bounded by the recursion ceiling
    pub depth: i64,
    pub correlation_id: Option<String>,
    pub spent_tokens: i64,
    pub spent_usd: f64,
    pub created_at: String,
    pub updated_at: String,
}

impl ExecutionRow {
    pub fn status(&self) -> Option<ExecutionStatus> {
        ExecutionStatus::parse(&self.status)
    }

    pub fn trigger_payload_value(&self) -> serde_json::Value {
        serde_json::from_str(&self.trigger_payload).unwrap_or(serde_json::Value::Null)
    }

    pub fn final_output_value(&self) -> Option<serde_json::Value> {
        self.final_output
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
    }
}
