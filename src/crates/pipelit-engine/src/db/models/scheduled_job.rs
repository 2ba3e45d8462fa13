//! Scheduled job row model

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle status of a scheduled job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledJobStatus {
    Active,
    Paused,
    Done,
    Dead,
}

impl ScheduledJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduledJobStatus::Active => "active",
            ScheduledJobStatus::Paused => "paused",
            ScheduledJobStatus::Done => "done",
            ScheduledJobStatus::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ScheduledJobStatus::Active),
            "paused" => Some(ScheduledJobStatus::Paused),
            "done" => Some(ScheduledJobStatus::Done),
            "dead" => Some(ScheduledJobStatus::Dead),
            _ => None,
        }
    }
}

impl std::fmt::Display for ScheduledJobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable description of a recurring trigger firing
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ScheduledJobRow {
    pub id: i64,
    pub workflow_id: String,
    pub trigger_node_id: String,
    pub interval_seconds: i64,
    /// Zero means repeat forever
    pub repeat_count: i64,
    pub repeat_done: i64,
    pub retry_max: i64,
    pub retry_done: i64,
    pub status: String,
    /// Await the triggered execution before rescheduling, vs. fire-and-forget
    pub await_completion: i64,
    pub last_run_at: Option<String>,
    pub next_run_at: Option<String>,
    pub last_error: Option<String>,
    pub payload: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl ScheduledJobRow {
    pub fn status(&self) -> Option<ScheduledJobStatus> {
        ScheduledJobStatus::parse(&self.status)
    }

    pub fn awaits_completion(&self) -> bool {
        self.await_completion != 0
    }

    pub fn payload_value(&self) -> serde_json::Value {
        self.payload
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            ScheduledJobStatus::Active,
            ScheduledJobStatus::Paused,
            ScheduledJobStatus::Done,
            ScheduledJobStatus::Dead,
        ] {
            assert_eq!(ScheduledJobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ScheduledJobStatus::parse("zombie"), None);
    }
}
