//! Node log row model

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Append-only record of one node status transition within an execution
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct NodeLogRow {
    pub id: i64,
    pub execution_id: String,
    pub node_id: String,
    pub status: String,
    pub output: Option<String>,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub duration_ms: i64,
    pub timestamp: String,
    pub token_input: Option<i64>,
    pub token_output: Option<i64>,
    pub token_cost_usd: Option<f64>,
}

impl NodeLogRow {
    pub fn output_value(&self) -> Option<serde_json::Value> {
        self.output.as_deref().and_then(|s| serde_json::from_str(s).ok())
    }

    /// Total tokens recorded on this entry
    pub fn token_total(&self) -> i64 {
        self.token_input.unwrap_or(0) + self.token_output.unwrap_or(0)
    }
}
