//! Epic (cost container) row model

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle status of an epic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpicStatus {
    Active,
    Completed,
    Failed,
}

impl EpicStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EpicStatus::Active => "active",
            EpicStatus::Completed => "completed",
            EpicStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(EpicStatus::Active),
            "completed" => Some(EpicStatus::Completed),
            "failed" => Some(EpicStatus::Failed),
            _ => None,
        }
    }
}

/// Budget and status container owning many executions
///
/// Money columns carry USD with at least 6-decimal precision.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EpicRow {
    pub id: String,
    pub title: String,
    pub status: String,
    pub budget_tokens: Option<i64>,
    pub budget_usd: Option<f64>,
    pub spent_tokens: i64,
    pub spent_usd: f64,
    pub created_at: String,
    pub updated_at: String,
}

impl EpicRow {
    pub fn status(&self) -> Option<EpicStatus> {
        EpicStatus::parse(&self.status)
    }

    /// True when either budget dimension is exhausted
    pub fn over_budget(&self) -> bool {
        let tokens_over = self
            .budget_tokens
            .map(|budget| self.spent_tokens >= budget)
            .unwrap_or(false);
        let usd_over = self
            .budget_usd
            .map(|budget| self.spent_usd >= budget)
            .unwrap_or(false);
        tokens_over || usd_over
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epic(budget_tokens: Option<i64>, spent_tokens: i64) -> EpicRow {
        EpicRow {
            id: "e".to_string(),
            title: "t".to_string(),
            status: "active".to_string(),
            budget_tokens,
            budget_usd: None,
            spent_tokens,
            spent_usd: 0.0,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn test_over_budget() {
        assert!(!epic(None, 1_000_000).over_budget());
        assert!(!epic(Some(100), 99).over_budget());
        assert!(epic(Some(100), 100).over_budget());
    }
}
