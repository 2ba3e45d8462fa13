//! Cost accounting and budget gates
//!
//! Every node that emits token usage increments counters on its execution
//! and, when the execution declares an owning epic, on that epic. The
//! [`BudgetGate`] implementation aborts an execution before the next node
//! runs once its epic is over budget; the epic itself transitions to
//! `failed` when that happens.

use crate::db::repositories::{EpicRepository, ExecutionRepository};
use crate::db::models::EpicStatus;
use crate::db::DatabasePool;
use async_trait::async_trait;
use pipelit_core::{BudgetGate, CoreError, TokenUsage};
use tracing::{debug, warn};

/// Budget-aware usage fan-in over the executions and epics tables
pub struct CostAccountant {
    pool: DatabasePool,
}

impl CostAccountant {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Mark the owning epic failed after a budget abort
    pub async fn fail_epic(&self, epic_id: &str) -> crate::Result<()> {
        EpicRepository::set_status(&self.pool, epic_id, EpicStatus::Failed).await?;
        Ok(())
    }

    async fn owning_epic(&self, execution_id: &str) -> Result<Option<String>, sqlx::Error> {
        Ok(ExecutionRepository::get(&self.pool, execution_id)
            .await?
            .and_then(|row| row.epic_id))
    }
}

#[async_trait]
impl BudgetGate for CostAccountant {
    async fn check(&self, execution_id: &str) -> pipelit_core::Result<()> {
        let epic_id = self
            .owning_epic(execution_id)
            .await
            .map_err(|err| CoreError::Execution(err.to_string()))?;
        let Some(epic_id) = epic_id else {
            return Ok(());
        };
        let epic = EpicRepository::get(&self.pool, &epic_id)
            .await
            .map_err(|err| CoreError::Execution(err.to_string()))?;
        match epic {
            Some(epic) if epic.over_budget() => {
                warn!(epic_id = %epic.id, "epic over budget, aborting execution");
                Err(CoreError::BudgetExceeded { epic_id: epic.id })
            }
            _ => Ok(()),
        }
    }

    async fn charge(
        &self,
        execution_id: &str,
        node_id: &str,
        usage: &TokenUsage,
    ) -> pipelit_core::Result<()> {
        let tokens = usage.total() as i64;
        ExecutionRepository::add_usage(&self.pool, execution_id, tokens, usage.cost_usd)
            .await
            .map_err(|err| CoreError::Execution(err.to_string()))?;

        if let Some(epic_id) = self
            .owning_epic(execution_id)
            .await
            .map_err(|err| CoreError::Execution(err.to_string()))?
        {
            EpicRepository::charge(&self.pool, &epic_id, tokens, usage.cost_usd)
                .await
                .map_err(|err| CoreError::Execution(err.to_string()))?;
        }
        debug!(execution_id, node_id, tokens, "usage charged");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repositories::execution_repo::NewExecution;
    use crate::db::DatabaseConnection;
    use serde_json::json;

    #[tokio::test]
    async fn test_charge_reaches_execution_and_epic() {
        let conn = DatabaseConnection::new("sqlite::memory:").await.unwrap();
        let pool = conn.pool().clone();

        let epic = EpicRepository::create(&pool, "E", Some(100), None).await.unwrap();
        let row = ExecutionRepository::create(
            &pool,
            NewExecution {
                workflow_id: "wf".to_string(),
                trigger_node_id: "t".to_string(),
                trigger_payload: json!({}),
                epic_id: Some(epic.id.clone()),
                ..NewExecution::default()
            },
        )
        .await
        .unwrap();

        let accountant = CostAccountant::new(pool.clone());
        accountant.check(&row.id).await.unwrap();

        accountant
            .charge(
                &row.id,
                "n1",
                &TokenUsage {
                    input_tokens: 80,
                    output_tokens: 30,
                    cost_usd: 0.0042,
                },
            )
            .await
            .unwrap();

        let execution = ExecutionRepository::get(&pool, &row.id).await.unwrap().unwrap();
        assert_eq!(execution.spent_tokens, 110);
        let epic = EpicRepository::get(&pool, &epic.id).await.unwrap().unwrap();
        assert_eq!(epic.spent_tokens, 110);
        assert!((epic.spent_usd - 0.0042).abs() < 1e-9);

        // Over budget now: the gate rejects.
        let denied = accountant.check(&row.id).await;
        assert!(matches!(denied, Err(CoreError::BudgetExceeded { .. })));
    }

    #[tokio::test]
    async fn test_no_epic_passes_gate() {
        let conn = DatabaseConnection::new("sqlite::memory:").await.unwrap();
        let pool = conn.pool().clone();
        let row = ExecutionRepository::create(
            &pool,
            NewExecution {
                workflow_id: "wf".to_string(),
                trigger_node_id: "t".to_string(),
                trigger_payload: json!({}),
                ..NewExecution::default()
            },
        )
        .await
        .unwrap();

        let accountant = CostAccountant::new(pool);
        accountant.check(&row.id).await.unwrap();
    }
}
