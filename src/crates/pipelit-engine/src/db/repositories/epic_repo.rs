//! Epic repository

use crate::db::connection::{now_rfc3339, DatabasePool};
use crate::db::models::{EpicRow, EpicStatus};
use uuid::Uuid;

/// Repository for epic cost containers
pub struct EpicRepository;

impl EpicRepository {
    /// Create an active epic with optional budgets
    pub async fn create(
        pool: &DatabasePool,
        title: &str,
        budget_tokens: Option<i64>,
        budget_usd: Option<f64>,
    ) -> Result<EpicRow, sqlx::Error> {
        let now = now_rfc3339();
        sqlx::query_as::<_, EpicRow>(
            "INSERT INTO epics (id, title, status, budget_tokens, budget_usd, created_at, updated_at)
             VALUES (?, ?, 'active', ?, ?, ?, ?)
             RETURNING *",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(title)
        .bind(budget_tokens)
        .bind(budget_usd)
        .bind(&now)
        .bind(&now)
        .fetch_one(pool)
        .await
    }

    pub async fn get(pool: &DatabasePool, id: &str) -> Result<Option<EpicRow>, sqlx::Error> {
        sqlx::query_as::<_, EpicRow>("SELECT * FROM epics WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Accumulate spend on the epic's counters
    pub async fn charge(
        pool: &DatabasePool,
        id: &str,
        tokens: i64,
        usd: f64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE epics
             SET spent_tokens = spent_tokens + ?, spent_usd = spent_usd + ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(tokens)
        .bind(usd)
        .bind(now_rfc3339())
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn set_status(
        pool: &DatabasePool,
        id: &str,
        status: EpicStatus,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE epics SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now_rfc3339())
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }
}
