//! Workflow repository

use crate::db::connection::{now_rfc3339, DatabasePool};
use crate::db::models::WorkflowRow;
use pipelit_core::WorkflowSnapshot;
use serde_json::json;

/// Repository for stored workflows
pub struct WorkflowRepository;

impl WorkflowRepository {
    /// Store a workflow from its snapshot form
    pub async fn create(
        pool: &DatabasePool,
        snapshot: &WorkflowSnapshot,
        status: &str,
    ) -> Result<WorkflowRow, sqlx::Error> {
        let now = now_rfc3339();
        let definition = json!({
            "nodes": snapshot.nodes,
            "edges": snapshot.edges,
        })
        .to_string();
        sqlx::query_as::<_, WorkflowRow>(
            "INSERT INTO workflows (id, slug, name, definition, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING *",
        )
        .bind(&snapshot.id)
        .bind(&snapshot.slug)
        .bind(&snapshot.name)
        .bind(&definition)
        .bind(status)
        .bind(&now)
        .bind(&now)
        .fetch_one(pool)
        .await
    }

    pub async fn get_by_id(pool: &DatabasePool, id: &str) -> Result<Option<WorkflowRow>, sqlx::Error> {
        sqlx::query_as::<_, WorkflowRow>("SELECT * FROM workflows WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn get_by_slug(
        pool: &DatabasePool,
        slug: &str,
    ) -> Result<Option<WorkflowRow>, sqlx::Error> {
        sqlx::query_as::<_, WorkflowRow>("SELECT * FROM workflows WHERE slug = ?")
            .bind(slug)
            .fetch_optional(pool)
            .await
    }

    /// Active workflows in creation order; the resolver walks these
    pub async fn list_active(pool: &DatabasePool) -> Result<Vec<WorkflowRow>, sqlx::Error> {
        sqlx::query_as::<_, WorkflowRow>(
            "SELECT * FROM workflows WHERE status = 'active' ORDER BY created_at, id",
        )
        .fetch_all(pool)
        .await
    }

    pub async fn update_status(
        pool: &DatabasePool,
        id: &str,
        status: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE workflows SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(now_rfc3339())
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipelit_core::{Node, NodeConfig};

    fn snapshot() -> WorkflowSnapshot {
        WorkflowSnapshot {
            id: "wf-1".to_string(),
            slug: "demo".to_string(),
            name: "Demo".to_string(),
            nodes: vec![Node {
                id: "t".to_string(),
                component_type: "trigger_chat".to_string(),
                config: NodeConfig::default(),
                position: None,
            }],
            edges: vec![],
        }
    }

    #[tokio::test]
    async fn test_round_trip_through_definition() {
        let conn = crate::db::DatabaseConnection::new("sqlite::memory:").await.unwrap();
        let pool = conn.pool();

        WorkflowRepository::create(pool, &snapshot(), "active").await.unwrap();
        let row = WorkflowRepository::get_by_slug(pool, "demo").await.unwrap().unwrap();
        assert!(row.is_active());

        let parsed = row.snapshot().unwrap();
        assert_eq!(parsed.id, "wf-1");
        assert_eq!(parsed.nodes[0].component_type, "trigger_chat");

        let active = WorkflowRepository::list_active(pool).await.unwrap();
        assert_eq!(active.len(), 1);
    }
}
