//! Database connection management
//!
//! SQLite via sqlx. The schema is created on connect; all timestamps are
//! stored as UTC RFC3339 text, money as REAL with microdollar precision.

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

/// Type alias for the database connection pool
pub type DatabasePool = SqlitePool;

/// Database connection wrapper owning the pool
#[derive(Clone)]
pub struct DatabaseConnection {
    pool: DatabasePool,
}

impl DatabaseConnection {
    /// Connect and create the schema if it does not exist
    ///
    /// In-memory databases are pinned to a single pooled connection: each
    /// SQLite `:memory:` connection is its own database, so a wider pool
    /// would hand out empty databases.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        let conn = Self { pool };
        conn.init_schema().await?;
        Ok(conn)
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }

    async fn init_schema(&self) -> Result<(), sqlx::Error> {
        let statements = [
            r#"CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                slug TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                definition TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                trigger_node_id TEXT NOT NULL,
                status TEXT NOT NULL,
                trigger_payload TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                error TEXT,
                error_code TEXT,
                final_output TEXT,
                parent_execution_id TEXT,
                parent_node_id TEXT,
                epic_id TEXT,
                depth INTEGER NOT NULL DEFAULT 0,
                correlation_id TEXT,
                spent_tokens INTEGER NOT NULL DEFAULT 0,
                spent_usd REAL NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS node_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                execution_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                status TEXT NOT NULL,
                output TEXT,
                error TEXT,
                error_code TEXT,
                duration_ms INTEGER NOT NULL DEFAULT 0,
                timestamp TEXT NOT NULL,
                token_input INTEGER,
                token_output INTEGER,
                token_cost_usd REAL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS scheduled_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                workflow_id TEXT NOT NULL,
                trigger_node_id TEXT NOT NULL,
                interval_seconds INTEGER NOT NULL,
                repeat_count INTEGER NOT NULL DEFAULT 0,
                repeat_done INTEGER NOT NULL DEFAULT 0,
                retry_max INTEGER NOT NULL DEFAULT 0,
                retry_done INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                await_completion INTEGER NOT NULL DEFAULT 1,
                last_run_at TEXT,
                next_run_at TEXT,
                last_error TEXT,
                payload TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS epics (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                status TEXT NOT NULL,
                budget_tokens INTEGER,
                budget_usd REAL,
                spent_tokens INTEGER NOT NULL DEFAULT 0,
                spent_usd REAL NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS checkpoints (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                thread_id TEXT NOT NULL,
                checkpoint_id TEXT NOT NULL UNIQUE,
                parent_checkpoint_id TEXT,
                step INTEGER NOT NULL,
                source TEXT NOT NULL,
                blob TEXT NOT NULL,
                created_at TEXT NOT NULL
            )"#,
            "CREATE INDEX IF NOT EXISTS idx_checkpoints_thread ON checkpoints(thread_id, id)",
            "CREATE INDEX IF NOT EXISTS idx_node_logs_execution ON node_logs(execution_id)",
            "CREATE INDEX IF NOT EXISTS idx_executions_workflow ON executions(workflow_id)",
            "CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status)",
        ];
        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

/// Current UTC timestamp in the stored text form
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_schema_initializes() {
        let conn = DatabaseConnection::new("sqlite::memory:").await.unwrap();
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM workflows")
                .fetch_one(conn.pool())
                .await
                .unwrap();
        assert_eq!(count.0, 0);
    }

    #[tokio::test]
    async fn test_schema_init_is_idempotent() {
        let conn = DatabaseConnection::new("sqlite::memory:").await.unwrap();
        conn.init_schema().await.unwrap();
    }
}
