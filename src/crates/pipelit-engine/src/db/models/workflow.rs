//! Workflow row model

use pipelit_core::WorkflowSnapshot;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::FromRow;

/// A stored workflow; `definition` is the JSON `{nodes, edges}` bundle
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowRow {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub definition: String,
    /// draft | active | archived
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

impl WorkflowRow {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }

    /// Parse the stored definition into an immutable snapshot
    pub fn snapshot(&self) -> Result<WorkflowSnapshot, serde_json::Error> {
        let definition: serde_json::Value = serde_json::from_str(&self.definition)?;
        serde_json::from_value(json!({
            "id": self.id,
            "slug": self.slug,
            "name": self.name,
            "nodes": definition.get("nodes").cloned().unwrap_or(json!([])),
            "edges": definition.get("edges").cloned().unwrap_or(json!([])),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_parses_definition() {
        let row = WorkflowRow {
            id: "wf-1".to_string(),
            slug: "demo".to_string(),
            name: "Demo".to_string(),
            definition: r#"{
                "nodes": [{"id": "t", "component_type": "trigger_chat"}],
                "edges": []
            }"#
            .to_string(),
            status: "active".to_string(),
            created_at: String::new(),
            updated_at: String::new(),
        };
        let snapshot = row.snapshot().unwrap();
        assert_eq!(snapshot.slug, "demo");
        assert_eq!(snapshot.nodes.len(), 1);
        assert_eq!(snapshot.nodes[0].component_type, "trigger_chat");
    }
}
