//! Workflow graph data model
//!
//! A workflow is an ordered set of [`Node`]s and [`Edge`]s plus a slug. The
//! editor mutates it; the execution core only ever sees an immutable
//! [`WorkflowSnapshot`] taken at compile time.
//!
//! Edges fall into three semantic classes distinguished by their label:
//!
//! - **Data edges** (empty label) propagate execution and carry values
//!   between ports.
//! - **Sub-component edges** (`llm`, `tool`, `memory`, `output_parser`) bind
//!   a capability to their target node at build time and do not advance
//!   execution.
//! - **Control edges** (`loop_body`, `loop_return`) wire a loop's body
//!   subgraph and bypass port typing. Conditional edges carry a
//!   `condition_value` and are traversed at most once per execution.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Node identifier, unique within a workflow
pub type NodeId = String;

/// Condition value reserved for the fallback branch of a route emitter
pub const FALLBACK_ROUTE: &str = "__other__";

/// Structured per-node configuration bundle
///
/// `extra` is a free-form mapping owned by the node's component type; the
/// executor never inspects its fields, it only renders string values that
/// contain template expressions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Templated system prompt, rendered immediately before the node runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Suspend before this node runs
    #[serde(default)]
    pub interrupt_before: bool,

    /// Suspend after this node succeeds
    #[serde(default)]
    pub interrupt_after: bool,

    /// Reference into the credential store; resolved by the embedder
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_ref: Option<String>,

    /// Component-specific free-form configuration
    #[serde(default)]
    pub extra: Map<String, Value>,
}

/// A node in a workflow graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Identifier, unique within the workflow
    pub id: NodeId,

    /// Component type drawn from the port registry
    pub component_type: String,

    /// Structured configuration bundle
    #[serde(default)]
    pub config: NodeConfig,

    /// Editor-positional metadata, opaque to the core
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Value>,
}

/// Sub-component capability slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubComponentKind {
    Llm,
    Tool,
    Memory,
    OutputParser,
}

impl SubComponentKind {
    /// Parse an edge label into a capability slot
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "llm" => Some(SubComponentKind::Llm),
            "tool" => Some(SubComponentKind::Tool),
            "memory" => Some(SubComponentKind::Memory),
            "output_parser" => Some(SubComponentKind::OutputParser),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubComponentKind::Llm => "llm",
            SubComponentKind::Tool => "tool",
            SubComponentKind::Memory => "memory",
            SubComponentKind::OutputParser => "output_parser",
        }
    }
}

/// Semantic class of an edge, derived from its label and condition value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeClass {
    /// Propagates execution and data between ports
    Data,
    /// Binds a capability at build time; does not advance execution
    SubComponent(SubComponentKind),
    /// Traversed when the source's emitted route equals the condition value
    Conditional,
    /// Enters a loop's body subgraph
    LoopBody,
    /// Re-enters the loop from the body's terminal node
    LoopReturn,
}

/// A directed edge between two nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub source: NodeId,
    #[serde(default)]
    pub source_port: String,
    pub target: NodeId,
    #[serde(default)]
    pub target_port: String,
    /// Empty for data edges; a sub-component kind or loop label otherwise
    #[serde(default)]
    pub label: String,
    /// Present on conditional edges only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_value: Option<String>,
}

impl Edge {
    /// A plain data edge between two ports
    pub fn data(source: &str, source_port: &str, target: &str, target_port: &str) -> Self {
        Self {
            source: source.to_string(),
            source_port: source_port.to_string(),
            target: target.to_string(),
            target_port: target_port.to_string(),
            label: String::new(),
            condition_value: None,
        }
    }

    /// A conditional edge traversed when the source emits `condition_value`
    pub fn conditional(source: &str, target: &str, condition_value: &str) -> Self {
        Self {
            source: source.to_string(),
            source_port: String::new(),
            target: target.to_string(),
            target_port: String::new(),
            label: String::new(),
            condition_value: Some(condition_value.to_string()),
        }
    }

    /// A control edge with an explicit label (`loop_body`, `loop_return`, or
    /// a sub-component kind)
    pub fn labeled(source: &str, target: &str, label: &str) -> Self {
        Self {
            source: source.to_string(),
            source_port: String::new(),
            target: target.to_string(),
            target_port: String::new(),
            label: label.to_string(),
            condition_value: None,
        }
    }

    /// Classify this edge by its label and condition value
    pub fn class(&self) -> EdgeClass {
        if self.label == "loop_body" {
            return EdgeClass::LoopBody;
        }
        if self.label == "loop_return" {
            return EdgeClass::LoopReturn;
        }
        if let Some(kind) = SubComponentKind::from_label(&self.label) {
            return EdgeClass::SubComponent(kind);
        }
        if self.condition_value.is_some() {
            return EdgeClass::Conditional;
        }
        EdgeClass::Data
    }

    /// True when this edge participates in execution flow
    pub fn advances_execution(&self) -> bool {
        !matches!(self.class(), EdgeClass::SubComponent(_))
    }
}

/// Immutable snapshot of a workflow at compile time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    /// Workflow identifier (UUID string)
    pub id: String,

    /// URL-safe identifier used for event channels and chat dispatch
    pub slug: String,

    /// Display name
    #[serde(default)]
    pub name: String,

    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl WorkflowSnapshot {
    /// Look up a node by id
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// All edges leaving `id`
    pub fn edges_from<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> {
        self.edges.iter().filter(move |e| e.source == id)
    }

    /// All edges entering `id`
    pub fn edges_to<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> {
        self.edges.iter().filter(move |e| e.target == id)
    }
}
