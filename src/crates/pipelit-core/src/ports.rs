//! Declarative component-type catalog
//!
//! The [`PortRegistry`] is the single source of truth for what a component
//! type can do: its input/output ports, its capability flags, whether it
//! fires executions, emits routes, or interrupts. The executor never
//! hardcodes component types; all per-type variation flows through the
//! registry's [`ComponentDef`] and the [`Runnable`](crate::runnable::Runnable)
//! its builder produces.
//!
//! Registries are built once at startup and frozen behind an `Arc`.

use crate::error::{CoreError, Result};
use crate::graph::Node;
use crate::runnable::{ResolvedCapabilities, Runnable};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Port data types; `Any` is assignable to and from everything else
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    Messages,
    Any,
}

impl DataType {
    /// Edge compatibility: exact match unless either side is `Any`
    pub fn accepts(&self, other: &DataType) -> bool {
        matches!(self, DataType::Any) || matches!(other, DataType::Any) || self == other
    }
}

/// A declared input or output port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortSpec {
    pub name: String,
    pub data_type: DataType,
    pub required: bool,
}

impl PortSpec {
    /// A port that must be connected for the node to compile
    pub fn required(name: &str, data_type: DataType) -> Self {
        Self {
            name: name.to_string(),
            data_type,
            required: true,
        }
    }

    /// A port that may be left unconnected
    pub fn optional(name: &str, data_type: DataType) -> Self {
        Self {
            name: name.to_string(),
            data_type,
            required: false,
        }
    }
}

/// Capability flags for a component type
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ComponentFlags {
    /// The node needs an `llm` sub-component edge to compile
    pub requires_model: bool,
    /// The node accepts `tool` sub-component edges
    pub accepts_tools: bool,
    /// The node accepts a `memory` sub-component edge
    pub accepts_memory: bool,
    /// The node accepts an `output_parser` sub-component edge
    pub accepts_output_parser: bool,
    /// The node executes; sub-component types set this to false
    pub executable: bool,
}

/// Builder producing a runnable for a node with its resolved capabilities
pub type BuilderFn =
    Arc<dyn Fn(&Node, &ResolvedCapabilities) -> Result<Arc<dyn Runnable>> + Send + Sync>;

/// Everything the registry knows about one component type
#[derive(Clone)]
pub struct ComponentDef {
    /// The `component_type` string nodes carry
    pub type_name: String,

    /// Human-readable name for the editor
    pub display_name: String,

    pub inputs: Vec<PortSpec>,
    pub outputs: Vec<PortSpec>,
    pub flags: ComponentFlags,

    /// Nodes of this type fire executions
    pub is_trigger: bool,

    /// Nodes of this type write `route` and may have conditional out-edges
    pub emits_route: bool,

    /// Nodes of this type suspend on first visit (human confirm, sub-workflow)
    pub interrupting: bool,

    /// Nodes of this type own a `loop_body` subgraph driven by the executor
    pub is_loop: bool,

    /// Optional per-type runnable timeout in milliseconds
    pub timeout_ms: Option<u64>,

    builder: Option<BuilderFn>,
}

impl ComponentDef {
    /// Start a definition; executable by default
    pub fn new(type_name: &str, display_name: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
            display_name: display_name.to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            flags: ComponentFlags {
                executable: true,
                ..ComponentFlags::default()
            },
            is_trigger: false,
            emits_route: false,
            interrupting: false,
            is_loop: false,
            timeout_ms: None,
            builder: None,
        }
    }

    pub fn with_input(mut self, port: PortSpec) -> Self {
        self.inputs.push(port);
        self
    }

    pub fn with_output(mut self, port: PortSpec) -> Self {
        self.outputs.push(port);
        self
    }

    pub fn with_flags(mut self, flags: ComponentFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn trigger(mut self) -> Self {
        self.is_trigger = true;
        self
    }

    pub fn route_emitter(mut self) -> Self {
        self.emits_route = true;
        self
    }

    pub fn interrupting(mut self) -> Self {
        self.interrupting = true;
        self
    }

    pub fn looping(mut self) -> Self {
        self.is_loop = true;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_builder(
        mut self,
        builder: impl Fn(&Node, &ResolvedCapabilities) -> Result<Arc<dyn Runnable>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.builder = Some(Arc::new(builder));
        self
    }

    /// Declared input port by name
    pub fn input(&self, name: &str) -> Option<&PortSpec> {
        self.inputs.iter().find(|p| p.name == name)
    }

    /// Declared output port by name
    pub fn output(&self, name: &str) -> Option<&PortSpec> {
        self.outputs.iter().find(|p| p.name == name)
    }

    /// Build the runnable for a node of this type
    pub fn build(&self, node: &Node, caps: &ResolvedCapabilities) -> Result<Arc<dyn Runnable>> {
        match &self.builder {
            Some(builder) => builder(node, caps),
            None => Err(CoreError::Registry(format!(
                "component type '{}' has no builder",
                self.type_name
            ))),
        }
    }
}

impl std::fmt::Debug for ComponentDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentDef")
            .field("type_name", &self.type_name)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .field("is_trigger", &self.is_trigger)
            .field("emits_route", &self.emits_route)
            .field("builder", &self.builder.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// Catalog of component definitions, frozen after startup
#[derive(Debug, Default)]
pub struct PortRegistry {
    defs: HashMap<String, ComponentDef>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self {
            defs: HashMap::new(),
        }
    }

    /// Register a definition; duplicate type names are rejected
    pub fn register(&mut self, def: ComponentDef) -> Result<()> {
        if self.defs.contains_key(&def.type_name) {
            return Err(CoreError::Registry(format!(
                "component type '{}' registered twice",
                def.type_name
            )));
        }
        self.defs.insert(def.type_name.clone(), def);
        Ok(())
    }

    pub fn get(&self, type_name: &str) -> Option<&ComponentDef> {
        self.defs.get(type_name)
    }

    /// Like [`get`](Self::get), but unknown types are an error
    pub fn expect(&self, type_name: &str) -> Result<&ComponentDef> {
        self.defs.get(type_name).ok_or_else(|| {
            CoreError::Registry(format!("unknown component type '{type_name}'"))
        })
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.defs.contains_key(type_name)
    }

    /// All registered type names, sorted
    pub fn type_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.defs.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_any_accepts_everything() {
        assert!(DataType::Any.accepts(&DataType::Number));
        assert!(DataType::Number.accepts(&DataType::Any));
        assert!(DataType::String.accepts(&DataType::String));
        assert!(!DataType::String.accepts(&DataType::Number));
        assert!(!DataType::Messages.accepts(&DataType::Array));
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut registry = PortRegistry::new();
        registry
            .register(ComponentDef::new("code", "Code"))
            .unwrap();
        let err = registry.register(ComponentDef::new("code", "Code again"));
        assert!(err.is_err());
    }

    #[test]
    fn test_expect_unknown_type() {
        let registry = PortRegistry::new();
        assert!(registry.expect("nope").is_err());
    }

    #[test]
    fn test_port_lookup() {
        let def = ComponentDef::new("code", "Code")
            .with_input(PortSpec::required("input", DataType::String))
            .with_output(PortSpec::optional("result", DataType::Any));
        assert!(def.input("input").unwrap().required);
        assert_eq!(def.output("result").unwrap().data_type, DataType::Any);
        assert!(def.input("missing").is_none());
    }
}
