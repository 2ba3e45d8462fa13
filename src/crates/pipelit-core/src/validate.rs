//! Edge validation at graph mutation time
//!
//! A pure check run on every graph mutation, before anything is persisted.
//! It rejects connections the compiler would later choke on: sub-component
//! edges landing on handles the target does not declare, data edges between
//! concretely-typed incompatible ports, conditional edges leaving a node
//! that never emits a route, and `loop_return` edges that do not close their
//! originating loop.

use crate::error::{CoreError, Result};
use crate::graph::{Edge, EdgeClass, SubComponentKind, WorkflowSnapshot};
use crate::ports::{DataType, PortRegistry};
use std::collections::{HashSet, VecDeque};

/// Validate one edge against the workflow it is being added to
pub fn validate_edge(
    workflow: &WorkflowSnapshot,
    edge: &Edge,
    registry: &PortRegistry,
) -> Result<()> {
    let source = workflow.node(&edge.source).ok_or_else(|| {
        CoreError::InvalidEdge(format!("source node '{}' does not exist", edge.source))
    })?;
    let target = workflow.node(&edge.target).ok_or_else(|| {
        CoreError::InvalidEdge(format!("target node '{}' does not exist", edge.target))
    })?;

    let source_def = registry.expect(&source.component_type)?;
    let target_def = registry.expect(&target.component_type)?;

    match edge.class() {
        EdgeClass::SubComponent(kind) => {
            let accepted = match kind {
                SubComponentKind::Llm => target_def.flags.requires_model,
                SubComponentKind::Tool => target_def.flags.accepts_tools,
                SubComponentKind::Memory => target_def.flags.accepts_memory,
                SubComponentKind::OutputParser => target_def.flags.accepts_output_parser,
            };
            if !accepted {
                return Err(CoreError::InvalidEdge(format!(
                    "node '{}' ({}) declares no '{}' handle",
                    edge.target,
                    target.component_type,
                    kind.as_str()
                )));
            }
        }
        EdgeClass::Data => {
            // Undeclared ports are treated as Any: dynamic components may
            // expose ports the registry does not enumerate.
            let out_type = source_def
                .output(&edge.source_port)
                .map(|p| p.data_type)
                .unwrap_or(DataType::Any);
            let in_type = target_def
                .input(&edge.target_port)
                .map(|p| p.data_type)
                .unwrap_or(DataType::Any);
            if !out_type.accepts(&in_type) {
                return Err(CoreError::InvalidEdge(format!(
                    "port type mismatch: {}.{} ({out_type:?}) -> {}.{} ({in_type:?})",
                    edge.source, edge.source_port, edge.target, edge.target_port
                )));
            }
        }
        EdgeClass::Conditional => {
            if !source_def.emits_route {
                return Err(CoreError::InvalidEdge(format!(
                    "node '{}' ({}) is not a route emitter",
                    edge.source, source.component_type
                )));
            }
        }
        EdgeClass::LoopBody => {
            if !source_def.is_loop {
                return Err(CoreError::InvalidEdge(format!(
                    "node '{}' ({}) cannot own a loop body",
                    edge.source, source.component_type
                )));
            }
        }
        EdgeClass::LoopReturn => {
            if !target_def.is_loop {
                return Err(CoreError::InvalidEdge(format!(
                    "loop_return target '{}' is not a loop",
                    edge.target
                )));
            }
            if !loop_body_contains(workflow, &edge.target, &edge.source) {
                return Err(CoreError::InvalidEdge(format!(
                    "loop_return source '{}' is not inside the body of loop '{}'",
                    edge.source, edge.target
                )));
            }
        }
    }
    Ok(())
}

/// Validate every edge in a workflow (used before compilation)
pub fn validate_workflow(workflow: &WorkflowSnapshot, registry: &PortRegistry) -> Result<()> {
    for edge in &workflow.edges {
        validate_edge(workflow, edge, registry)?;
    }
    Ok(())
}

/// Walk a loop's body from its `loop_body` entries along execution edges;
/// true when `node_id` is reachable without passing back through the loop
fn loop_body_contains(workflow: &WorkflowSnapshot, loop_id: &str, node_id: &str) -> bool {
    let mut queue: VecDeque<&str> = workflow
        .edges_from(loop_id)
        .filter(|e| e.class() == EdgeClass::LoopBody)
        .map(|e| e.target.as_str())
        .collect();
    let mut seen: HashSet<&str> = HashSet::new();

    while let Some(current) = queue.pop_front() {
        if current == loop_id || !seen.insert(current) {
            continue;
        }
        if current == node_id {
            return true;
        }
        for edge in workflow.edges_from(current) {
            if matches!(edge.class(), EdgeClass::Data | EdgeClass::Conditional) {
                queue.push_back(edge.target.as_str());
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::register_builtins;
    use crate::graph::{Node, NodeConfig};
    use crate::ports::{ComponentDef, ComponentFlags, PortSpec};
    use crate::runnable::FnRunnable;
    use crate::runnable::NodeOutcome;
    use serde_json::json;

    fn registry() -> PortRegistry {
        let mut registry = PortRegistry::new();
        register_builtins(&mut registry).unwrap();
        registry
            .register(
                ComponentDef::new("agent", "Agent")
                    .with_input(PortSpec::optional("input", DataType::String))
                    .with_output(PortSpec::optional("output", DataType::String))
                    .with_flags(ComponentFlags {
                        requires_model: true,
                        accepts_tools: true,
                        accepts_memory: true,
                        accepts_output_parser: false,
                        executable: true,
                    })
                    .with_builder(|_, _| Ok(FnRunnable::arc(|_| Ok(NodeOutcome::from_raw(json!({})))))),
            )
            .unwrap();
        registry
            .register(
                ComponentDef::new("number_source", "Numbers")
                    .with_output(PortSpec::optional("value", DataType::Number))
                    .with_builder(|_, _| Ok(FnRunnable::arc(|_| Ok(NodeOutcome::from_raw(json!({})))))),
            )
            .unwrap();
        registry
            .register(
                ComponentDef::new("model_openai", "OpenAI Model")
                    .with_flags(ComponentFlags::default())
                    .with_builder(|_, _| Ok(FnRunnable::arc(|_| Ok(NodeOutcome::from_raw(json!({})))))),
            )
            .unwrap();
        registry
    }

    fn node(id: &str, component_type: &str) -> Node {
        Node {
            id: id.to_string(),
            component_type: component_type.to_string(),
            config: NodeConfig::default(),
            position: None,
        }
    }

    fn workflow(nodes: Vec<Node>, edges: Vec<Edge>) -> WorkflowSnapshot {
        WorkflowSnapshot {
            id: "wf".to_string(),
            slug: "wf".to_string(),
            name: String::new(),
            nodes,
            edges,
        }
    }

    #[test]
    fn test_missing_endpoint_rejected() {
        let wf = workflow(vec![node("a", "agent")], vec![]);
        let edge = Edge::data("a", "output", "ghost", "input");
        assert!(validate_edge(&wf, &edge, &registry()).is_err());
    }

    #[test]
    fn test_subcomponent_handle_checked() {
        let wf = workflow(
            vec![node("m", "model_openai"), node("a", "agent")],
            vec![],
        );
        assert!(validate_edge(&wf, &Edge::labeled("m", "a", "llm"), &registry()).is_ok());
        // Agent does not declare an output_parser handle.
        assert!(validate_edge(&wf, &Edge::labeled("m", "a", "output_parser"), &registry()).is_err());
    }

    #[test]
    fn test_concrete_type_mismatch_rejected() {
        let wf = workflow(
            vec![node("n", "number_source"), node("a", "agent")],
            vec![],
        );
        let edge = Edge::data("n", "value", "a", "input");
        let err = validate_edge(&wf, &edge, &registry()).unwrap_err();
        assert!(err.to_string().contains("type mismatch"));
    }

    #[test]
    fn test_undeclared_ports_treated_as_any() {
        let wf = workflow(
            vec![node("n", "number_source"), node("a", "agent")],
            vec![],
        );
        let edge = Edge::data("n", "dynamic_out", "a", "dynamic_in");
        assert!(validate_edge(&wf, &edge, &registry()).is_ok());
    }

    #[test]
    fn test_conditional_requires_route_emitter() {
        let wf = workflow(vec![node("a", "agent"), node("b", "agent")], vec![]);
        let edge = Edge::conditional("a", "b", "yes");
        assert!(validate_edge(&wf, &edge, &registry()).is_err());

        let wf = workflow(vec![node("s", "switch"), node("b", "agent")], vec![]);
        let edge = Edge::conditional("s", "b", "yes");
        assert!(validate_edge(&wf, &edge, &registry()).is_ok());
    }

    #[test]
    fn test_loop_return_must_close_its_loop() {
        let mut wf = workflow(
            vec![node("l", "loop"), node("body", "agent"), node("outside", "agent")],
            vec![Edge::labeled("l", "body", "loop_body")],
        );

        assert!(validate_edge(
            &wf,
            &Edge::labeled("body", "l", "loop_return"),
            &registry()
        )
        .is_ok());

        // A node outside the body cannot close the loop.
        assert!(validate_edge(
            &wf,
            &Edge::labeled("outside", "l", "loop_return"),
            &registry()
        )
        .is_err());

        // Targeting a non-loop is rejected.
        wf.edges.clear();
        assert!(validate_edge(
            &wf,
            &Edge::labeled("body", "outside", "loop_return"),
            &registry()
        )
        .is_err());
    }
}
