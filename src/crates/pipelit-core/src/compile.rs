//! Trigger-scoped graph compilation
//!
//! Given an immutable workflow snapshot and the fired trigger node, the
//! compiler produces the executable [`Plan`]: the reachable set, topological
//! waves over data edges (conditional branches kept as alternatives - the
//! executor picks the branch at runtime), per-node build records with
//! resolved capabilities, the route map for every route emitter, and a
//! frame for every loop. Compilation is deterministic for a given snapshot.
//!
//! Cycles are forbidden except through loop constructs: `loop_body` and
//! `loop_return` edges are excluded from the cycle check, so a well-formed
//! loop compiles to a frame re-entered by the executor rather than a true
//! cycle.

use crate::error::{CoreError, ErrorCode, Result};
use crate::graph::{Edge, EdgeClass, NodeId, SubComponentKind, WorkflowSnapshot, FALLBACK_ROUTE};
use crate::ports::PortRegistry;
use crate::runnable::{CapabilityRef, ResolvedCapabilities, Runnable};
use crate::validate::validate_workflow;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Per-node build record inside a [`Plan`]
#[derive(Clone)]
pub struct NodeBuild {
    pub node_id: NodeId,
    pub component_type: String,

    /// Template source, expanded immediately before the node runs
    pub system_prompt: Option<String>,

    /// Component-specific config; string values may carry templates
    pub extra: Map<String, Value>,

    pub runnable: Arc<dyn Runnable>,
    pub capabilities: ResolvedCapabilities,

    pub interrupt_before: bool,
    pub interrupt_after: bool,

    /// Set when the node can suspend the execution (explicit interrupts or
    /// an interrupting component type)
    pub can_suspend: bool,

    pub emits_route: bool,
    pub is_loop: bool,
    pub timeout_ms: Option<u64>,
}

impl std::fmt::Debug for NodeBuild {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeBuild")
            .field("node_id", &self.node_id)
            .field("component_type", &self.component_type)
            .field("can_suspend", &self.can_suspend)
            .field("emits_route", &self.emits_route)
            .field("is_loop", &self.is_loop)
            .finish()
    }
}

/// Conditional-edge targets of one route emitter
#[derive(Debug, Clone, Default)]
pub struct RouteMap {
    /// `condition_value -> targets`
    pub branches: HashMap<String, Vec<NodeId>>,
    /// Targets of the `__other__` fallback edge; empty when none exists
    pub fallback: Vec<NodeId>,
}

impl RouteMap {
    /// Targets selected by an emitted route, applying the fallback rule
    pub fn select(&self, route: &str) -> &[NodeId] {
        match self.branches.get(route) {
            Some(targets) => targets,
            None => &self.fallback,
        }
    }

    /// Every target across all branches and the fallback
    pub fn all_targets(&self) -> impl Iterator<Item = &NodeId> {
        self.branches
            .values()
            .flatten()
            .chain(self.fallback.iter())
    }
}

/// Compiled frame for one loop node
#[derive(Debug, Clone, Default)]
pub struct LoopFrame {
    /// Targets of the loop's `loop_body` edges
    pub body_entries: Vec<NodeId>,

    /// Every node inside the body subgraph
    pub body_nodes: HashSet<NodeId>,

    /// Source of the `loop_return` edge; its output is appended to `results`
    pub terminal: Option<NodeId>,

    /// Items wired through the `items` input port: `(source node, port)`
    pub items_input: Option<(NodeId, String)>,

    /// Items named in extra config: `(source node, field)`
    pub items_config: Option<(String, String)>,
}

/// Executable plan produced by compilation
pub struct Plan {
    pub workflow_id: String,
    pub workflow_slug: String,
    pub trigger_node_id: NodeId,

    /// Build records for every reachable executable node
    pub nodes: HashMap<NodeId, NodeBuild>,

    /// Topological waves over the outer region (loop bodies excluded)
    pub waves: Vec<Vec<NodeId>>,

    /// Data-edge predecessors per node, sorted
    pub data_preds: HashMap<NodeId, Vec<NodeId>>,

    /// Data-edge successors per node, sorted
    pub data_succs: HashMap<NodeId, Vec<NodeId>>,

    /// Conditional-edge predecessors: `target -> [(emitter, condition)]`
    pub cond_preds: HashMap<NodeId, Vec<(NodeId, String)>>,

    /// Route map per route emitter
    pub route_map: HashMap<NodeId, RouteMap>,

    /// Loop frames keyed by loop node
    pub loops: HashMap<NodeId, LoopFrame>,

    /// Innermost owning loop per body node
    pub body_owner: HashMap<NodeId, NodeId>,
}

impl Plan {
    /// Build record for a node; unknown ids are an internal error
    pub fn node(&self, id: &str) -> Result<&NodeBuild> {
        self.nodes
            .get(id)
            .ok_or_else(|| CoreError::Execution(format!("plan has no node '{id}'")))
    }

    /// Node ids in the outer region (not inside any loop body)
    pub fn outer_nodes(&self) -> HashSet<NodeId> {
        self.nodes
            .keys()
            .filter(|id| !self.body_owner.contains_key(*id))
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plan")
            .field("workflow_id", &self.workflow_id)
            .field("trigger_node_id", &self.trigger_node_id)
            .field("nodes", &self.nodes.len())
            .field("waves", &self.waves)
            .field("loops", &self.loops.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Compile a workflow snapshot for one fired trigger
pub fn compile(
    workflow: &WorkflowSnapshot,
    trigger_node_id: &str,
    registry: &PortRegistry,
) -> Result<Plan> {
    validate_workflow(workflow, registry).map_err(|err| match err {
        CoreError::InvalidEdge(msg) => CoreError::build(ErrorCode::BuildIncompatibleEdge, msg),
        other => other,
    })?;

    let trigger = workflow.node(trigger_node_id).ok_or_else(|| {
        CoreError::Execution(format!("trigger node '{trigger_node_id}' does not exist"))
    })?;
    let trigger_def = registry.expect(&trigger.component_type)?;
    if !trigger_def.is_trigger {
        return Err(CoreError::Execution(format!(
            "node '{trigger_node_id}' ({}) is not a trigger",
            trigger.component_type
        )));
    }

    // 1. Reachability from the trigger along execution edges. Sub-component
    //    edges are followed only later, to bind capabilities.
    let reachable = reach_from(workflow, trigger_node_id);
    debug!(
        workflow = %workflow.slug,
        trigger = trigger_node_id,
        reachable = reachable.len(),
        "compiling plan"
    );

    // 2. Loop frames and body ownership.
    let (loops, body_owner) = build_loop_frames(workflow, &reachable)?;

    // 3. Per-node build records.
    let mut nodes: HashMap<NodeId, NodeBuild> = HashMap::new();
    for node_id in &reachable {
        let node = workflow
            .node(node_id)
            .ok_or_else(|| CoreError::Execution(format!("node '{node_id}' vanished")))?;
        let def = registry.expect(&node.component_type)?;
        if !def.flags.executable {
            // Sub-component types are reachable only through misuse; they
            // never execute.
            continue;
        }

        let capabilities = resolve_capabilities(workflow, node_id);
        if def.flags.requires_model && capabilities.model.is_none() {
            return Err(CoreError::build(
                ErrorCode::BuildMissingCapability,
                format!("node '{node_id}' ({}) has no model bound", node.component_type),
            ));
        }

        check_required_inputs(workflow, node_id, def)?;

        let runnable = def.build(node, &capabilities)?;
        nodes.insert(
            node_id.clone(),
            NodeBuild {
                node_id: node_id.clone(),
                component_type: node.component_type.clone(),
                system_prompt: node.config.system_prompt.clone(),
                extra: node.config.extra.clone(),
                runnable,
                capabilities,
                interrupt_before: node.config.interrupt_before,
                interrupt_after: node.config.interrupt_after,
                can_suspend: node.config.interrupt_before
                    || node.config.interrupt_after
                    || def.interrupting,
                emits_route: def.emits_route,
                is_loop: def.is_loop,
                timeout_ms: def.timeout_ms,
            },
        );
    }

    // 4. Topological layering over data and conditional edges; loop edges
    //    are excluded so loops do not register as cycles.
    let levels = layer_nodes(workflow, &nodes)?;

    // 5. Route emitters must not share a wave within one region.
    check_route_emitter_waves(&levels, &nodes, &body_owner)?;

    // 6. Adjacency and route maps.
    let mut data_preds: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    let mut data_succs: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    let mut cond_preds: HashMap<NodeId, Vec<(NodeId, String)>> = HashMap::new();
    let mut route_map: HashMap<NodeId, RouteMap> = HashMap::new();

    for edge in &workflow.edges {
        if !nodes.contains_key(&edge.source) || !nodes.contains_key(&edge.target) {
            continue;
        }
        match edge.class() {
            EdgeClass::Data => {
                data_succs
                    .entry(edge.source.clone())
                    .or_default()
                    .push(edge.target.clone());
                data_preds
                    .entry(edge.target.clone())
                    .or_default()
                    .push(edge.source.clone());
            }
            EdgeClass::Conditional => {
                let condition = edge.condition_value.clone().unwrap_or_default();
                cond_preds
                    .entry(edge.target.clone())
                    .or_default()
                    .push((edge.source.clone(), condition.clone()));
                let map = route_map.entry(edge.source.clone()).or_default();
                if condition == FALLBACK_ROUTE {
                    map.fallback.push(edge.target.clone());
                } else {
                    map.branches.entry(condition).or_default().push(edge.target.clone());
                }
            }
            _ => {}
        }
    }
    for targets in data_preds.values_mut().chain(data_succs.values_mut()) {
        targets.sort_unstable();
        targets.dedup();
    }

    // 7. Outer waves: levels with loop-body nodes removed.
    let waves: Vec<Vec<NodeId>> = levels
        .into_iter()
        .map(|level| {
            let mut wave: Vec<NodeId> = level
                .into_iter()
                .filter(|id| !body_owner.contains_key(id))
                .collect();
            wave.sort_unstable();
            wave
        })
        .filter(|wave| !wave.is_empty())
        .collect();

    Ok(Plan {
        workflow_id: workflow.id.clone(),
        workflow_slug: workflow.slug.clone(),
        trigger_node_id: trigger_node_id.to_string(),
        nodes,
        waves,
        data_preds,
        data_succs,
        cond_preds,
        route_map,
        loops,
        body_owner,
    })
}

/// BFS from the trigger along execution edges
fn reach_from(workflow: &WorkflowSnapshot, start: &str) -> HashSet<NodeId> {
    let mut reachable = HashSet::new();
    let mut queue = VecDeque::from([start.to_string()]);
    while let Some(current) = queue.pop_front() {
        if !reachable.insert(current.clone()) {
            continue;
        }
        for edge in workflow.edges_from(&current) {
            if edge.advances_execution() && !reachable.contains(&edge.target) {
                queue.push_back(edge.target.clone());
            }
        }
    }
    reachable
}

/// Gather capabilities from incoming sub-component edges
fn resolve_capabilities(workflow: &WorkflowSnapshot, node_id: &str) -> ResolvedCapabilities {
    let mut caps = ResolvedCapabilities::default();
    for edge in workflow.edges_to(node_id) {
        let EdgeClass::SubComponent(kind) = edge.class() else {
            continue;
        };
        let Some(source) = workflow.node(&edge.source) else {
            continue;
        };
        let reference = CapabilityRef {
            node_id: source.id.clone(),
            component_type: source.component_type.clone(),
            config: source.config.clone(),
        };
        match kind {
            SubComponentKind::Llm => caps.model = Some(reference),
            SubComponentKind::Tool => caps.tools.push(reference),
            SubComponentKind::Memory => caps.memory = Some(reference),
            SubComponentKind::OutputParser => caps.output_parser = Some(reference),
        }
    }
    caps.tools.sort_by(|a, b| a.node_id.cmp(&b.node_id));
    caps
}

/// Every declared required input port must be fed by an execution edge
fn check_required_inputs(
    workflow: &WorkflowSnapshot,
    node_id: &str,
    def: &crate::ports::ComponentDef,
) -> Result<()> {
    for port in def.inputs.iter().filter(|p| p.required) {
        let connected = workflow.edges_to(node_id).any(|edge| {
            edge.advances_execution()
                && (edge.target_port == port.name || edge.target_port.is_empty())
        });
        if !connected {
            return Err(CoreError::build(
                ErrorCode::BuildBrokenInput,
                format!("node '{node_id}' required input '{}' is not connected", port.name),
            ));
        }
    }
    Ok(())
}

/// Loop frames plus innermost body ownership
fn build_loop_frames(
    workflow: &WorkflowSnapshot,
    reachable: &HashSet<NodeId>,
) -> Result<(HashMap<NodeId, LoopFrame>, HashMap<NodeId, NodeId>)> {
    let mut loops: HashMap<NodeId, LoopFrame> = HashMap::new();
    let mut body_owner: HashMap<NodeId, NodeId> = HashMap::new();

    for node in &workflow.nodes {
        if !reachable.contains(&node.id) {
            continue;
        }
        let mut body_entries: Vec<NodeId> = workflow
            .edges_from(&node.id)
            .filter(|e| e.class() == EdgeClass::LoopBody)
            .map(|e| e.target.clone())
            .collect();
        if body_entries.is_empty() {
            continue;
        }
        body_entries.sort_unstable();

        // Body membership: everything reachable from the entries along
        // data/conditional edges, stopping at the loop node itself.
        let mut body_nodes: HashSet<NodeId> = HashSet::new();
        let mut queue: VecDeque<NodeId> = body_entries.iter().cloned().collect();
        while let Some(current) = queue.pop_front() {
            if current == node.id || !body_nodes.insert(current.clone()) {
                continue;
            }
            for edge in workflow.edges_from(&current) {
                if matches!(edge.class(), EdgeClass::Data | EdgeClass::Conditional) {
                    queue.push_back(edge.target.clone());
                }
            }
        }
        for body_node in &body_nodes {
            body_owner.insert(body_node.clone(), node.id.clone());
        }

        let terminal = workflow
            .edges
            .iter()
            .find(|e| e.class() == EdgeClass::LoopReturn && e.target == node.id)
            .map(|e| e.source.clone());

        let items_input = workflow
            .edges_to(&node.id)
            .find(|e| e.class() == EdgeClass::Data && e.target_port == "items")
            .map(|e| (e.source.clone(), e.source_port.clone()));

        let items_config = match (
            node.config.extra.get("items_source").and_then(|v| v.as_str()),
            node.config.extra.get("items_field").and_then(|v| v.as_str()),
        ) {
            (Some(source), Some(field)) => Some((source.to_string(), field.to_string())),
            _ => None,
        };

        loops.insert(
            node.id.clone(),
            LoopFrame {
                body_entries,
                body_nodes,
                terminal,
                items_input,
                items_config,
            },
        );
    }
    Ok((loops, body_owner))
}

/// Kahn layering over data and conditional edges; leftovers are a cycle
fn layer_nodes(
    workflow: &WorkflowSnapshot,
    nodes: &HashMap<NodeId, NodeBuild>,
) -> Result<Vec<Vec<NodeId>>> {
    let mut indegree: HashMap<&str, usize> = nodes.keys().map(|id| (id.as_str(), 0)).collect();
    let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();

    for edge in &workflow.edges {
        if !matches!(edge.class(), EdgeClass::Data | EdgeClass::Conditional) {
            continue;
        }
        if !nodes.contains_key(&edge.source) || !nodes.contains_key(&edge.target) {
            continue;
        }
        if let Some(degree) = indegree.get_mut(edge.target.as_str()) {
            *degree += 1;
        }
        successors
            .entry(edge.source.as_str())
            .or_default()
            .push(edge.target.as_str());
    }

    let mut current: Vec<&str> = indegree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    current.sort_unstable();

    let mut levels: Vec<Vec<NodeId>> = Vec::new();
    let mut placed = 0usize;

    while !current.is_empty() {
        placed += current.len();
        let mut next: Vec<&str> = Vec::new();
        for id in &current {
            for succ in successors.get(id).into_iter().flatten() {
                if let Some(degree) = indegree.get_mut(*succ) {
                    *degree -= 1;
                    if *degree == 0 {
                        next.push(*succ);
                    }
                }
            }
        }
        levels.push(current.iter().map(|id| id.to_string()).collect());
        next.sort_unstable();
        next.dedup();
        current = next;
    }

    if placed != nodes.len() {
        let stuck: Vec<&str> = indegree
            .iter()
            .filter(|(_, degree)| **degree > 0)
            .map(|(id, _)| *id)
            .collect();
        return Err(CoreError::build(
            ErrorCode::BuildCyclicGraph,
            format!("cycle without a loop construct involving: {}", stuck.join(", ")),
        ));
    }
    Ok(levels)
}

/// Two route emitters in one wave of the same region cannot be ordered;
/// reject at compile time rather than racing at runtime
fn check_route_emitter_waves(
    levels: &[Vec<NodeId>],
    nodes: &HashMap<NodeId, NodeBuild>,
    body_owner: &HashMap<NodeId, NodeId>,
) -> Result<()> {
    for level in levels {
        let mut emitters_per_region: HashMap<Option<&NodeId>, Vec<&NodeId>> = HashMap::new();
        for id in level {
            if nodes.get(id).map(|n| n.emits_route).unwrap_or(false) {
                emitters_per_region
                    .entry(body_owner.get(id))
                    .or_default()
                    .push(id);
            }
        }
        for (_, emitters) in emitters_per_region {
            if emitters.len() > 1 {
                let mut names: Vec<String> = emitters.iter().map(|s| s.to_string()).collect();
                names.sort_unstable();
                return Err(CoreError::build(
                    ErrorCode::BuildRouteConflict,
                    format!("route emitters share a wave: {}", names.join(", ")),
                ));
            }
        }
    }
    Ok(())
}
