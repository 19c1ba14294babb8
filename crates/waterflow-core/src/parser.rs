//! JSON graph parser.
//!
//! Turns a definition document into an immutable [`FlowDefinition`] and
//! rejects structurally broken graphs before anything runs. Condition
//! branches are folded into the rules of their node's outgoing events.

use crate::{
    Callback, DefinitionError, DefinitionStatus, FanInSpec, FanOutSpec, FlowDefinition,
    FlowEvent, FlowNode, Jober, NodeKind, NodeType, OutputConverter, TaskSpec, TriggerMode,
};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDefinition {
    #[serde(default)]
    id: Option<String>,
    meta_id: String,
    #[serde(default = "default_version")]
    version: String,
    #[serde(default)]
    status: DefinitionStatus,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    properties: HashMap<String, Value>,
    #[serde(default)]
    callback: Option<Callback>,
    #[serde(default)]
    exception_fitables: Vec<String>,
    #[serde(default)]
    finished_fitables: Vec<String>,
    nodes: Vec<RawNode>,
    #[serde(default)]
    events: Vec<RawEvent>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawNode {
    meta_id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "type")]
    node_type: String,
    #[serde(default)]
    trigger_mode: Option<TriggerMode>,
    #[serde(default)]
    jober: Option<RawJober>,
    #[serde(default)]
    task: Option<TaskSpec>,
    #[serde(default)]
    branches: Option<Vec<RawBranch>>,
    #[serde(default)]
    fan_out: Option<FanOutSpec>,
    #[serde(default)]
    fan_in: Option<FanInSpec>,
    #[serde(default)]
    callback: Option<Callback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawJober {
    #[serde(default)]
    fitables: Vec<String>,
    #[serde(default)]
    converter: Option<String>,
    #[serde(default)]
    filter: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawBranch {
    #[serde(default)]
    rule: Option<String>,
    #[serde(default, rename = "else")]
    is_else: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEvent {
    from: String,
    to: String,
    #[serde(default)]
    condition_rule: Option<String>,
    #[serde(default)]
    priority: Option<i32>,
}

/// Parse a definition document.
pub fn parse(json: &str) -> Result<FlowDefinition, DefinitionError> {
    let raw: RawDefinition = serde_json::from_str(json)?;
    build(raw)
}

/// Parse an already decoded definition document.
pub fn parse_value(value: Value) -> Result<FlowDefinition, DefinitionError> {
    let raw: RawDefinition = serde_json::from_value(value)?;
    build(raw)
}

fn build(raw: RawDefinition) -> Result<FlowDefinition, DefinitionError> {
    let mut nodes: HashMap<String, FlowNode> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    let mut branches: HashMap<String, Vec<RawBranch>> = HashMap::new();

    for raw_node in raw.nodes {
        let id = raw_node.meta_id.clone();
        if nodes.contains_key(&id) {
            return Err(DefinitionError::DuplicateNode(id));
        }
        let node_type =
            NodeType::parse(&raw_node.node_type).ok_or_else(|| DefinitionError::UnknownNodeType {
                node_id: id.clone(),
                node_type: raw_node.node_type.clone(),
            })?;
        let kind = build_kind(&id, node_type, &raw_node)?;
        let trigger_mode = match node_type {
            NodeType::ManualTask => TriggerMode::Manual,
            _ => raw_node.trigger_mode.unwrap_or_default(),
        };
        if let Some(b) = raw_node.branches {
            if node_type == NodeType::Condition {
                branches.insert(id.clone(), b);
            }
        }

        order.push(id.clone());
        nodes.insert(
            id.clone(),
            FlowNode {
                name: raw_node.name.unwrap_or_else(|| id.clone()),
                meta_id: id,
                kind,
                trigger_mode,
                callback: raw_node.callback,
                events: Vec::new(),
            },
        );
    }

    let mut outgoing: HashMap<String, Vec<RawEvent>> = HashMap::new();
    let mut incoming: HashSet<String> = HashSet::new();
    for event in raw.events {
        if !nodes.contains_key(&event.from) || !nodes.contains_key(&event.to) {
            return Err(DefinitionError::UnknownEventEndpoint {
                from: event.from,
                to: event.to,
            });
        }
        incoming.insert(event.to.clone());
        outgoing.entry(event.from.clone()).or_default().push(event);
    }

    for id in &order {
        let Some(raw_events) = outgoing.remove(id) else {
            continue;
        };
        let mut events = match branches.get(id) {
            Some(b) => convert_branches(id, b, raw_events)?,
            None => raw_events
                .into_iter()
                .enumerate()
                .map(|(i, e)| FlowEvent {
                    from: e.from,
                    to: e.to,
                    condition_rule: non_blank(e.condition_rule),
                    priority: e.priority.unwrap_or(i as i32),
                })
                .collect(),
        };
        events.sort_by_key(|e| e.priority);
        if let Some(node) = nodes.get_mut(id) {
            node.events = events;
        }
    }

    let start_node = validate(&order, &nodes, &incoming)?;

    Ok(FlowDefinition {
        id: raw.id.unwrap_or_else(|| raw.meta_id.clone()),
        name: raw.name.unwrap_or_else(|| raw.meta_id.clone()),
        meta_id: raw.meta_id,
        version: raw.version,
        status: raw.status,
        description: raw.description,
        properties: raw.properties,
        nodes,
        start_node,
        callback: raw.callback,
        exception_fitables: raw.exception_fitables,
        finished_fitables: raw.finished_fitables,
    })
}

fn build_kind(id: &str, node_type: NodeType, raw: &RawNode) -> Result<NodeKind, DefinitionError> {
    let missing = |field: &str| DefinitionError::MissingSpec {
        node_id: id.to_string(),
        field: field.to_string(),
    };
    let invalid = |reason: String| DefinitionError::InvalidSpec {
        node_id: id.to_string(),
        reason,
    };

    Ok(match node_type {
        NodeType::Start => NodeKind::Start,
        NodeType::End => NodeKind::End,
        NodeType::Condition => NodeKind::Condition,
        NodeType::State => {
            let jober = raw.jober.as_ref().ok_or_else(|| missing("jober"))?;
            if jober.fitables.is_empty() {
                return Err(invalid("automatic task has no fitables".to_string()));
            }
            let converter = match jober.converter.as_deref() {
                Some(c) => OutputConverter::parse(c)
                    .ok_or_else(|| invalid(format!("unknown converter '{}'", c)))?,
                None => OutputConverter::default(),
            };
            NodeKind::State(Jober {
                fitables: jober.fitables.clone(),
                converter,
                filter: non_blank(jober.filter.clone()),
            })
        }
        NodeType::ManualTask => {
            let task = raw.task.clone().unwrap_or_else(|| TaskSpec {
                task_id: id.to_string(),
                filter: None,
            });
            NodeKind::ManualTask(TaskSpec {
                filter: non_blank(task.filter),
                ..task
            })
        }
        NodeType::FanOut => {
            let spec = raw.fan_out.clone().ok_or_else(|| missing("fanOut"))?;
            if spec.items.trim().is_empty() || spec.item_key.trim().is_empty() {
                return Err(invalid("fan-out needs both items and itemKey".to_string()));
            }
            NodeKind::FanOut(spec)
        }
        NodeType::FanIn => {
            let spec = raw.fan_in.clone().ok_or_else(|| missing("fanIn"))?;
            if spec.min_batch == 0 {
                return Err(invalid("fan-in minBatch must be at least 1".to_string()));
            }
            NodeKind::FanIn(FanInSpec {
                filter: non_blank(spec.filter.clone()),
                ..spec
            })
        }
    })
}

/// Assign branch rules to the condition node's events in declaration order.
///
/// Older definitions leave out the fallback branch; when no branch is marked
/// `else` and exactly one event is left over, that event becomes the else.
fn convert_branches(
    node_id: &str,
    branches: &[RawBranch],
    events: Vec<RawEvent>,
) -> Result<Vec<FlowEvent>, DefinitionError> {
    let else_count = branches.iter().filter(|b| b.is_else).count();
    if else_count > 1 {
        return Err(DefinitionError::InvalidSpec {
            node_id: node_id.to_string(),
            reason: "condition declares more than one else branch".to_string(),
        });
    }
    let implicit_else = else_count == 0 && branches.len() + 1 == events.len();
    if branches.len() != events.len() && !implicit_else {
        return Err(DefinitionError::InvalidEventSize {
            node_id: node_id.to_string(),
            branches: branches.len(),
            events: events.len(),
        });
    }

    let last = events.len() as i32;
    Ok(events
        .into_iter()
        .enumerate()
        .map(|(i, e)| {
            let (rule, priority) = match branches.get(i) {
                Some(b) if b.is_else => (None, last),
                Some(b) => (non_blank(b.rule.clone()), i as i32),
                None => (None, last),
            };
            FlowEvent {
                from: e.from,
                to: e.to,
                condition_rule: rule,
                priority,
            }
        })
        .collect())
}

fn validate(
    order: &[String],
    nodes: &HashMap<String, FlowNode>,
    incoming: &HashSet<String>,
) -> Result<String, DefinitionError> {
    let starts: Vec<String> = order
        .iter()
        .filter(|id| nodes[*id].node_type() == NodeType::Start)
        .cloned()
        .collect();
    let start = match starts.as_slice() {
        [] => return Err(DefinitionError::NoStartNode),
        [only] => only.clone(),
        _ => return Err(DefinitionError::MultipleStartNodes(starts)),
    };
    if incoming.contains(&start) {
        return Err(DefinitionError::StartHasIncoming(start));
    }

    for id in order {
        let node = &nodes[id];
        match node.node_type() {
            NodeType::End if !node.events.is_empty() => {
                return Err(DefinitionError::EndHasOutgoing(id.clone()));
            }
            NodeType::End => {}
            _ if node.events.is_empty() => {
                return Err(DefinitionError::MissingOutgoing(id.clone()));
            }
            NodeType::FanOut if node.events.len() != 1 => {
                return Err(DefinitionError::InvalidSpec {
                    node_id: id.clone(),
                    reason: "fan-out must have exactly one outgoing event".to_string(),
                });
            }
            _ => {}
        }
    }

    // Every node must be reachable from the start node
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let index: HashMap<&str, NodeIndex> = order
        .iter()
        .map(|id| (id.as_str(), graph.add_node(id.as_str())))
        .collect();
    for id in order {
        for event in &nodes[id].events {
            graph.add_edge(index[event.from.as_str()], index[event.to.as_str()], ());
        }
    }
    let mut reached = HashSet::new();
    let mut dfs = Dfs::new(&graph, index[start.as_str()]);
    while let Some(ix) = dfs.next(&graph) {
        reached.insert(graph[ix]);
    }
    if let Some(lost) = order.iter().find(|id| !reached.contains(id.as_str())) {
        return Err(DefinitionError::Unreachable(lost.clone()));
    }

    Ok(start)
}

fn non_blank(rule: Option<String>) -> Option<String> {
    rule.filter(|r| !r.trim().is_empty())
}
