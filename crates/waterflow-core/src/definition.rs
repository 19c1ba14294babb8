use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Publication state of a definition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefinitionStatus {
    #[default]
    #[serde(alias = "DRAFT")]
    Draft,
    #[serde(alias = "PUBLISHED")]
    Published,
}

/// Whether a node runs as soon as a context arrives or waits for a signal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    #[default]
    #[serde(alias = "AUTO")]
    Auto,
    #[serde(alias = "MANUAL")]
    Manual,
}

/// Complete, immutable flow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDefinition {
    pub id: String,
    pub meta_id: String,
    pub version: String,
    pub status: DefinitionStatus,
    pub name: String,
    pub description: Option<String>,
    pub properties: HashMap<String, Value>,
    pub nodes: HashMap<String, FlowNode>,
    pub start_node: String,
    pub callback: Option<Callback>,
    pub exception_fitables: Vec<String>,
    pub finished_fitables: Vec<String>,
}

impl FlowDefinition {
    /// Identity of the runnable stream: `{meta_id}-{version}`.
    pub fn stream_id(&self) -> String {
        format!("{}-{}", self.meta_id, self.version)
    }

    pub fn node(&self, id: &str) -> Option<&FlowNode> {
        self.nodes.get(id)
    }

    pub fn start(&self) -> Option<&FlowNode> {
        self.nodes.get(&self.start_node)
    }

    /// All events of the graph, in no particular order.
    pub fn events(&self) -> impl Iterator<Item = &FlowEvent> {
        self.nodes.values().flat_map(|n| n.events.iter())
    }
}

/// Node discriminant without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeType {
    Start,
    State,
    ManualTask,
    Condition,
    FanOut,
    FanIn,
    End,
}

impl NodeType {
    pub const ALL: [NodeType; 7] = [
        NodeType::Start,
        NodeType::State,
        NodeType::ManualTask,
        NodeType::Condition,
        NodeType::FanOut,
        NodeType::FanIn,
        NodeType::End,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Start => "start",
            NodeType::State => "state",
            NodeType::ManualTask => "manualTask",
            NodeType::Condition => "condition",
            NodeType::FanOut => "fanOut",
            NodeType::FanIn => "fanIn",
            NodeType::End => "end",
        }
    }

    /// Accepts the names used in definition JSON, case-insensitively.
    pub fn parse(s: &str) -> Option<NodeType> {
        match s.to_ascii_lowercase().as_str() {
            "start" => Some(NodeType::Start),
            "state" | "autotask" | "auto_task" => Some(NodeType::State),
            "manualtask" | "manual_task" => Some(NodeType::ManualTask),
            "condition" => Some(NodeType::Condition),
            "fanout" | "fan_out" | "produce" => Some(NodeType::FanOut),
            "fanin" | "fan_in" | "join" => Some(NodeType::FanIn),
            "end" => Some(NodeType::End),
            _ => None,
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-kind node payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NodeKind {
    Start,
    State(Jober),
    ManualTask(TaskSpec),
    Condition,
    FanOut(FanOutSpec),
    FanIn(FanInSpec),
    End,
}

impl NodeKind {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeKind::Start => NodeType::Start,
            NodeKind::State(_) => NodeType::State,
            NodeKind::ManualTask(_) => NodeType::ManualTask,
            NodeKind::Condition => NodeType::Condition,
            NodeKind::FanOut(_) => NodeType::FanOut,
            NodeKind::FanIn(_) => NodeType::FanIn,
            NodeKind::End => NodeType::End,
        }
    }
}

/// One node of the graph with its outgoing events sorted by priority.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowNode {
    pub meta_id: String,
    pub name: String,
    pub kind: NodeKind,
    pub trigger_mode: TriggerMode,
    pub callback: Option<Callback>,
    pub events: Vec<FlowEvent>,
}

impl FlowNode {
    pub fn node_type(&self) -> NodeType {
        self.kind.node_type()
    }

    pub fn is_manual(&self) -> bool {
        self.trigger_mode == TriggerMode::Manual
    }
}

/// Directed edge between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowEvent {
    pub from: String,
    pub to: String,
    /// JEXL predicate over the context data; `None` always holds.
    pub condition_rule: Option<String>,
    pub priority: i32,
}

/// Automatic task: which fitables to run and how to fold their output back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Jober {
    pub fitables: Vec<String>,
    pub converter: OutputConverter,
    /// Task is skipped when this rule is false.
    pub filter: Option<String>,
}

/// How a fitable result is folded into the context data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OutputConverter {
    /// Object output merged key by key; anything else lands under `output`.
    #[default]
    Merge,
    Replace,
    Key(String),
}

impl OutputConverter {
    /// `merge`, `replace` or `key:<name>`.
    pub fn parse(s: &str) -> Option<OutputConverter> {
        let s = s.trim();
        if let Some(key) = s.strip_prefix("key:") {
            let key = key.trim();
            return (!key.is_empty()).then(|| OutputConverter::Key(key.to_string()));
        }
        match s.to_ascii_lowercase().as_str() {
            "" | "merge" => Some(OutputConverter::Merge),
            "replace" => Some(OutputConverter::Replace),
            _ => None,
        }
    }

    pub fn apply(&self, data: &Value, output: Value) -> Value {
        match self {
            OutputConverter::Replace => output,
            OutputConverter::Merge => match (data, output) {
                (_, Value::Null) => data.clone(),
                (Value::Object(current), Value::Object(out)) => {
                    let mut merged = current.clone();
                    merged.extend(out);
                    Value::Object(merged)
                }
                (Value::Object(current), other) => {
                    let mut merged = current.clone();
                    merged.insert("output".to_string(), other);
                    Value::Object(merged)
                }
                (_, other) => other,
            },
            OutputConverter::Key(key) => {
                let mut merged = match data {
                    Value::Object(current) => current.clone(),
                    _ => serde_json::Map::new(),
                };
                merged.insert(key.clone(), output);
                Value::Object(merged)
            }
        }
    }
}

/// Human task waiting for an external completion signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    pub task_id: String,
    /// Node passes through without waiting when this rule is false.
    #[serde(default)]
    pub filter: Option<String>,
}

/// Produce step splitting an array into one context per item.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FanOutSpec {
    /// Dotted path to the array in the context data.
    pub items: String,
    pub item_key: String,
}

/// Join step merging the contexts of one batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FanInSpec {
    pub min_batch: usize,
    pub collect_into: String,
    /// Contributions failing this rule still count but are left out of the merged array.
    #[serde(default)]
    pub filter: Option<String>,
}

/// Fitables notified after completion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Callback {
    pub fitables: Vec<String>,
}
