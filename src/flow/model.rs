use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::condition::ConditionRule;

/// A stored flow: identity, activation flag and the node/edge graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FlowDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_active", alias = "is_active")]
    pub is_active: bool,
    #[serde(alias = "flow_data", alias = "flowData")]
    pub graph: FlowConfig,
}

fn default_active() -> bool {
    true
}

impl FlowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>, graph: FlowConfig) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            is_active: true,
            graph,
        }
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }
}

/// The `{nodes, edges}` blob as authored in the flow editor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FlowConfig {
    pub nodes: Vec<FlowNode>,
    #[serde(default, deserialize_with = "deserialize_edges")]
    #[schemars(with = "Vec<RawEdge>")]
    pub edges: Vec<FlowEdge>,
}

impl FlowConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(mut self, node: FlowNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn edge(mut self, source: &str, target: &str, branch: Branch) -> Self {
        let id = format!("e{}", self.edges.len() + 1);
        self.edges.push(FlowEdge {
            id,
            source: source.to_string(),
            target: target.to_string(),
            branch,
        });
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Start,
    Condition,
    Action,
    End,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FlowNode {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

impl FlowNode {
    pub fn new(id: impl Into<String>, kind: NodeKind, data: Value) -> Self {
        Self {
            id: id.into(),
            kind,
            data,
            position: None,
        }
    }

    pub fn start(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Start, Value::Null)
    }

    pub fn end(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::End, Value::Null)
    }

    pub fn condition(id: impl Into<String>, rule: &ConditionRule) -> Self {
        let data = serde_json::json!({ "conditionData": rule });
        Self::new(id, NodeKind::Condition, data)
    }

    pub fn action(id: impl Into<String>, action_type: &str, parameters: Value) -> Self {
        let data = serde_json::json!({ "actionType": action_type, "actionData": parameters });
        Self::new(id, NodeKind::Action, data)
    }

    /// Condition data, either nested under `conditionData` or given directly.
    /// A node the editor left unconfigured decodes to a rule that never
    /// matches, so the run takes its `false` edge.
    pub fn condition_rule(&self) -> ConditionRule {
        let raw = match self.data.get("conditionData") {
            Some(nested @ Value::Object(_)) => nested.clone(),
            _ => self.data.clone(),
        };
        serde_json::from_value(raw).unwrap_or_else(|err| {
            warn!(node_id = %self.id, error = %err, "condition is not configured, it will never match");
            ConditionRule::never()
        })
    }

    /// Action type from `actionType` (or `type`), parameters from
    /// `actionData` or else the remaining keys of `data`. A missing type
    /// decodes as empty and is rejected by the dispatcher when reached.
    pub fn action_spec(&self) -> ActionSpec {
        let empty = Map::new();
        let data = self.data.as_object().unwrap_or(&empty);
        let action_type = data
            .get("actionType")
            .or_else(|| data.get("type"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let parameters = match data.get("actionData") {
            Some(Value::Object(params)) => params.clone(),
            _ => data
                .iter()
                .filter(|(k, _)| !matches!(k.as_str(), "actionType" | "type" | "label"))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        ActionSpec {
            action_type,
            parameters,
        }
    }
}

/// What an action node asks the dispatcher to do.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionSpec {
    pub action_type: String,
    pub parameters: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Branch {
    True,
    False,
    #[default]
    Default,
}

impl Branch {
    pub fn from_label(label: &str) -> Option<Branch> {
        match label {
            "true" => Some(Branch::True),
            "false" => Some(Branch::False),
            "default" => Some(Branch::Default),
            _ => None,
        }
    }
}

impl From<bool> for Branch {
    fn from(result: bool) -> Self {
        if result { Branch::True } else { Branch::False }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowEdge {
    #[serde(default)]
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub branch: Branch,
}

/// Edge as written by editors: the branch label may sit in `branch`,
/// `type` or `sourceHandle`.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
struct RawEdge {
    #[serde(default)]
    id: String,
    source: String,
    target: String,
    #[serde(default)]
    branch: Option<String>,
    #[serde(default, rename = "type")]
    edge_type: Option<String>,
    #[serde(default)]
    source_handle: Option<String>,
}

impl From<RawEdge> for FlowEdge {
    fn from(raw: RawEdge) -> Self {
        let branch = [raw.branch, raw.edge_type, raw.source_handle]
            .into_iter()
            .flatten()
            .filter_map(|label| Branch::from_label(&label))
            .find(|b| *b != Branch::Default)
            .unwrap_or_default();
        FlowEdge {
            id: raw.id,
            source: raw.source,
            target: raw.target,
            branch,
        }
    }
}

fn deserialize_edges<'de, D>(deserializer: D) -> Result<Vec<FlowEdge>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<RawEdge> = Vec::deserialize(deserializer)?;
    Ok(raw.into_iter().map(FlowEdge::from).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Operator;
    use serde_json::json;

    #[test]
    fn parses_editor_export() {
        let def: FlowDefinition = serde_json::from_value(json!({
            "id": "f1",
            "name": "hot leads",
            "is_active": true,
            "flow_data": {
                "nodes": [
                    {"id": "s", "type": "start", "position": {"x": 0.0, "y": 0.0}},
                    {"id": "c", "type": "condition", "data": {"conditionData": {
                        "field": "status_id", "fieldType": "status", "operator": "equals", "value": 5}}},
                    {"id": "a", "type": "action", "data": {"type": "send_to_dialer", "bucket_id": "B"}},
                    {"id": "x", "type": "teleport"}
                ],
                "edges": [
                    {"id": "e1", "source": "s", "target": "c", "type": "smoothstep"},
                    {"id": "e2", "source": "c", "target": "a", "type": "default", "sourceHandle": "true"}
                ]
            }
        }))
        .unwrap();

        assert!(def.is_active);
        assert_eq!(def.graph.nodes[3].kind, NodeKind::Unknown);
        assert_eq!(def.graph.edges[0].branch, Branch::Default);
        assert_eq!(def.graph.edges[1].branch, Branch::True);

        let rule = def.graph.nodes[1].condition_rule();
        assert_eq!(rule.operator, Operator::Equals);

        let spec = def.graph.nodes[2].action_spec();
        assert_eq!(spec.action_type, "send_to_dialer");
        assert_eq!(spec.parameters.get("bucket_id"), Some(&json!("B")));
        assert!(!spec.parameters.contains_key("type"));
    }

    #[test]
    fn flat_condition_data_and_action_data() {
        let cond = FlowNode::new(
            "c",
            NodeKind::Condition,
            json!({"field": "city", "operator": "contains", "value": "x"}),
        );
        assert_eq!(cond.condition_rule().field, "city");

        let action = FlowNode::action("a", "add_note", json!({"text": "hi"}));
        let spec = action.action_spec();
        assert_eq!(spec.action_type, "add_note");
        assert_eq!(spec.parameters.get("text"), Some(&json!("hi")));
    }

    #[test]
    fn unconfigured_nodes_decode_to_inert_defaults() {
        let action = FlowNode::new("a", NodeKind::Action, json!({"label": "action node", "bucket_id": "B"}));
        let spec = action.action_spec();
        assert_eq!(spec.action_type, "");
        assert_eq!(spec.parameters.get("bucket_id"), Some(&json!("B")));
        assert_eq!(FlowNode::new("a", NodeKind::Action, Value::Null).action_spec().action_type, "");

        let cond = FlowNode::new("c", NodeKind::Condition, json!({"label": "condition node"}));
        assert_eq!(cond.condition_rule(), ConditionRule::never());
    }
}
