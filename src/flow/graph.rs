use std::collections::{HashMap, HashSet};

use petgraph::Direction::Outgoing;
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::{Dfs, EdgeRef};
use tracing::warn;

use crate::condition::ConditionRule;
use crate::error::GraphError;

use super::model::{ActionSpec, Branch, FlowConfig, NodeKind};

/// A node with its data already decoded.
#[derive(Debug, Clone)]
pub struct FlowStep {
    pub id: String,
    pub kind: StepKind,
}

#[derive(Debug, Clone)]
pub enum StepKind {
    Start,
    Condition(ConditionRule),
    Action(ActionSpec),
    End,
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Start => "start",
            StepKind::Condition(_) => "condition",
            StepKind::Action(_) => "action",
            StepKind::End => "end",
        }
    }
}

/// Validated, immutable arena form of a [`FlowConfig`]. Nodes live in a
/// petgraph arena and are addressed by index, so one graph can be read by any
/// number of concurrent runs.
#[derive(Debug, Clone)]
pub struct FlowGraph {
    graph: DiGraph<FlowStep, Branch>,
    index_of: HashMap<String, NodeIndex>,
    start: NodeIndex,
}

impl FlowGraph {
    pub fn build(config: &FlowConfig) -> Result<Self, GraphError> {
        let mut graph = DiGraph::with_capacity(config.nodes.len(), config.edges.len());
        let mut index_of = HashMap::with_capacity(config.nodes.len());
        let mut starts = Vec::new();

        for node in &config.nodes {
            if index_of.contains_key(&node.id) {
                return Err(GraphError::DuplicateNode(node.id.clone()));
            }
            let kind = match node.kind {
                NodeKind::Start => StepKind::Start,
                NodeKind::End => StepKind::End,
                NodeKind::Condition => StepKind::Condition(node.condition_rule()),
                NodeKind::Action => StepKind::Action(node.action_spec()),
                NodeKind::Unknown => return Err(GraphError::UnknownNodeType(node.id.clone())),
            };
            let idx = graph.add_node(FlowStep {
                id: node.id.clone(),
                kind,
            });
            if node.kind == NodeKind::Start {
                starts.push(node.id.clone());
            }
            index_of.insert(node.id.clone(), idx);
        }

        let start = match starts.as_slice() {
            [] => return Err(GraphError::MissingStart),
            [only] => index_of[only],
            _ => return Err(GraphError::MultipleStarts(starts)),
        };

        for edge in &config.edges {
            let lookup = |id: &str| {
                index_of.get(id).copied().ok_or_else(|| GraphError::DanglingEdge {
                    edge_id: edge.id.clone(),
                    node_id: id.to_string(),
                })
            };
            let from = lookup(&edge.source)?;
            let to = lookup(&edge.target)?;
            if from == to {
                return Err(GraphError::Cycle(edge.source.clone()));
            }
            graph.add_edge(from, to, edge.branch);
        }

        if let Err(cycle) = petgraph::algo::toposort(&graph, None) {
            return Err(GraphError::Cycle(graph[cycle.node_id()].id.clone()));
        }

        let flow = FlowGraph {
            graph,
            index_of,
            start,
        };
        flow.warn_on_suspicious_shape();
        Ok(flow)
    }

    fn warn_on_suspicious_shape(&self) {
        let mut reachable = HashSet::new();
        let mut dfs = Dfs::new(&self.graph, self.start);
        while let Some(idx) = dfs.next(&self.graph) {
            reachable.insert(idx);
        }
        for idx in self.graph.node_indices() {
            let step = &self.graph[idx];
            if !reachable.contains(&idx) {
                warn!(node_id = %step.id, "node is unreachable from start");
            }
            if let StepKind::Condition(_) = step.kind {
                let mut seen = HashSet::new();
                for (_, branch) in self.outgoing(idx) {
                    if branch != Branch::Default && !seen.insert(branch) {
                        warn!(node_id = %step.id, ?branch, "duplicate branch, first edge wins");
                    }
                }
            }
        }
    }

    pub fn start(&self) -> NodeIndex {
        self.start
    }

    pub fn step(&self, idx: NodeIndex) -> &FlowStep {
        &self.graph[idx]
    }

    pub fn index_of(&self, id: &str) -> Option<NodeIndex> {
        self.index_of.get(id).copied()
    }

    /// Outgoing edges in declaration order.
    fn outgoing(&self, idx: NodeIndex) -> Vec<(NodeIndex, Branch)> {
        let mut edges: Vec<(EdgeIndex, NodeIndex, Branch)> = self
            .graph
            .edges_directed(idx, Outgoing)
            .map(|e| (e.id(), e.target(), *e.weight()))
            .collect();
        edges.sort_by_key(|(id, _, _)| *id);
        edges.into_iter().map(|(_, to, b)| (to, b)).collect()
    }

    /// First outgoing edge regardless of its label.
    pub fn next(&self, idx: NodeIndex) -> Option<NodeIndex> {
        self.outgoing(idx).first().map(|(to, _)| *to)
    }

    /// First outgoing edge labelled `branch`.
    pub fn follow(&self, idx: NodeIndex, branch: Branch) -> Option<NodeIndex> {
        self.outgoing(idx)
            .into_iter()
            .find(|(_, b)| *b == branch)
            .map(|(to, _)| to)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Operator;
    use crate::flow::model::FlowNode;
    use serde_json::json;

    fn rule() -> ConditionRule {
        ConditionRule::new("status_id", Operator::Equals, 5)
    }

    #[test]
    fn builds_and_follows_branches_in_order() {
        let config = FlowConfig::new()
            .node(FlowNode::start("s"))
            .node(FlowNode::condition("c", &rule()))
            .node(FlowNode::action("a1", "add_note", json!({"text": "1"})))
            .node(FlowNode::action("a2", "add_note", json!({"text": "2"})))
            .node(FlowNode::end("e"))
            .edge("s", "c", Branch::Default)
            .edge("c", "a1", Branch::True)
            .edge("c", "a2", Branch::True)
            .edge("c", "e", Branch::False)
            .edge("a1", "e", Branch::Default);
        let graph = FlowGraph::build(&config).unwrap();

        let c = graph.index_of("c").unwrap();
        assert_eq!(graph.next(graph.start()), Some(c));
        assert_eq!(graph.follow(c, Branch::True), graph.index_of("a1"));
        assert_eq!(graph.follow(c, Branch::False), graph.index_of("e"));
        assert_eq!(graph.follow(c, Branch::Default), None);
        assert_eq!(graph.node_count(), 5);
        assert_eq!(graph.edge_count(), 5);
    }

    #[test]
    fn rejects_missing_or_multiple_starts() {
        let config = FlowConfig::new().node(FlowNode::end("e"));
        assert_eq!(FlowGraph::build(&config).unwrap_err(), GraphError::MissingStart);

        let config = FlowConfig::new()
            .node(FlowNode::start("s1"))
            .node(FlowNode::start("s2"));
        assert!(matches!(
            FlowGraph::build(&config),
            Err(GraphError::MultipleStarts(ids)) if ids == vec!["s1", "s2"]
        ));
    }

    #[test]
    fn rejects_dangling_edges_and_duplicates() {
        let config = FlowConfig::new()
            .node(FlowNode::start("s"))
            .edge("s", "ghost", Branch::Default);
        assert_eq!(
            FlowGraph::build(&config).unwrap_err(),
            GraphError::DanglingEdge {
                edge_id: "e1".into(),
                node_id: "ghost".into()
            }
        );

        let config = FlowConfig::new()
            .node(FlowNode::start("s"))
            .node(FlowNode::end("s"));
        assert_eq!(
            FlowGraph::build(&config).unwrap_err(),
            GraphError::DuplicateNode("s".into())
        );
    }

    #[test]
    fn rejects_cycles() {
        let config = FlowConfig::new()
            .node(FlowNode::start("s"))
            .node(FlowNode::condition("c", &rule()))
            .node(FlowNode::action("a", "add_note", json!({})))
            .edge("s", "c", Branch::Default)
            .edge("c", "a", Branch::True)
            .edge("a", "c", Branch::Default);
        assert!(matches!(FlowGraph::build(&config), Err(GraphError::Cycle(_))));

        let config = FlowConfig::new()
            .node(FlowNode::start("s"))
            .edge("s", "s", Branch::Default);
        assert_eq!(FlowGraph::build(&config).unwrap_err(), GraphError::Cycle("s".into()));
    }

    #[test]
    fn rejects_unknown_node_types() {
        let config: FlowConfig = serde_json::from_value(json!({
            "nodes": [{"id": "s", "type": "start"}, {"id": "w", "type": "wait"}],
            "edges": []
        }))
        .unwrap();
        assert_eq!(
            FlowGraph::build(&config).unwrap_err(),
            GraphError::UnknownNodeType("w".into())
        );
    }
}
