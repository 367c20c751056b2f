use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::action::ActionDispatcher;
use crate::error::{ActionError, GraphError};
use crate::event::InputEvent;

use super::graph::{FlowGraph, StepKind};
use super::model::{Branch, FlowConfig};

/// What happened at one visited node.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum StepOutput {
    Start,
    Condition { matched: bool },
    Action { action_type: String },
    End,
}

/// One record per visited node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeRecord {
    pub node_id: String,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub result: Result<StepOutput, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Reached an end node, or a start/action node with nowhere to go.
    Completed,
    /// A condition had no edge for its result. Not an error.
    NoMatchingBranch { node_id: String, result: bool },
    /// An action failed; the rest of the flow was skipped.
    Failed { node_id: String, error: ActionError },
}

#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub records: Vec<NodeRecord>,
    pub outcome: RunOutcome,
    pub total: TimeDelta,
}

impl ExecutionReport {
    pub fn completed(&self) -> bool {
        self.outcome == RunOutcome::Completed
    }

    pub fn error(&self) -> Option<&ActionError> {
        match &self.outcome {
            RunOutcome::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn visited(&self) -> Vec<&str> {
        self.records.iter().map(|r| r.node_id.as_str()).collect()
    }
}

/// Walks a flow graph along exactly one path per event.
#[derive(Clone)]
pub struct FlowExecutor {
    dispatcher: ActionDispatcher,
}

impl FlowExecutor {
    pub fn new(dispatcher: ActionDispatcher) -> Self {
        Self { dispatcher }
    }

    /// Builds `config` and runs it.
    pub async fn execute_config(
        &self,
        config: &FlowConfig,
        event: &InputEvent,
    ) -> Result<ExecutionReport, GraphError> {
        let graph = FlowGraph::build(config)?;
        Ok(self.execute(&graph, event).await)
    }

    /// Runs `graph` from its start node. Graphs are acyclic by construction,
    /// so every step moves strictly forward and the walk terminates.
    pub async fn execute(&self, graph: &FlowGraph, event: &InputEvent) -> ExecutionReport {
        let run_start = Utc::now();
        let mut records = Vec::new();
        let mut current = graph.start();

        let outcome = loop {
            let step = graph.step(current);
            let started = Utc::now();
            let record = |result: Result<StepOutput, String>| NodeRecord {
                node_id: step.id.clone(),
                started,
                finished: Utc::now(),
                result,
            };

            let next = match &step.kind {
                StepKind::Start => {
                    records.push(record(Ok(StepOutput::Start)));
                    graph.next(current)
                }
                StepKind::End => {
                    records.push(record(Ok(StepOutput::End)));
                    break RunOutcome::Completed;
                }
                StepKind::Condition(rule) => {
                    let matched = rule.evaluate(event);
                    records.push(record(Ok(StepOutput::Condition { matched })));
                    debug!(node_id = %step.id, matched, "condition evaluated");
                    match graph.follow(current, Branch::from(matched)) {
                        Some(target) => Some(target),
                        None => {
                            break RunOutcome::NoMatchingBranch {
                                node_id: step.id.clone(),
                                result: matched,
                            };
                        }
                    }
                }
                StepKind::Action(spec) => {
                    match self
                        .dispatcher
                        .dispatch(&spec.action_type, &spec.parameters, event)
                        .await
                    {
                        Ok(()) => {
                            records.push(record(Ok(StepOutput::Action {
                                action_type: spec.action_type.clone(),
                            })));
                            graph.next(current)
                        }
                        Err(error) => {
                            warn!(node_id = %step.id, action = %spec.action_type, error = %error, "action failed");
                            records.push(record(Err(error.to_string())));
                            break RunOutcome::Failed {
                                node_id: step.id.clone(),
                                error,
                            };
                        }
                    }
                }
            };

            match next {
                Some(target) => current = target,
                None => break RunOutcome::Completed,
            }
        };

        ExecutionReport {
            records,
            outcome,
            total: Utc::now() - run_start,
        }
    }
}
