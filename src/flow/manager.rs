use std::sync::Arc;

use futures::future::join_all;
use opentelemetry::KeyValue;
use tracing::{Level, error, info, instrument, warn};

use crate::error::{GraphError, StoreError};
use crate::event::InputEvent;
use crate::logger::EngineMetrics;

use super::executor::{ExecutionReport, FlowExecutor, RunOutcome};
use super::graph::FlowGraph;
use super::model::FlowDefinition;
use super::store::FlowStore;

/// The result of one flow against one event.
#[derive(Debug, Clone)]
pub struct FlowRunResult {
    pub flow_id: String,
    pub result: Result<ExecutionReport, GraphError>,
}

impl FlowRunResult {
    pub fn completed(&self) -> bool {
        matches!(&self.result, Ok(report) if report.completed())
    }
}

/// Runs every active flow against each incoming event. Runs are isolated: an
/// invalid graph or failed action in one flow never affects another.
#[derive(Clone)]
pub struct FlowManager {
    store: Arc<dyn FlowStore>,
    executor: FlowExecutor,
    metrics: EngineMetrics,
}

impl FlowManager {
    pub fn new(store: Arc<dyn FlowStore>, executor: FlowExecutor) -> Self {
        Self {
            store,
            executor,
            metrics: EngineMetrics::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: EngineMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    #[instrument(skip_all, fields(entity_id = ?event.entity_id()))]
    pub async fn process_event(&self, event: &InputEvent) -> Result<Vec<FlowRunResult>, StoreError> {
        let flows = self.store.list_active_flows().await?;
        if flows.is_empty() {
            info!("no active flows");
            return Ok(Vec::new());
        }
        let runs = flows.iter().map(|flow| self.run_flow(flow, event));
        Ok(join_all(runs).await)
    }

    /// Runs a single flow by id, whether or not it is active.
    pub async fn execute_flow(
        &self,
        flow_id: &str,
        event: &InputEvent,
    ) -> Result<Option<FlowRunResult>, StoreError> {
        match self.store.get_flow(flow_id).await? {
            Some(flow) => Ok(Some(self.run_flow(&flow, event).await)),
            None => Ok(None),
        }
    }

    #[instrument(skip_all, fields(flow_id = %flow.id))]
    async fn run_flow(&self, flow: &FlowDefinition, event: &InputEvent) -> FlowRunResult {
        let attrs = [KeyValue::new("flow_id", flow.id.clone())];
        self.metrics.flow_runs.add(1, &attrs);

        let graph = match FlowGraph::build(&flow.graph) {
            Ok(graph) => graph,
            Err(err) => {
                error!(error = %err, "flow graph is invalid");
                self.metrics.flow_failures.add(1, &attrs);
                return FlowRunResult {
                    flow_id: flow.id.clone(),
                    result: Err(err),
                };
            }
        };

        let report = self.executor.execute(&graph, event).await;
        match &report.outcome {
            RunOutcome::Completed => info!(nodes = report.records.len(), "flow completed"),
            RunOutcome::NoMatchingBranch { node_id, result } => {
                info!(node_id = %node_id, result, "flow stopped: no matching branch")
            }
            RunOutcome::Failed { node_id, error } => {
                warn!(node_id = %node_id, error = %error, "flow failed");
                self.metrics.flow_failures.add(1, &attrs);
            }
        }
        tracing::event!(
            target: "report",
            Level::INFO,
            flow_id = %flow.id,
            entity_id = ?event.entity_id(),
            completed = report.completed(),
            visited = ?report.visited(),
            total_ms = report.total.num_milliseconds(),
            "flow run"
        );

        FlowRunResult {
            flow_id: flow.id.clone(),
            result: Ok(report),
        }
    }
}
