//! Flow definitions, their validated graph form, and the engine that walks
//! them for each incoming lead event.

pub mod executor;
pub mod graph;
pub mod manager;
pub mod model;
pub mod store;

pub use executor::{ExecutionReport, FlowExecutor, NodeRecord, RunOutcome, StepOutput};
pub use graph::{FlowGraph, FlowStep, StepKind};
pub use manager::{FlowManager, FlowRunResult};
pub use model::{ActionSpec, Branch, FlowConfig, FlowDefinition, FlowEdge, FlowNode, NodeKind, Position};
pub use store::{DirFlowStore, FlowStore, InMemoryFlowStore, load_flow_from_file};
