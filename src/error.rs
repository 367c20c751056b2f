use leadflow_bus::BusError;
use thiserror::Error;

use crate::action::ActionType;

/// A flow definition that cannot be executed. Fatal for that flow only.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("flow has no start node")]
    MissingStart,

    #[error("flow has more than one start node: {0:?}")]
    MultipleStarts(Vec<String>),

    #[error("duplicate node id `{0}`")]
    DuplicateNode(String),

    #[error("node `{0}` has an unknown type")]
    UnknownNodeType(String),

    #[error("edge `{edge_id}` references missing node `{node_id}`")]
    DanglingEdge { edge_id: String, node_id: String },

    #[error("flow contains a cycle through node `{0}`")]
    Cycle(String),
}

/// Raised by the action dispatcher. Aborts the current flow run.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ActionError {
    #[error("unsupported action type `{0}`")]
    UnsupportedAction(String),

    #[error("action `{0}` needs a lead_id in the event")]
    MissingEntityId(ActionType),

    #[error("action `{action}` has an invalid parameter `{parameter}`: {reason}")]
    InvalidParameter {
        action: ActionType,
        parameter: String,
        reason: String,
    },

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Failure handing work to a downstream collaborator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("publish failed: {0}")]
    Publish(#[from] BusError),

    #[error("lead batch processor rejected update: {0}")]
    Coalescer(#[from] CoalescerError),

    #[error("dispatch queue rejected entities: {0}")]
    Queue(#[from] QueueError),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueueError {
    #[error("submission cancelled")]
    Cancelled,

    #[error("dispatch queue is closed")]
    Closed,

    #[error("{batches} batches exceed the queue capacity of {capacity}")]
    CapacityExceeded { batches: usize, capacity: usize },

    #[error("shutdown deadline elapsed with {in_flight} batches still running")]
    DrainTimeout { in_flight: usize },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoalescerError {
    #[error("lead batch processor is closed")]
    Closed,

    #[error("shutdown flush did not finish within the deadline")]
    ShutdownTimeout,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlatformError {
    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("no handler for request type `{0}`")]
    UnsupportedRequest(String),
}

impl From<reqwest::Error> for PlatformError {
    fn from(err: reqwest::Error) -> Self {
        PlatformError::Http(err.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("config key {key}={value:?} is invalid: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("could not read {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("could not parse {path}: {reason}")]
    Format { path: String, reason: String },

    #[error("flow file {path} is not a valid flow: {source}")]
    Invalid {
        path: String,
        #[source]
        source: GraphError,
    },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EventError {
    #[error("event payload must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("event payload is not valid JSON: {0}")]
    Json(String),
}
