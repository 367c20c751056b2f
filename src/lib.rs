//! Lead workflow engine: evaluates CRM lead events against user-defined flow
//! graphs and dispatches the resulting actions to the dialer and the CRM
//! under a shared request-rate ceiling.

pub mod action;
pub mod coalescer;
pub mod condition;
pub mod config;
pub mod error;
pub mod event;
pub mod flow;
pub mod logger;
pub mod platform;
pub mod queue;
pub mod rate_limit;
pub mod schema;
pub mod service;
pub mod watcher;
