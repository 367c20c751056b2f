use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::error::StoreError;
use crate::watcher::{DirectoryWatcher, WatchedType, has_extension};

use super::graph::FlowGraph;
use super::model::FlowDefinition;

pub const FLOW_EXTENSIONS: &[&str] = &["json", "yaml", "yml"];

/// Where flow definitions come from.
#[async_trait]
pub trait FlowStore: Send + Sync {
    async fn list_active_flows(&self) -> Result<Vec<FlowDefinition>, StoreError>;

    async fn get_flow(&self, id: &str) -> Result<Option<FlowDefinition>, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryFlowStore {
    flows: DashMap<String, FlowDefinition>,
}

impl InMemoryFlowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, flow: FlowDefinition) -> Option<FlowDefinition> {
        info!(flow_id = %flow.id, active = flow.is_active, "Registered flow");
        self.flows.insert(flow.id.clone(), flow)
    }

    pub fn remove(&self, id: &str) -> Option<FlowDefinition> {
        self.flows.remove(id).map(|(_, flow)| flow)
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

#[async_trait]
impl FlowStore for InMemoryFlowStore {
    async fn list_active_flows(&self) -> Result<Vec<FlowDefinition>, StoreError> {
        let mut active: Vec<FlowDefinition> = self
            .flows
            .iter()
            .filter(|entry| entry.is_active)
            .map(|entry| entry.value().clone())
            .collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(active)
    }

    async fn get_flow(&self, id: &str) -> Result<Option<FlowDefinition>, StoreError> {
        Ok(self.flows.get(id).map(|entry| entry.value().clone()))
    }
}

/// Reads a flow definition from a `.json`, `.yaml` or `.yml` file. A bare
/// `{nodes, edges}` document is accepted too; a missing `id` defaults to the
/// file stem. The graph is validated before the definition is returned.
pub fn load_flow_from_file(path: &Path) -> Result<FlowDefinition, StoreError> {
    let shown = path.display().to_string();
    let format_err = |reason: String| StoreError::Format {
        path: shown.clone(),
        reason,
    };
    let contents = fs::read_to_string(path).map_err(|e| StoreError::Io {
        path: shown.clone(),
        reason: e.to_string(),
    })?;
    let ext = path
        .extension()
        .and_then(|os| os.to_str())
        .unwrap_or_default()
        .to_lowercase();

    let mut value: Value = match ext.as_str() {
        "json" => serde_json::from_str(&contents).map_err(|e| format_err(format!("JSON parse error: {e}")))?,
        "yaml" | "yml" => {
            serde_yaml_bw::from_str(&contents).map_err(|e| format_err(format!("YAML parse error: {e}")))?
        }
        other => {
            return Err(format_err(format!(
                "unsupported extension `{other}` (expected .json, .yaml or .yml)"
            )));
        }
    };

    if let Value::Object(obj) = &mut value {
        let has_graph = ["graph", "flowData", "flow_data"].iter().any(|k| obj.contains_key(*k));
        if !has_graph && obj.contains_key("nodes") {
            let nodes = obj.remove("nodes").unwrap_or_else(|| json!([]));
            let edges = obj.remove("edges").unwrap_or_else(|| json!([]));
            obj.insert("graph".into(), json!({ "nodes": nodes, "edges": edges }));
        }
        if !obj.contains_key("id") {
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            obj.insert("id".into(), Value::String(stem));
        }
    }

    let flow: FlowDefinition =
        serde_json::from_value(value).map_err(|e| format_err(format!("not a flow definition: {e}")))?;
    FlowGraph::build(&flow.graph).map_err(|source| StoreError::Invalid {
        path: shown.clone(),
        source,
    })?;
    Ok(flow)
}

/// Keeps the in-memory store in step with the files on disk.
struct FlowFiles {
    flows: Arc<InMemoryFlowStore>,
    by_path: DashMap<PathBuf, String>,
}

impl FlowFiles {
    fn load(&self, path: &Path) -> Result<String, StoreError> {
        let flow = load_flow_from_file(path)?;
        let id = flow.id.clone();
        if let Some(previous) = self.by_path.insert(path.to_path_buf(), id.clone()) {
            if previous != id {
                self.flows.remove(&previous);
            }
        }
        self.flows.insert(flow);
        Ok(id)
    }

    fn forget(&self, path: &Path) -> Option<String> {
        let (_, id) = self.by_path.remove(path)?;
        self.flows.remove(&id);
        info!(flow_id = %id, path = %path.display(), "Unregistered flow");
        Some(id)
    }
}

#[async_trait]
impl WatchedType for FlowFiles {
    fn is_relevant(&self, path: &Path) -> bool {
        has_extension(path, FLOW_EXTENSIONS)
    }

    async fn on_create_or_modify(&self, path: &Path) -> anyhow::Result<()> {
        self.load(path)?;
        Ok(())
    }

    async fn on_remove(&self, path: &Path) -> anyhow::Result<()> {
        self.forget(path);
        Ok(())
    }
}

/// Flow definitions loaded from a directory, optionally hot-reloaded.
pub struct DirFlowStore {
    dir: PathBuf,
    files: Arc<FlowFiles>,
    watcher: Mutex<Option<DirectoryWatcher>>,
}

impl DirFlowStore {
    /// Loads every flow file in `dir` once. Invalid files are logged and
    /// skipped.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        let store = Self::empty(dir.clone());
        let entries = fs::read_dir(&dir).map_err(|e| StoreError::Io {
            path: dir.display().to_string(),
            reason: e.to_string(),
        })?;
        for entry in entries.flatten() {
            let path = entry.path();
            if store.files.is_relevant(&path) {
                if let Err(err) = store.files.load(&path) {
                    warn!(error = %err, "skipping flow file");
                }
            }
        }
        Ok(store)
    }

    /// Like [`DirFlowStore::open`], then keeps watching `dir` for changes.
    pub async fn watch(dir: impl Into<PathBuf>, poll_interval: Duration) -> Result<Self, StoreError> {
        let dir = dir.into();
        let store = Self::empty(dir.clone());
        let watched: Arc<dyn WatchedType> = store.files.clone();
        let watcher = DirectoryWatcher::new(dir.clone(), watched, true, true, poll_interval)
            .await
            .map_err(|e| StoreError::Io {
                path: dir.display().to_string(),
                reason: e.to_string(),
            })?;
        if let Ok(mut slot) = store.watcher.lock() {
            *slot = Some(watcher);
        }
        Ok(store)
    }

    fn empty(dir: PathBuf) -> Self {
        Self {
            dir,
            files: Arc::new(FlowFiles {
                flows: Arc::new(InMemoryFlowStore::new()),
                by_path: DashMap::new(),
            }),
            watcher: Mutex::new(None),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.files.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.flows.is_empty()
    }

    pub fn shutdown(&self) {
        if let Some(watcher) = self.watcher.lock().ok().and_then(|mut w| w.take()) {
            watcher.shutdown();
        }
    }
}

#[async_trait]
impl FlowStore for DirFlowStore {
    async fn list_active_flows(&self) -> Result<Vec<FlowDefinition>, StoreError> {
        self.files.flows.list_active_flows().await
    }

    async fn get_flow(&self, id: &str) -> Result<Option<FlowDefinition>, StoreError> {
        self.files.flows.get_flow(id).await
    }
}
