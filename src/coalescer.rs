use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leadflow_bus::EntityId;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tracing::{debug, error, info, warn};

use crate::error::{CoalescerError, DispatchError};
use crate::logger::EngineMetrics;

/// Accumulated update for one lead since the last flush.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingUpdate {
    pub entity_id: EntityId,
    pub fields: BTreeMap<String, Value>,
    pub status_id: Option<i64>,
    pub pipeline_id: Option<i64>,
    pub last_received_at: DateTime<Utc>,
}

impl PendingUpdate {
    pub fn new(entity_id: EntityId) -> Self {
        Self {
            entity_id,
            fields: BTreeMap::new(),
            status_id: None,
            pipeline_id: None,
            last_received_at: Utc::now(),
        }
    }

    pub fn with_field(mut self, field_id: impl Into<String>, value: Value) -> Self {
        self.fields.insert(field_id.into(), value);
        self
    }

    /// Non-positive ids mean "not specified".
    pub fn with_status(mut self, status_id: i64) -> Self {
        self.status_id = Some(status_id).filter(|id| *id > 0);
        self
    }

    pub fn with_pipeline(mut self, pipeline_id: i64) -> Self {
        self.pipeline_id = Some(pipeline_id).filter(|id| *id > 0);
        self
    }

    /// Folds a newer update into this one. Fields overwrite key by key;
    /// status and pipeline only when the newer update carries them.
    pub fn merge(&mut self, newer: PendingUpdate) {
        self.fields.extend(newer.fields);
        if newer.status_id.is_some() {
            self.status_id = newer.status_id;
        }
        if newer.pipeline_id.is_some() {
            self.pipeline_id = newer.pipeline_id;
        }
        self.last_received_at = self.last_received_at.max(newer.last_received_at);
    }

    /// Body of one entity in a CRM bulk lead update.
    pub fn to_platform_json(&self) -> Value {
        let mut lead = json!({ "id": self.entity_id });
        if let Some(status) = self.status_id {
            lead["status_id"] = status.into();
        }
        if let Some(pipeline) = self.pipeline_id {
            lead["pipeline_id"] = pipeline.into();
        }
        if !self.fields.is_empty() {
            let values: Vec<Value> = self
                .fields
                .iter()
                .map(|(id, value)| {
                    let field_id = id
                        .trim_start_matches("field_")
                        .parse::<i64>()
                        .map(Value::from)
                        .unwrap_or_else(|_| Value::String(id.clone()));
                    json!({ "field_id": field_id, "values": [{ "value": value }] })
                })
                .collect();
            lead["custom_fields_values"] = Value::Array(values);
        }
        lead["updated_at"] = self.last_received_at.timestamp().into();
        lead
    }
}

/// Where merged updates go once flushed.
#[async_trait]
pub trait UpdateSink: Send + Sync {
    async fn push(&self, chunk: Vec<Value>) -> Result<(), DispatchError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoalescerSettings {
    pub window: Duration,
    pub flush_size: usize,
    pub max_batch: usize,
}

impl Default for CoalescerSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(2),
            flush_size: 100,
            max_batch: 200,
        }
    }
}

/// Result of draining the pending set once.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushReport {
    pub entity_ids: Vec<EntityId>,
    pub chunks: usize,
    pub failed_chunks: usize,
}

impl FlushReport {
    pub fn flushed(&self) -> usize {
        self.entity_ids.len()
    }

    pub fn is_partial_failure(&self) -> bool {
        self.failed_chunks > 0
    }

    fn absorb(&mut self, other: FlushReport) {
        self.entity_ids.extend(other.entity_ids);
        self.chunks += other.chunks;
        self.failed_chunks += other.failed_chunks;
    }
}

enum Command {
    Add(PendingUpdate),
    Flush(oneshot::Sender<FlushReport>),
    Pending(oneshot::Sender<usize>),
    Shutdown(oneshot::Sender<FlushReport>),
}

/// Cheap handle to a running lead batch processor.
#[derive(Clone, Debug)]
pub struct LeadBatchHandle {
    tx: mpsc::Sender<Command>,
}

impl LeadBatchHandle {
    pub async fn add(&self, update: PendingUpdate) -> Result<(), CoalescerError> {
        self.tx
            .send(Command::Add(update))
            .await
            .map_err(|_| CoalescerError::Closed)
    }

    /// Flushes everything added before this call.
    pub async fn flush(&self) -> Result<FlushReport, CoalescerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(reply))
            .await
            .map_err(|_| CoalescerError::Closed)?;
        rx.await.map_err(|_| CoalescerError::Closed)
    }

    pub async fn pending(&self) -> Result<usize, CoalescerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Pending(reply))
            .await
            .map_err(|_| CoalescerError::Closed)?;
        rx.await.map_err(|_| CoalescerError::Closed)
    }

    /// Stops the processor after a final flush, waiting at most `grace`.
    pub async fn shutdown(&self, grace: Duration) -> Result<FlushReport, CoalescerError> {
        let (reply, rx) = oneshot::channel();
        let request = async {
            self.tx
                .send(Command::Shutdown(reply))
                .await
                .map_err(|_| CoalescerError::Closed)?;
            rx.await.map_err(|_| CoalescerError::Closed)
        };
        timeout(grace, request)
            .await
            .map_err(|_| CoalescerError::ShutdownTimeout)?
    }
}

/// Actor owning the pending set. Every mutation arrives as a command on one
/// channel, so a drain is atomic with respect to concurrent adds.
pub struct LeadBatchProcessor {
    settings: CoalescerSettings,
    sink: Arc<dyn UpdateSink>,
    metrics: EngineMetrics,
    pending: HashMap<EntityId, PendingUpdate>,
}

impl LeadBatchProcessor {
    pub fn spawn(
        settings: CoalescerSettings,
        sink: Arc<dyn UpdateSink>,
        metrics: EngineMetrics,
    ) -> (LeadBatchHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(1024);
        let processor = LeadBatchProcessor {
            settings,
            sink,
            metrics,
            pending: HashMap::new(),
        };
        let handle = tokio::spawn(processor.run(rx));
        (LeadBatchHandle { tx }, handle)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let window = self.settings.window.max(Duration::from_millis(1));
        let mut ticker = interval_at(Instant::now() + window, window);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(window_ms = window.as_millis() as u64, flush_size = self.settings.flush_size, "lead batch processor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.pending.is_empty() {
                        self.flush("interval").await;
                    }
                }
                cmd = rx.recv() => match cmd {
                    Some(Command::Add(update)) => {
                        self.add(update);
                        if self.pending.len() >= self.settings.flush_size.max(1) {
                            self.flush("size").await;
                        }
                    }
                    Some(Command::Flush(reply)) => {
                        let report = self.flush("explicit").await;
                        let _ = reply.send(report);
                    }
                    Some(Command::Pending(reply)) => {
                        let _ = reply.send(self.pending.len());
                    }
                    Some(Command::Shutdown(reply)) => {
                        let report = self.finish(&mut rx).await;
                        let _ = reply.send(report);
                        break;
                    }
                    None => {
                        self.flush("closed").await;
                        break;
                    }
                }
            }
        }
        info!("lead batch processor stopped");
    }

    fn add(&mut self, update: PendingUpdate) {
        self.metrics.updates_coalesced.add(1, &[]);
        match self.pending.entry(update.entity_id) {
            Entry::Occupied(mut existing) => existing.get_mut().merge(update),
            Entry::Vacant(slot) => {
                slot.insert(update);
            }
        }
    }

    /// Takes commands already queued behind the shutdown request, then
    /// flushes once more so nothing accepted is lost.
    async fn finish(&mut self, rx: &mut mpsc::Receiver<Command>) -> FlushReport {
        rx.close();
        let mut report = self.flush("shutdown").await;
        let mut waiting = Vec::new();
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Add(update) => self.add(update),
                Command::Flush(reply) | Command::Shutdown(reply) => waiting.push(reply),
                Command::Pending(reply) => {
                    let _ = reply.send(self.pending.len());
                }
            }
        }
        report.absorb(self.flush("shutdown").await);
        for reply in waiting {
            let _ = reply.send(FlushReport::default());
        }
        report
    }

    async fn flush(&mut self, trigger: &'static str) -> FlushReport {
        let drained = std::mem::take(&mut self.pending);
        if drained.is_empty() {
            return FlushReport::default();
        }
        let mut updates: Vec<PendingUpdate> = drained.into_values().collect();
        updates.sort_by_key(|u| u.entity_id);

        let mut report = FlushReport {
            entity_ids: updates.iter().map(|u| u.entity_id).collect(),
            ..FlushReport::default()
        };
        for chunk in updates.chunks(self.settings.max_batch.max(1)) {
            report.chunks += 1;
            let body: Vec<Value> = chunk.iter().map(PendingUpdate::to_platform_json).collect();
            if let Err(err) = self.sink.push(body).await {
                report.failed_chunks += 1;
                error!(
                    error = %err,
                    first_entity = chunk.first().map(|u| u.entity_id),
                    size = chunk.len(),
                    "failed to push lead update chunk"
                );
            }
        }
        self.metrics.coalescer_flushes.add(1, &[]);
        if report.is_partial_failure() {
            warn!(trigger, flushed = report.flushed(), failed_chunks = report.failed_chunks, "lead updates flushed with failures");
        } else {
            debug!(trigger, flushed = report.flushed(), chunks = report.chunks, "lead updates flushed");
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingSink {
        chunks: Mutex<Vec<Vec<Value>>>,
        fail_first: AtomicUsize,
    }

    #[async_trait]
    impl UpdateSink for RecordingSink {
        async fn push(&self, chunk: Vec<Value>) -> Result<(), DispatchError> {
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(DispatchError::Coalescer(CoalescerError::Closed));
            }
            self.chunks.lock().unwrap().push(chunk);
            Ok(())
        }
    }

    impl RecordingSink {
        fn ids(&self) -> Vec<i64> {
            self.chunks
                .lock()
                .unwrap()
                .iter()
                .flatten()
                .map(|v| v["id"].as_i64().unwrap())
                .collect()
        }
    }

    fn settings(window_ms: u64, flush_size: usize, max_batch: usize) -> CoalescerSettings {
        CoalescerSettings {
            window: Duration::from_millis(window_ms),
            flush_size,
            max_batch,
        }
    }

    #[test]
    fn merge_is_non_destructive() {
        let mut first = PendingUpdate::new(1)
            .with_field("A", json!("a1"))
            .with_field("B", json!("b1"))
            .with_status(10)
            .with_pipeline(3);
        let second = PendingUpdate::new(1).with_field("A", json!("a2")).with_status(0);
        first.merge(second);

        assert_eq!(first.fields["A"], json!("a2"));
        assert_eq!(first.fields["B"], json!("b1"));
        assert_eq!(first.status_id, Some(10));
        assert_eq!(first.pipeline_id, Some(3));

        first.merge(PendingUpdate::new(1).with_status(11));
        assert_eq!(first.status_id, Some(11));
    }

    #[test]
    fn platform_json_shape() {
        let update = PendingUpdate::new(5)
            .with_field("field_77", json!("gold"))
            .with_status(3);
        let body = update.to_platform_json();
        assert_eq!(body["id"], 5);
        assert_eq!(body["status_id"], 3);
        assert!(body.get("pipeline_id").is_none());
        assert_eq!(body["custom_fields_values"][0]["field_id"], 77);
        assert_eq!(body["custom_fields_values"][0]["values"][0]["value"], "gold");
    }

    #[tokio::test]
    async fn explicit_flush_merges_and_drains() {
        let sink = Arc::new(RecordingSink::default());
        let (handle, _task) = LeadBatchProcessor::spawn(settings(60_000, 100, 200), sink.clone(), EngineMetrics::new());

        handle.add(PendingUpdate::new(1).with_field("A", json!(1))).await.unwrap();
        handle.add(PendingUpdate::new(2).with_field("A", json!(2))).await.unwrap();
        handle.add(PendingUpdate::new(1).with_field("B", json!(3))).await.unwrap();
        assert_eq!(handle.pending().await.unwrap(), 2);

        let report = handle.flush().await.unwrap();
        assert_eq!(report.entity_ids, vec![1, 2]);
        assert_eq!(handle.pending().await.unwrap(), 0);

        let chunks = sink.chunks.lock().unwrap().clone();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0][0]["custom_fields_values"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn size_threshold_triggers_flush() {
        let sink = Arc::new(RecordingSink::default());
        let (handle, _task) = LeadBatchProcessor::spawn(settings(60_000, 3, 2), sink.clone(), EngineMetrics::new());
        for id in 1..=3 {
            handle.add(PendingUpdate::new(id)).await.unwrap();
        }
        assert_eq!(handle.pending().await.unwrap(), 0);
        let chunks = sink.chunks.lock().unwrap().clone();
        assert_eq!(chunks.iter().map(Vec::len).collect::<Vec<_>>(), vec![2, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_flushes_pending_updates() {
        let sink = Arc::new(RecordingSink::default());
        let (handle, _task) = LeadBatchProcessor::spawn(settings(2_000, 100, 200), sink.clone(), EngineMetrics::new());
        handle.add(PendingUpdate::new(7)).await.unwrap();
        assert_eq!(handle.pending().await.unwrap(), 1);

        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert_eq!(handle.pending().await.unwrap(), 0);
        assert_eq!(sink.ids(), vec![7]);
    }

    #[tokio::test]
    async fn chunk_failure_is_partial() {
        let sink = Arc::new(RecordingSink::default());
        sink.fail_first.store(1, Ordering::SeqCst);
        let (handle, _task) = LeadBatchProcessor::spawn(settings(60_000, 100, 2), sink.clone(), EngineMetrics::new());
        for id in 1..=5 {
            handle.add(PendingUpdate::new(id)).await.unwrap();
        }
        let report = handle.flush().await.unwrap();
        assert_eq!(report.chunks, 3);
        assert_eq!(report.failed_chunks, 1);
        assert!(report.is_partial_failure());
        assert_eq!(sink.ids(), vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn shutdown_flushes_everything() {
        let sink = Arc::new(RecordingSink::default());
        let (handle, task) = LeadBatchProcessor::spawn(settings(60_000, 100, 200), sink.clone(), EngineMetrics::new());
        for id in 1..=10 {
            handle.add(PendingUpdate::new(id)).await.unwrap();
        }
        let report = handle.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(report.flushed(), 10);
        task.await.unwrap();
        assert_eq!(handle.add(PendingUpdate::new(11)).await, Err(CoalescerError::Closed));
        assert_eq!(sink.ids().len(), 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_adds_are_never_lost() {
        let sink = Arc::new(RecordingSink::default());
        let (handle, _task) = LeadBatchProcessor::spawn(settings(5, 50, 200), sink.clone(), EngineMetrics::new());

        let mut writers = Vec::new();
        for w in 0..8i64 {
            let handle = handle.clone();
            writers.push(tokio::spawn(async move {
                for i in 0..250i64 {
                    handle.add(PendingUpdate::new(w * 1_000 + i)).await.unwrap();
                    if i % 50 == 0 {
                        handle.flush().await.unwrap();
                    }
                }
            }));
        }
        for w in writers {
            w.await.unwrap();
        }
        handle.flush().await.unwrap();

        let mut ids = sink.ids();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 8 * 250);
    }
}
