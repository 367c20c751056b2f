use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, Semaphore, mpsc};
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::coalescer::UpdateSink;
use crate::error::{DispatchError, PlatformError, QueueError};
use crate::logger::EngineMetrics;
use crate::rate_limit::RateLimiter;

pub const UPDATE_LEADS: &str = "update_leads";
pub const PUSH_CONTACTS: &str = "push_contacts";

/// A slice of at most `max_batch` entities from one submission.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub id: u64,
    pub request_type: String,
    pub entities: Vec<Value>,
    /// Position of this batch within its submission, from 0.
    pub seq: usize,
    pub of: usize,
}

/// Executes one released batch against the platform.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    /// Returns how many entities the platform accepted.
    async fn handle(&self, batch: &Batch) -> Result<usize, PlatformError>;
}

#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub batch_id: u64,
    pub request_type: String,
    pub size: usize,
    pub released_at: Instant,
    pub finished_at: Instant,
    pub result: Result<usize, PlatformError>,
}

pub type CompletionCallback = Arc<dyn Fn(&BatchOutcome) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueSettings {
    pub requests_per_second: usize,
    pub max_batch: usize,
    pub queue_depth: usize,
    pub max_in_flight: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            requests_per_second: 7,
            max_batch: 200,
            queue_depth: 1000,
            max_in_flight: 7,
        }
    }
}

/// Splits `entities` into consecutive batches of at most `max` items.
pub fn split_batches(entities: Vec<Value>, max: usize) -> Vec<Vec<Value>> {
    let max = max.max(1);
    let mut batches = Vec::with_capacity(entities.len().div_ceil(max));
    let mut rest = entities.into_iter().peekable();
    while rest.peek().is_some() {
        batches.push(rest.by_ref().take(max).collect());
    }
    batches
}

/// Bounded batch queue drained by one dispatcher task. The dispatcher waits
/// for a concurrency permit and a free rate slot before it takes the next
/// batch, then hands the batch to a worker.
pub struct DispatchQueue {
    settings: QueueSettings,
    tx: Mutex<Option<mpsc::Sender<Batch>>>,
    submit_lock: AsyncMutex<()>,
    next_id: AtomicU64,
    tracker: TaskTracker,
    stop: CancellationToken,
    dispatcher: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

struct Dispatcher {
    rx: mpsc::Receiver<Batch>,
    limiter: RateLimiter,
    in_flight: Arc<Semaphore>,
    handler: Arc<dyn BatchHandler>,
    on_complete: Option<CompletionCallback>,
    tracker: TaskTracker,
    stop: CancellationToken,
    metrics: EngineMetrics,
}

impl DispatchQueue {
    pub fn start(
        settings: QueueSettings,
        handler: Arc<dyn BatchHandler>,
        on_complete: Option<CompletionCallback>,
        metrics: EngineMetrics,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(settings.queue_depth.max(1));
        let tracker = TaskTracker::new();
        let stop = CancellationToken::new();
        let dispatcher = Dispatcher {
            rx,
            limiter: RateLimiter::per_second(settings.requests_per_second),
            in_flight: Arc::new(Semaphore::new(settings.max_in_flight.max(1))),
            handler,
            on_complete,
            tracker: tracker.clone(),
            stop: stop.clone(),
            metrics,
        };
        let task = tokio::spawn(dispatcher.run());
        info!(
            rps = settings.requests_per_second,
            max_batch = settings.max_batch,
            queue_depth = settings.queue_depth,
            max_in_flight = settings.max_in_flight,
            "dispatch queue started"
        );
        Arc::new(Self {
            settings,
            tx: Mutex::new(Some(tx)),
            submit_lock: AsyncMutex::new(()),
            next_id: AtomicU64::new(1),
            tracker,
            stop,
            dispatcher: Mutex::new(Some(task)),
        })
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// The dialer takes one contact per call, so each contact push is its own
    /// batch and passes the rate gate alone.
    fn batch_size(&self, request_type: &str) -> usize {
        match request_type {
            PUSH_CONTACTS => 1,
            _ => self.settings.max_batch,
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<Batch>, QueueError> {
        let guard = self.tx.lock().map_err(|_| QueueError::Closed)?;
        guard.clone().ok_or(QueueError::Closed)
    }

    /// Enqueues `entities` as ordered batches. Blocks while the queue is full;
    /// either every batch is enqueued or none is.
    pub async fn submit(
        &self,
        request_type: &str,
        entities: Vec<Value>,
        cancel: &CancellationToken,
    ) -> Result<usize, QueueError> {
        if entities.is_empty() {
            return Ok(0);
        }
        let chunks = split_batches(entities, self.batch_size(request_type));
        let total = chunks.len();
        if total > self.settings.queue_depth {
            return Err(QueueError::CapacityExceeded {
                batches: total,
                capacity: self.settings.queue_depth,
            });
        }
        let tx = self.sender()?;

        let _turn = tokio::select! {
            _ = cancel.cancelled() => return Err(QueueError::Cancelled),
            guard = self.submit_lock.lock() => guard,
        };
        let mut slots = Vec::with_capacity(total);
        for _ in 0..total {
            let slot = tokio::select! {
                _ = cancel.cancelled() => return Err(QueueError::Cancelled),
                slot = tx.reserve() => slot.map_err(|_| QueueError::Closed)?,
            };
            slots.push(slot);
        }

        for (seq, (slot, entities)) in slots.into_iter().zip(chunks).enumerate() {
            let batch = Batch {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                request_type: request_type.to_string(),
                entities,
                seq,
                of: total,
            };
            debug!(batch_id = batch.id, request_type, batch_size = batch.entities.len(), "batch enqueued");
            slot.send(batch);
        }
        Ok(total)
    }

    /// Stops accepting work, lets queued batches drain through the rate gate
    /// and waits for running workers. After `grace` the remaining queued
    /// batches are abandoned; running workers still finish their batch.
    pub async fn shutdown(&self, grace: Duration) -> Result<(), QueueError> {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        let dispatcher = self.dispatcher.lock().ok().and_then(|mut d| d.take());
        let drain = async {
            if let Some(task) = dispatcher {
                let _ = task.await;
            }
            self.tracker.close();
            self.tracker.wait().await;
        };
        match timeout(grace, drain).await {
            Ok(()) => {
                info!("dispatch queue drained");
                Ok(())
            }
            Err(_) => {
                self.stop.cancel();
                self.tracker.close();
                let in_flight = self.tracker.len();
                warn!(in_flight, "dispatch queue shutdown deadline elapsed");
                Err(QueueError::DrainTimeout { in_flight })
            }
        }
    }

    /// Token cancelled when the queue is forced down.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }
}

impl Dispatcher {
    async fn run(mut self) {
        // A batch leaves the channel only once it can be released, so queued
        // work never exceeds the channel capacity.
        let mut held = 0;
        loop {
            let permit = tokio::select! {
                _ = self.stop.cancelled() => break,
                permit = self.in_flight.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            if self.limiter.ready(&self.stop).await.is_err() {
                break;
            }
            let batch = tokio::select! {
                _ = self.stop.cancelled() => break,
                batch = self.rx.recv() => match batch {
                    Some(batch) => batch,
                    None => break,
                },
            };
            if self.limiter.acquire(&self.stop).await.is_err() {
                held = 1;
                break;
            }
            let released_at = Instant::now();
            self.metrics.batches_released.add(1, &[KeyValue::new("request_type", batch.request_type.clone())]);
            debug!(batch_id = batch.id, request_type = %batch.request_type, batch_size = batch.entities.len(), "batch released");

            let handler = self.handler.clone();
            let on_complete = self.on_complete.clone();
            let metrics = self.metrics.clone();
            self.tracker.spawn(async move {
                let result = handler.handle(&batch).await;
                drop(permit);
                let finished_at = Instant::now();
                metrics
                    .batch_latency_ms
                    .record(finished_at.duration_since(released_at).as_secs_f64() * 1_000.0, &[]);
                match &result {
                    Ok(accepted) => info!(
                        batch_id = batch.id,
                        request_type = %batch.request_type,
                        batch_size = batch.entities.len(),
                        accepted,
                        "batch completed"
                    ),
                    Err(err) => {
                        metrics.batch_failures.add(1, &[]);
                        error!(
                            batch_id = batch.id,
                            request_type = %batch.request_type,
                            batch_size = batch.entities.len(),
                            error = %err,
                            "batch failed"
                        );
                    }
                }
                if let Some(callback) = on_complete {
                    callback(&BatchOutcome {
                        batch_id: batch.id,
                        request_type: batch.request_type,
                        size: batch.entities.len(),
                        released_at,
                        finished_at,
                        result,
                    });
                }
            });
        }
        let abandoned = self.rx.len() + held;
        if abandoned > 0 {
            error!(abandoned, "dispatcher stopped with batches still queued");
        }
    }
}

#[async_trait]
impl UpdateSink for DispatchQueue {
    async fn push(&self, chunk: Vec<Value>) -> Result<(), DispatchError> {
        self.submit(UPDATE_LEADS, chunk, &self.stop)
            .await
            .map(|_| ())
            .map_err(DispatchError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Recorder {
        batches: Mutex<Vec<(Instant, Batch)>>,
        work: Duration,
    }

    #[async_trait]
    impl BatchHandler for Recorder {
        async fn handle(&self, batch: &Batch) -> Result<usize, PlatformError> {
            self.batches.lock().unwrap().push((Instant::now(), batch.clone()));
            tokio::time::sleep(self.work).await;
            if batch.request_type == "explode" {
                return Err(PlatformError::Status { status: 500, body: "boom".into() });
            }
            Ok(batch.entities.len())
        }
    }

    fn recorder(work_ms: u64) -> Arc<Recorder> {
        Arc::new(Recorder {
            batches: Mutex::new(Vec::new()),
            work: Duration::from_millis(work_ms),
        })
    }

    fn entities(n: usize) -> Vec<Value> {
        (0..n).map(|i| json!({ "id": i })).collect()
    }

    #[test]
    fn split_preserves_order() {
        let batches = split_batches(entities(450), 200);
        assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![200, 200, 50]);
        assert_eq!(batches[1][0]["id"], 200);
        assert_eq!(batches[2][49]["id"], 449);
        assert!(split_batches(Vec::new(), 200).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn releases_at_configured_rate() {
        let handler = recorder(10);
        let settings = QueueSettings { requests_per_second: 2, max_batch: 1, queue_depth: 100, max_in_flight: 2 };
        let queue = DispatchQueue::start(settings, handler.clone(), None, EngineMetrics::new());
        let started = Instant::now();
        queue.submit("update_leads", entities(6), &CancellationToken::new()).await.unwrap();
        queue.shutdown(Duration::from_secs(30)).await.unwrap();

        let stamps: Vec<Instant> = handler.batches.lock().unwrap().iter().map(|(t, _)| *t).collect();
        assert_eq!(stamps.len(), 6);
        for i in 2..stamps.len() {
            assert!(stamps[i].duration_since(stamps[i - 2]) >= Duration::from_secs(1));
        }
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn contact_pushes_are_released_one_per_batch() {
        let handler = recorder(0);
        let queue = DispatchQueue::start(QueueSettings::default(), handler.clone(), None, EngineMetrics::new());
        let cancel = CancellationToken::new();
        assert_eq!(queue.submit(PUSH_CONTACTS, entities(3), &cancel).await, Ok(3));
        assert_eq!(queue.submit(UPDATE_LEADS, entities(3), &cancel).await, Ok(1));
        queue.shutdown(Duration::from_secs(5)).await.unwrap();

        let batches = handler.batches.lock().unwrap();
        let contacts: Vec<usize> = batches
            .iter()
            .filter(|(_, b)| b.request_type == PUSH_CONTACTS)
            .map(|(_, b)| b.entities.len())
            .collect();
        assert_eq!(contacts, vec![1, 1, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn contact_push_capacity_counts_each_contact() {
        let settings = QueueSettings { requests_per_second: 7, max_batch: 200, queue_depth: 2, max_in_flight: 1 };
        let queue = DispatchQueue::start(settings, recorder(0), None, EngineMetrics::new());
        assert_eq!(
            queue.submit(PUSH_CONTACTS, entities(3), &CancellationToken::new()).await,
            Err(QueueError::CapacityExceeded { batches: 3, capacity: 2 })
        );
        queue.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_dispatcher_leaves_batches_in_the_queue() {
        // busy worker, then a closed rate window
        for (settings, work_ms) in [
            (QueueSettings { requests_per_second: 100, max_batch: 1, queue_depth: 1, max_in_flight: 1 }, 60_000),
            (QueueSettings { requests_per_second: 1, max_batch: 1, queue_depth: 1, max_in_flight: 4 }, 0),
        ] {
            let handler = recorder(work_ms);
            let queue = DispatchQueue::start(settings, handler.clone(), None, EngineMetrics::new());
            let cancel = CancellationToken::new();
            queue.submit("update_leads", entities(1), &cancel).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            queue.submit("update_leads", entities(1), &cancel).await.unwrap();

            let blocked = {
                let queue = queue.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { queue.submit("update_leads", entities(1), &cancel).await })
            };
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(!blocked.is_finished());
            cancel.cancel();
            assert_eq!(blocked.await.unwrap(), Err(QueueError::Cancelled));
            assert_eq!(handler.batches.lock().unwrap().len(), 1);
            queue.stop_token().cancel();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failures_reach_callback_and_queue_keeps_going() {
        let handler = recorder(0);
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink = outcomes.clone();
        let callback: CompletionCallback = Arc::new(move |o: &BatchOutcome| {
            sink.lock().unwrap().push((o.request_type.clone(), o.result.is_ok()));
        });
        let queue = DispatchQueue::start(QueueSettings::default(), handler, Some(callback), EngineMetrics::new());
        let cancel = CancellationToken::new();
        queue.submit("explode", entities(1), &cancel).await.unwrap();
        queue.submit("update_leads", entities(1), &cancel).await.unwrap();
        queue.shutdown(Duration::from_secs(5)).await.unwrap();

        let mut seen = outcomes.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec![("explode".to_string(), false), ("update_leads".to_string(), true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_and_closed_errors() {
        let settings = QueueSettings { requests_per_second: 7, max_batch: 10, queue_depth: 2, max_in_flight: 1 };
        let queue = DispatchQueue::start(settings, recorder(0), None, EngineMetrics::new());
        let cancel = CancellationToken::new();
        assert_eq!(
            queue.submit("update_leads", entities(25), &cancel).await,
            Err(QueueError::CapacityExceeded { batches: 3, capacity: 2 })
        );
        queue.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(queue.submit("update_leads", entities(1), &cancel).await, Err(QueueError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_submit_is_cancellable_without_partial_enqueue() {
        let handler = recorder(60_000);
        let settings = QueueSettings { requests_per_second: 100, max_batch: 1, queue_depth: 2, max_in_flight: 1 };
        let queue = DispatchQueue::start(settings, handler.clone(), None, EngineMetrics::new());
        let cancel = CancellationToken::new();
        // one batch running, two waiting fill the queue
        queue.submit("update_leads", entities(1), &cancel).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.submit("update_leads", entities(2), &cancel).await.unwrap();

        let blocked = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.submit("update_leads", entities(2), &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        assert_eq!(blocked.await.unwrap(), Err(QueueError::Cancelled));
        assert_eq!(handler.batches.lock().unwrap().len(), 1);
    }
}
