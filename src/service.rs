use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use leadflow_bus::{Envelope, LeadEventKind, MessageBus, OutboundMessage, QueueRequest, Subscription};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::action::{ActionDispatcher, ActionType};
use crate::coalescer::{LeadBatchHandle, LeadBatchProcessor, UpdateSink};
use crate::config::Settings;
use crate::event::InputEvent;
use crate::flow::{FlowExecutor, FlowManager, FlowStore};
use crate::logger::EngineMetrics;
use crate::queue::{BatchHandler, CompletionCallback, DispatchQueue, PUSH_CONTACTS};

/// Subject carrying bulk requests for the dispatch queue.
pub const QUEUE_SUBJECT: &str = "queue.crm.>";

/// The running engine: bus subscriptions feeding the flow manager and the
/// dispatch queue, plus the lead batch processor in between.
pub struct LeadflowService {
    manager: FlowManager,
    queue: Arc<DispatchQueue>,
    coalescer: LeadBatchHandle,
    coalescer_task: JoinHandle<()>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl LeadflowService {
    /// Wires everything together and starts listening on the bus.
    pub async fn start(
        bus: Arc<dyn MessageBus>,
        store: Arc<dyn FlowStore>,
        handler: Arc<dyn BatchHandler>,
        settings: &Settings,
        on_complete: Option<CompletionCallback>,
        metrics: EngineMetrics,
    ) -> Result<Self> {
        let queue = DispatchQueue::start(settings.queue, handler, on_complete, metrics.clone());
        let sink: Arc<dyn UpdateSink> = queue.clone();
        let (coalescer, coalescer_task) =
            LeadBatchProcessor::spawn(settings.coalescer, sink, metrics.clone());

        let dispatcher = ActionDispatcher::new(bus.clone())
            .with_lead_batcher(coalescer.clone())
            .with_metrics(metrics.clone());
        let manager = FlowManager::new(store, FlowExecutor::new(dispatcher)).with_metrics(metrics);

        let service = Self {
            manager,
            queue,
            coalescer,
            coalescer_task,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        };

        let events = subscribe(bus.as_ref(), &LeadEventKind::any_subject()).await?;
        service.tasks.spawn(event_loop(
            events,
            service.manager.clone(),
            service.tasks.clone(),
            service.cancel.clone(),
        ));

        let requests = subscribe(bus.as_ref(), QUEUE_SUBJECT).await?;
        service
            .tasks
            .spawn(queue_loop(requests, service.queue.clone(), service.cancel.clone()));

        for action in [ActionType::SendToDialer, ActionType::AddToBucket] {
            let subject = leadflow_bus::message::dispatch_subject(action.as_ref());
            let contacts = subscribe(bus.as_ref(), &subject).await?;
            service
                .tasks
                .spawn(contact_loop(contacts, service.queue.clone(), service.cancel.clone()));
        }

        info!(bus = bus.name(), "leadflow service started");
        Ok(service)
    }

    pub fn manager(&self) -> &FlowManager {
        &self.manager
    }

    pub fn queue(&self) -> &Arc<DispatchQueue> {
        &self.queue
    }

    pub fn coalescer(&self) -> &LeadBatchHandle {
        &self.coalescer
    }

    /// Stops the subscriptions, lets running flows finish, flushes pending
    /// lead updates and drains the dispatch queue, all within `grace`.
    pub async fn shutdown(self, grace: Duration) -> Result<()> {
        let deadline = Instant::now() + grace;
        let remaining = || deadline.saturating_duration_since(Instant::now());

        self.cancel.cancel();
        self.tasks.close();
        if timeout(remaining(), self.tasks.wait()).await.is_err() {
            warn!(running = self.tasks.len(), "flow runs still active at shutdown");
        }

        let mut failures = Vec::new();
        match self.coalescer.shutdown(remaining()).await {
            Ok(report) => info!(
                flushed = report.flushed(),
                failed_chunks = report.failed_chunks,
                "lead updates flushed"
            ),
            Err(err) => failures.push(format!("coalescer: {err}")),
        }
        if timeout(remaining(), self.coalescer_task).await.is_err() {
            warn!("lead batch processor did not stop in time");
        }
        if let Err(err) = self.queue.shutdown(remaining()).await {
            failures.push(format!("dispatch queue: {err}"));
        }

        if failures.is_empty() {
            info!("leadflow service stopped");
            Ok(())
        } else {
            error!(?failures, "unclean shutdown");
            bail!("unclean shutdown: {}", failures.join("; "))
        }
    }
}

async fn subscribe(bus: &dyn MessageBus, subject: &str) -> Result<Subscription> {
    bus.subscribe(subject)
        .await
        .with_context(|| format!("subscribing to {subject}"))
}

async fn next(rx: &mut Subscription, cancel: &CancellationToken) -> Option<Envelope> {
    tokio::select! {
        _ = cancel.cancelled() => None,
        msg = rx.recv() => msg,
    }
}

fn decode_event(envelope: &Envelope) -> Option<InputEvent> {
    let event = match InputEvent::from_slice(&envelope.payload) {
        Ok(event) => event,
        Err(err) => {
            warn!(subject = %envelope.subject, error = %err, "dropping undecodable lead event");
            return None;
        }
    };
    match LeadEventKind::from_subject(&envelope.subject) {
        Some(kind) if event.get("event_type").is_none() => Some(event.with("event_type", kind.as_ref())),
        _ => Some(event),
    }
}

async fn event_loop(
    mut rx: Subscription,
    manager: FlowManager,
    tasks: TaskTracker,
    cancel: CancellationToken,
) {
    while let Some(envelope) = next(&mut rx, &cancel).await {
        let Some(event) = decode_event(&envelope) else {
            continue;
        };
        let manager = manager.clone();
        tasks.spawn(async move {
            if let Err(err) = manager.process_event(&event).await {
                error!(error = %err, "could not load flows for event");
            }
        });
    }
    debug!("lead event loop stopped");
}

async fn queue_loop(mut rx: Subscription, queue: Arc<DispatchQueue>, cancel: CancellationToken) {
    while let Some(envelope) = next(&mut rx, &cancel).await {
        let request: QueueRequest = match envelope.json() {
            Ok(request) => request,
            Err(err) => {
                warn!(subject = %envelope.subject, error = %err, "dropping malformed queue request");
                continue;
            }
        };
        let size = request.entities.len();
        match queue.submit(&request.request_type, request.entities, &cancel).await {
            Ok(batches) => debug!(request_type = %request.request_type, size, batches, "queue request accepted"),
            Err(err) => error!(request_type = %request.request_type, size, error = %err, "queue request rejected"),
        }
    }
    debug!("queue request loop stopped");
}

/// Collects dialer-bound contacts into `push_contacts` submissions. Messages
/// already waiting on the subscription are grouped into one submission. Each
/// contact takes its own queue slot, so a group never exceeds the queue depth.
async fn contact_loop(mut rx: Subscription, queue: Arc<DispatchQueue>, cancel: CancellationToken) {
    let settings = queue.settings();
    let max = settings.max_batch.min(settings.queue_depth).max(1);
    while let Some(first) = next(&mut rx, &cancel).await {
        let mut contacts = Vec::new();
        push_contact(&first, &mut contacts);
        while contacts.len() < max {
            match rx.try_recv() {
                Ok(envelope) => push_contact(&envelope, &mut contacts),
                Err(_) => break,
            }
        }
        if contacts.is_empty() {
            continue;
        }
        let size = contacts.len();
        if let Err(err) = queue.submit(PUSH_CONTACTS, contacts, &cancel).await {
            error!(size, error = %err, "could not queue dialer contacts");
        }
    }
    debug!("dialer contact loop stopped");
}

fn push_contact(envelope: &Envelope, contacts: &mut Vec<Value>) {
    match envelope.json::<OutboundMessage>() {
        Ok(message) => contacts.push(message.parameters),
        Err(err) => warn!(subject = %envelope.subject, error = %err, "dropping malformed dispatch message"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PlatformError;
    use crate::flow::InMemoryFlowStore;
    use crate::queue::Batch;
    use leadflow_bus::InMemoryBus;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        batches: Mutex<Vec<Batch>>,
    }

    #[async_trait::async_trait]
    impl BatchHandler for Recorder {
        async fn handle(&self, batch: &Batch) -> Result<usize, PlatformError> {
            self.batches.lock().unwrap().push(batch.clone());
            Ok(batch.entities.len())
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn routes_queue_requests_and_dialer_messages() {
        let bus = Arc::new(InMemoryBus::new());
        let dyn_bus: Arc<dyn MessageBus> = bus.clone();
        let recorder = Arc::new(Recorder::default());
        let settings = Settings::default();
        let service = LeadflowService::start(
            dyn_bus.clone(),
            Arc::new(InMemoryFlowStore::new()),
            recorder.clone(),
            &settings,
            None,
            EngineMetrics::new(),
        )
        .await
        .unwrap();

        let request = QueueRequest {
            request_type: "update_leads".into(),
            entities: vec![json!({"id": 1}), json!({"id": 2})],
        };
        dyn_bus.publish_json(&request.subject(), &request).await.unwrap();
        let message = OutboundMessage::new(
            "send_to_dialer",
            vec![],
            json!({"bucket_id": "B", "contact": {"phone": "+1"}}),
        );
        dyn_bus.publish_json(&message.subject(), &message).await.unwrap();
        settle().await;

        service.shutdown(Duration::from_secs(5)).await.unwrap();
        let mut kinds: Vec<(String, usize)> = recorder
            .batches
            .lock()
            .unwrap()
            .iter()
            .map(|b| (b.request_type.clone(), b.entities.len()))
            .collect();
        kinds.sort();
        assert_eq!(
            kinds,
            vec![("push_contacts".to_string(), 1), ("update_leads".to_string(), 2)]
        );
    }

    #[test]
    fn lead_events_are_tagged_with_their_kind() {
        let envelope = Envelope {
            subject: "events.leads.status_changed".into(),
            payload: br#"{"lead_id": 7, "status_id": 5}"#.to_vec(),
        };
        let event = decode_event(&envelope).unwrap();
        assert_eq!(event.text("event_type").as_deref(), Some("status_changed"));
        assert_eq!(event.entity_id(), Some(7));

        let garbage = Envelope {
            subject: "events.leads.created".into(),
            payload: b"[1,2]".to_vec(),
        };
        assert!(decode_event(&garbage).is_none());
    }
}
