use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace};

use crate::error::BusError;

/// A message as delivered by a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub subject: String,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

pub type Subscription = UnboundedReceiver<Envelope>;

/// Publish/subscribe transport. Subjects are dot separated and subscriptions
/// accept the NATS wildcards `*` (one token) and `>` (one or more tokens).
#[async_trait]
pub trait MessageBus: Send + Sync {
    fn name(&self) -> &'static str;

    async fn publish_bytes(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError>;

    async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError>;
}

impl dyn MessageBus {
    pub async fn publish_json<T: Serialize + ?Sized + Sync>(
        &self,
        subject: &str,
        value: &T,
    ) -> Result<(), BusError> {
        let payload = serde_json::to_vec(value)?;
        self.publish_bytes(subject, payload).await
    }
}

impl fmt::Debug for dyn MessageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageBus({})", self.name())
    }
}

/// Returns true when `subject` is matched by the subscription `pattern`.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut subject_tokens = subject.split('.');
    for token in pattern.split('.') {
        match token {
            ">" => return subject_tokens.next().is_some(),
            "*" => {
                if subject_tokens.next().is_none() {
                    return false;
                }
            }
            literal => {
                if subject_tokens.next() != Some(literal) {
                    return false;
                }
            }
        }
    }
    subject_tokens.next().is_none()
}

/// In-process bus. Keeps a log of every published message so callers can
/// inspect what went out.
#[derive(Default)]
pub struct InMemoryBus {
    subscribers: Mutex<Vec<(String, UnboundedSender<Envelope>)>>,
    published: Mutex<Vec<Envelope>>,
    fail_publish: AtomicBool,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message published so far, in publish order.
    pub fn published(&self) -> Vec<Envelope> {
        self.published
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    /// Published messages whose subject matches `pattern`.
    pub fn published_on(&self, pattern: &str) -> Vec<Envelope> {
        self.published()
            .into_iter()
            .filter(|env| subject_matches(pattern, &env.subject))
            .collect()
    }

    /// Makes subsequent publishes fail, for exercising error paths.
    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn publish_bytes(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(BusError::Publish {
                subject: subject.to_string(),
                reason: "publishing disabled".to_string(),
            });
        }
        let envelope = Envelope {
            subject: subject.to_string(),
            payload,
        };
        trace!(subject, "publish");
        if let Ok(mut log) = self.published.lock() {
            log.push(envelope.clone());
        }
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.retain(|(pattern, tx)| {
                if subject_matches(pattern, subject) {
                    tx.send(envelope.clone()).is_ok()
                } else {
                    !tx.is_closed()
                }
            });
        }
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subs = self.subscribers.lock().map_err(|e| BusError::Subscribe {
            subject: subject.to_string(),
            reason: e.to_string(),
        })?;
        subs.push((subject.to_string(), tx));
        debug!(subject, "subscribed");
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use std::sync::Arc;

    #[test]
    fn wildcard_matching() {
        assert!(subject_matches("events.leads.>", "events.leads.created"));
        assert!(subject_matches("events.leads.>", "events.leads.a.b"));
        assert!(!subject_matches("events.leads.>", "events.leads"));
        assert!(subject_matches("dispatch.*", "dispatch.send_to_dialer"));
        assert!(!subject_matches("dispatch.*", "dispatch.a.b"));
        assert!(subject_matches("queue.crm.update_leads", "queue.crm.update_leads"));
        assert!(!subject_matches("queue.crm.update_leads", "queue.crm.update"));
    }

    #[tokio::test]
    async fn subscribers_receive_matching_messages() {
        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());
        let mut rx = bus.subscribe("dispatch.>").await.unwrap();

        bus.publish_json("dispatch.add_note", &json!({"text": "hi"}))
            .await
            .unwrap();
        bus.publish_json("events.leads.created", &json!({}))
            .await
            .unwrap();

        let env = rx.recv().await.unwrap();
        assert_eq!(env.subject, "dispatch.add_note");
        let body: Value = env.json().unwrap();
        assert_eq!(body["text"], "hi");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failing_publish_is_reported_and_not_logged() {
        let bus = InMemoryBus::new();
        bus.set_fail_publish(true);
        let err = bus.publish_bytes("dispatch.x", b"{}".to_vec()).await.unwrap_err();
        assert!(matches!(err, BusError::Publish { .. }));
        assert!(bus.published().is_empty());
    }
}
