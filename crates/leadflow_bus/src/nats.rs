use async_nats::Client;
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::bus::{Envelope, MessageBus, Subscription};
use crate::error::BusError;

/// [`MessageBus`] backed by a NATS connection.
pub struct NatsBus {
    client: Client,
    stop_tx: watch::Sender<bool>,
}

impl NatsBus {
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BusError::Connect {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        info!(url, "connected to NATS");
        let (stop_tx, _) = watch::channel(false);
        Ok(Self { client, stop_tx })
    }

    /// Stops every forwarding task and flushes pending publishes.
    pub async fn close(&self) {
        let _ = self.stop_tx.send(true);
        if let Err(err) = self.client.flush().await {
            warn!(error = %err, "NATS flush on close failed");
        }
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    fn name(&self) -> &'static str {
        "nats"
    }

    async fn publish_bytes(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| BusError::Publish {
                subject: subject.to_string(),
                reason: e.to_string(),
            })
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError> {
        let mut subscription = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| BusError::Subscribe {
                subject: subject.to_string(),
                reason: e.to_string(),
            })?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut stop_rx = self.stop_tx.subscribe();
        let pattern = subject.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = subscription.next() => match message {
                        Some(message) => {
                            let envelope = Envelope {
                                subject: message.subject.to_string(),
                                payload: message.payload.to_vec(),
                            };
                            if tx.send(envelope).is_err() {
                                break;
                            }
                        }
                        None => {
                            warn!(subject = %pattern, "NATS subscription ended");
                            break;
                        }
                    },
                    _ = stop_rx.changed() => {
                        info!(subject = %pattern, "NATS subscriber received stop signal");
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }
}
