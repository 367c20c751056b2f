//! Clients for the two downstream platforms and the batch handler that routes
//! released dispatch batches to them.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::PlatformError;
use crate::queue::{Batch, BatchHandler, PUSH_CONTACTS, UPDATE_LEADS};

/// One contact headed for a dialer bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactPush {
    #[serde(default)]
    pub scheduler_id: String,
    #[serde(default)]
    pub campaign_id: String,
    pub bucket_id: String,
    pub contact: Value,
}

#[async_trait]
pub trait DialerClient: Send + Sync {
    async fn push_contact(
        &self,
        scheduler_id: &str,
        campaign_id: &str,
        bucket_id: &str,
        contact: &Value,
    ) -> Result<(), PlatformError>;
}

#[async_trait]
pub trait CrmClient: Send + Sync {
    /// Sends one bulk update and returns how many entities the CRM accepted.
    async fn update_entities(&self, batch: &[Value]) -> Result<usize, PlatformError>;
}

pub struct HttpDialerClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpDialerClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, PlatformError> {
        let base_url = base_url.into();
        if base_url.trim().is_empty() {
            return Err(PlatformError::NotConfigured("DIALER_API_URL"));
        }
        Ok(Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    fn contacts_url(&self, campaign_id: &str, bucket_id: &str) -> String {
        if campaign_id.is_empty() {
            format!("{}/api/v1/buckets/{bucket_id}/contacts", self.base_url)
        } else {
            format!(
                "{}/api/v1/campaigns/{campaign_id}/buckets/{bucket_id}/contacts",
                self.base_url
            )
        }
    }
}

#[async_trait]
impl DialerClient for HttpDialerClient {
    async fn push_contact(
        &self,
        scheduler_id: &str,
        campaign_id: &str,
        bucket_id: &str,
        contact: &Value,
    ) -> Result<(), PlatformError> {
        let url = self.contacts_url(campaign_id, bucket_id);
        let body = json!({ "scheduler_id": scheduler_id, "contact": contact });
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        match resp.status() {
            StatusCode::OK | StatusCode::CREATED => {
                debug!(bucket_id, "contact pushed to dialer");
                Ok(())
            }
            status => Err(status_error(status, resp).await),
        }
    }
}

pub struct HttpCrmClient {
    client: Client,
    base_url: String,
    access_token: String,
}

impl HttpCrmClient {
    pub fn new(base_url: impl Into<String>, access_token: impl Into<String>) -> Result<Self, PlatformError> {
        let base_url = base_url.into();
        if base_url.trim().is_empty() {
            return Err(PlatformError::NotConfigured("CRM_BASE_URL"));
        }
        Ok(Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: access_token.into(),
        })
    }
}

#[async_trait]
impl CrmClient for HttpCrmClient {
    async fn update_entities(&self, batch: &[Value]) -> Result<usize, PlatformError> {
        let url = format!("{}/api/v4/leads", self.base_url);
        let resp = self
            .client
            .patch(&url)
            .bearer_auth(&self.access_token)
            .json(batch)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status(), resp).await);
        }
        let body: Value = resp.json().await?;
        let updated = body
            .pointer("/_embedded/leads")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(batch.len());
        Ok(updated)
    }
}

async fn status_error(status: StatusCode, resp: reqwest::Response) -> PlatformError {
    let body = resp.text().await.unwrap_or_else(|_| "<no body>".into());
    PlatformError::Status {
        status: status.as_u16(),
        body,
    }
}

/// Routes `update_leads` batches to the CRM in one call and `push_contacts`
/// batches to the dialer one contact at a time.
pub struct PlatformBatchHandler {
    crm: Option<Arc<dyn CrmClient>>,
    dialer: Option<Arc<dyn DialerClient>>,
}

impl PlatformBatchHandler {
    pub fn new(crm: Option<Arc<dyn CrmClient>>, dialer: Option<Arc<dyn DialerClient>>) -> Self {
        Self { crm, dialer }
    }

    async fn push_contacts(&self, dialer: &dyn DialerClient, batch: &Batch) -> Result<usize, PlatformError> {
        let mut pushed = 0;
        let mut last_err = None;
        for entity in &batch.entities {
            let push: ContactPush = match serde_json::from_value(entity.clone()) {
                Ok(push) => push,
                Err(err) => {
                    warn!(batch_id = batch.id, error = %err, "skipping malformed contact");
                    last_err = Some(PlatformError::InvalidPayload(err.to_string()));
                    continue;
                }
            };
            match dialer
                .push_contact(&push.scheduler_id, &push.campaign_id, &push.bucket_id, &push.contact)
                .await
            {
                Ok(()) => pushed += 1,
                Err(err) => {
                    warn!(batch_id = batch.id, bucket_id = %push.bucket_id, error = %err, "contact push failed");
                    last_err = Some(err);
                }
            }
        }
        match last_err {
            Some(err) if pushed == 0 => Err(err),
            _ => Ok(pushed),
        }
    }
}

#[async_trait]
impl BatchHandler for PlatformBatchHandler {
    async fn handle(&self, batch: &Batch) -> Result<usize, PlatformError> {
        match batch.request_type.as_str() {
            UPDATE_LEADS => {
                let crm = self.crm.as_ref().ok_or(PlatformError::NotConfigured("CRM client"))?;
                crm.update_entities(&batch.entities).await
            }
            PUSH_CONTACTS => {
                let dialer = self
                    .dialer
                    .as_ref()
                    .ok_or(PlatformError::NotConfigured("dialer client"))?;
                self.push_contacts(dialer.as_ref(), batch).await
            }
            other => Err(PlatformError::UnsupportedRequest(other.to_string())),
        }
    }
}
