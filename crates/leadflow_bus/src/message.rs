use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Platform-assigned id of a CRM lead or contact.
pub type EntityId = i64;

pub const EVENTS_PREFIX: &str = "events.leads";
pub const DISPATCH_PREFIX: &str = "dispatch";
pub const QUEUE_PREFIX: &str = "queue.crm";

/// Lead events published by the CRM webhook side, one subject per kind:
/// `events.leads.<kind>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LeadEventKind {
    Created,
    Updated,
    StatusChanged,
    Deleted,
    ResponsibleChanged,
}

impl LeadEventKind {
    pub fn subject(&self) -> String {
        format!("{EVENTS_PREFIX}.{self}")
    }

    /// Wildcard subject matching every lead event kind.
    pub fn any_subject() -> String {
        format!("{EVENTS_PREFIX}.>")
    }

    pub fn from_subject(subject: &str) -> Option<Self> {
        subject
            .strip_prefix(EVENTS_PREFIX)?
            .strip_prefix('.')?
            .parse()
            .ok()
    }
}

/// Message handed to the bus for every dispatched action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundMessage {
    pub id: String,
    pub entity_ids: Vec<EntityId>,
    pub action_type: String,
    pub parameters: Value,
    pub timestamp: DateTime<Utc>,
}

impl OutboundMessage {
    pub fn new(action_type: impl Into<String>, entity_ids: Vec<EntityId>, parameters: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            entity_ids,
            action_type: action_type.into(),
            parameters,
            timestamp: Utc::now(),
        }
    }

    pub fn subject(&self) -> String {
        dispatch_subject(&self.action_type)
    }
}

pub fn dispatch_subject(action_type: &str) -> String {
    format!("{DISPATCH_PREFIX}.{action_type}")
}

/// Request to push a list of entities to the platform through the
/// rate-controlled queue. Published on `queue.crm.<type>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueRequest {
    #[serde(rename = "type")]
    pub request_type: String,
    #[serde(default)]
    pub entities: Vec<Value>,
}

impl QueueRequest {
    pub fn subject(&self) -> String {
        queue_subject(&self.request_type)
    }
}

pub fn queue_subject(request_type: &str) -> String {
    format!("{QUEUE_PREFIX}.{request_type}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_kind_subjects_round_trip() {
        assert_eq!(LeadEventKind::StatusChanged.subject(), "events.leads.status_changed");
        assert_eq!(
            LeadEventKind::from_subject("events.leads.created"),
            Some(LeadEventKind::Created)
        );
        assert_eq!(LeadEventKind::from_subject("events.contacts.created"), None);
        assert_eq!(LeadEventKind::from_subject("events.leads.exploded"), None);
    }

    #[test]
    fn outbound_message_subject_follows_action() {
        let msg = OutboundMessage::new("change_priority", vec![7], json!({"priority": 3}));
        assert_eq!(msg.subject(), "dispatch.change_priority");
        assert_eq!(msg.entity_ids, vec![7]);
        assert!(!msg.id.is_empty());
    }

    #[test]
    fn queue_request_uses_type_key() {
        let req: QueueRequest =
            serde_json::from_value(json!({"type": "update_leads", "entities": [{"id": 1}]})).unwrap();
        assert_eq!(req.request_type, "update_leads");
        assert_eq!(req.subject(), "queue.crm.update_leads");
        assert_eq!(req.entities.len(), 1);
    }
}
