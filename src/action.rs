use std::sync::Arc;

use leadflow_bus::{EntityId, MessageBus, OutboundMessage};
use opentelemetry::KeyValue;
use serde_json::{Map, Value, json};
use strum_macros::{AsRefStr, Display, EnumString};
use tracing::{debug, info};

use crate::coalescer::{LeadBatchHandle, PendingUpdate};
use crate::error::{ActionError, DispatchError};
use crate::event::{EventValue, InputEvent};
use crate::logger::EngineMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ActionType {
    SendToDialer,
    UpdateLead,
    AddNote,
    AddToBucket,
    ChangePriority,
    ChangeSchedulerStep,
    RemoveFromDialer,
}

impl ActionType {
    /// Actions that address an existing lead and so need `lead_id`.
    pub fn requires_lead(&self) -> bool {
        !matches!(self, ActionType::SendToDialer | ActionType::AddToBucket)
    }
}

/// Turns action nodes into outbound messages. `update_lead` goes through the
/// lead batch processor when one is attached.
#[derive(Clone)]
pub struct ActionDispatcher {
    bus: Arc<dyn MessageBus>,
    leads: Option<LeadBatchHandle>,
    metrics: EngineMetrics,
}

impl ActionDispatcher {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self {
            bus,
            leads: None,
            metrics: EngineMetrics::new(),
        }
    }

    pub fn with_lead_batcher(mut self, handle: LeadBatchHandle) -> Self {
        self.leads = Some(handle);
        self
    }

    pub fn with_metrics(mut self, metrics: EngineMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub async fn dispatch(
        &self,
        action_type: &str,
        parameters: &Map<String, Value>,
        event: &InputEvent,
    ) -> Result<(), ActionError> {
        let action: ActionType = action_type
            .parse()
            .map_err(|_| ActionError::UnsupportedAction(action_type.to_string()))?;
        let lead = event.entity_id();
        if action.requires_lead() && lead.is_none() {
            return Err(ActionError::MissingEntityId(action));
        }

        if let (ActionType::UpdateLead, Some(handle), Some(entity_id)) = (action, &self.leads, lead) {
            let update = lead_update(entity_id, parameters)?;
            debug!(entity_id, fields = update.fields.len(), "queueing lead update");
            handle.add(update).await.map_err(DispatchError::from)?;
            self.count(action);
            return Ok(());
        }

        let message = build_message(action, parameters, event)?;
        let subject = message.subject();
        self.bus
            .publish_json(&subject, &message)
            .await
            .map_err(DispatchError::from)?;
        info!(
            action = %action,
            entity_id = ?lead,
            message_id = %message.id,
            "action dispatched"
        );
        self.count(action);
        Ok(())
    }

    fn count(&self, action: ActionType) {
        self.metrics
            .actions_dispatched
            .add(1, &[KeyValue::new("action", action.to_string())]);
    }
}

/// Builds the outbound message for `action` without sending it.
pub fn build_message(
    action: ActionType,
    params: &Map<String, Value>,
    event: &InputEvent,
) -> Result<OutboundMessage, ActionError> {
    let lead = event.entity_id();
    let payload = match action {
        ActionType::SendToDialer => json!({
            "scheduler_id": param_text(params, "scheduler_id"),
            "campaign_id": param_text(params, "campaign_id"),
            "bucket_id": param_text(params, "bucket_id"),
            "contact": contact(event),
        }),
        ActionType::AddToBucket => {
            let priority = param_int(action, params, "priority")?;
            let step = param_int(action, params, "scheduler_step")?;
            let mut custom = Map::new();
            custom.insert("crm_lead_id".into(), event_json(event, "lead_id"));
            custom.insert("crm_contact_id".into(), event_json(event, "contact_id"));
            custom.insert("priority".into(), priority.into());
            custom.insert("scheduler_step".into(), step.into());
            for (key, value) in event.with_prefix("custom_fields") {
                custom.insert(key.to_string(), value.to_json());
            }
            let mut contact = contact(event);
            contact["lead_id"] = event_json(event, "lead_id");
            contact["custom_data"] = Value::Object(custom);
            json!({
                "bucket_id": param_text(params, "bucket_id"),
                "priority": priority,
                "scheduler_id": param_text(params, "scheduler_id"),
                "scheduler_step": step,
                "contact": contact,
            })
        }
        ActionType::UpdateLead => {
            let update = lead_update(lead.unwrap_or_default(), params)?;
            json!({
                "fields": update.fields,
                "status_id": update.status_id,
                "pipeline_id": update.pipeline_id,
            })
        }
        ActionType::AddNote => json!({ "text": param_text(params, "text") }),
        ActionType::ChangePriority => {
            json!({ "priority": param_int(action, params, "priority")? })
        }
        ActionType::ChangeSchedulerStep => {
            json!({ "scheduler_step": param_int(action, params, "scheduler_step")? })
        }
        ActionType::RemoveFromDialer => json!({}),
    };
    let entity_ids: Vec<EntityId> = lead.into_iter().collect();
    Ok(OutboundMessage::new(action.as_ref(), entity_ids, payload))
}

fn lead_update(entity_id: EntityId, params: &Map<String, Value>) -> Result<PendingUpdate, ActionError> {
    let mut update = PendingUpdate::new(entity_id);
    match params.get("fields") {
        Some(Value::Object(fields)) => {
            for (key, value) in fields {
                update = update.with_field(key.clone(), value.clone());
            }
        }
        None | Some(Value::Null) => {}
        Some(_) => {
            return Err(ActionError::InvalidParameter {
                action: ActionType::UpdateLead,
                parameter: "fields".into(),
                reason: "expected an object".into(),
            });
        }
    }
    let status = param_int(ActionType::UpdateLead, params, "status_id")?;
    let pipeline = param_int(ActionType::UpdateLead, params, "pipeline_id")?;
    Ok(update.with_status(status).with_pipeline(pipeline))
}

fn contact(event: &InputEvent) -> Value {
    let text = |key: &str| event.text(key).unwrap_or_default();
    json!({
        "phone": text("contact.phone"),
        "name": text("contact.name"),
        "email": text("contact.email"),
    })
}

fn event_json(event: &InputEvent, key: &str) -> Value {
    event.get(key).map(EventValue::to_json).unwrap_or(Value::Null)
}

fn param_text(params: &Map<String, Value>, key: &str) -> String {
    params
        .get(key)
        .map(crate::event::canonical_json)
        .unwrap_or_default()
}

/// Integer parameter; absent or null reads as 0.
fn param_int(action: ActionType, params: &Map<String, Value>, key: &str) -> Result<i64, ActionError> {
    let Some(raw) = params.get(key).filter(|v| !v.is_null()) else {
        return Ok(0);
    };
    EventValue::from_json(raw)
        .and_then(|v| v.as_f64())
        .map(|n| n as i64)
        .ok_or_else(|| ActionError::InvalidParameter {
            action,
            parameter: key.to_string(),
            reason: format!("expected a number, got {raw}"),
        })
}
