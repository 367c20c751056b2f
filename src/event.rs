use std::collections::BTreeMap;
use std::fmt;

use leadflow_bus::EntityId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::EventError;

/// A scalar carried by an [`InputEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventValue {
    Boolean(bool),
    Number(f64),
    String(String),
}

impl EventValue {
    pub fn from_json(value: &Value) -> Option<EventValue> {
        match value {
            Value::Bool(b) => Some(EventValue::Boolean(*b)),
            Value::Number(n) => n.as_f64().map(EventValue::Number),
            Value::String(s) => Some(EventValue::String(s.clone())),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            EventValue::Boolean(b) => Value::Bool(*b),
            EventValue::Number(n) => number_to_json(*n),
            EventValue::String(s) => Value::String(s.clone()),
        }
    }

    /// Text form used by equality and substring comparisons. Whole numbers
    /// render without a fraction so `42` and `"42"` agree.
    pub fn canonical(&self) -> String {
        match self {
            EventValue::Boolean(b) => b.to_string(),
            EventValue::Number(n) => format_number(*n),
            EventValue::String(s) => s.clone(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            EventValue::Number(n) => Some(*n),
            EventValue::String(s) => s.trim().parse().ok(),
            EventValue::Boolean(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_f64()
            .filter(|n| n.fract() == 0.0 && n.is_finite())
            .map(|n| n as i64)
    }
}

impl fmt::Display for EventValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

impl From<bool> for EventValue {
    fn from(v: bool) -> Self {
        EventValue::Boolean(v)
    }
}

impl From<f64> for EventValue {
    fn from(v: f64) -> Self {
        EventValue::Number(v)
    }
}

impl From<i64> for EventValue {
    fn from(v: i64) -> Self {
        EventValue::Number(v as f64)
    }
}

impl From<i32> for EventValue {
    fn from(v: i32) -> Self {
        EventValue::Number(v.into())
    }
}

impl From<&str> for EventValue {
    fn from(v: &str) -> Self {
        EventValue::String(v.to_string())
    }
}

impl From<String> for EventValue {
    fn from(v: String) -> Self {
        EventValue::String(v)
    }
}

pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

fn number_to_json(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

/// Canonical text of an arbitrary JSON value, as used for rule operands.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        other => EventValue::from_json(other)
            .map(|v| v.canonical())
            .unwrap_or_else(|| other.to_string()),
    }
}

/// The triggering CRM event as flat key/value pairs. Built once per event
/// and only ever shared by reference afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputEvent {
    fields: BTreeMap<String, EventValue>,
}

impl InputEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<EventValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Flattens a webhook event object. Nested objects become dotted keys,
    /// `custom_fields` entries are also exposed under their bare key, and
    /// arrays and nulls are dropped.
    pub fn from_json(value: &Value) -> Result<Self, EventError> {
        let obj = match value {
            Value::Object(obj) => obj,
            Value::Array(_) => return Err(EventError::NotAnObject("array")),
            Value::Null => return Err(EventError::NotAnObject("null")),
            _ => return Err(EventError::NotAnObject("scalar")),
        };
        let mut fields = BTreeMap::new();
        flatten_into(None, obj, &mut fields);

        if let Some(Value::Object(custom)) = obj.get("custom_fields") {
            for (key, value) in custom {
                if fields.contains_key(key) {
                    continue;
                }
                if let Some(v) = EventValue::from_json(value) {
                    fields.insert(key.clone(), v);
                }
            }
        }
        Ok(Self { fields })
    }

    pub fn from_slice(payload: &[u8]) -> Result<Self, EventError> {
        let value: Value =
            serde_json::from_slice(payload).map_err(|e| EventError::Json(e.to_string()))?;
        Self::from_json(&value)
    }

    pub fn get(&self, key: &str) -> Option<&EventValue> {
        self.fields.get(key)
    }

    pub fn text(&self, key: &str) -> Option<String> {
        self.get(key).map(EventValue::canonical)
    }

    /// The lead this event is about, from `lead_id`.
    pub fn entity_id(&self) -> Option<EntityId> {
        self.get("lead_id").and_then(EventValue::as_i64)
    }

    /// Entries under `prefix.`, with the prefix stripped.
    pub fn with_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a EventValue)> + 'a {
        self.fields.iter().filter_map(move |(k, v)| {
            k.strip_prefix(prefix)
                .and_then(|rest| rest.strip_prefix('.'))
                .map(|rest| (rest, v))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &EventValue)> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K: Into<String>, V: Into<EventValue>> FromIterator<(K, V)> for InputEvent {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

fn flatten_into(prefix: Option<&str>, obj: &Map<String, Value>, out: &mut BTreeMap<String, EventValue>) {
    for (key, value) in obj {
        let key = match prefix {
            Some(p) => format!("{p}.{key}"),
            None => key.clone(),
        };
        match value {
            Value::Object(inner) => flatten_into(Some(&key), inner, out),
            other => {
                if let Some(v) = EventValue::from_json(other) {
                    out.insert(key, v);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_forms() {
        assert_eq!(EventValue::from(42).canonical(), "42");
        assert_eq!(EventValue::from(42.0).canonical(), "42");
        assert_eq!(EventValue::from(2.5).canonical(), "2.5");
        assert_eq!(EventValue::from(true).canonical(), "true");
        assert_eq!(canonical_json(&json!("42")), "42");
        assert_eq!(canonical_json(&json!(null)), "");
    }

    #[test]
    fn flattens_webhook_event() {
        let raw = json!({
            "event_type": "lead.status",
            "lead_id": 123,
            "status_id": 5,
            "contact": {"phone": "+100", "name": "Ann"},
            "custom_fields": {"field_77": "gold", "tier": "gold", "lead_id": 999},
            "tags": ["a", "b"],
            "note": null
        });
        let event = InputEvent::from_json(&raw).unwrap();

        assert_eq!(event.entity_id(), Some(123));
        assert_eq!(event.text("contact.phone").as_deref(), Some("+100"));
        assert_eq!(event.text("field_77").as_deref(), Some("gold"));
        assert_eq!(event.text("custom_fields.tier").as_deref(), Some("gold"));
        // bare keys never shadow top-level fields
        assert_eq!(event.text("lead_id").as_deref(), Some("123"));
        assert!(event.get("tags").is_none());
        assert!(event.get("note").is_none());
    }

    #[test]
    fn entity_id_accepts_numeric_strings() {
        let event = InputEvent::new().with("lead_id", "77");
        assert_eq!(event.entity_id(), Some(77));
        let event = InputEvent::new().with("lead_id", "abc");
        assert_eq!(event.entity_id(), None);
    }

    #[test]
    fn rejects_non_objects() {
        assert_eq!(
            InputEvent::from_json(&json!([1, 2])),
            Err(EventError::NotAnObject("array"))
        );
        assert!(InputEvent::from_slice(b"not json").is_err());
    }

    #[test]
    fn prefix_iteration_strips_prefix() {
        let event = InputEvent::new()
            .with("custom_fields.a", 1)
            .with("custom_fields.b", "x")
            .with("custom", true);
        let keys: Vec<&str> = event.with_prefix("custom_fields").map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }
}
