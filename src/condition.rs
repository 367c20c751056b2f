use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display};

use crate::event::{EventValue, InputEvent, canonical_json};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Operator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    Contains,
    /// Anything else. Never matches.
    #[serde(other)]
    Unknown,
}

/// Logical category of the operand. Each category maps onto a fixed key of
/// the flattened event; `custom_field` and unrecognised values read the
/// rule's own `field`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Pipeline,
    Status,
    Bucket,
    Scheduler,
    SchedulerStep,
    DialAttempts,
    #[serde(alias = "amocrm_field")]
    CustomField,
    #[default]
    #[serde(other)]
    Field,
}

impl FieldType {
    pub fn event_key<'a>(&self, field: &'a str) -> &'a str {
        match self {
            FieldType::Pipeline => "pipeline_id",
            FieldType::Status => "status_id",
            FieldType::Bucket => "bucket_id",
            FieldType::Scheduler => "scheduler_id",
            FieldType::SchedulerStep => "scheduler_step",
            FieldType::DialAttempts => "dial_attempts",
            FieldType::CustomField | FieldType::Field => field,
        }
    }
}

/// A single comparison carried by a condition node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConditionRule {
    #[serde(default)]
    pub field: String,
    #[serde(default)]
    pub field_type: FieldType,
    pub operator: Operator,
    #[serde(default)]
    pub value: Value,
}

impl ConditionRule {
    pub fn new(field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            field_type: FieldType::Field,
            operator,
            value: value.into(),
        }
    }

    /// A rule that matches no event.
    pub fn never() -> Self {
        Self::new("", Operator::Unknown, Value::Null)
    }

    pub fn with_field_type(mut self, field_type: FieldType) -> Self {
        self.field_type = field_type;
        self
    }

    /// Evaluates the rule against `event`. A missing operand is `false` for
    /// every operator, `not_equals` included.
    pub fn evaluate(&self, event: &InputEvent) -> bool {
        let key = self.field_type.event_key(&self.field);
        match event.get(key) {
            Some(operand) => compare(operand, self.operator, &self.value),
            None => false,
        }
    }
}

pub fn evaluate(rule: &ConditionRule, event: &InputEvent) -> bool {
    rule.evaluate(event)
}

fn compare(operand: &EventValue, operator: Operator, expected: &Value) -> bool {
    match operator {
        Operator::Equals => operand.canonical() == canonical_json(expected),
        Operator::NotEquals => operand.canonical() != canonical_json(expected),
        Operator::GreaterThan => compare_numeric(operand, expected).is_some_and(|(a, b)| a > b),
        Operator::LessThan => compare_numeric(operand, expected).is_some_and(|(a, b)| a < b),
        Operator::Contains => operand
            .canonical()
            .to_lowercase()
            .contains(&canonical_json(expected).to_lowercase()),
        Operator::Unknown => false,
    }
}

fn compare_numeric(operand: &EventValue, expected: &Value) -> Option<(f64, f64)> {
    let a = operand.as_f64()?;
    let b = EventValue::from_json(expected)?.as_f64()?;
    Some((a, b))
}
