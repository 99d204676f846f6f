//! Declarative shape and type checks for response records
//!
//! Rows coming back over the SQL surface do not carry faithful JSON types:
//! integer columns can arrive as strings (`"1000"`) and absent values as the
//! literal text `"None"`. A [`FieldRule`] states what a field means and
//! whether that encoding is tolerated, and [`ResponseValidator`] turns a raw
//! record into typed [`FieldValue`]s, so test cases never repeat ad hoc
//! `is_string() || parse()` checks.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{HarnessError, HarnessResult};

/// Literal some protocols use for an absent value
pub const NONE_LITERAL: &str = "None";

/// One row or object returned from either API surface
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseRecord {
    fields: Map<String, Value>,
}

impl ResponseRecord {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Wrap a JSON object; anything else is a protocol mismatch
    pub fn from_value(value: Value) -> HarnessResult<Self> {
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(HarnessError::mismatch(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Record at a JSON pointer inside `body`, e.g. `/0/rental_price`
    pub fn at(body: &Value, pointer: &str) -> HarnessResult<Self> {
        let value = body
            .pointer(pointer)
            .ok_or_else(|| HarnessError::mismatch(format!("no value at {}", pointer)))?;
        Self::from_value(value.clone())
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// String value of `field`, if it is one
    pub fn str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }
}

/// Semantic type expected for a field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Integer,
    Float,
    /// Integer or float
    Number,
    String,
    Bool,
    Object,
    Array,
    /// Presence only
    Any,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRule {
    pub name: String,
    pub field_type: FieldType,
    /// Field may be encoded as text; `"None"` means null
    pub nullable_as_string: bool,
    /// Null is accepted
    pub nullable: bool,
}

impl FieldRule {
    /// Required, non-null field of the given type
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable_as_string: false,
            nullable: false,
        }
    }

    /// Tolerate the protocol's text encoding of typed and null values.
    ///
    /// Enabling the exception also accepts null, since `"None"` is how the
    /// protocol spells it; chain [`non_null`](Self::non_null) to forbid it.
    pub fn nullable_as_string(mut self) -> Self {
        self.nullable_as_string = true;
        self.nullable = true;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn non_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Required fields of a record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordSchema {
    rules: Vec<FieldRule>,
}

impl RecordSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, rule: FieldRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Shorthand for a required, non-null field
    pub fn require(self, name: &str, field_type: FieldType) -> Self {
        self.field(FieldRule::new(name, field_type))
    }

    pub fn rules(&self) -> &[FieldRule] {
        &self.rules
    }
}

/// A field value after the protocol quirks have been undone
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Integer(i64),
    Float(f64),
    String(String),
    Bool(bool),
    Json(Value),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => f.write_str("null"),
            FieldValue::Integer(v) => write!(f, "{}", v),
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::String(v) => write!(f, "{:?}", v),
            FieldValue::Bool(v) => write!(f, "{}", v),
            FieldValue::Json(v) => write!(f, "{}", v),
        }
    }
}

/// Typed view over the schema's fields of one record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidatedRecord {
    values: BTreeMap<String, FieldValue>,
}

impl ValidatedRecord {
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.values.get(field)
    }

    pub fn integer(&self, field: &str) -> Option<i64> {
        match self.values.get(field) {
            Some(FieldValue::Integer(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn float(&self, field: &str) -> Option<f64> {
        match self.values.get(field) {
            Some(FieldValue::Float(v)) => Some(*v),
            Some(FieldValue::Integer(v)) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn string(&self, field: &str) -> Option<&str> {
        match self.values.get(field) {
            Some(FieldValue::String(v)) => Some(v),
            _ => None,
        }
    }

    pub fn is_null(&self, field: &str) -> bool {
        matches!(self.values.get(field), Some(FieldValue::Null))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseValidator;

impl ResponseValidator {
    /// Check `record` against `schema` and return the typed values
    pub fn validate(record: &ResponseRecord, schema: &RecordSchema) -> HarnessResult<ValidatedRecord> {
        let mut values = BTreeMap::new();

        for rule in schema.rules() {
            let raw = record.get(&rule.name).ok_or_else(|| {
                HarnessError::mismatch(format!("required field '{}' is missing", rule.name))
            })?;

            let value = Self::check_field(rule, raw)?;
            values.insert(rule.name.clone(), value);
        }

        Ok(ValidatedRecord { values })
    }

    /// Validate every record; the error names the offending row
    pub fn validate_all(
        records: &[ResponseRecord],
        schema: &RecordSchema,
    ) -> HarnessResult<Vec<ValidatedRecord>> {
        records
            .iter()
            .enumerate()
            .map(|(i, record)| {
                Self::validate(record, schema).map_err(|e| match e {
                    HarnessError::ProtocolMismatch(msg) => {
                        HarnessError::mismatch(format!("row {}: {}", i, msg))
                    }
                    other => other,
                })
            })
            .collect()
    }

    fn check_field(rule: &FieldRule, raw: &Value) -> HarnessResult<FieldValue> {
        let is_null_literal = rule.nullable_as_string && raw.as_str() == Some(NONE_LITERAL);

        if raw.is_null() || is_null_literal {
            return if rule.nullable {
                Ok(FieldValue::Null)
            } else {
                Err(HarnessError::mismatch(format!(
                    "field '{}' must not be null, got {}",
                    rule.name, raw
                )))
            };
        }

        let converted = match (rule.field_type, raw) {
            (FieldType::Any, value) => Some(FieldValue::Json(value.clone())),
            (FieldType::Integer, Value::Number(n)) => n.as_i64().map(FieldValue::Integer),
            (FieldType::Float, Value::Number(n)) if n.is_f64() => n.as_f64().map(FieldValue::Float),
            (FieldType::Number, Value::Number(n)) => Some(number_value(n)),
            (FieldType::String, Value::String(s)) => Some(FieldValue::String(s.clone())),
            (FieldType::Bool, Value::Bool(b)) => Some(FieldValue::Bool(*b)),
            (FieldType::Object, Value::Object(_)) => Some(FieldValue::Json(raw.clone())),
            (FieldType::Array, Value::Array(_)) => Some(FieldValue::Json(raw.clone())),
            (field_type, Value::String(s)) if rule.nullable_as_string => {
                return Self::parse_encoded(rule, field_type, s);
            }
            _ => None,
        };

        converted.ok_or_else(|| {
            HarnessError::mismatch(format!(
                "field '{}' expected {:?}, got {} ({})",
                rule.name,
                rule.field_type,
                json_kind(raw),
                raw
            ))
        })
    }

    fn parse_encoded(rule: &FieldRule, field_type: FieldType, text: &str) -> HarnessResult<FieldValue> {
        let trimmed = text.trim();
        let parsed = match field_type {
            FieldType::Integer => trimmed.parse::<i64>().ok().map(FieldValue::Integer),
            FieldType::Float => trimmed.parse::<f64>().ok().map(FieldValue::Float),
            FieldType::Number => trimmed
                .parse::<i64>()
                .map(FieldValue::Integer)
                .ok()
                .or_else(|| trimmed.parse::<f64>().ok().map(FieldValue::Float)),
            FieldType::Bool => match trimmed {
                "true" | "1" => Some(FieldValue::Bool(true)),
                "false" | "0" => Some(FieldValue::Bool(false)),
                _ => None,
            },
            FieldType::Object | FieldType::Array => serde_json::from_str::<Value>(trimmed)
                .ok()
                .filter(|v| match field_type {
                    FieldType::Object => v.is_object(),
                    _ => v.is_array(),
                })
                .map(FieldValue::Json),
            FieldType::String | FieldType::Any => Some(FieldValue::String(text.to_string())),
        };

        parsed.ok_or_else(|| {
            HarnessError::mismatch(format!(
                "field '{}' expected {:?} encoded as text, could not parse {:?}",
                rule.name, field_type, text
            ))
        })
    }
}

fn number_value(n: &serde_json::Number) -> FieldValue {
    match n.as_i64() {
        Some(v) => FieldValue::Integer(v),
        None => FieldValue::Float(n.as_f64().unwrap_or(f64::NAN)),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
