//! Declarative attribute schemas.
//!
//! A [`RecordSchema`] lists typed fields and plugs into a
//! [`RecordConfig`](crate::RecordConfig) as its [`Validator`]. Rejections
//! surface as a JSON payload of the form
//! `{"field": "...", "error": "..."}`.

use crate::{config::Validator, error::Result, Attributes, Error};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Field types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    Array,
    Object,
    /// Any JSON value
    Json,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FieldType::String => "String",
            FieldType::Int => "Int",
            FieldType::Float => "Float",
            FieldType::Bool => "Bool",
            FieldType::Array => "Array",
            FieldType::Object => "Object",
            FieldType::Json => "Json",
        };
        f.write_str(name)
    }
}

/// Definition of one attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
}

impl FieldDef {
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }

    /// Check a single attribute value. Null counts as missing.
    pub fn validate(&self, value: Option<&Value>) -> Result<()> {
        match value {
            None | Some(Value::Null) if self.required => {
                Err(Error::MissingRequiredField(self.name.clone()))
            }
            None | Some(Value::Null) => Ok(()),
            Some(v) => self.validate_type(v),
        }
    }

    fn validate_type(&self, value: &Value) -> Result<()> {
        let valid = match self.field_type {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Array => value.is_array(),
            FieldType::Object => value.is_object(),
            FieldType::Json => true,
        };

        if valid {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: json_type_name(value).to_string(),
            })
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "Null",
        Value::Bool(_) => "Bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        Value::Number(_) => "Float",
        Value::String(_) => "String",
        Value::Array(_) => "Array",
        Value::Object(_) => "Object",
    }
}

/// Typed field list for one kind of record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordSchema {
    pub fields: Vec<FieldDef>,
    /// Reject attributes not listed in `fields`
    #[serde(default)]
    pub strict: bool,
}

impl RecordSchema {
    pub fn new(fields: Vec<FieldDef>) -> Self {
        Self {
            fields,
            strict: false,
        }
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Check every field against `attributes`.
    pub fn check(&self, attributes: &Attributes) -> Result<()> {
        for field in &self.fields {
            field.validate(attributes.get(&field.name))?;
        }
        if self.strict {
            if let Some(unknown) = attributes.keys().find(|k| self.field(k).is_none()) {
                return Err(Error::InvalidPayload(format!("unknown attribute {}", unknown)));
            }
        }
        Ok(())
    }
}

impl Validator for RecordSchema {
    fn validate(&self, attributes: &Attributes) -> std::result::Result<(), Value> {
        self.check(attributes).map_err(|e| {
            let field = match &e {
                Error::MissingRequiredField(f) => Some(f.clone()),
                Error::TypeMismatch { field, .. } => Some(field.clone()),
                _ => None,
            };
            json!({"field": field, "error": e.to_string()})
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Record, RecordConfig};
    use std::sync::Arc;

    fn user_schema() -> RecordSchema {
        RecordSchema::new(vec![
            FieldDef::required("name", FieldType::String),
            FieldDef::required("age", FieldType::Int),
            FieldDef::optional("email", FieldType::String),
        ])
    }

    fn attrs(value: Value) -> Attributes {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn valid_attributes() {
        let schema = user_schema();
        assert!(schema.check(&attrs(json!({"name": "Alice", "age": 30}))).is_ok());
        assert!(schema
            .check(&attrs(json!({"name": "Bob", "age": 25, "email": "bob@example.com"})))
            .is_ok());
    }

    #[test]
    fn missing_required_field() {
        let result = user_schema().check(&attrs(json!({"name": "Alice"})));
        assert!(matches!(result, Err(Error::MissingRequiredField(f)) if f == "age"));
    }

    #[test]
    fn null_required_field() {
        let result = user_schema().check(&attrs(json!({"name": null, "age": 30})));
        assert!(matches!(result, Err(Error::MissingRequiredField(f)) if f == "name"));
    }

    #[test]
    fn wrong_type() {
        let result = user_schema().check(&attrs(json!({"name": "Alice", "age": "thirty"})));
        assert!(matches!(result, Err(Error::TypeMismatch { field, .. }) if field == "age"));
    }

    #[test]
    fn strict_rejects_unknown() {
        let schema = user_schema().strict();
        assert!(matches!(
            schema.check(&attrs(json!({"name": "A", "age": 1, "extra": true}))),
            Err(Error::InvalidPayload(_))
        ));
    }

    #[test]
    fn json_field_accepts_any() {
        let schema = RecordSchema::new(vec![FieldDef::required("data", FieldType::Json)]);
        for data in [json!("s"), json!(1), json!(true), json!([1]), json!({"a": 1})] {
            assert!(schema.check(&attrs(json!({ "data": data }))).is_ok());
        }
    }

    #[test]
    fn schema_as_record_validator() {
        let config = RecordConfig::new().with_validator(user_schema());
        let record = Record::with_config(Arc::new(config), json!({"name": "Alice", "age": 30}));

        assert!(!record.set("age", json!("old")));
        let error = record.validation_error().unwrap();
        assert_eq!(error["field"], json!("age"));
        assert_eq!(record.get("age"), Some(json!(30)));
    }

    #[test]
    fn schema_serialization() {
        let schema = user_schema();
        let json = serde_json::to_string(&schema).unwrap();
        let parsed: RecordSchema = serde_json::from_str(&json).unwrap();
        assert_eq!(schema, parsed);
    }
}
