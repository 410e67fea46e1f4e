//! Schemas render to JSON Schema (OpenAI, Ollama) or Gemini's OpenAPI
//! subset, and validate model output before serde sees it.

use crate::core::error::PipelineError;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum Schema {
    String,
    Integer,
    /// A string restricted to one of the listed values.
    Enum(Vec<&'static str>),
    Array(Box<Schema>),
    Object(Vec<Field>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: &'static str,
    pub schema: Schema,
    pub required: bool,
    pub description: Option<&'static str>,
}

impl Field {
    pub fn required(name: &'static str, schema: Schema) -> Self {
        Self {
            name,
            schema,
            required: true,
            description: None,
        }
    }

    pub fn describe(mut self, description: &'static str) -> Self {
        self.description = Some(description);
        self
    }
}

/// One mismatch found by [`Schema::validate`], located by a `/`-separated path.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaIssue {
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for SchemaIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let path = if self.path.is_empty() { "/" } else { &self.path };
        write!(f, "{}: {}", path, self.message)
    }
}

impl Schema {
    pub fn array(item: Schema) -> Self {
        Schema::Array(Box::new(item))
    }

    /// Standard JSON Schema.
    pub fn to_json_schema(&self) -> Value {
        match self {
            Schema::String => json!({ "type": "string" }),
            Schema::Integer => json!({ "type": "integer" }),
            Schema::Enum(values) => json!({ "type": "string", "enum": values }),
            Schema::Array(item) => json!({ "type": "array", "items": item.to_json_schema() }),
            Schema::Object(fields) => {
                let mut properties = Map::new();
                for field in fields {
                    let mut prop = field.schema.to_json_schema();
                    if let (Some(desc), Some(obj)) = (field.description, prop.as_object_mut()) {
                        obj.insert("description".into(), Value::from(desc));
                    }
                    properties.insert(field.name.to_string(), prop);
                }
                json!({
                    "type": "object",
                    "properties": properties,
                    "required": required_names(fields),
                    "additionalProperties": false,
                })
            }
        }
    }

    /// Gemini `responseSchema` (OpenAPI subset, upper-case type names).
    pub fn to_gemini_schema(&self) -> Value {
        match self {
            Schema::String => json!({ "type": "STRING" }),
            Schema::Integer => json!({ "type": "INTEGER" }),
            Schema::Enum(values) => json!({ "type": "STRING", "format": "enum", "enum": values }),
            Schema::Array(item) => json!({ "type": "ARRAY", "items": item.to_gemini_schema() }),
            Schema::Object(fields) => {
                let mut properties = Map::new();
                for field in fields {
                    let mut prop = field.schema.to_gemini_schema();
                    if let (Some(desc), Some(obj)) = (field.description, prop.as_object_mut()) {
                        obj.insert("description".into(), Value::from(desc));
                    }
                    properties.insert(field.name.to_string(), prop);
                }
                let ordering: Vec<&str> = fields.iter().map(|f| f.name).collect();
                json!({
                    "type": "OBJECT",
                    "properties": properties,
                    "required": required_names(fields),
                    "propertyOrdering": ordering,
                })
            }
        }
    }

    /// Collects every mismatch between `value` and this schema.
    ///
    /// Unknown object keys are tolerated; missing required keys, wrong types
    /// and out-of-enum strings are not.
    pub fn validate(&self, value: &Value) -> Result<(), Vec<SchemaIssue>> {
        let mut issues = Vec::new();
        self.check(value, String::new(), &mut issues);
        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }

    fn check(&self, value: &Value, path: String, issues: &mut Vec<SchemaIssue>) {
        match self {
            Schema::String => {
                if !value.is_string() {
                    report(issues, &path, format!("expected string, found {}", kind(value)));
                }
            }
            Schema::Integer => {
                if !(value.is_i64() || value.is_u64()) {
                    report(issues, &path, format!("expected integer, found {}", kind(value)));
                }
            }
            Schema::Enum(values) => match value.as_str() {
                Some(s) if values.iter().any(|v| *v == s) => {}
                Some(s) => report(issues, &path, format!("'{}' is not one of {:?}", s, values)),
                None => report(issues, &path, format!("expected string, found {}", kind(value))),
            },
            Schema::Array(item) => match value.as_array() {
                Some(items) => {
                    for (i, v) in items.iter().enumerate() {
                        item.check(v, format!("{}/{}", path, i), issues);
                    }
                }
                None => report(issues, &path, format!("expected array, found {}", kind(value))),
            },
            Schema::Object(fields) => match value.as_object() {
                Some(map) => {
                    for field in fields {
                        let child = format!("{}/{}", path, field.name);
                        match map.get(field.name) {
                            Some(Value::Null) | None => {
                                if field.required {
                                    report(issues, &child, "missing required field".to_string());
                                }
                            }
                            Some(v) => field.schema.check(v, child, issues),
                        }
                    }
                }
                None => report(issues, &path, format!("expected object, found {}", kind(value))),
            },
        }
    }
}

fn report(issues: &mut Vec<SchemaIssue>, path: &str, message: String) {
    issues.push(SchemaIssue {
        path: path.to_string(),
        message,
    });
}

fn required_names(fields: &[Field]) -> Vec<&'static str> {
    fields.iter().filter(|f| f.required).map(|f| f.name).collect()
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A type the model can be asked to produce directly.
pub trait Structured: DeserializeOwned {
    const NAME: &'static str;

    fn schema() -> Schema;
}

/// Validates `value` against `T::schema()` and deserializes it.
pub fn parse_structured<T: Structured>(value: Value) -> Result<T, PipelineError> {
    if let Err(issues) = T::schema().validate(&value) {
        let details = issues
            .iter()
            .take(8)
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        return Err(PipelineError::schema(T::NAME, details));
    }
    serde_json::from_value(value).map_err(|e| PipelineError::schema(T::NAME, e.to_string()))
}
