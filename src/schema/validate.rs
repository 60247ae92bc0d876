//! Snapshot content validation against a declared schema.
//!
//! Covers the subset of JSON Schema the engine's declarations use: `type`
//! (single or list), `required`, `additionalProperties: false`, `enum` and
//! `default`.

use super::LixSchema;
use crate::error::{LixError, Result};
use serde_json::{Map, Value};

/// Normalize loosely typed input before validation.
///
/// SQL callers bind booleans as 0/1 and structured values as JSON text;
/// both are converted to the declared type. Missing properties with a
/// declared `default` are filled in.
pub fn coerce_content(schema: &LixSchema, content: Value) -> Value {
    let Value::Object(mut object) = content else {
        return content;
    };

    for name in &schema.properties {
        let Some(declared) = schema.property(name) else {
            continue;
        };
        let types = declared_types(declared);

        let replacement = match object.get(name) {
            None => declared.get("default").cloned(),
            Some(Value::Number(n)) if types.contains(&"boolean") && !types.contains(&"number") => {
                match n.as_i64() {
                    Some(0) => Some(Value::Bool(false)),
                    Some(1) => Some(Value::Bool(true)),
                    _ => None,
                }
            }
            Some(Value::String(text))
                if (types.contains(&"object") || types.contains(&"array"))
                    && !types.contains(&"string") =>
            {
                serde_json::from_str::<Value>(text)
                    .ok()
                    .filter(|parsed| types.contains(&type_name(parsed)))
            }
            _ => None,
        };

        if let Some(value) = replacement {
            object.insert(name.clone(), value);
        }
    }

    Value::Object(object)
}

/// Check content against the schema.
pub fn validate_content(schema: &LixSchema, content: &Value) -> Result<()> {
    let object = match content {
        Value::Object(object) => object,
        Value::String(_) => {
            return Err(LixError::schema(
                &schema.key,
                "content is a string; expected a JSON object (was it stringified twice?)",
            ));
        }
        other => {
            return Err(LixError::schema(
                &schema.key,
                format!("content must be a JSON object, got {}", type_name(other)),
            ));
        }
    };

    if let Some(required) = schema.definition.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if !object.contains_key(name) {
                return Err(LixError::schema(
                    &schema.key,
                    format!("missing required property '{name}'"),
                ));
            }
        }
    }

    for column in &schema.primary_key {
        if matches!(object.get(column), None | Some(Value::Null)) {
            return Err(LixError::schema(
                &schema.key,
                format!("primary key property '{column}' must be set"),
            ));
        }
    }

    let closed = schema.definition.get("additionalProperties") == Some(&Value::Bool(false));
    for (name, value) in object {
        match schema.property(name) {
            Some(declared) => check_property(schema, name, declared, value)?,
            None if closed => {
                return Err(LixError::schema(
                    &schema.key,
                    format!("unknown property '{name}'"),
                ));
            }
            None => {}
        }
    }

    Ok(())
}

fn check_property(schema: &LixSchema, name: &str, declared: &Value, value: &Value) -> Result<()> {
    let types = declared_types(declared);
    if !types.is_empty() && !types.iter().any(|t| matches_type(t, value)) {
        return Err(LixError::schema(
            &schema.key,
            format!(
                "property '{name}' must be {}, got {}",
                types.join(" or "),
                type_name(value)
            ),
        ));
    }

    if let Some(options) = declared.get("enum").and_then(Value::as_array) {
        if !options.contains(value) {
            return Err(LixError::schema(
                &schema.key,
                format!("property '{name}' is not one of the allowed values"),
            ));
        }
    }

    if let Value::Object(nested) = value {
        check_nested_required(schema, name, nested, declared)?;
    }

    Ok(())
}

fn check_nested_required(
    schema: &LixSchema,
    name: &str,
    nested: &Map<String, Value>,
    declared: &Value,
) -> Result<()> {
    if let Some(required) = declared.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if !nested.contains_key(field) {
                return Err(LixError::schema(
                    &schema.key,
                    format!("property '{name}' is missing required field '{field}'"),
                ));
            }
        }
    }
    Ok(())
}

fn declared_types(declared: &Value) -> Vec<&str> {
    match declared.get("type") {
        Some(Value::String(t)) => vec![t.as_str()],
        Some(Value::Array(list)) => list.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}

fn matches_type(expected: &str, value: &Value) -> bool {
    match expected {
        "integer" => value.as_i64().is_some() || value.as_u64().is_some(),
        "number" => value.is_number(),
        other => type_name(value) == other,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
