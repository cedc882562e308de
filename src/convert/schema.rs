//! JSON-Schema sanitizer for tool parameter schemas.
//!
//! The Anthropic API rejects schemas carrying vendor extensions that OpenAI
//! clients routinely send (`$schema`, `additionalProperties`, custom
//! annotations). Rather than enumerate everything to strip, the sanitizer
//! keeps a whitelist of portable JSON-Schema fields and recurses into
//! `properties` and `items`.

use serde_json::{json, Map, Value};

/// Fields preserved at every nesting level.
const ALLOWED_FIELDS: &[&str] = &[
    "type",
    "properties",
    "required",
    "items",
    "enum",
    "description",
    "default",
    "minimum",
    "maximum",
    "minLength",
    "maxLength",
    "pattern",
    "minItems",
    "maxItems",
];

/// Reduce an OpenAI `parameters` object to an Anthropic-safe `input_schema`.
///
/// Anything that is not a JSON object (including `null` or absence) becomes
/// the empty object schema, which Anthropic requires at minimum.
pub fn sanitize_schema(parameters: Option<&Value>) -> Value {
    match parameters.and_then(Value::as_object) {
        Some(object) => sanitize_object(object),
        None => json!({ "type": "object", "properties": {} }),
    }
}

fn sanitize_object(object: &Map<String, Value>) -> Value {
    let mut out = Map::new();

    for field in ALLOWED_FIELDS {
        let Some(value) = object.get(*field) else { continue };
        let value = match *field {
            "properties" => sanitize_properties(value),
            "items" => sanitize_nested(value),
            _ => value.clone(),
        };
        out.insert((*field).to_string(), value);
    }

    // Anthropic insists on a typed top level; default to an object schema.
    out.entry("type".to_string())
        .or_insert_with(|| Value::String("object".to_string()));
    if out["type"] == "object" && !out.contains_key("properties") {
        out.insert("properties".to_string(), json!({}));
    }

    Value::Object(out)
}

fn sanitize_properties(value: &Value) -> Value {
    match value.as_object() {
        Some(properties) => Value::Object(
            properties
                .iter()
                .map(|(name, prop)| (name.clone(), sanitize_nested(prop)))
                .collect(),
        ),
        None => json!({}),
    }
}

fn sanitize_nested(value: &Value) -> Value {
    match value.as_object() {
        Some(object) => {
            let mut out = Map::new();
            for field in ALLOWED_FIELDS {
                let Some(inner) = object.get(*field) else { continue };
                let inner = match *field {
                    "properties" => sanitize_properties(inner),
                    "items" => sanitize_nested(inner),
                    _ => inner.clone(),
                };
                out.insert((*field).to_string(), inner);
            }
            Value::Object(out)
        }
        None => value.clone(),
    }
}
