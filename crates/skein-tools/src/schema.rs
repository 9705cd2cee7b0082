//! Minimal JSON Schema checker for tool input/output validation.
//!
//! Supports the subset tool declarations actually use: `type`, `required`,
//! `properties`, `items`, `enum`, `pattern`, `minimum`, `maximum`.

use serde_json::Value;

/// Validate `value` against `schema`. Returns all violations found.
pub fn validate(schema: &Value, value: &Value) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();
    check(schema, value, "$", &mut errors);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check(schema: &Value, value: &Value, path: &str, errors: &mut Vec<String>) {
    let Some(schema_obj) = schema.as_object() else {
        return; // non-object schemas validate everything
    };

    if let Some(expected) = schema_obj.get("type").and_then(|t| t.as_str()) {
        if !type_matches(expected, value) {
            errors.push(format!(
                "{}: expected type {}, got {}",
                path,
                expected,
                type_name(value)
            ));
            return;
        }
    }

    if let Some(allowed) = schema_obj.get("enum").and_then(|e| e.as_array()) {
        if !allowed.contains(value) {
            errors.push(format!("{}: value not in enum", path));
        }
    }

    if let Some(pattern) = schema_obj.get("pattern").and_then(|p| p.as_str()) {
        if let Some(s) = value.as_str() {
            match regex::Regex::new(pattern) {
                Ok(re) => {
                    if !re.is_match(s) {
                        errors.push(format!("{}: does not match pattern {}", path, pattern));
                    }
                }
                Err(_) => errors.push(format!("{}: invalid pattern in schema", path)),
            }
        }
    }

    if let Some(min) = schema_obj.get("minimum").and_then(|m| m.as_f64()) {
        if let Some(n) = value.as_f64() {
            if n < min {
                errors.push(format!("{}: {} is below minimum {}", path, n, min));
            }
        }
    }

    if let Some(max) = schema_obj.get("maximum").and_then(|m| m.as_f64()) {
        if let Some(n) = value.as_f64() {
            if n > max {
                errors.push(format!("{}: {} is above maximum {}", path, n, max));
            }
        }
    }

    if let Some(required) = schema_obj.get("required").and_then(|r| r.as_array()) {
        if let Some(obj) = value.as_object() {
            for req in required.iter().filter_map(|r| r.as_str()) {
                if !obj.contains_key(req) {
                    errors.push(format!("{}: missing required property '{}'", path, req));
                }
            }
        }
    }

    if let Some(props) = schema_obj.get("properties").and_then(|p| p.as_object()) {
        if let Some(obj) = value.as_object() {
            for (name, prop_schema) in props {
                if let Some(prop_value) = obj.get(name) {
                    check(prop_schema, prop_value, &format!("{}.{}", path, name), errors);
                }
            }
        }
    }

    if let Some(item_schema) = schema_obj.get("items") {
        if let Some(items) = value.as_array() {
            for (i, item) in items.iter().enumerate() {
                check(item_schema, item, &format!("{}[{}]", path, i), errors);
            }
        }
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => true,
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
