use std::collections::HashMap;

use crate::error::{Result, SkeinError};

/// Evaluate a gating expression against a variable scope.
///
/// Supported forms:
/// - `key == "value"` / `key != "value"`: string/number/bool equality
/// - `key contains "substr"`: substring match
/// - `key > n`, `key >= n`, `key < n`, `key <= n`: numeric comparison
/// - `key`: truthiness (missing, null, false, 0, and "" are false)
///
/// Keys may be dot paths (`result.status`). Returns `ExpressionParse` for
/// expressions that match no supported form.
pub fn evaluate(expr: &str, scope: &HashMap<String, serde_json::Value>) -> Result<bool> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err(SkeinError::ExpressionParse("empty expression".into()));
    }

    // Order matters: `>=`/`<=` before `>`/`<`, `!=` before bare keys.
    for op in ["contains", "!=", "==", ">=", "<=", ">", "<"] {
        if let Some((key, rhs)) = split_operator(expr, op) {
            let lhs = lookup(scope, key);
            return apply(op, lhs, rhs);
        }
    }

    // Bare key: truthiness test.
    if expr.split_whitespace().count() == 1 {
        return Ok(truthy(lookup(scope, expr)));
    }

    Err(SkeinError::ExpressionParse(format!(
        "unsupported expression: {}",
        expr
    )))
}

/// Evaluate, treating unparseable expressions as `false`.
///
/// Edge conditions use this: a malformed condition makes the edge
/// non-matching rather than failing the run.
pub fn evaluate_or_false(expr: &str, scope: &HashMap<String, serde_json::Value>) -> bool {
    evaluate(expr, scope).unwrap_or(false)
}

/// Resolve a dot path (`a.b.c`) inside a JSON value.
pub fn resolve_path<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            serde_json::Value::Object(map) => map.get(segment)?,
            serde_json::Value::Array(items) => {
                let idx: usize = segment.parse().ok()?;
                items.get(idx)?
            }
            _ => return None,
        };
    }
    Some(current)
}

/// Build an evaluation scope from an arbitrary JSON value.
///
/// Objects contribute their entries; anything else lands under `"value"`.
pub fn scope_from_value(value: &serde_json::Value) -> HashMap<String, serde_json::Value> {
    match value {
        serde_json::Value::Object(map) => map.clone().into_iter().collect(),
        other => {
            let mut scope = HashMap::new();
            scope.insert("value".to_string(), other.clone());
            scope
        }
    }
}

fn lookup<'a>(
    scope: &'a HashMap<String, serde_json::Value>,
    key: &str,
) -> Option<&'a serde_json::Value> {
    match key.split_once('.') {
        Some((head, rest)) => scope.get(head).and_then(|v| resolve_path(v, rest)),
        None => scope.get(key),
    }
}

fn truthy(value: Option<&serde_json::Value>) -> bool {
    match value {
        None | Some(serde_json::Value::Null) => false,
        Some(serde_json::Value::Bool(b)) => *b,
        Some(serde_json::Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(serde_json::Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

fn apply(op: &str, lhs: Option<&serde_json::Value>, rhs: &str) -> Result<bool> {
    match op {
        "contains" => Ok(lhs
            .and_then(|v| v.as_str())
            .is_some_and(|s| s.contains(rhs))),
        "==" => Ok(compare_eq(lhs, rhs)),
        "!=" => Ok(!compare_eq(lhs, rhs)),
        ">" | ">=" | "<" | "<=" => {
            let left = lhs.and_then(|v| v.as_f64());
            let right: f64 = rhs
                .parse()
                .map_err(|_| SkeinError::ExpressionParse(format!("not a number: {}", rhs)))?;
            let Some(left) = left else { return Ok(false) };
            Ok(match op {
                ">" => left > right,
                ">=" => left >= right,
                "<" => left < right,
                _ => left <= right,
            })
        }
        other => Err(SkeinError::ExpressionParse(format!(
            "unknown operator: {}",
            other
        ))),
    }
}

fn compare_eq(lhs: Option<&serde_json::Value>, rhs: &str) -> bool {
    let Some(lhs) = lhs else { return false };
    match lhs {
        serde_json::Value::String(s) => s == rhs,
        serde_json::Value::Number(n) => rhs.parse::<f64>().is_ok_and(|r| n.as_f64() == Some(r)),
        serde_json::Value::Bool(b) => rhs.parse::<bool>().is_ok_and(|r| *b == r),
        _ => false,
    }
}

/// Parse `key OP rhs`, returning (key, rhs) with quotes stripped from rhs.
fn split_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    // `contains` needs surrounding whitespace to avoid matching inside keys.
    let needle = if op == "contains" {
        format!(" {} ", op)
    } else {
        op.to_string()
    };
    let idx = expr.find(&needle)?;
    let key = expr[..idx].trim();
    let rhs = expr[idx + needle.len()..].trim().trim_matches('"');
    if key.is_empty() || rhs.is_empty() {
        return None;
    }
    Some((key, rhs))
}
