//! Structural validation of task field data.

use serde_json::Value;
use uuid::Uuid;

use crate::domain::PriorityTier;

/// Check the field data of a task before it is encoded or after it is
/// decoded.
///
/// Every violation is logged with the offending field; the result is a
/// plain `false`, never an error.
pub fn validate_task_data(data: &Value) -> bool {
    match first_violation(data) {
        None => true,
        Some((field, problem)) => {
            tracing::warn!(field, problem, "task data failed validation");
            false
        }
    }
}

/// First `(field, problem)` found, in field order.
pub(crate) fn first_violation(data: &Value) -> Option<(&'static str, &'static str)> {
    let Some(fields) = data.as_object() else {
        return Some(("data", "not an object"));
    };

    match fields.get("task_id") {
        None | Some(Value::Null) => return Some(("task_id", "missing")),
        Some(Value::String(s)) if is_uuid_shaped(s) => {}
        Some(_) => return Some(("task_id", "not a UUID string")),
    }

    for field in ["owner_id", "resource_id"] {
        match fields.get(field) {
            None | Some(Value::Null) => return Some((field, "missing")),
            Some(v) if v.as_i64().is_some_and(|n| n > 0) => {}
            Some(_) => return Some((field, "not a positive integer")),
        }
    }

    match fields.get("priority") {
        None | Some(Value::Null) => {}
        Some(Value::String(s)) if s.parse::<PriorityTier>().is_ok() => {}
        Some(_) => return Some(("priority", "not a known tier")),
    }

    for field in ["retry_count", "max_retries"] {
        match fields.get(field) {
            None | Some(Value::Null) => {}
            Some(v) if v.as_u64().is_some_and(|n| n <= u64::from(u32::MAX)) => {}
            Some(_) => return Some((field, "not a non-negative integer")),
        }
    }

    match fields.get("settings") {
        None | Some(Value::Null) | Some(Value::Object(_)) => {}
        Some(_) => return Some(("settings", "not a mapping")),
    }

    match fields.get("created_at") {
        None | Some(Value::Null) | Some(Value::String(_)) => {}
        Some(_) => return Some(("created_at", "not a timestamp string")),
    }

    None
}

/// 8-4-4-4-12 hex, hyphenated.
fn is_uuid_shaped(s: &str) -> bool {
    s.len() == 36 && Uuid::parse_str(s).is_ok()
}
