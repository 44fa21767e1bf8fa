use serde_json::json;

use crate::allocation::AllocationError;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

pub fn allocation_err(id: &str, e: &AllocationError) -> serde_json::Value {
    let message = match e {
        AllocationError::Storage(inner) => format!("{inner:#}"),
        other => other.to_string(),
    };
    err(id, e.code(), message, e.details())
}
