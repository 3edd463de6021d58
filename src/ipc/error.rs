use serde_json::json;

use crate::error::CalcError;

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

pub fn calc_err(id: &str, e: CalcError) -> serde_json::Value {
    if matches!(e, CalcError::Invariant(_) | CalcError::Db(_)) {
        tracing::error!(request_id = id, error = %e, "request failed");
    }
    let details = match &e {
        CalcError::InvalidTransition { from, to } => Some(json!({ "from": from, "to": to })),
        _ => None,
    };
    err(id, e.code(), e.to_string(), details)
}
