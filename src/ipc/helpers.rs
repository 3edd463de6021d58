use crate::calc::PeriodKey;
use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};
use crate::lifecycle::ReportCardLifecycle;
use rusqlite::Connection;
use serde_json::json;

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .and_then(|s| if s.is_empty() { None } else { Some(s) })
}

/// A number that may be omitted or null, but must be a finite number when
/// present.
pub fn optional_f64(req: &Request, key: &str) -> Result<Option<f64>, serde_json::Value> {
    match req.params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => match v.as_f64() {
            Some(n) if n.is_finite() => Ok(Some(n)),
            _ => Err(err(
                &req.id,
                "bad_params",
                format!("{} must be a number", key),
                Some(json!({ "value": v })),
            )),
        },
    }
}

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn lifecycle<'a>(
    state: &'a AppState,
    req: &Request,
) -> Result<ReportCardLifecycle<'a>, serde_json::Value> {
    state
        .lifecycle()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

/// `classId`, `year` and `period` are always explicit.
pub fn period_key(req: &Request) -> Result<PeriodKey, serde_json::Value> {
    let class_id = required_str(req, "classId")?;
    let year = required_str(req, "year")?;
    let Some(period) = req.params.get("period").and_then(|v| v.as_i64()) else {
        return Err(err(&req.id, "bad_params", "missing period", None));
    };
    if period < 1 {
        return Err(err(
            &req.id,
            "bad_params",
            "period must be >= 1",
            Some(json!({ "period": period })),
        ));
    }
    Ok(PeriodKey::new(class_id, year, period))
}
