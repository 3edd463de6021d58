use crate::config::GradingSettings;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::{Path, PathBuf};

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "grading": state.grading,
        }),
    )
}

/// Workspace-level grading overrides live in the `grading` settings key.
/// Unreadable overrides are logged and ignored so the workspace still opens.
fn workspace_grading(conn: &rusqlite::Connection, defaults: &GradingSettings) -> GradingSettings {
    let raw = match db::settings_get_json(conn, "grading") {
        Ok(Some(v)) => v,
        Ok(None) => return defaults.clone(),
        Err(e) => {
            tracing::warn!(error = %e, "cannot read workspace grading settings");
            return defaults.clone();
        }
    };
    let mut merged = serde_json::to_value(defaults).unwrap_or_else(|_| json!({}));
    if let (Some(base), Some(over)) = (merged.as_object_mut(), raw.as_object()) {
        for (k, v) in over {
            base.insert(k.clone(), v.clone());
        }
    }
    match serde_json::from_value::<GradingSettings>(merged) {
        Ok(g) => g.sanitized(),
        Err(e) => {
            tracing::warn!(error = %e, "ignoring malformed workspace grading settings");
            defaults.clone()
        }
    }
}

pub fn open_workspace(state: &mut AppState, path: &Path) -> anyhow::Result<()> {
    let conn = db::open_db(path)?;
    state.grading = workspace_grading(&conn, &state.default_grading);
    state.workspace = Some(path.to_path_buf());
    state.db = Some(conn);
    tracing::info!(workspace = %path.display(), scale = state.grading.scale, "workspace opened");
    Ok(())
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match open_workspace(state, &path) {
        Ok(()) => ok(&req.id, json!({ "workspacePath": path.to_string_lossy() })),
        Err(e) => {
            tracing::error!(workspace = %path.display(), error = %e, "cannot open workspace");
            err(&req.id, "db_open_failed", format!("{e:?}"), None)
        }
    }
}

fn handle_grading_settings_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let mut next = state.grading.clone();
    if let Some(v) = req.params.get("scale") {
        match v.as_f64() {
            Some(n) if n > 0.0 && n.is_finite() => next.scale = n,
            _ => return err(&req.id, "bad_params", "scale must be a positive number", None),
        }
    }
    if let Some(v) = req.params.get("workers") {
        match v.as_u64() {
            Some(n) if n >= 1 => next.workers = n as usize,
            _ => return err(&req.id, "bad_params", "workers must be an integer >= 1", None),
        }
    }
    let value = json!(next);
    if let Err(e) = db::settings_set_json(conn, "grading", &value) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    state.grading = next;
    ok(&req.id, json!({ "grading": value }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        "settings.updateGrading" => Some(handle_grading_settings_update(state, req)),
        _ => None,
    }
}
