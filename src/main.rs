mod calc;
mod coeff;
mod config;
mod db;
mod error;
mod ipc;
mod lifecycle;
mod ranking;
mod scoring;
mod store;

use std::io::{self, BufRead, Write};

use tracing_subscriber::EnvFilter;

fn main() {
    let loaded = config::load_config();
    let cfg = loaded.as_ref().cloned().unwrap_or_default();

    // stdout carries responses, so logs go to stderr.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.log_filter))
        .unwrap_or_else(|_| EnvFilter::new("reportcardd=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    if let Err(e) = &loaded {
        tracing::error!(error = %format!("{e:#}"), "config load failed, using defaults");
    }

    let mut state = ipc::AppState::new(cfg.grading.clone());
    if let Some(ws) = cfg.workspace.as_deref() {
        if let Err(e) = ipc::open_workspace(&mut state, ws) {
            tracing::error!(workspace = %ws.display(), error = %format!("{e:#}"), "cannot open configured workspace");
        }
    }
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "reportcardd ready");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "stdin read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // No id to reply to.
                tracing::warn!(error = %e, "malformed request line");
                let resp = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                });
                let _ = writeln!(stdout, "{}", resp);
                let _ = stdout.flush();
                continue;
            }
        };

        tracing::debug!(id = %req.id, method = %req.method, "request");
        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
    tracing::info!("stdin closed, shutting down");
}
