use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::config::GradingSettings;
use crate::lifecycle::{ClassLocks, ReportCardLifecycle};

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub locks: ClassLocks,
    /// Daemon-level defaults; a workspace may override them.
    pub default_grading: GradingSettings,
    pub grading: GradingSettings,
}

impl AppState {
    pub fn new(default_grading: GradingSettings) -> Self {
        Self {
            workspace: None,
            db: None,
            locks: ClassLocks::new(),
            grading: default_grading.clone(),
            default_grading,
        }
    }

    pub fn lifecycle(&self) -> Option<ReportCardLifecycle<'_>> {
        self.db
            .as_ref()
            .map(|conn| ReportCardLifecycle::new(conn, &self.locks, &self.grading))
    }
}
