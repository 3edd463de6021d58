//! Daemon configuration.
//!
//! Search order:
//! 1. the file named by `REPORTCARDD_CONFIG`
//! 2. `reportcardd.toml` in the current directory
//! 3. built-in defaults
//!
//! `REPORTCARDD_WORKSPACE` overrides the configured workspace path.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::calc::DEFAULT_SCALE;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradingSettings {
    /// Scale raw scores are normalized to before subject averaging.
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Worker threads used when generating a whole class.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_scale() -> f64 {
    DEFAULT_SCALE
}
fn default_workers() -> usize {
    4
}

impl Default for GradingSettings {
    fn default() -> Self {
        Self {
            scale: default_scale(),
            workers: default_workers(),
        }
    }
}

impl GradingSettings {
    /// Clamp nonsense values back to something usable.
    pub fn sanitized(mut self) -> Self {
        if !(self.scale > 0.0) || !self.scale.is_finite() {
            self.scale = default_scale();
        }
        self.workers = self.workers.max(1);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Workspace opened at startup, if any.
    #[serde(default)]
    pub workspace: Option<PathBuf>,
    /// `tracing` env-filter directive.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default)]
    pub grading: GradingSettings,
}

fn default_log_filter() -> String {
    "reportcardd=info".to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            workspace: None,
            log_filter: default_log_filter(),
            grading: GradingSettings::default(),
        }
    }
}

pub fn load_config() -> Result<DaemonConfig> {
    let explicit = std::env::var_os("REPORTCARDD_CONFIG").map(PathBuf::from);
    let mut cfg = load_config_from(explicit.as_deref())?;
    if let Some(ws) = std::env::var_os("REPORTCARDD_WORKSPACE") {
        if !ws.is_empty() {
            cfg.workspace = Some(PathBuf::from(ws));
        }
    }
    Ok(cfg)
}

pub fn load_config_from(path: Option<&Path>) -> Result<DaemonConfig> {
    let config_path = match path {
        Some(p) if p.exists() => Some(p.to_path_buf()),
        Some(p) => anyhow::bail!("config file not found: {}", p.display()),
        None => {
            let local = PathBuf::from("reportcardd.toml");
            if local.exists() {
                Some(local)
            } else {
                None
            }
        }
    };

    let Some(config_path) = config_path else {
        return Ok(DaemonConfig::default());
    };
    let content = std::fs::read_to_string(&config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    parse_config(&content).with_context(|| format!("failed to parse {}", config_path.display()))
}

pub fn parse_config(content: &str) -> Result<DaemonConfig> {
    let mut cfg: DaemonConfig = toml::from_str(content)?;
    cfg.grading = cfg.grading.sanitized();
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = parse_config("").expect("parse");
        assert_eq!(cfg, DaemonConfig::default());
        assert_eq!(cfg.grading.scale, 20.0);
    }

    #[test]
    fn grading_section_is_read_and_sanitized() {
        let cfg = parse_config(
            r#"
workspace = "/srv/school"
log_filter = "reportcardd=debug"

[grading]
scale = 100.0
workers = 0
"#,
        )
        .expect("parse");
        assert_eq!(cfg.workspace, Some(PathBuf::from("/srv/school")));
        assert_eq!(cfg.log_filter, "reportcardd=debug");
        assert_eq!(cfg.grading.scale, 100.0);
        assert_eq!(cfg.grading.workers, 1);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let res = load_config_from(Some(Path::new("/definitely/not/here.toml")));
        assert!(res.is_err());
    }
}
