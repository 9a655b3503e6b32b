//! Controller configuration stored under `.flowrunner/config.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::tree_view::DEFAULT_LABEL_CHARS;

/// What the controller does once the primary goal holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostGoalPolicy {
    /// Report `COMPLETE` immediately.
    #[default]
    Stop,
    /// Keep running eligible `HIGH` importance nodes, then report `COMPLETE`.
    HighImportanceCleanup,
}

/// Controller configuration (TOML).
///
/// Intended to be edited by humans. Missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ControllerConfig {
    /// Consecutive no-progress selections of one node tolerated before the
    /// controller force-escalates it.
    pub stagnation_threshold: u32,

    pub post_goal_policy: PostGoalPolicy,

    /// Characters kept from the first user message when labelling alternate paths.
    pub divergence_label_chars: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            stagnation_threshold: 10,
            post_goal_policy: PostGoalPolicy::default(),
            divergence_label_chars: DEFAULT_LABEL_CHARS,
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.stagnation_threshold == 0 {
            return Err(anyhow!("stagnation_threshold must be > 0"));
        }
        if self.divergence_label_chars == 0 {
            return Err(anyhow!("divergence_label_chars must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ControllerConfig::default()`.
pub fn load_config(path: &Path) -> Result<ControllerConfig> {
    if !path.exists() {
        return Ok(ControllerConfig::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ControllerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ControllerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, ControllerConfig::default());
        assert_eq!(cfg.stagnation_threshold, 10);
        assert_eq!(cfg.post_goal_policy, PostGoalPolicy::Stop);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = ControllerConfig {
            stagnation_threshold: 4,
            post_goal_policy: PostGoalPolicy::HighImportanceCleanup,
            divergence_label_chars: 24,
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "post_goal_policy = \"high_importance_cleanup\"\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.post_goal_policy, PostGoalPolicy::HighImportanceCleanup);
        assert_eq!(cfg.stagnation_threshold, 10);
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "stagnation_threshold = 0\n").expect("write");
        let err = load_config(&path).expect_err("invalid");
        assert!(format!("{err:#}").contains("stagnation_threshold"));
    }
}
