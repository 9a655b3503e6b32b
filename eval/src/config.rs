//! Controller configuration merging.
//!
//! Applies case-specific overrides to the default controller configuration.

use anyhow::Result;
use flowrunner::io::config::ControllerConfig;

use crate::case::CaseConfig;

/// Apply case configuration overrides to the base controller config.
pub fn apply_case_config(
    mut base: ControllerConfig,
    overrides: &CaseConfig,
) -> Result<ControllerConfig> {
    if let Some(threshold) = overrides.stagnation_threshold {
        base.stagnation_threshold = threshold;
    }
    if let Some(policy) = overrides.post_goal_policy {
        base.post_goal_policy = policy;
    }
    if let Some(chars) = overrides.divergence_label_chars {
        base.divergence_label_chars = chars;
    }
    base.validate()?;
    Ok(base)
}

#[cfg(test)]
mod tests {
    use flowrunner::io::config::PostGoalPolicy;

    use super::*;

    #[test]
    fn preserves_defaults_when_no_override() {
        let base = ControllerConfig::default();
        let merged = apply_case_config(base.clone(), &CaseConfig::default()).expect("merge");
        assert_eq!(merged, base);
    }

    #[test]
    fn applies_overrides() {
        let overrides = CaseConfig {
            stagnation_threshold: Some(3),
            post_goal_policy: Some(PostGoalPolicy::HighImportanceCleanup),
            divergence_label_chars: None,
        };
        let merged = apply_case_config(ControllerConfig::default(), &overrides).expect("merge");
        assert_eq!(merged.stagnation_threshold, 3);
        assert_eq!(merged.post_goal_policy, PostGoalPolicy::HighImportanceCleanup);
    }

    #[test]
    fn rejects_zero_label_width() {
        let overrides = CaseConfig {
            divergence_label_chars: Some(0),
            ..CaseConfig::default()
        };
        assert!(apply_case_config(ControllerConfig::default(), &overrides).is_err());
    }
}
