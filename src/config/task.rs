//! Settings handed to the external task and the safety overrides applied
//! before every unattended run.

use serde::{Deserialize, Serialize};

/// How the task handles resume documents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeMode {
    /// Upload the resume already on file.
    #[default]
    Existing,
    /// Produce a tailored resume per job.
    Tailored,
    /// Do not attach a resume.
    None,
}

/// Task-specific toggles from the scheduler configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskOverrides {
    /// Resume handling selected for unattended runs.
    pub resume_mode: ResumeMode,
}

/// Configuration the external task reads.
///
/// Unknown keys survive a round trip through `extra` so the scheduler can
/// override a few knobs without understanding the rest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSettings {
    /// Run without waiting for a human.
    pub pilot_mode: bool,
    /// Pause for confirmation before each submission.
    pub pause_before_submit: bool,
    /// Pause when a question cannot be answered.
    pub pause_at_failed_question: bool,
    /// Cap on jobs the task processes in one run.
    pub max_jobs: Option<u32>,
    /// Resume handling.
    pub resume_mode: ResumeMode,
    /// Settings the scheduler does not interpret.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TaskSettings {
    /// Force an unattended configuration: pilot mode on, every pause off, the
    /// job cap tightened to `target`, and the configured resume mode.
    #[must_use]
    pub fn with_safety_overrides(mut self, target: u32, overrides: &TaskOverrides) -> Self {
        self.pilot_mode = true;
        self.pause_before_submit = false;
        self.pause_at_failed_question = false;
        self.max_jobs = Some(self.max_jobs.map_or(target, |cap| cap.min(target)));
        self.resume_mode = overrides.resume_mode;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_force_unattended_mode() {
        let base = TaskSettings {
            pause_before_submit: true,
            pause_at_failed_question: true,
            ..TaskSettings::default()
        };
        let settings = base.with_safety_overrides(
            10,
            &TaskOverrides {
                resume_mode: ResumeMode::Tailored,
            },
        );
        assert!(settings.pilot_mode);
        assert!(!settings.pause_before_submit);
        assert!(!settings.pause_at_failed_question);
        assert_eq!(settings.max_jobs, Some(10));
        assert_eq!(settings.resume_mode, ResumeMode::Tailored);
    }

    #[test]
    fn test_job_cap_only_tightens() {
        let loose = TaskSettings {
            max_jobs: Some(100),
            ..TaskSettings::default()
        };
        assert_eq!(loose.with_safety_overrides(5, &TaskOverrides::default()).max_jobs, Some(5));

        let tight = TaskSettings {
            max_jobs: Some(3),
            ..TaskSettings::default()
        };
        assert_eq!(tight.with_safety_overrides(5, &TaskOverrides::default()).max_jobs, Some(3));
    }

    #[test]
    fn test_unknown_keys_survive() {
        let settings: TaskSettings =
            serde_json::from_str(r#"{"pilot_mode": false, "search_terms": ["rust"]}"#).unwrap();
        assert_eq!(settings.extra["search_terms"][0], "rust");
        let json = serde_json::to_value(&settings).unwrap();
        assert_eq!(json["search_terms"][0], "rust");
    }
}
