//! The `task_results` artifact written when a run finishes.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSummary {
    pub goal: Option<String>,
    pub start_dtime: Option<String>,
    pub finish_dtime: Option<String>,
    pub step_limit: Option<f64>,
    pub task_status: Option<String>,
    pub test_status_report: Option<String>,
    pub test_status_report_zh: Option<String>,
    pub total_tokens: Option<u64>,
    pub execution_steps: Option<u64>,
    pub token_usage: Option<serde_json::Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TaskSummary {
    pub fn from_json(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }

    /// Whether the judge marked the task as passed.
    pub fn is_pass(&self) -> bool {
        self.task_status
            .as_deref()
            .map(|s| {
                let s = s.trim().to_ascii_lowercase();
                s == "success" || s == "pass" || s == "passed"
            })
            .unwrap_or(false)
    }

    /// Report in the requested language, falling back to the default one.
    pub fn report(&self, lang: &str) -> Option<&str> {
        let localized = if lang == "zh" {
            self.test_status_report_zh.as_deref()
        } else {
            None
        };
        localized
            .or(self.test_status_report.as_deref())
            .filter(|r| !r.is_empty())
    }
}
