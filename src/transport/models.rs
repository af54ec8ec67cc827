//! Wire types for the job backend.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Lifecycle state of a remote job as reported by `/status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Success,
    Failed,
    Stopped,
    Unknown,
}

impl JobStatus {
    /// No further transition occurs from a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed | JobStatus::Stopped)
    }

    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Success => write!(f, "success"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Stopped => write!(f, "stopped"),
            JobStatus::Unknown => write!(f, "unknown"),
        }
    }
}

impl<'de> Deserialize<'de> for JobStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(match raw.as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("queued") => JobStatus::Queued,
            Some("running") => JobStatus::Running,
            Some("success") => JobStatus::Success,
            Some("failed") => JobStatus::Failed,
            Some("stopped") => JobStatus::Stopped,
            _ => JobStatus::Unknown,
        })
    }
}

/// Epoch-seconds timestamp; the backend sends it as a string or a number.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(transparent)]
pub struct EpochSeconds(pub f64);

impl EpochSeconds {
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        let secs = self.0.trunc() as i64;
        let nanos = ((self.0 - self.0.trunc()) * 1e9) as u32;
        Utc.timestamp_opt(secs, nanos).single()
    }
}

impl<'de> Deserialize<'de> for EpochSeconds {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(f64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(EpochSeconds(n)),
            Raw::Text(s) => s
                .trim()
                .parse::<f64>()
                .map(EpochSeconds)
                .map_err(serde::de::Error::custom),
        }
    }
}

/// A job record as returned by `/status/{job_id}` and `/stop/{job_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub created_at: Option<EpochSeconds>,
    #[serde(default)]
    pub started_at: Option<EpochSeconds>,
    #[serde(default)]
    pub finished_at: Option<EpochSeconds>,
    /// Which execution attempt's artifacts to read.
    #[serde(default)]
    pub run_dir: Option<String>,
    /// Every attempt directory seen so far (batch mode produces several).
    #[serde(default)]
    pub run_dirs: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub artifacts: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub device_snapshot: Option<serde_json::Value>,
    #[serde(default)]
    pub command: Option<serde_json::Value>,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Run directory to tail: the newest known attempt.
    pub fn resolved_run_dir(&self) -> Option<&str> {
        self.run_dir
            .as_deref()
            .filter(|d| !d.is_empty())
            .or_else(|| self.run_dirs.last().map(String::as_str))
    }

    /// Wall-clock run time, if the job has started.
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        let start = self.started_at?.to_datetime()?;
        let end = match self.finished_at.and_then(EpochSeconds::to_datetime) {
            Some(end) => end,
            None => Utc::now(),
        };
        Some(end - start)
    }
}

/// How many scenarios a submission covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Single,
    Range,
    Batch,
}

impl std::str::FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(RunMode::Single),
            "range" => Ok(RunMode::Range),
            "batch" => Ok(RunMode::Batch),
            other => Err(format!("unknown run mode '{other}' (expected single, range or batch)")),
        }
    }
}

/// Where the backend should find the scenario definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ScenarioRef {
    /// Token returned by a previous `/upload`.
    Uploaded(String),
    /// Path on the backend host.
    Path(String),
    /// The scenario document itself.
    Inline(serde_json::Value),
}

/// Where the backend should find the application package to install.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum PackageRef {
    Uploaded(String),
    Path(String),
}

/// A free-text task the backend turns into a one-scenario inline document.
/// The backend forces `single` mode when this is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleTask {
    pub task_description: String,
    pub package_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch_activity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
}

/// One application entry of a batch run: a single scenario, an id range,
/// or every scenario of the app when neither is given.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItem {
    pub app_id: String,
    #[serde(default, alias = "specific_id", skip_serializing_if = "Option::is_none")]
    pub scenario_id: Option<String>,
    #[serde(default, alias = "start_id", skip_serializing_if = "Option::is_none")]
    pub scenario_start_id: Option<String>,
    #[serde(default, alias = "end_id", skip_serializing_if = "Option::is_none")]
    pub scenario_end_id: Option<String>,
}

/// Body of `POST /run`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub mode: RunMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario_ref: Option<ScenarioRef>,
    #[serde(rename = "apk_ref", skip_serializing_if = "Option::is_none")]
    pub package_ref: Option<PackageRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simple_task: Option<SimpleTask>,
    /// Required by the backend in `batch` mode.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub run_config: Vec<BatchItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario_start_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario_end_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl RunRequest {
    pub fn new(mode: RunMode) -> Self {
        Self {
            mode,
            scenario_ref: None,
            package_ref: None,
            simple_task: None,
            run_config: Vec::new(),
            app_id: None,
            scenario_id: None,
            scenario_start_id: None,
            scenario_end_id: None,
            device_profile: None,
            model_profile: None,
            lang: None,
            user_id: None,
        }
    }
}

/// Result of `POST /run`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunAccepted {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub created_at: Option<EpochSeconds>,
}

/// Partial update for `POST /config`; `None` fields are left untouched,
/// empty strings clear the stored value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary_api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary_base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary_model: Option<String>,
}

impl ConfigUpdate {
    pub fn is_empty(&self) -> bool {
        self == &ConfigUpdate::default()
    }
}

/// Effective backend model configuration after an update.
pub type EffectiveConfig = std::collections::BTreeMap<String, String>;

/// What kind of file an upload turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadKind {
    Scenario,
    #[serde(rename = "apk", alias = "package")]
    Package,
}

/// Result of `POST /upload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadReceipt {
    #[serde(rename = "type")]
    pub kind: UploadKind,
    pub token: String,
    pub filename: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_terminality() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Unknown.is_terminal());
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Stopped.is_terminal());
    }

    #[test]
    fn test_job_decodes_backend_shape() {
        let job: Job = serde_json::from_value(json!({
            "job_id": "a1b2",
            "status": "running",
            "created_at": "1712345678.5",
            "started_at": 1712345680.0,
            "finished_at": null,
            "run_dir": "runs/T-app-s1",
            "run_dirs": [],
            "error": null,
            "artifacts": {"stdout": "terminallog/stdout.log"},
            "device_id": "emulator-5554",
            "device_snapshot": null,
            "command": ["python", "main.py"]
        }))
        .unwrap();

        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.resolved_run_dir(), Some("runs/T-app-s1"));
        assert_eq!(job.created_at, Some(EpochSeconds(1712345678.5)));
        assert!(job.elapsed().is_some());
    }

    #[test]
    fn test_unrecognised_status_is_unknown() {
        let job: Job = serde_json::from_value(json!({"job_id": "x", "status": "paused"})).unwrap();
        assert_eq!(job.status, JobStatus::Unknown);
        let job: Job = serde_json::from_value(json!({"job_id": "x", "status": null})).unwrap();
        assert_eq!(job.status, JobStatus::Unknown);
    }

    #[test]
    fn test_resolved_run_dir_falls_back_to_latest_attempt() {
        let job: Job = serde_json::from_value(json!({
            "job_id": "x",
            "status": "running",
            "run_dir": "",
            "run_dirs": ["runs/T-1", "runs/T-2"]
        }))
        .unwrap();
        assert_eq!(job.resolved_run_dir(), Some("runs/T-2"));
    }

    #[test]
    fn test_run_request_wire_shape() {
        let mut req = RunRequest::new(RunMode::Single);
        req.scenario_ref = Some(ScenarioRef::Uploaded("tok-1".into()));
        req.package_ref = Some(PackageRef::Path("/data/app.apk".into()));
        req.lang = Some("en".into());

        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(
            value,
            json!({
                "mode": "single",
                "scenario_ref": {"type": "uploaded", "value": "tok-1"},
                "apk_ref": {"type": "path", "value": "/data/app.apk"},
                "lang": "en"
            })
        );
    }

    #[test]
    fn test_batch_items_accept_short_id_names() {
        let items: Vec<BatchItem> = serde_json::from_value(json!([
            {"app_id": "settings", "specific_id": "4"},
            {"app_id": "clock", "start_id": "1", "end_id": "3"},
            {"app_id": "camera"}
        ]))
        .unwrap();
        assert_eq!(items[0].scenario_id.as_deref(), Some("4"));
        assert_eq!(items[1].scenario_end_id.as_deref(), Some("3"));

        let value = serde_json::to_value(&items).unwrap();
        assert_eq!(value[1], json!({"app_id": "clock", "scenario_start_id": "1", "scenario_end_id": "3"}));
        assert_eq!(value[2], json!({"app_id": "camera"}));
    }

    #[test]
    fn test_upload_receipt_accepts_package_alias() {
        let r: UploadReceipt =
            serde_json::from_value(json!({"type": "apk", "token": "t", "filename": "a.apk"})).unwrap();
        assert_eq!(r.kind, UploadKind::Package);
        let r: UploadReceipt =
            serde_json::from_value(json!({"type": "package", "token": "t", "filename": "a.apk"}))
                .unwrap();
        assert_eq!(r.kind, UploadKind::Package);
    }
}
