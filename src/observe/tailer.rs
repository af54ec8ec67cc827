//! Periodic artifact fetching for one `(job, run_dir)` pair.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::transport::models::Job;
use crate::transport::{ApiClient, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Stdout,
    LatestScreenshot,
    Script,
    TaskResults,
    ChatLog,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 5] = [
        ArtifactKind::Stdout,
        ArtifactKind::LatestScreenshot,
        ArtifactKind::Script,
        ArtifactKind::TaskResults,
        ArtifactKind::ChatLog,
    ];

    /// Alias understood by the backend download endpoint.
    pub fn wire_name(self) -> &'static str {
        match self {
            ArtifactKind::Stdout => "stdout",
            ArtifactKind::LatestScreenshot => "latest_screenshot",
            ArtifactKind::Script => "script",
            ArtifactKind::TaskResults => "task_results",
            ArtifactKind::ChatLog => "chat_log",
        }
    }

    pub fn cadence(self, config: &TailConfig) -> Cadence {
        match self {
            ArtifactKind::Stdout => Cadence::Live {
                interval: config.stdout_interval,
            },
            ArtifactKind::LatestScreenshot => Cadence::Live {
                interval: config.screenshot_interval,
            },
            ArtifactKind::ChatLog => Cadence::Live {
                interval: config.chat_log_interval,
            },
            ArtifactKind::Script | ArtifactKind::TaskResults => Cadence::UntilObtained {
                retry: config.document_retry,
            },
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

impl std::str::FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ArtifactKind::ALL
            .into_iter()
            .find(|kind| kind.wire_name() == s)
            .ok_or_else(|| format!("unknown artifact '{s}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// Refetch every `interval` while the job is active, plus once after it ends.
    Live { interval: Duration },
    /// Retry every `retry` until the first successful fetch.
    UntilObtained { retry: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TailConfig {
    pub stdout_interval: Duration,
    pub screenshot_interval: Duration,
    pub chat_log_interval: Duration,
    pub document_retry: Duration,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            stdout_interval: Duration::from_millis(2000),
            screenshot_interval: Duration::from_millis(1500),
            chat_log_interval: Duration::from_millis(2000),
            document_retry: Duration::from_millis(5000),
        }
    }
}

/// Where artifact bytes come from.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    async fn fetch_artifact(
        &self,
        job_id: &str,
        kind: ArtifactKind,
        run_dir: &str,
    ) -> Result<Bytes, TransportError>;
}

#[async_trait]
impl ArtifactSource for ApiClient {
    async fn fetch_artifact(
        &self,
        job_id: &str,
        kind: ArtifactKind,
        run_dir: &str,
    ) -> Result<Bytes, TransportError> {
        self.download_artifact(job_id, kind.wire_name(), Some(run_dir))
            .await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactUpdate {
    Content(Bytes),
    /// The backend answered 404: the artifact is not there (yet).
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailOutcome {
    /// A live tailer made its last fetch after the job stopped being observed.
    Finished,
    /// A document was fetched successfully.
    Obtained,
    /// The job ended without the document ever becoming available.
    Unavailable,
    Cancelled,
}

pub struct ArtifactTailer<S: ?Sized> {
    source: Arc<S>,
    job_id: String,
    run_dir: String,
    kind: ArtifactKind,
    cadence: Cadence,
}

impl<S: ArtifactSource + ?Sized> ArtifactTailer<S> {
    pub fn new(
        source: Arc<S>,
        job_id: impl Into<String>,
        run_dir: impl Into<String>,
        kind: ArtifactKind,
        config: &TailConfig,
    ) -> Self {
        Self {
            source,
            job_id: job_id.into(),
            run_dir: run_dir.into(),
            kind,
            cadence: kind.cadence(config),
        }
    }

    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }

    /// Fetch on this artifact's cadence until done or cancelled.
    ///
    /// `job` carries the latest polled job. Once it is terminal, or its sender
    /// is gone, the tailer treats the job as over. Errors other than 404 are
    /// logged and retried on the next tick. `on_update` returns whether it
    /// accepted the content; a document counts as obtained only then. It is
    /// never called after `cancel` has fired.
    pub async fn run<F>(
        self,
        cancel: CancellationToken,
        job: watch::Receiver<Option<Job>>,
        mut on_update: F,
    ) -> TailOutcome
    where
        F: FnMut(ArtifactKind, ArtifactUpdate) -> bool + Send,
    {
        let (Cadence::Live { interval: pause } | Cadence::UntilObtained { retry: pause }) =
            self.cadence;
        debug!(job_id = %self.job_id, run_dir = %self.run_dir, artifact = %self.kind, "tailer started");

        loop {
            let job_over = job_has_ended(&job);

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return TailOutcome::Cancelled,
                result = self.source.fetch_artifact(&self.job_id, self.kind, &self.run_dir) => result,
            };
            if cancel.is_cancelled() {
                return TailOutcome::Cancelled;
            }

            let obtained = match result {
                Ok(bytes) => {
                    let accepted = on_update(self.kind, ArtifactUpdate::Content(bytes));
                    if !accepted {
                        debug!(job_id = %self.job_id, artifact = %self.kind, "content rejected, will refetch");
                    }
                    accepted
                }
                Err(e) if e.is_absence() => {
                    on_update(self.kind, ArtifactUpdate::Absent);
                    false
                }
                Err(e) => {
                    warn!(job_id = %self.job_id, artifact = %self.kind, "artifact fetch failed: {}", e);
                    false
                }
            };

            match self.cadence {
                Cadence::Live { .. } if job_over => return TailOutcome::Finished,
                Cadence::UntilObtained { .. } if obtained => return TailOutcome::Obtained,
                Cadence::UntilObtained { .. } if job_over => return TailOutcome::Unavailable,
                _ => {}
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return TailOutcome::Cancelled,
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }
}

fn job_has_ended(job: &watch::Receiver<Option<Job>>) -> bool {
    job.has_changed().is_err() || job.borrow().as_ref().is_some_and(Job::is_terminal)
}
