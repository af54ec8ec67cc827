//! Status polling for one job until it reaches a terminal state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::transport::models::{Job, JobStatus};
use crate::transport::{ApiClient, TransportError};

/// Where job status comes from.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch_status(&self, job_id: &str) -> Result<Job, TransportError>;
}

#[async_trait]
impl StatusSource for ApiClient {
    async fn fetch_status(&self, job_id: &str) -> Result<Job, TransportError> {
        self.status(job_id).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerConfig {
    /// Pause after each completed fetch before the next one starts.
    pub interval: Duration,
    /// Consecutive failed fetches tolerated before the poller gives up.
    pub max_consecutive_failures: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1500),
            max_consecutive_failures: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Polling,
    Terminal(JobStatus),
    Failed(TransportError),
    Cancelled,
}

/// How a [`StatusPoller::run`] call ended.
#[derive(Debug, Clone)]
pub enum PollOutcome {
    /// Last fetched job, whose status is terminal.
    Terminal(Job),
    /// The failure that exhausted the retry ceiling.
    Failed(TransportError),
    Cancelled,
}

pub struct StatusPoller<S: ?Sized> {
    source: Arc<S>,
    job_id: String,
    config: PollerConfig,
    state: PollerState,
    fetches: u64,
}

impl<S: StatusSource + ?Sized> StatusPoller<S> {
    pub fn new(source: Arc<S>, job_id: impl Into<String>, config: PollerConfig) -> Self {
        Self {
            source,
            job_id: job_id.into(),
            config,
            state: PollerState::Idle,
            fetches: 0,
        }
    }

    pub fn state(&self) -> &PollerState {
        &self.state
    }

    /// Status requests issued so far.
    pub fn fetches(&self) -> u64 {
        self.fetches
    }

    /// Poll until terminal, failed or cancelled.
    ///
    /// The first fetch starts immediately. Requests never overlap: the next
    /// one is scheduled only after the previous has completed. `on_update` is
    /// not called once `cancel` has fired.
    pub async fn run<F>(&mut self, cancel: &CancellationToken, mut on_update: F) -> PollOutcome
    where
        F: FnMut(&Job) + Send,
    {
        self.state = PollerState::Polling;
        let mut failures: u32 = 0;
        info!(job_id = %self.job_id, interval_ms = self.config.interval.as_millis() as u64, "status polling started");

        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.cancelled(),
                result = self.source.fetch_status(&self.job_id) => result,
            };
            self.fetches += 1;

            if cancel.is_cancelled() {
                return self.cancelled();
            }

            match result {
                Ok(job) => {
                    failures = 0;
                    debug!(job_id = %self.job_id, status = %job.status, "status fetched");
                    on_update(&job);
                    if job.is_terminal() {
                        info!(job_id = %self.job_id, status = %job.status, fetches = self.fetches, "job reached terminal state");
                        self.state = PollerState::Terminal(job.status);
                        return PollOutcome::Terminal(job);
                    }
                }
                Err(e) => {
                    failures += 1;
                    warn!(job_id = %self.job_id, failures, "status fetch failed: {}", e);
                    if failures > self.config.max_consecutive_failures {
                        self.state = PollerState::Failed(e.clone());
                        return PollOutcome::Failed(e);
                    }
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.cancelled(),
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }
    }

    fn cancelled(&mut self) -> PollOutcome {
        debug!(job_id = %self.job_id, "status polling cancelled");
        self.state = PollerState::Cancelled;
        PollOutcome::Cancelled
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::transport::TransportErrorKind;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays a fixed list of responses, repeating the last one forever.
    pub(crate) struct ScriptedStatus {
        responses: Mutex<VecDeque<Result<Job, TransportError>>>,
        pub(crate) calls: Mutex<Vec<tokio::time::Instant>>,
    }

    impl ScriptedStatus {
        pub(crate) fn new(responses: Vec<Result<Job, TransportError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl StatusSource for ScriptedStatus {
        async fn fetch_status(&self, _job_id: &str) -> Result<Job, TransportError> {
            self.calls.lock().unwrap().push(tokio::time::Instant::now());
            let mut responses = self.responses.lock().unwrap();
            if responses.len() > 1 {
                responses.pop_front().unwrap()
            } else {
                responses.front().cloned().unwrap()
            }
        }
    }

    pub(crate) fn job(status: &str) -> Result<Job, TransportError> {
        Ok(serde_json::from_value(serde_json::json!({
            "job_id": "job-1",
            "status": status,
            "created_at": "1712300000.0",
            "run_dir": "runs/T-1",
        }))
        .unwrap())
    }

    pub(crate) fn network_error() -> Result<Job, TransportError> {
        Err(TransportError {
            kind: TransportErrorKind::Network,
            message: "connection refused".into(),
            http_status: None,
            code: None,
            detail: None,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_after_first_terminal_status() {
        let source = Arc::new(ScriptedStatus::new(vec![
            job("queued"),
            job("running"),
            job("running"),
            job("success"),
        ]));
        let mut poller = StatusPoller::new(source.clone(), "job-1", PollerConfig::default());
        let mut seen = Vec::new();

        let outcome = poller
            .run(&CancellationToken::new(), |job| seen.push(job.status))
            .await;

        assert!(matches!(outcome, PollOutcome::Terminal(ref j) if j.status == JobStatus::Success));
        assert_eq!(poller.fetches(), 4);
        assert_eq!(source.call_count(), 4);
        assert_eq!(
            seen,
            vec![JobStatus::Queued, JobStatus::Running, JobStatus::Running, JobStatus::Success]
        );
        assert_eq!(poller.state(), &PollerState::Terminal(JobStatus::Success));

        // no further requests once terminal
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(source.call_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_fetch_immediate_then_interval() {
        let source = Arc::new(ScriptedStatus::new(vec![job("running"), job("stopped")]));
        let mut poller = StatusPoller::new(source.clone(), "job-1", PollerConfig::default());
        let start = tokio::time::Instant::now();

        poller.run(&CancellationToken::new(), |_| {}).await;

        let calls = source.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0] - start, Duration::ZERO);
        assert_eq!(calls[1] - calls[0], Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let source = Arc::new(ScriptedStatus::new(vec![
            network_error(),
            network_error(),
            job("running"),
            network_error(),
            job("failed"),
        ]));
        let mut poller = StatusPoller::new(source.clone(), "job-1", PollerConfig::default());

        let outcome = poller.run(&CancellationToken::new(), |_| {}).await;

        assert!(matches!(outcome, PollOutcome::Terminal(ref j) if j.status == JobStatus::Failed));
        assert_eq!(source.call_count(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_retry_ceiling() {
        let source = Arc::new(ScriptedStatus::new(vec![network_error()]));
        let config = PollerConfig {
            interval: Duration::from_millis(100),
            max_consecutive_failures: 3,
        };
        let mut poller = StatusPoller::new(source.clone(), "job-1", config);

        let outcome = poller.run(&CancellationToken::new(), |_| {}).await;

        assert!(matches!(outcome, PollOutcome::Failed(ref e) if e.kind == TransportErrorKind::Network));
        assert_eq!(source.call_count(), 4);
        assert!(matches!(poller.state(), PollerState::Failed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_polling_without_updates() {
        let source = Arc::new(ScriptedStatus::new(vec![job("running")]));
        let cancel = CancellationToken::new();
        let mut poller = StatusPoller::new(source.clone(), "job-1", PollerConfig::default());

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(4000)).await;
            canceller.cancel();
        });

        let mut updates = 0;
        let outcome = poller.run(&cancel, |_| updates += 1).await;

        assert!(matches!(outcome, PollOutcome::Cancelled));
        assert_eq!(poller.state(), &PollerState::Cancelled);
        // fetches at 0ms, 1500ms and 3000ms
        assert_eq!(source.call_count(), 3);
        assert_eq!(updates, 3);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(source.call_count(), 3);
    }
}
