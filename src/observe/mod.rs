//! View-scoped observation of one job.
//!
//! An [`Observer`] owns a status poller plus one tailer per artifact kind for
//! the job's current run directory. Everything it learns lands in a
//! [`Dashboard`] behind a mutex; readers are woken through a revision counter.
//! Cancelling the observer stops every task it started and no state is
//! written afterwards.

pub mod poller;
pub mod screenshot;
pub mod tailer;

pub use self::poller::{PollOutcome, PollerConfig, PollerState, StatusPoller, StatusSource};
pub use self::screenshot::{ScreenshotSlot, TransientRef};
pub use self::tailer::{ArtifactKind, ArtifactSource, ArtifactTailer, ArtifactUpdate, TailConfig};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::reconstruct::{
    build_frames, parse_event_log, EventRecord, StepDocument, TaskSummary, TimelineCache,
    TimelineEntry,
};
use crate::transport::models::Job;
use crate::transport::TransportError;
use self::tailer::TailOutcome;

/// Anything that can serve both status and artifacts for a job.
pub trait JobSource: StatusSource + ArtifactSource {}

impl<T: StatusSource + ArtifactSource + ?Sized> JobSource for T {}

#[derive(Debug, Error)]
pub enum ObserveError {
    #[error("job {job_id} is already being observed")]
    AlreadyWatching { job_id: String },
}

#[derive(Debug, Clone)]
pub struct ObserverOptions {
    pub poller: PollerConfig,
    pub tail: TailConfig,
    /// Tail this run directory instead of the one reported by the backend.
    pub run_dir: Option<String>,
    /// Shown as the first timeline entry.
    pub initial_goal: Option<String>,
    /// Where screenshot bytes are spilled for rendering.
    pub spill_dir: PathBuf,
}

impl Default for ObserverOptions {
    fn default() -> Self {
        Self {
            poller: PollerConfig::default(),
            tail: TailConfig::default(),
            run_dir: None,
            initial_goal: None,
            spill_dir: std::env::temp_dir().join("jobscope"),
        }
    }
}

/// Everything currently known about an observed job.
#[derive(Debug)]
pub struct Dashboard {
    job: Option<Job>,
    poller: PollerState,
    run_dir: Option<String>,
    initial_goal: Option<String>,
    log: String,
    timeline: Vec<TimelineEntry>,
    timeline_cache: TimelineCache,
    screenshot: ScreenshotSlot,
    steps: Option<StepDocument>,
    frames: Vec<String>,
    summary: Option<TaskSummary>,
    events: Vec<EventRecord>,
    observing: bool,
}

impl Dashboard {
    pub fn new(initial_goal: Option<String>, spill_dir: impl Into<PathBuf>) -> Self {
        let mut timeline_cache = TimelineCache::new();
        let timeline = timeline_cache.get("", initial_goal.as_deref()).to_vec();
        Self {
            job: None,
            poller: PollerState::Idle,
            run_dir: None,
            initial_goal,
            log: String::new(),
            timeline,
            timeline_cache,
            screenshot: ScreenshotSlot::new(spill_dir),
            steps: None,
            frames: Vec::new(),
            summary: None,
            events: Vec::new(),
            observing: true,
        }
    }

    pub fn job(&self) -> Option<&Job> {
        self.job.as_ref()
    }

    pub fn poller_state(&self) -> &PollerState {
        &self.poller
    }

    /// The failure that made the poller give up, if it did.
    pub fn poll_error(&self) -> Option<&TransportError> {
        match &self.poller {
            PollerState::Failed(e) => Some(e),
            _ => None,
        }
    }

    pub fn run_dir(&self) -> Option<&str> {
        self.run_dir.as_deref()
    }

    pub fn log(&self) -> &str {
        &self.log
    }

    pub fn timeline(&self) -> &[TimelineEntry] {
        &self.timeline
    }

    pub fn screenshot(&self) -> &ScreenshotSlot {
        &self.screenshot
    }

    pub fn steps(&self) -> Option<&StepDocument> {
        self.steps.as_ref()
    }

    pub fn frames(&self) -> &[String] {
        &self.frames
    }

    pub fn summary(&self) -> Option<&TaskSummary> {
        self.summary.as_ref()
    }

    pub fn events(&self) -> &[EventRecord] {
        &self.events
    }

    /// False once the observer has stopped for good.
    pub fn is_observing(&self) -> bool {
        self.observing
    }

    pub fn record_job(&mut self, job: &Job) {
        self.job = Some(job.clone());
    }

    /// Point at a new run directory, dropping everything tailed from the old one.
    pub fn switch_run_dir(&mut self, run_dir: &str) {
        if self.run_dir.as_deref() == Some(run_dir) {
            return;
        }
        self.run_dir = Some(run_dir.to_string());
        self.log.clear();
        self.refresh_timeline();
        self.screenshot.clear();
        self.steps = None;
        self.frames.clear();
        self.summary = None;
        self.events.clear();
    }

    /// Fold one artifact update into the dashboard. Returns false when the
    /// content could not be used, so a document tailer keeps fetching.
    pub fn apply_artifact(&mut self, kind: ArtifactKind, update: ArtifactUpdate) -> bool {
        match (kind, update) {
            (ArtifactKind::Stdout, ArtifactUpdate::Content(bytes)) => {
                self.log = String::from_utf8_lossy(&bytes).into_owned();
                self.refresh_timeline();
            }
            (ArtifactKind::Stdout, ArtifactUpdate::Absent) => {
                self.log.clear();
                self.refresh_timeline();
            }
            (ArtifactKind::LatestScreenshot, ArtifactUpdate::Content(bytes)) => {
                if let Err(e) = self.screenshot.replace(&bytes) {
                    warn!("failed to spill screenshot: {}", e);
                    return false;
                }
            }
            (ArtifactKind::LatestScreenshot, ArtifactUpdate::Absent) => self.screenshot.clear(),
            (ArtifactKind::Script, ArtifactUpdate::Content(bytes)) => {
                match StepDocument::from_json(&bytes) {
                    Ok(doc) => {
                        self.frames = build_frames(&doc);
                        self.steps = Some(doc);
                    }
                    Err(e) => {
                        warn!("ignoring undecodable step document: {}", e);
                        return false;
                    }
                }
            }
            (ArtifactKind::TaskResults, ArtifactUpdate::Content(bytes)) => {
                match TaskSummary::from_json(&bytes) {
                    Ok(summary) => self.summary = Some(summary),
                    Err(e) => {
                        warn!("ignoring undecodable task summary: {}", e);
                        return false;
                    }
                }
            }
            (ArtifactKind::ChatLog, ArtifactUpdate::Content(bytes)) => {
                self.events = parse_event_log(&String::from_utf8_lossy(&bytes));
            }
            (_, ArtifactUpdate::Absent) => {}
        }
        true
    }

    fn refresh_timeline(&mut self) {
        self.timeline = self
            .timeline_cache
            .get(&self.log, self.initial_goal.as_deref())
            .to_vec();
    }
}

#[derive(Clone)]
struct SharedDashboard {
    inner: Arc<Mutex<Dashboard>>,
    revision: Arc<watch::Sender<u64>>,
}

impl SharedDashboard {
    fn new(dashboard: Dashboard) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(Mutex::new(dashboard)),
            revision: Arc::new(revision),
        }
    }

    /// Apply `f` unless `guard` has fired. The check happens under the lock.
    fn update<R>(&self, guard: &CancellationToken, f: impl FnOnce(&mut Dashboard) -> R) -> Option<R> {
        let applied = {
            let mut dashboard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            if guard.is_cancelled() {
                return None;
            }
            f(&mut dashboard)
        };
        self.revision.send_modify(|r| *r += 1);
        Some(applied)
    }

    fn read<R>(&self, f: impl FnOnce(&Dashboard) -> R) -> R {
        let dashboard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&dashboard)
    }
}

/// Live observation of one job.
pub struct Observer {
    job_id: String,
    cancel: CancellationToken,
    shared: SharedDashboard,
    handle: Option<JoinHandle<()>>,
}

impl Observer {
    /// Start polling `job_id` and tailing its artifacts. Must be called
    /// inside a tokio runtime.
    pub fn start<S>(source: Arc<S>, job_id: impl Into<String>, options: ObserverOptions) -> Self
    where
        S: JobSource + ?Sized + 'static,
    {
        let job_id = job_id.into();
        let cancel = CancellationToken::new();
        let shared = SharedDashboard::new(Dashboard::new(
            options.initial_goal.clone(),
            options.spill_dir.clone(),
        ));

        info!(job_id = %job_id, "observer started");
        let handle = tokio::spawn(supervise(
            source,
            job_id.clone(),
            options,
            shared.clone(),
            cancel.clone(),
        ));

        Self {
            job_id,
            cancel,
            shared,
            handle: Some(handle),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Run `f` against the current dashboard.
    pub fn read<R>(&self, f: impl FnOnce(&Dashboard) -> R) -> R {
        self.shared.read(f)
    }

    /// Receiver whose value increments after every dashboard change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until the job has ended and its final artifacts are in.
    pub async fn finished(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(job_id = %self.job_id, "observer task ended abnormally: {}", e);
            }
        }
    }

    /// Stop all tasks and release the screenshot reference.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        self.finished().await;
        let mut dashboard = self.shared.inner.lock().unwrap_or_else(PoisonError::into_inner);
        dashboard.screenshot.clear();
        dashboard.observing = false;
        drop(dashboard);
        self.shared.revision.send_modify(|r| *r += 1);
        debug!(job_id = %self.job_id, "observer shut down");
    }
}

impl Drop for Observer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct TailGroup {
    run_dir: String,
    token: CancellationToken,
    tasks: JoinSet<TailOutcome>,
}

impl TailGroup {
    async fn join(mut self) {
        while let Some(result) = self.tasks.join_next().await {
            match result {
                Ok(outcome) => debug!(run_dir = %self.run_dir, ?outcome, "tailer ended"),
                Err(e) => warn!(run_dir = %self.run_dir, "tailer task failed: {}", e),
            }
        }
    }
}

fn spawn_tail_group<S>(
    source: &Arc<S>,
    job_id: &str,
    run_dir: String,
    options: &ObserverOptions,
    job: &watch::Receiver<Option<Job>>,
    shared: &SharedDashboard,
    parent: &CancellationToken,
) -> TailGroup
where
    S: JobSource + ?Sized + 'static,
{
    let token = parent.child_token();
    let mut tasks = JoinSet::new();
    for kind in ArtifactKind::ALL {
        let tailer = ArtifactTailer::new(source.clone(), job_id, run_dir.clone(), kind, &options.tail);
        let shared = shared.clone();
        let guard = token.clone();
        tasks.spawn(tailer.run(token.clone(), job.clone(), move |kind, update| {
            shared
                .update(&guard, |d| d.apply_artifact(kind, update))
                .unwrap_or(false)
        }));
    }
    info!(job_id = %job_id, run_dir = %run_dir, "tailing artifacts");
    TailGroup {
        run_dir,
        token,
        tasks,
    }
}

async fn supervise<S>(
    source: Arc<S>,
    job_id: String,
    options: ObserverOptions,
    shared: SharedDashboard,
    cancel: CancellationToken,
) where
    S: JobSource + ?Sized + 'static,
{
    let (job_tx, mut job_rx) = watch::channel::<Option<Job>>(None);

    let poll_task = {
        let mut poller = StatusPoller::new(source.clone(), job_id.clone(), options.poller);
        let shared = shared.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shared.update(&cancel, |d| d.poller = PollerState::Polling);
            let outcome = poller
                .run(&cancel, |job| {
                    shared.update(&cancel, |d| d.record_job(job));
                    job_tx.send_replace(Some(job.clone()));
                })
                .await;
            let state = poller.state().clone();
            shared.update(&cancel, |d| d.poller = state);
            outcome
        })
    };

    let mut group = None;
    if let Some(dir) = options.run_dir.clone() {
        shared.update(&cancel, |d| d.switch_run_dir(&dir));
        group = Some(spawn_tail_group(&source, &job_id, dir, &options, &job_rx, &shared, &cancel));
    }

    loop {
        let open = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            changed = job_rx.changed() => changed.is_ok(),
        };

        if options.run_dir.is_none() {
            let resolved = job_rx
                .borrow_and_update()
                .as_ref()
                .and_then(|job| job.resolved_run_dir().map(str::to_string));
            if let Some(dir) = resolved {
                let current = group.as_ref().map(|g: &TailGroup| g.run_dir.as_str());
                if current != Some(dir.as_str()) {
                    if let Some(old) = group.take() {
                        info!(job_id = %job_id, from = %old.run_dir, to = %dir, "run directory changed");
                        old.token.cancel();
                    }
                    shared.update(&cancel, |d| d.switch_run_dir(&dir));
                    group = Some(spawn_tail_group(&source, &job_id, dir, &options, &job_rx, &shared, &cancel));
                }
            }
        }

        if !open {
            break;
        }
    }

    if let Some(group) = group {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {}
            _ = group.join() => {}
        }
    }

    match poll_task.await {
        Ok(PollOutcome::Failed(e)) => warn!(job_id = %job_id, "gave up polling: {}", e.display_message()),
        Ok(outcome) => debug!(job_id = %job_id, ?outcome, "polling ended"),
        Err(e) => warn!(job_id = %job_id, "poller task failed: {}", e),
    }
    shared.update(&cancel, |d| d.observing = false);
    info!(job_id = %job_id, "observer finished");
}

/// The set of live observers, at most one per job.
#[derive(Default)]
pub struct ObserverRegistry {
    observers: HashMap<String, Observer>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watch<S>(
        &mut self,
        source: Arc<S>,
        job_id: &str,
        options: ObserverOptions,
    ) -> Result<&mut Observer, ObserveError>
    where
        S: JobSource + ?Sized + 'static,
    {
        match self.observers.entry(job_id.to_string()) {
            std::collections::hash_map::Entry::Occupied(_) => Err(ObserveError::AlreadyWatching {
                job_id: job_id.to_string(),
            }),
            std::collections::hash_map::Entry::Vacant(slot) => {
                Ok(slot.insert(Observer::start(source, job_id, options)))
            }
        }
    }

    pub fn get(&self, job_id: &str) -> Option<&Observer> {
        self.observers.get(job_id)
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Shut down and forget the observer for `job_id`.
    pub async fn unwatch(&mut self, job_id: &str) -> bool {
        match self.observers.remove(job_id) {
            Some(observer) => {
                observer.shutdown().await;
                true
            }
            None => false,
        }
    }

    pub async fn shutdown_all(&mut self) {
        for (_, observer) in self.observers.drain() {
            observer.shutdown().await;
        }
    }
}
