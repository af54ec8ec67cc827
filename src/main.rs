use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use jobscope::config::{JobscopeConfig, LoggingConfig};
use jobscope::observe::{Dashboard, ObserverOptions, ObserverRegistry};
use jobscope::reconstruct::{
    build_frames, parse_event_log, playback, reconstruct_timeline, EntryKind, Player,
    StepDocument, TaskSummary,
};
use jobscope::storage::history::{
    self, ScenarioHistoryRecord, ScenarioOrigin,
};
use jobscope::storage::{self as store, KvStore};
use jobscope::transport::models::{
    BatchItem, ConfigUpdate, EpochSeconds, Job, JobStatus, PackageRef, RunMode, RunRequest,
    ScenarioRef, SimpleTask, UploadKind,
};
use jobscope::transport::ApiClient;

#[derive(Parser)]
#[command(
    name = "jobscope",
    about = "Observe, replay and audit remote agent test jobs",
    version,
    long_about = None
)]
struct Cli {
    /// Backend address (overrides the config file and the stored preference)
    #[arg(long, global = true, env = "JOBSCOPE_BACKEND")]
    backend: Option<String>,

    /// Config file (default: $JOBSCOPE_CONFIG, then ./jobscope.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct RunDirArg {
    /// Read artifacts from this run directory instead of the job's latest
    #[arg(long)]
    run_dir: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a new job
    Submit(SubmitArgs),

    /// Ask the backend to stop a job
    Stop { job_id: String },

    /// Show a job's current status
    Status {
        job_id: String,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Follow a job live until it finishes
    Watch {
        job_id: String,

        #[command(flatten)]
        run_dir: RunDirArg,

        /// Task goal shown as the first timeline entry
        #[arg(long)]
        goal: Option<String>,
    },

    /// Rebuild the narrative timeline from a job's stdout log
    Timeline {
        job_id: String,

        #[command(flatten)]
        run_dir: RunDirArg,

        #[arg(long)]
        goal: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Print the agent event log
    Events {
        job_id: String,

        #[command(flatten)]
        run_dir: RunDirArg,

        #[arg(long)]
        json: bool,
    },

    /// Show the final task summary
    Results {
        job_id: String,

        #[command(flatten)]
        run_dir: RunDirArg,

        /// Report language
        #[arg(long, default_value = "en")]
        lang: String,
    },

    /// Replay the recorded screenshots step by step
    Playback {
        job_id: String,

        #[command(flatten)]
        run_dir: RunDirArg,

        /// Time per frame (default from config)
        #[arg(long)]
        interval_ms: Option<u64>,

        /// Also download every frame into this directory
        #[arg(long)]
        save_dir: Option<PathBuf>,

        /// Parallel frame downloads
        #[arg(long, default_value = "4")]
        concurrency: usize,
    },

    /// Upload a scenario or application package
    Upload { file: PathBuf },

    /// Backend settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Locally remembered jobs and scenarios
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },

    /// Download a run directory as a zip archive
    Export {
        job_id: String,

        #[command(flatten)]
        run_dir: RunDirArg,

        /// Output file path (default: <job_id>.zip)
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Args)]
struct SubmitArgs {
    /// Run mode: single, range or batch
    #[arg(long, default_value = "single")]
    mode: RunMode,

    /// Scenario token from a previous upload
    #[arg(long, group = "scenario")]
    scenario_token: Option<String>,

    /// Scenario path on the backend host
    #[arg(long, group = "scenario")]
    scenario_path: Option<String>,

    /// Scenario document given inline (JSON, or plain text)
    #[arg(long, group = "scenario")]
    scenario_inline: Option<String>,

    /// Free-text task; the backend generates a one-scenario document from it
    #[arg(long, group = "scenario", requires = "package_name")]
    task: Option<String>,

    /// Package name of the app the task runs against
    #[arg(long, requires = "task")]
    package_name: Option<String>,

    /// Activity to launch for the task
    #[arg(long, requires = "task")]
    launch_activity: Option<String>,

    /// Display name of the app for the task
    #[arg(long, requires = "task")]
    app_name: Option<String>,

    /// Batch entries: a JSON array, or the path of a JSON file holding one
    #[arg(long)]
    run_config: Option<String>,

    /// Package token from a previous upload
    #[arg(long, group = "package")]
    apk_token: Option<String>,

    /// Package path on the backend host
    #[arg(long, group = "package")]
    apk_path: Option<String>,

    #[arg(long)]
    app_id: Option<String>,

    #[arg(long)]
    scenario_id: Option<String>,

    #[arg(long)]
    start_id: Option<String>,

    #[arg(long)]
    end_id: Option<String>,

    #[arg(long)]
    device_profile: Option<String>,

    #[arg(long)]
    model_profile: Option<String>,

    #[arg(long)]
    lang: Option<String>,

    #[arg(long)]
    user_id: Option<String>,

    /// Keep watching the job after it is accepted
    #[arg(long)]
    watch: bool,

    /// Task goal shown as the first timeline entry when watching
    #[arg(long)]
    goal: Option<String>,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Update model settings on the backend
    Set {
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        base_url: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        summary_api_key: Option<String>,
        #[arg(long)]
        summary_base_url: Option<String>,
        #[arg(long)]
        summary_model: Option<String>,
    },

    /// Show, remember or forget the preferred backend address
    Backend {
        url: Option<String>,

        #[arg(long, conflicts_with = "url")]
        clear: bool,
    },
}

#[derive(Subcommand)]
enum HistoryAction {
    /// Recently submitted or watched jobs
    Jobs {
        #[arg(long)]
        remove: Option<String>,
        #[arg(long, conflicts_with = "remove")]
        clear: bool,
    },

    /// Recently uploaded scenarios
    Scenarios {
        #[arg(long)]
        remove: Option<String>,
        #[arg(long, conflicts_with = "remove")]
        clear: bool,
    },
}

fn init_tracing(logging: &LoggingConfig, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json || logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => JobscopeConfig::load(path)?,
        None => JobscopeConfig::load_or_default(),
    };
    init_tracing(&config.logging, cli.json_logs);

    let db_path = config.storage.db_path.to_string_lossy().into_owned();
    let pool = store::open_pool(&db_path)?;
    let kv = KvStore::new(pool.clone());
    let backend = cli.backend.as_deref();

    match cli.command {
        Commands::Submit(args) => {
            let client = jobscope::connect(backend, &config, &kv)?;
            let watch = args.watch;
            let goal = args.goal.clone();
            let request = build_run_request(args)?;
            tracing::info!(mode = ?request.mode, batch_entries = request.run_config.len(), "Submitting job");

            let accepted = client.submit(&request).await?;
            let created_at = accepted.created_at.and_then(EpochSeconds::to_datetime);
            history::job_history(pool.clone()).remember_job(&accepted.job_id, created_at)?;
            if let Some(task) = &request.simple_task {
                history::scenario_history(pool.clone()).upsert_front(ScenarioHistoryRecord {
                    token: accepted.job_id.clone(),
                    filename: task.task_description.clone(),
                    uploaded_at: created_at.unwrap_or_else(Utc::now),
                    origin: ScenarioOrigin::Generated,
                })?;
            }
            println!("Job {} accepted ({})", accepted.job_id, accepted.status);

            if watch {
                let mut options = config.observer_options();
                options.initial_goal = goal.or_else(|| {
                    request.simple_task.as_ref().map(|t| t.task_description.clone())
                });
                watch_job(client, &accepted.job_id, options).await?;
            }
        }
        Commands::Stop { job_id } => {
            let client = jobscope::connect(backend, &config, &kv)?;
            let job = client.stop(&job_id).await?;
            println!("Job {} is now {}", job.job_id, job.status);
        }
        Commands::Status { job_id, json } => {
            let client = jobscope::connect(backend, &config, &kv)?;
            let job = client.status(&job_id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&job)?);
            } else {
                print_job(&job);
            }
        }
        Commands::Watch {
            job_id,
            run_dir,
            goal,
        } => {
            let client = jobscope::connect(backend, &config, &kv)?;
            let jobs = history::job_history(pool.clone());
            jobs.remember_job(&job_id, None)?;
            let mut options = config.observer_options();
            options.run_dir = run_dir.run_dir;
            options.initial_goal = goal;
            let last = watch_job(client, &job_id, options).await?;
            if let Some(created_at) = last.and_then(|j| j.created_at).and_then(EpochSeconds::to_datetime) {
                jobs.remember_job(&job_id, Some(created_at))?;
            }
        }
        Commands::Timeline {
            job_id,
            run_dir,
            goal,
            json,
        } => {
            let client = jobscope::connect(backend, &config, &kv)?;
            let raw = client
                .download_artifact(&job_id, "stdout", run_dir.run_dir.as_deref())
                .await
                .context("failed to fetch stdout log")?;
            let timeline = reconstruct_timeline(&String::from_utf8_lossy(&raw), goal.as_deref());
            if json {
                println!("{}", serde_json::to_string_pretty(&timeline)?);
            } else if timeline.is_empty() {
                println!("No timeline entries yet.");
            } else {
                for entry in &timeline {
                    print_timeline_entry(entry.kind, entry.agent.as_deref(), &entry.content);
                }
            }
        }
        Commands::Events {
            job_id,
            run_dir,
            json,
        } => {
            let client = jobscope::connect(backend, &config, &kv)?;
            let raw = client
                .download_artifact(&job_id, "chat_log", run_dir.run_dir.as_deref())
                .await
                .context("failed to fetch event log")?;
            let events = parse_event_log(&String::from_utf8_lossy(&raw));
            if json {
                println!("{}", serde_json::to_string_pretty(&events)?);
            } else {
                for event in &events {
                    let step = event.step.map(|s| s.to_string()).unwrap_or_else(|| "-".into());
                    println!("[{:>3}] {:<18} {}", step, event.role, event.content);
                }
            }
        }
        Commands::Results {
            job_id,
            run_dir,
            lang,
        } => {
            let client = jobscope::connect(backend, &config, &kv)?;
            let raw = client
                .download_artifact(&job_id, "task_results", run_dir.run_dir.as_deref())
                .await
                .context("failed to fetch task results")?;
            let summary = TaskSummary::from_json(&raw).context("task results are not valid JSON")?;
            print_summary(&summary, &lang);
        }
        Commands::Playback {
            job_id,
            run_dir,
            interval_ms,
            save_dir,
            concurrency,
        } => {
            let client = jobscope::connect(backend, &config, &kv)?;
            let interval = interval_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| config.polling.frame_interval());
            run_playback(
                &client,
                &job_id,
                run_dir.run_dir.as_deref(),
                interval,
                save_dir.as_deref(),
                concurrency,
            )
            .await?;
        }
        Commands::Upload { file } => {
            let client = jobscope::connect(backend, &config, &kv)?;
            let filename = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .context("upload path has no file name")?;
            let content = tokio::fs::read(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            tracing::info!(%filename, bytes = content.len(), "Uploading file");

            let receipt = client.upload(&filename, content).await?;
            if receipt.kind == UploadKind::Scenario {
                history::scenario_history(pool.clone()).upsert_front(ScenarioHistoryRecord {
                    token: receipt.token.clone(),
                    filename: receipt.filename.clone(),
                    uploaded_at: Utc::now(),
                    origin: ScenarioOrigin::Upload,
                })?;
            }
            let kind = match receipt.kind {
                UploadKind::Scenario => "scenario",
                UploadKind::Package => "package",
            };
            println!("Uploaded {} as {}: token {}", receipt.filename, kind, receipt.token);
        }
        Commands::Config { action } => match action {
            ConfigAction::Set {
                api_key,
                base_url,
                model,
                summary_api_key,
                summary_base_url,
                summary_model,
            } => {
                let update = ConfigUpdate {
                    api_key,
                    base_url,
                    model,
                    summary_api_key,
                    summary_base_url,
                    summary_model,
                };
                if update.is_empty() {
                    bail!("nothing to update; pass at least one setting");
                }
                let client = jobscope::connect(backend, &config, &kv)?;
                let effective = client.update_config(&update).await?;
                for (key, value) in &effective {
                    println!("{:<18} {}", key, value);
                }
            }
            ConfigAction::Backend { url, clear } => {
                if clear {
                    store::prefs::clear_preferred_base_url(&kv)?;
                    println!("Preferred backend cleared.");
                } else if let Some(url) = url {
                    store::prefs::set_preferred_base_url(&kv, &url)?;
                    println!("Preferred backend set to {}", url.trim());
                } else {
                    let resolved = jobscope::resolve_base_url(backend, &config, &kv)?;
                    println!("{}", resolved);
                }
            }
        },
        Commands::History { action } => match action {
            HistoryAction::Jobs { remove, clear } => {
                let jobs = history::job_history(pool.clone());
                let list = if clear {
                    jobs.clear()?;
                    Vec::new()
                } else if let Some(job_id) = remove {
                    jobs.remove_by_key(&job_id)?
                } else {
                    jobs.read_all()?
                };
                if list.is_empty() {
                    println!("No jobs remembered.");
                }
                for record in list {
                    println!(
                        "{:<40} {}",
                        record.job_id,
                        record.created_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
            }
            HistoryAction::Scenarios { remove, clear } => {
                let scenarios = history::scenario_history(pool.clone());
                let list = if clear {
                    scenarios.clear()?;
                    Vec::new()
                } else if let Some(token) = remove {
                    scenarios.remove_by_key(&token)?
                } else {
                    scenarios.read_all()?
                };
                if list.is_empty() {
                    println!("No scenarios remembered.");
                }
                for record in list {
                    println!(
                        "{:<36} {:<30} {}",
                        record.token,
                        record.filename,
                        record.uploaded_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
            }
        },
        Commands::Export {
            job_id,
            run_dir,
            output,
        } => {
            let client = jobscope::connect(backend, &config, &kv)?;
            let output = output.unwrap_or_else(|| PathBuf::from(format!("{job_id}.zip")));
            tracing::info!(%job_id, output = %output.display(), "Exporting run directory");
            let archive = client
                .download_artifact(&job_id, "zip", run_dir.run_dir.as_deref())
                .await
                .context("failed to download run archive")?;
            tokio::fs::write(&output, &archive)
                .await
                .with_context(|| format!("failed to write {}", output.display()))?;
            println!("Wrote {} ({} bytes)", output.display(), archive.len());
        }
    }

    Ok(())
}

fn build_run_request(args: SubmitArgs) -> Result<RunRequest> {
    let mut request = RunRequest::new(args.mode);
    request.scenario_ref = args
        .scenario_token
        .map(ScenarioRef::Uploaded)
        .or_else(|| args.scenario_path.map(ScenarioRef::Path))
        .or_else(|| {
            args.scenario_inline.map(|text| {
                ScenarioRef::Inline(
                    serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text)),
                )
            })
        });
    request.package_ref = args
        .apk_token
        .map(PackageRef::Uploaded)
        .or_else(|| args.apk_path.map(PackageRef::Path));
    request.simple_task = match (args.task, args.package_name) {
        (Some(task_description), Some(package_name)) => Some(SimpleTask {
            task_description,
            package_name,
            launch_activity: args.launch_activity,
            app_name: args.app_name,
        }),
        _ => None,
    };
    if let Some(raw) = args.run_config {
        request.run_config = load_run_config(&raw)?;
    }
    request.app_id = args.app_id;
    request.scenario_id = args.scenario_id;
    request.scenario_start_id = args.start_id;
    request.scenario_end_id = args.end_id;
    request.device_profile = args.device_profile;
    request.model_profile = args.model_profile;
    request.lang = args.lang;
    request.user_id = args.user_id;

    if request.mode == RunMode::Batch
        && request.simple_task.is_none()
        && request.run_config.is_empty()
    {
        bail!("batch mode needs at least one entry in --run-config");
    }
    Ok(request)
}

/// Batch entries given either inline as a JSON array or as a file path.
fn load_run_config(raw: &str) -> Result<Vec<BatchItem>> {
    let text = if raw.trim_start().starts_with('[') {
        raw.to_string()
    } else {
        std::fs::read_to_string(raw).with_context(|| format!("failed to read {}", raw))?
    };
    serde_json::from_str(&text).context("run config must be a JSON array of {app_id, ...} entries")
}

/// Follow `job_id` until it ends or the user interrupts. Returns the last
/// job record the backend reported.
async fn watch_job(client: ApiClient, job_id: &str, options: ObserverOptions) -> Result<Option<Job>> {
    let mut registry = ObserverRegistry::new();
    let observer = registry.watch(Arc::new(client), job_id, options)?;
    let mut revisions = observer.subscribe();
    let mut printer = WatchPrinter::default();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(%job_id, "Interrupted, stopping observer");
                break;
            }
            changed = revisions.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        if !observer.read(|d| printer.print(d)) {
            break;
        }
    }

    let job = observer.read(|d| d.job().cloned());
    registry.shutdown_all().await;
    Ok(job)
}

/// Prints only what changed since the previous dashboard revision.
#[derive(Default)]
struct WatchPrinter {
    status: Option<JobStatus>,
    run_dir: Option<String>,
    timeline_shown: usize,
    events_shown: usize,
    screenshot_generation: u64,
    summary_shown: bool,
    poll_error_shown: bool,
}

impl WatchPrinter {
    /// Returns false once the dashboard is no longer being updated.
    fn print(&mut self, d: &Dashboard) -> bool {
        if let Some(job) = d.job() {
            if self.status != Some(job.status) {
                println!("== {} is {}", job.job_id, job.status);
                self.status = Some(job.status);
            }
        }

        if d.run_dir() != self.run_dir.as_deref() {
            if let Some(dir) = d.run_dir() {
                println!("== run directory {}", dir);
            }
            self.run_dir = d.run_dir().map(str::to_string);
            self.timeline_shown = 0;
            self.events_shown = 0;
            self.summary_shown = false;
        }

        let timeline = d.timeline();
        if timeline.len() < self.timeline_shown {
            self.timeline_shown = 0;
        }
        for entry in &timeline[self.timeline_shown..] {
            print_timeline_entry(entry.kind, entry.agent.as_deref(), &entry.content);
        }
        self.timeline_shown = timeline.len();

        let events = d.events();
        if events.len() < self.events_shown {
            self.events_shown = 0;
        }
        for event in &events[self.events_shown..] {
            println!("   {:<18} {}", event.role, event.content);
        }
        self.events_shown = events.len();

        if let Some(shot) = d.screenshot().current() {
            if shot.generation() != self.screenshot_generation {
                self.screenshot_generation = shot.generation();
                tracing::debug!(path = %shot.path().display(), bytes = shot.len(), "Screenshot updated");
            }
        }

        if let Some(summary) = d.summary() {
            if !self.summary_shown {
                print_summary(summary, "en");
                self.summary_shown = true;
            }
        }

        if let Some(e) = d.poll_error() {
            if !self.poll_error_shown {
                println!("== gave up polling: {}", e.display_message());
                self.poll_error_shown = true;
            }
        }

        d.is_observing()
    }
}

async fn run_playback(
    client: &ApiClient,
    job_id: &str,
    run_dir: Option<&str>,
    interval: Duration,
    save_dir: Option<&Path>,
    concurrency: usize,
) -> Result<()> {
    let raw = client
        .download_artifact(job_id, "script", run_dir)
        .await
        .context("failed to fetch step document")?;
    let doc = StepDocument::from_json(&raw).context("step document is not valid JSON")?;
    let frames = build_frames(&doc);
    if frames.is_empty() {
        println!("No frames recorded.");
        return Ok(());
    }
    if !doc.overall_plan.is_empty() {
        println!("Plan: {}", doc.overall_plan);
    }

    if let Some(dir) = save_dir {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let results = client.download_frames(job_id, &frames, run_dir, concurrency).await;
        for (index, (reference, result)) in results.into_iter().enumerate() {
            match result {
                Ok(bytes) => {
                    let name = playback::frame_download_path(&reference);
                    let name = name.trim_start_matches("images/");
                    let path = dir.join(format!("{:03}-{}", index, name));
                    tokio::fs::write(&path, &bytes)
                        .await
                        .with_context(|| format!("failed to write {}", path.display()))?;
                }
                Err(e) => tracing::warn!(%reference, "Frame download failed: {}", e),
            }
        }
    }

    let total = frames.len();
    let mut player = Player::new(frames);
    player.set_interval(interval);
    if let Some(frame) = player.current() {
        println!("[{:>3}/{}] {}", 1, total, frame);
    }
    player.play();

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    playback::drive(Arc::new(Mutex::new(player)), cancel, |index, frame| {
        println!("[{:>3}/{}] {}", index + 1, total, frame);
    })
    .await;
    Ok(())
}

fn print_job(job: &Job) {
    println!("Job:      {}", job.job_id);
    println!("Status:   {}", job.status);
    if let Some(created) = job.created_at.and_then(EpochSeconds::to_datetime) {
        println!("Created:  {}", created.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(elapsed) = job.elapsed() {
        println!("Elapsed:  {}s", elapsed.num_seconds());
    }
    if let Some(dir) = job.resolved_run_dir() {
        println!("Run dir:  {}", dir);
    }
    if let Some(device) = &job.device_id {
        println!("Device:   {}", device);
    }
    if let Some(error) = &job.error {
        println!("Error:    {}", error);
    }
}

fn print_timeline_entry(kind: EntryKind, agent: Option<&str>, content: &str) {
    match kind {
        EntryKind::User => println!("> {}", content),
        _ => println!("  [{}] {}", agent.unwrap_or("-"), content),
    }
}

fn print_summary(summary: &TaskSummary, lang: &str) {
    println!("\n=== Task Summary ===");
    if let Some(goal) = &summary.goal {
        println!("Goal:    {}", goal);
    }
    println!(
        "Result:  {}",
        summary.task_status.as_deref().unwrap_or("unknown")
    );
    if let Some(steps) = summary.execution_steps {
        println!("Steps:   {}", steps);
    }
    if let Some(tokens) = summary.total_tokens {
        println!("Tokens:  {}", tokens);
    }
    if let Some(report) = summary.report(lang) {
        println!("\n{}", report);
    }
    println!("====================\n");
}
