//! Build orchestrator: a job queue plus the per-build state machine.
//!
//! State machine: `queued -> building -> pending_review -> {approved ->
//! published, rejected}`, with `failed` reachable from any pre-terminal
//! state. Terminal states are immutable; a retry is a brand-new job.
//!
//! Exactly one worker processes a given job id; job records are mutated only
//! through atomic read-modify-write against the durable store, so workers
//! for different job ids never interfere.

use crate::bundler::{bundle, BundleOptions};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::executor::{BuildExecutor, ExecMode};
use crate::listing::{now_ms, ListingStore};
use crate::resolver::{ImportPolicy, ImportResolver};
use crate::store::{
    read_json, write_atomic, write_json_atomic, ArtifactSet, ArtifactStore, BUILD_LOG, BUNDLE_JS,
    ENTRY_HTML,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Push-feed poll interval; the feed is eventually consistent within this bound.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Keep-alive cadence for long-lived feeds.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);
/// Queued-but-unprocessed build bound.
const QUEUE_DEPTH: usize = 64;

/// Entry document written around a bundled component module.
const ENTRY_SHELL: &str = "<!doctype html><html><head><meta charset=\"utf-8\"></head>\
<body><div id=\"root\"></div><script type=\"module\" src=\"./app.js\"></script></body></html>";

// ============================================================================
// Job state machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Building,
    PendingReview,
    Approved,
    Published,
    Failed,
    Rejected,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Published | Self::Failed | Self::Rejected)
    }

    fn can_transition(self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Queued, Building)
                | (Building, PendingReview)
                | (PendingReview, Approved)
                | (PendingReview, Rejected)
                | (Approved, Published)
                | (Queued, Failed)
                | (Building, Failed)
                | (PendingReview, Failed)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Building => "building",
            Self::PendingReview => "pending_review",
            Self::Approved => "approved",
            Self::Published => "published",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// One build job record. Owned by the orchestrator and mutated only through
/// its transition functions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildJob {
    pub id: String,
    pub state: JobState,
    pub progress: u8,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: u64,
}

/// Durable job-record store with atomic per-key read-modify-write.
pub struct JobStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl JobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: Mutex::new(()),
        }
    }

    fn record_path(&self, id: &str) -> Result<PathBuf> {
        ArtifactStore::validate_build_id(id)?;
        Ok(self.dir.join(format!("{id}.json")))
    }

    /// Create the initial queued record for a freshly accepted job.
    pub fn init(&self, id: &str) -> Result<BuildJob> {
        let _guard = self.lock.lock().expect("job store lock poisoned");
        let job = BuildJob {
            id: id.to_string(),
            state: JobState::Queued,
            progress: 0,
            error: None,
            created_at: now_ms(),
        };
        write_json_atomic(&self.record_path(id)?, &job)?;
        Ok(job)
    }

    pub fn read(&self, id: &str) -> Result<Option<BuildJob>> {
        let path = self.record_path(id)?;
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(read_json(&path)?))
    }

    fn update<F>(&self, id: &str, mutate: F) -> Result<BuildJob>
    where
        F: FnOnce(&mut BuildJob) -> Result<()>,
    {
        let _guard = self.lock.lock().expect("job store lock poisoned");
        let path = self.record_path(id)?;
        let mut job: BuildJob = if path.is_file() {
            read_json(&path)?
        } else {
            return Err(PipelineError::NotFound(format!("job {id}")));
        };
        mutate(&mut job)?;
        write_json_atomic(&path, &job)?;
        Ok(job)
    }

    /// Apply one state transition. Transitioning into `building` resets
    /// progress to 0; reaching `pending_review` pins it at 100.
    pub fn transition(&self, id: &str, to: JobState) -> Result<BuildJob> {
        let job = self.update(id, |job| {
            if !job.state.can_transition(to) {
                return Err(PipelineError::InvalidTransition {
                    from: job.state.to_string(),
                    to: to.to_string(),
                });
            }
            job.state = to;
            match to {
                JobState::Building => job.progress = 0,
                JobState::PendingReview => job.progress = 100,
                _ => {}
            }
            Ok(())
        })?;
        info!(id, state = %job.state, "build:state");
        Ok(job)
    }

    /// Monotonic progress update; lower values are clamped to the current one.
    pub fn set_progress(&self, id: &str, progress: u8) -> Result<BuildJob> {
        self.update(id, |job| {
            if job.state.is_terminal() {
                return Err(PipelineError::InvalidTransition {
                    from: job.state.to_string(),
                    to: job.state.to_string(),
                });
            }
            job.progress = job.progress.max(progress.min(100));
            Ok(())
        })
    }

    /// Record a failure: capped verbatim message, terminal `failed` state.
    pub fn fail(&self, id: &str, err: &PipelineError) -> Result<BuildJob> {
        let job = self.update(id, |job| {
            if job.state.is_terminal() {
                return Err(PipelineError::InvalidTransition {
                    from: job.state.to_string(),
                    to: JobState::Failed.to_string(),
                });
            }
            job.state = JobState::Failed;
            job.error = Some(err.capped_message());
            Ok(())
        })?;
        error!(id, error = %err, "build:state failed");
        Ok(job)
    }
}

// ============================================================================
// Build requests
// ============================================================================

/// Work description carried through the queue.
#[derive(Debug, Clone)]
pub enum BuildPayload {
    /// Fast path: one untrusted source document bundled in-process.
    Inline {
        source: String,
        options: BundleOptions,
    },
    /// Heavy path: full project build via the sandboxed executor.
    Project {
        dir: PathBuf,
        mode: ExecMode,
        allow_scripts: bool,
    },
}

#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub build_id: String,
    pub payload: BuildPayload,
}

/// Snapshot returned by the poll endpoint.
#[derive(Debug, Clone)]
pub struct BuildStatus {
    pub state: JobState,
    pub progress: u8,
    pub error: Option<String>,
    pub artifacts: Option<ArtifactSet>,
}

/// Events emitted by the push feed.
#[derive(Debug, Clone)]
pub enum StatusEvent {
    State { state: JobState, progress: u8 },
    KeepAlive,
    Final {
        state: JobState,
        artifacts: Option<ArtifactSet>,
        error: Option<String>,
    },
}

// ============================================================================
// Orchestrator
// ============================================================================

struct Inner {
    config: PipelineConfig,
    store: ArtifactStore,
    jobs: JobStore,
    queue_tx: Mutex<Option<mpsc::Sender<BuildRequest>>>,
}

/// Cheaply cloneable orchestrator handle; every clone shares the queue and
/// the underlying stores.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(config: PipelineConfig) -> Self {
        let store = ArtifactStore::new(&config.bundle_root);
        let jobs = JobStore::new(config.bundle_root.join("jobs"));
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                jobs,
                queue_tx: Mutex::new(None),
            }),
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.inner.store
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub fn jobs(&self) -> &JobStore {
        &self.inner.jobs
    }

    /// Start the single queue consumer. Without this (or with the worker
    /// feature disabled) `enqueue` fails with `QUEUE_DISABLED`.
    pub fn start_worker(&self) -> tokio::task::JoinHandle<()> {
        let (tx, mut rx) = mpsc::channel::<BuildRequest>(QUEUE_DEPTH);
        *self
            .inner
            .queue_tx
            .lock()
            .expect("queue handle lock poisoned") = Some(tx);
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                this.process(req).await;
            }
        })
    }

    /// Accept a build request onto the queue, returning its id immediately.
    pub async fn enqueue(&self, req: BuildRequest) -> Result<String> {
        if !self.inner.config.worker_enabled {
            return Err(PipelineError::QueueDisabled);
        }
        let tx = self
            .inner
            .queue_tx
            .lock()
            .expect("queue handle lock poisoned")
            .clone()
            .ok_or(PipelineError::QueueDisabled)?;
        let id = req.build_id.clone();
        self.inner.jobs.init(&id)?;
        tx.send(req).await.map_err(|_| PipelineError::QueueDisabled)?;
        Ok(id)
    }

    /// Synchronous path for callers without a queue backend: run the build
    /// to completion on the caller's task.
    pub async fn run_now(&self, req: BuildRequest) -> Result<BuildJob> {
        let id = req.build_id.clone();
        self.inner.jobs.init(&id)?;
        self.process(req).await;
        self.inner
            .jobs
            .read(&id)?
            .ok_or_else(|| PipelineError::NotFound(format!("job {id}")))
    }

    /// Worker body for one job: building -> run -> pending_review | failed.
    async fn process(&self, req: BuildRequest) {
        let id = req.build_id.clone();
        if let Err(err) = self.inner.jobs.transition(&id, JobState::Building) {
            error!(id, %err, "build: could not enter building state");
            return;
        }
        match self.run_build(&req).await {
            Ok(()) => {
                let _ = self.inner.jobs.transition(&id, JobState::PendingReview);
            }
            Err(err) => {
                // Artifacts of the previous published version are untouched;
                // only this build's directory holds partial output.
                let _ = self.inner.jobs.fail(&id, &err);
            }
        }
    }

    async fn run_build(&self, req: &BuildRequest) -> Result<()> {
        let id = &req.build_id;
        let build_dir = self.inner.store.ensure_build_dir(id)?;
        match &req.payload {
            BuildPayload::Inline { source, options } => {
                self.run_inline_build(id, &build_dir, source, options).await
            }
            BuildPayload::Project {
                dir,
                mode,
                allow_scripts,
            } => {
                self.run_project_build(id, &build_dir, dir, *mode, *allow_scripts)
                    .await
            }
        }
    }

    async fn run_inline_build(
        &self,
        id: &str,
        build_dir: &Path,
        source: &str,
        options: &BundleOptions,
    ) -> Result<()> {
        let mut log = String::new();

        // HTML documents pass straight through as the entry document.
        if source.trim_start().to_lowercase().starts_with("<!doctype html>") {
            write_atomic(&build_dir.join(ENTRY_HTML), source.as_bytes())?;
            write_atomic(&build_dir.join(BUNDLE_JS), b"")?;
            log.push_str("[bundler] html document passed through\n");
            write_atomic(&build_dir.join(BUILD_LOG), log.as_bytes())?;
            self.inner.jobs.set_progress(id, 90)?;
            return Ok(());
        }

        self.inner.jobs.set_progress(id, 10)?;
        let resolver = ImportResolver::new(
            self.inner.config.cdn_base_trimmed(),
            &self.inner.config.cache_dir,
            self.inner.config.fetch_retries,
        );
        let policy = ImportPolicy {
            allow_any: self.inner.config.allow_any,
            allow_list: self.inner.config.allow_list.iter().cloned().collect(),
            pin_map: self.inner.config.pin_map.clone(),
        };

        let bundled = bundle(source, options, &resolver, &policy).await?;
        self.inner.jobs.set_progress(id, 60)?;
        log.push_str("[bundler] inline source bundled\n");

        write_atomic(&build_dir.join(BUNDLE_JS), bundled.as_bytes())?;
        write_atomic(&build_dir.join(ENTRY_HTML), ENTRY_SHELL.as_bytes())?;
        write_atomic(&build_dir.join(BUILD_LOG), log.as_bytes())?;
        self.inner.jobs.set_progress(id, 90)?;
        Ok(())
    }

    async fn run_project_build(
        &self,
        id: &str,
        build_dir: &Path,
        project_dir: &Path,
        mode: ExecMode,
        allow_scripts: bool,
    ) -> Result<()> {
        let executor = BuildExecutor::new(
            self.inner.config.build_timeout,
            self.inner.config.container_image.clone(),
        );
        let mut log = String::new();
        let result = executor
            .execute(project_dir, mode, allow_scripts, &mut log)
            .await;
        // The captured log is persisted for post-mortem regardless of outcome.
        write_atomic(&build_dir.join(BUILD_LOG), log.as_bytes())?;
        result?;
        self.inner.jobs.set_progress(id, 70)?;

        copy_project_output(project_dir, build_dir)?;
        self.inner.jobs.set_progress(id, 90)?;
        Ok(())
    }

    /// Poll endpoint: current state plus the on-demand artifact view.
    pub fn status(&self, id: &str) -> Result<BuildStatus> {
        let job = self
            .inner
            .jobs
            .read(id)?
            .ok_or_else(|| PipelineError::NotFound(format!("job {id}")))?;
        if !self.inner.store.build_dir_exists(id)? {
            return Err(PipelineError::ArtifactsMissing(ArtifactStore::expected_files()));
        }
        let artifacts = self.inner.store.artifact_set(id)?;
        let error = if job.state == JobState::Published && !artifacts.is_complete() {
            Some("artifacts_missing".to_string())
        } else {
            job.error.clone()
        };
        Ok(BuildStatus {
            state: job.state,
            progress: job.progress,
            error,
            artifacts: Some(artifacts),
        })
    }

    /// Push feed: a `State` event per observed change, periodic keep-alives,
    /// one `Final` event at a terminal state, then the channel closes.
    /// Consumers fall back to polling when the feed drops.
    pub fn watch(&self, id: &str) -> Result<mpsc::Receiver<StatusEvent>> {
        let job = self
            .inner
            .jobs
            .read(id)?
            .ok_or_else(|| PipelineError::NotFound(format!("job {id}")))?;
        let (tx, rx) = mpsc::channel(16);
        let this = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            let mut last = (job.state, job.progress);
            if !this.emit(&tx, &id, job).await {
                return;
            }
            let mut poll = tokio::time::interval(POLL_INTERVAL);
            poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
            keepalive.reset();
            loop {
                tokio::select! {
                    _ = poll.tick() => {
                        let Ok(Some(job)) = this.inner.jobs.read(&id) else { continue };
                        if (job.state, job.progress) != last {
                            last = (job.state, job.progress);
                            if !this.emit(&tx, &id, job).await {
                                return;
                            }
                        }
                    }
                    _ = keepalive.tick() => {
                        if tx.send(StatusEvent::KeepAlive).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        Ok(rx)
    }

    /// Send a state event; on a terminal state also send the final event and
    /// report the feed as finished.
    async fn emit(&self, tx: &mpsc::Sender<StatusEvent>, id: &str, job: BuildJob) -> bool {
        let state_event = StatusEvent::State {
            state: job.state,
            progress: job.progress,
        };
        if tx.send(state_event).await.is_err() {
            return false;
        }
        if job.state.is_terminal() {
            let artifacts = self.inner.store.artifact_set(id).ok();
            let _ = tx
                .send(StatusEvent::Final {
                    state: job.state,
                    artifacts,
                    error: job.error,
                })
                .await;
            return false;
        }
        true
    }

    /// Approve a reviewed build: attach it to its listing and publish.
    pub async fn approve(&self, id: &str, listings: &ListingStore) -> Result<BuildJob> {
        self.inner.jobs.transition(id, JobState::Approved)?;
        let now = now_ms();
        if let Some(listing) = listings.get_by_build_id(id, now)? {
            listings.attach_build(&listing.id, id, now)?;
        }
        self.inner.jobs.transition(id, JobState::Published)
    }

    pub fn reject(&self, id: &str) -> Result<BuildJob> {
        self.inner.jobs.transition(id, JobState::Rejected)
    }
}

/// Copy the project's build output (first existing of `dist/`, `build/`)
/// into the artifact directory.
fn copy_project_output(project_dir: &Path, build_dir: &Path) -> Result<()> {
    for candidate in ["dist", "build"] {
        let src = project_dir.join(candidate);
        if src.is_dir() {
            copy_dir_recursive(&src, build_dir)?;
            return Ok(());
        }
    }
    Ok(())
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::seed_cache;
    use tempfile::tempdir;

    fn orchestrator(root: &Path, worker_enabled: bool) -> Orchestrator {
        let config = PipelineConfig {
            bundle_root: root.join("bundles"),
            cache_dir: root.join("cache"),
            worker_enabled,
            allow_any: true,
            ..Default::default()
        };
        Orchestrator::new(config)
    }

    fn inline_request(id: &str, source: &str) -> BuildRequest {
        BuildRequest {
            build_id: id.into(),
            payload: BuildPayload::Inline {
                source: source.into(),
                options: BundleOptions::default(),
            },
        }
    }

    #[test]
    fn test_transition_rules() {
        use JobState::*;
        assert!(Queued.can_transition(Building));
        assert!(Building.can_transition(PendingReview));
        assert!(PendingReview.can_transition(Approved));
        assert!(Approved.can_transition(Published));
        assert!(PendingReview.can_transition(Rejected));
        assert!(Building.can_transition(Failed));

        assert!(!Queued.can_transition(Published));
        assert!(!Published.can_transition(Building));
        assert!(!Failed.can_transition(Queued));
        assert!(!Rejected.can_transition(Approved));
    }

    #[test]
    fn test_terminal_jobs_reject_all_mutation() {
        let dir = tempdir().unwrap();
        let jobs = JobStore::new(dir.path());
        jobs.init("b1").unwrap();
        jobs.transition("b1", JobState::Building).unwrap();
        jobs.fail("b1", &PipelineError::QueueDisabled).unwrap();

        assert!(matches!(
            jobs.transition("b1", JobState::Building),
            Err(PipelineError::InvalidTransition { .. })
        ));
        assert!(matches!(
            jobs.set_progress("b1", 50),
            Err(PipelineError::InvalidTransition { .. })
        ));
        assert!(matches!(
            jobs.fail("b1", &PipelineError::QueueDisabled),
            Err(PipelineError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_progress_is_monotonic_and_resets_on_building() {
        let dir = tempdir().unwrap();
        let jobs = JobStore::new(dir.path());
        jobs.init("b1").unwrap();
        let job = jobs.transition("b1", JobState::Building).unwrap();
        assert_eq!(job.progress, 0);
        assert_eq!(jobs.set_progress("b1", 40).unwrap().progress, 40);
        // Lower values clamp to the high-water mark.
        assert_eq!(jobs.set_progress("b1", 10).unwrap().progress, 40);
        assert_eq!(
            jobs.transition("b1", JobState::PendingReview).unwrap().progress,
            100
        );
    }

    #[tokio::test]
    async fn test_enqueue_without_worker_is_queue_disabled() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(dir.path(), false);
        match orch.enqueue(inline_request("b1", "export default 1;")).await {
            Err(PipelineError::QueueDisabled) => {}
            other => panic!("expected QueueDisabled, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_now_inline_build_writes_artifacts() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(dir.path(), false);
        seed_cache(
            &orch.config().cache_dir,
            "https://esm.sh/left-pad",
            b"export default p => p;",
        )
        .unwrap();

        let job = orch
            .run_now(inline_request(
                "b1",
                r#"import pad from "left-pad"; export default () => pad("x");"#,
            ))
            .await
            .unwrap();
        assert_eq!(job.state, JobState::PendingReview);
        assert_eq!(job.progress, 100);

        let status = orch.status("b1").unwrap();
        let artifacts = status.artifacts.unwrap();
        assert!(artifacts.bundle_entry_exists);
        let bundled =
            std::fs::read_to_string(artifacts.build_dir.join(BUNDLE_JS)).unwrap();
        assert!(bundled.contains("https://esm.sh/left-pad"));
    }

    #[tokio::test]
    async fn test_run_now_html_passthrough() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(dir.path(), false);
        let job = orch
            .run_now(inline_request("b1", "<!doctype html><h1>hi</h1>"))
            .await
            .unwrap();
        assert_eq!(job.state, JobState::PendingReview);
        let entry = orch.store().artifact_path("b1", ENTRY_HTML).unwrap();
        assert!(std::fs::read_to_string(entry).unwrap().contains("<h1>hi</h1>"));
    }

    #[tokio::test]
    async fn test_failed_build_records_capped_error() {
        let dir = tempdir().unwrap();
        let mut orch_cfg = PipelineConfig {
            bundle_root: dir.path().join("bundles"),
            cache_dir: dir.path().join("cache"),
            allow_any: false,
            ..Default::default()
        };
        orch_cfg.allow_list = vec!["left-pad".into()];
        let orch = Orchestrator::new(orch_cfg);

        let job = orch
            .run_now(inline_request("b1", r#"import _ from "lodash";"#))
            .await
            .unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.error.unwrap().contains("lodash"));
    }

    #[tokio::test]
    async fn test_status_reports_artifacts_missing_when_dir_absent() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(dir.path(), false);
        orch.jobs().init("b1").unwrap();
        match orch.status("b1") {
            Err(PipelineError::ArtifactsMissing(missing)) => {
                assert!(missing.contains(&BUNDLE_JS.to_string()));
            }
            other => panic!("expected ArtifactsMissing, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_watch_terminal_job_emits_state_then_final() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(dir.path(), false);
        let job = orch
            .run_now(inline_request("b1", "<!doctype html><p>x</p>"))
            .await
            .unwrap();
        assert_eq!(job.state, JobState::PendingReview);
        orch.jobs().transition("b1", JobState::Approved).unwrap();
        orch.jobs().transition("b1", JobState::Published).unwrap();

        let mut rx = orch.watch("b1").unwrap();
        match rx.recv().await.unwrap() {
            StatusEvent::State { state, .. } => assert_eq!(state, JobState::Published),
            other => panic!("expected State, got {other:?}"),
        }
        match rx.recv().await.unwrap() {
            StatusEvent::Final { state, artifacts, .. } => {
                assert_eq!(state, JobState::Published);
                assert!(artifacts.unwrap().bundle_entry_exists);
            }
            other => panic!("expected Final, got {other:?}"),
        }
        // Feed terminates after the final event.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_worker_processes_enqueued_job() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(dir.path(), true);
        orch.start_worker();
        let id = orch
            .enqueue(inline_request("b1", "<!doctype html><p>x</p>"))
            .await
            .unwrap();
        assert_eq!(id, "b1");

        // Poll until the worker finishes; the initial record is queued.
        for _ in 0..50 {
            if let Some(job) = orch.jobs().read("b1").unwrap() {
                if job.state == JobState::PendingReview {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("worker never completed the job");
    }

    #[tokio::test]
    async fn test_approve_attaches_build_and_publishes() {
        use crate::listing::{Capabilities, Listing};
        let dir = tempdir().unwrap();
        let orch = orchestrator(dir.path(), false);
        orch.run_now(inline_request("b1", "<!doctype html><p>x</p>"))
            .await
            .unwrap();

        let listings = ListingStore::new(dir.path().join("listings.json"), Duration::from_secs(60));
        let now = now_ms();
        listings
            .upsert(
                Listing {
                    id: "1".into(),
                    slug: "my-app".into(),
                    owner_uid: "u1".into(),
                    title: "My App".into(),
                    description: String::new(),
                    visibility: "public".into(),
                    capabilities: Capabilities::default(),
                    build_id: None,
                    pending_build_id: Some("b1".into()),
                    version: 0,
                    archived_versions: Vec::new(),
                    created_at: now,
                    updated_at: now,
                },
                now,
            )
            .unwrap();

        let job = orch.approve("b1", &listings).await.unwrap();
        assert_eq!(job.state, JobState::Published);
        let listing = listings.get("1", now_ms()).unwrap().unwrap();
        assert_eq!(listing.build_id.as_deref(), Some("b1"));
        assert_eq!(listing.version, 1);
        assert_eq!(listing.pending_build_id, None);
    }
}
