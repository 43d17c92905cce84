/// Execution Coordinator
///
/// **Responsibility:**
/// Validate a submission, claim the session slot, then drive the job through
/// `Pending → Launching → Running → terminal` on its own tokio task.
///
/// **Flow per job:**
/// 1. Emit `execution_started`
/// 2. Persist the script (Launching)
/// 3. Spawn the interpreter, start both relays, arm the watchdog (Running)
/// 4. Race natural exit against the watchdog
/// 5. Tear down the process tree, drain or abort the relays
/// 6. Delete the script, release the slot, emit exactly one `execution_finished`
///
/// Relays and the watchdog only report; every state transition happens here.

use crate::error::{CancelError, LaunchError, Rejection};
use crate::launcher::{LaunchedProcess, Launcher};
use crate::registry::SessionRegistry;
use crate::relay::{relay_lines, FrameTarget};
use crate::script_store::{ScriptStore, TemporaryScript};
use crate::watchdog::{reap_orphans, terminate_tree, CancelHandle, StopReason, Watchdog};
use anyhow::Context;
use coderun_common::config::EngineConfig;
use coderun_common::types::{
    timestamp_now, ExecutionEvent, ExecutionFinished, ExecutionRequest, ExecutionStarted, JobState,
    SessionId, StreamKind,
};
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// What the caller learns once a job is over.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub job_id: Uuid,
    pub session_id: SessionId,
    pub state: JobState,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub duration: Duration,
    pub stdout_lines: u64,
    pub stderr_lines: u64,
    pub pid: Option<u32>,
    pub script_path: Option<PathBuf>,
}

/// Handle to an accepted job. Dropping it does not affect the job.
#[derive(Debug)]
pub struct SubmittedJob {
    job_id: Uuid,
    completion: JoinHandle<JobReport>,
}

impl SubmittedJob {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub async fn wait(self) -> anyhow::Result<JobReport> {
        self.completion
            .await
            .with_context(|| format!("Job task {} terminated abnormally", self.job_id))
    }
}

/// The live unit of work, owned by its job task.
#[derive(Debug)]
struct ExecutionJob {
    job_id: Uuid,
    session_id: SessionId,
    timeout: Duration,
    started_at: Instant,
    state: JobState,
    pid: Option<u32>,
    script_path: Option<PathBuf>,
    stdout_lines: u64,
    stderr_lines: u64,
}

impl ExecutionJob {
    fn new(job_id: Uuid, session_id: SessionId, timeout: Duration) -> Self {
        Self {
            job_id,
            session_id,
            timeout,
            started_at: Instant::now(),
            state: JobState::Pending,
            pid: None,
            script_path: None,
            stdout_lines: 0,
            stderr_lines: 0,
        }
    }

    fn transition(&mut self, next: JobState) {
        if !self.state.can_transition_to(next) {
            warn!(from = %self.state, to = %next, "Ignoring illegal job state transition");
            return;
        }
        debug!(from = %self.state, to = %next, "Job state transition");
        self.state = next;
    }
}

struct Outcome {
    state: JobState,
    exit_code: Option<i32>,
    error: Option<String>,
}

impl Outcome {
    fn failed(message: String) -> Self {
        Self {
            state: JobState::Failed,
            exit_code: None,
            error: Some(message),
        }
    }
}

enum ProcessExit {
    Natural(std::io::Result<ExitStatus>),
    Stopped(StopReason),
}

/// Frees the session slot if the job task unwinds before finalizing.
struct SlotGuard {
    registry: Arc<SessionRegistry>,
    session_id: SessionId,
    job_id: Uuid,
}

impl SlotGuard {
    fn release(self) {
        // Drop does the work.
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.registry.release(&self.session_id, self.job_id);
    }
}

struct Inner {
    config: EngineConfig,
    registry: Arc<SessionRegistry>,
    store: ScriptStore,
    launcher: Launcher,
}

#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(config: EngineConfig, registry: Arc<SessionRegistry>) -> Self {
        let store = ScriptStore::new(config.scratch_dir.clone(), &config.interpreter.file_extension);
        let launcher = Launcher::new(&config.interpreter);
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                store,
                launcher,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.inner.registry
    }

    /// Job currently holding the session's slot, if any.
    pub fn active_job(&self, session_id: &str) -> Option<Uuid> {
        self.inner.registry.active_job(session_id)
    }

    pub fn validate(&self, source_text: &str) -> Result<(), Rejection> {
        if source_text.trim().is_empty() {
            return Err(Rejection::EmptyRequest);
        }
        let max_chars = self.inner.config.max_source_chars;
        if source_text.chars().count() > max_chars {
            return Err(Rejection::RequestTooLarge { max_chars });
        }
        Ok(())
    }

    /// Accept a request and start it in the background.
    ///
    /// Must be called from within a tokio runtime. Returns as soon as the job
    /// is scheduled; output arrives through the session's sink.
    pub fn submit(&self, request: ExecutionRequest) -> Result<SubmittedJob, Rejection> {
        let ExecutionRequest {
            session_id,
            source_text,
            timeout_seconds,
        } = request;

        if let Err(rejection) = self.validate(&source_text) {
            debug!(session_id = %session_id, reason = rejection.reason(), "Submission rejected");
            return Err(rejection);
        }

        let job_id = Uuid::new_v4();
        let cancel = CancelHandle::new();
        if !self.inner.registry.acquire(&session_id, job_id, cancel.clone()) {
            debug!(session_id = %session_id, "Submission rejected: session busy");
            return Err(Rejection::SessionBusy);
        }

        let guard = SlotGuard {
            registry: self.inner.registry.clone(),
            session_id: session_id.clone(),
            job_id,
        };

        let timeout = self.inner.config.resolve_timeout(timeout_seconds);
        info!(
            job_id = %job_id,
            session_id = %session_id,
            timeout_secs = timeout.as_secs(),
            source_chars = source_text.chars().count(),
            "Job accepted"
        );

        let span = info_span!("job", job_id = %job_id, session_id = %session_id);
        let job = ExecutionJob::new(job_id, session_id, timeout);
        let completion = tokio::spawn(
            run_job(self.inner.clone(), job, source_text, cancel, guard).instrument(span),
        );

        Ok(SubmittedJob { job_id, completion })
    }

    /// Kill the session's running job now. Reports `NoActiveJob` when there is
    /// none or when it has already left the running phase.
    pub fn cancel(&self, session_id: &str) -> Result<Uuid, CancelError> {
        match self.inner.registry.cancel_handle(session_id) {
            Some((job_id, handle)) if handle.cancel() => {
                info!(job_id = %job_id, session_id, "Cancellation requested");
                Ok(job_id)
            }
            _ => Err(CancelError::NoActiveJob),
        }
    }

    /// Cancel every running job, e.g. before the process exits. Returns the
    /// ids of the jobs that accepted the cancel.
    pub fn cancel_all(&self) -> Vec<Uuid> {
        self.inner
            .registry
            .cancel_handles()
            .into_iter()
            .filter_map(|(session_id, job_id, handle)| {
                handle.cancel().then(|| {
                    info!(job_id = %job_id, session_id = %session_id, "Cancelling job for shutdown");
                    job_id
                })
            })
            .collect()
    }

    /// Wait until no session holds a job, for at most `limit`. Returns false
    /// if jobs were still running when time ran out.
    pub async fn drain(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while self.inner.registry.running_jobs() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        true
    }
}

async fn run_job(
    inner: Arc<Inner>,
    mut job: ExecutionJob,
    source_text: String,
    cancel: CancelHandle,
    guard: SlotGuard,
) -> JobReport {
    inner.registry.deliver(
        &job.session_id,
        ExecutionEvent::ExecutionStarted(ExecutionStarted {
            job_id: job.job_id,
            message: "Code execution started".to_string(),
            timestamp: timestamp_now(),
        }),
    );

    job.transition(JobState::Launching);

    let persisted = {
        let inner = inner.clone();
        let job_id = job.job_id;
        tokio::task::spawn_blocking(move || inner.store.persist(job_id, &source_text)).await
    };
    let script = match persisted {
        Ok(Ok(script)) => script,
        Ok(Err(e)) => {
            warn!(error = %e, "Could not store script");
            cancel.close();
            return finalize(&inner, job, Outcome::failed(e.to_string()), None, guard).await;
        }
        Err(e) => {
            warn!(error = %e, "Script storage task failed");
            cancel.close();
            let error = LaunchError::Storage(std::io::Error::other(e));
            return finalize(&inner, job, Outcome::failed(error.to_string()), None, guard).await;
        }
    };
    job.script_path = Some(script.path().to_path_buf());

    let LaunchedProcess {
        mut child,
        stdout,
        stderr,
        pid,
    } = match inner.launcher.launch(script.path()) {
        Ok(process) => process,
        Err(e) => {
            warn!(error = %e, "Could not launch interpreter");
            cancel.close();
            return finalize(&inner, job, Outcome::failed(e.to_string()), Some(script), guard).await;
        }
    };
    job.pid = pid;
    job.transition(JobState::Running);
    info!(pid = ?pid, "Job running");

    let watchdog = Watchdog::arm(job.job_id, job.timeout, cancel);
    let target = |stream_kind| FrameTarget {
        registry: inner.registry.clone(),
        session_id: job.session_id.clone(),
        job_id: job.job_id,
        stream_kind,
        max_line_bytes: inner.config.max_line_bytes,
    };
    let stdout_task = tokio::spawn(relay_lines(stdout, target(StreamKind::Stdout)));
    let stderr_task = tokio::spawn(relay_lines(stderr, target(StreamKind::Stderr)));

    let exit = tokio::select! {
        status = child.wait() => ProcessExit::Natural(status),
        reason = watchdog.fired() => ProcessExit::Stopped(reason),
    };
    // A cancel accepted before this point wins, even over a natural exit that
    // raced it, so a successful `cancel` always ends in `Cancelled`.
    let cancelled = watchdog.disarm();
    let exit = match exit {
        ProcessExit::Natural(_) if cancelled => {
            debug!("Cancel accepted concurrently with natural exit");
            if let Some(pid) = pid {
                reap_orphans(pid);
            }
            ProcessExit::Stopped(StopReason::Cancelled)
        }
        ProcessExit::Stopped(StopReason::TimedOut) if cancelled => ProcessExit::Stopped(StopReason::Cancelled),
        other => other,
    };

    let grace = inner.config.kill_grace();
    let outcome = match exit {
        ProcessExit::Natural(Ok(status)) => {
            if let Some(pid) = pid {
                reap_orphans(pid);
            }
            Outcome {
                state: JobState::Completed,
                exit_code: status.code(),
                error: None,
            }
        }
        ProcessExit::Natural(Err(e)) => {
            terminate_tree(&mut child, grace).await;
            Outcome::failed(format!("Failed to wait for process: {}", e))
        }
        ProcessExit::Stopped(StopReason::TimedOut) => {
            warn!(timeout_secs = job.timeout.as_secs(), "Job exceeded its timeout, terminating");
            terminate_tree(&mut child, grace).await;
            Outcome {
                state: JobState::TimedOut,
                exit_code: None,
                error: Some(format!(
                    "Execution timed out after {} seconds",
                    job.timeout.as_secs()
                )),
            }
        }
        ProcessExit::Stopped(StopReason::Cancelled) => {
            terminate_tree(&mut child, grace).await;
            Outcome {
                state: JobState::Cancelled,
                exit_code: None,
                error: Some("Execution cancelled by request".to_string()),
            }
        }
    };

    let (stdout_lines, stderr_lines) = tokio::join!(
        join_relay(stdout_task, StreamKind::Stdout, grace),
        join_relay(stderr_task, StreamKind::Stderr, grace),
    );
    job.stdout_lines = stdout_lines;
    job.stderr_lines = stderr_lines;

    finalize(&inner, job, outcome, Some(script), guard).await
}

/// Wait for a relay to hit EOF, or stop it once `grace` has passed.
async fn join_relay(mut task: JoinHandle<u64>, stream_kind: StreamKind, grace: Duration) -> u64 {
    match tokio::time::timeout(grace, &mut task).await {
        Ok(Ok(lines)) => lines,
        Ok(Err(e)) => {
            warn!(stream = %stream_kind, error = %e, "Relay task failed");
            0
        }
        Err(_) => {
            warn!(stream = %stream_kind, "Relay still open after process exit, aborting it");
            task.abort();
            // Wait for the abort to land so no frame can trail the finished event.
            let _ = task.await;
            0
        }
    }
}

async fn finalize(
    inner: &Inner,
    mut job: ExecutionJob,
    outcome: Outcome,
    script: Option<TemporaryScript>,
    guard: SlotGuard,
) -> JobReport {
    job.transition(outcome.state);

    if let Some(script) = script {
        // Cleanup failure never changes the job's outcome.
        match tokio::task::spawn_blocking(move || script.remove()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to delete temporary script"),
            Err(e) => warn!(error = %e, "Script cleanup task failed"),
        }
    }

    guard.release();

    let duration = job.started_at.elapsed();
    info!(
        state = %job.state,
        exit_code = ?outcome.exit_code,
        duration_ms = duration.as_millis() as u64,
        stdout_lines = job.stdout_lines,
        stderr_lines = job.stderr_lines,
        "Job finished"
    );

    inner.registry.deliver(
        &job.session_id,
        ExecutionEvent::ExecutionFinished(ExecutionFinished::new(
            job.job_id,
            job.state,
            outcome.error.clone(),
            outcome.exit_code,
            duration,
        )),
    );

    JobReport {
        job_id: job.job_id,
        session_id: job.session_id,
        state: job.state,
        exit_code: outcome.exit_code,
        error: outcome.error,
        duration,
        stdout_lines: job.stdout_lines,
        stderr_lines: job.stderr_lines,
        pid: job.pid,
        script_path: job.script_path,
    }
}
