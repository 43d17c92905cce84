// CLI commands for running scripts through the engine
use anyhow::{Context, Result};
use coderun_common::config::{EngineConfig, DEFAULT_CONFIG_PATH};
use coderun_common::types::{ExecutionEvent, ExecutionRequest, JobState, StreamKind};
use coderun_engine::{Coordinator, JobReport, SessionRegistry};
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const CLI_SESSION: &str = "cli";

/// Exit codes for runs that did not complete normally.
const EXIT_FAILED: i32 = 1;
const EXIT_TIMED_OUT: i32 = 124;
const EXIT_CANCELLED: i32 = 130;

/// Load the engine config from `path`, or the default location.
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path),
        None => EngineConfig::load_default(),
    }
}

/// Execute `file` and stream its output. Returns the process exit code to use.
pub async fn run_script(file: &Path, timeout: Option<u64>, config_path: Option<&Path>) -> Result<i32> {
    let source = fs::read_to_string(file)
        .with_context(|| format!("Failed to read script: {}", file.display()))?;
    let config = load_config(config_path)?;

    let registry = Arc::new(SessionRegistry::new());
    let coordinator = Coordinator::new(config, registry.clone());

    let (tx, mut rx) = mpsc::unbounded_channel::<ExecutionEvent>();
    registry.attach_sink(CLI_SESSION, Arc::new(tx));

    let job = coordinator
        .submit(ExecutionRequest::new(CLI_SESSION, source, timeout))
        .with_context(|| format!("Execution of {} was rejected", file.display()))?;
    debug!(job_id = %job.job_id(), "Job submitted");

    let stdout = io::stdout();
    let stderr = io::stderr();
    let mut cancel_requested = false;

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                let done = event.is_terminal();
                render_event(&event, &mut stdout.lock(), &mut stderr.lock())?;
                if done {
                    break;
                }
            }
            result = signal::ctrl_c(), if !cancel_requested => {
                cancel_requested = true;
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                    continue;
                }
                match coordinator.cancel(CLI_SESSION) {
                    Ok(job_id) => eprintln!("\n⏹️  Cancelling job {}...", job_id),
                    Err(e) => debug!("Nothing to cancel: {}", e),
                }
            }
        }
    }

    let report = job.wait().await?;
    eprintln!("{}", summary_line(&report));
    Ok(exit_code_for(&report))
}

/// Write one engine event: stdout frames to `out`, everything else to `err`.
pub fn render_event<O: Write, E: Write>(event: &ExecutionEvent, out: &mut O, err: &mut E) -> io::Result<()> {
    match event {
        ExecutionEvent::ExecutionStarted(_) => Ok(()),
        ExecutionEvent::OutputFrame(frame) => match frame.stream_kind {
            StreamKind::Stdout => {
                writeln!(out, "{}", frame.text)?;
                out.flush()
            }
            StreamKind::Stderr => {
                writeln!(err, "{}", frame.text)?;
                err.flush()
            }
        },
        ExecutionEvent::ExecutionFinished(done) => match &done.error {
            Some(message) => writeln!(err, "❌ {}", message),
            None => Ok(()),
        },
    }
}

pub fn summary_line(report: &JobReport) -> String {
    let secs = report.duration.as_secs_f64();
    match (report.state, report.exit_code) {
        (JobState::Completed, Some(0)) => format!("✅ Completed in {:.2}s", secs),
        (JobState::Completed, Some(code)) => format!("⚠️  Exited with code {} after {:.2}s", code, secs),
        (state, _) => format!("❌ {} after {:.2}s", state, secs),
    }
}

/// 0 only for a completed run whose process exited 0.
pub fn exit_code_for(report: &JobReport) -> i32 {
    match (report.state, report.exit_code) {
        (JobState::Completed, Some(0)) => 0,
        (JobState::Completed, Some(code)) => code,
        (JobState::TimedOut, _) => EXIT_TIMED_OUT,
        (JobState::Cancelled, _) => EXIT_CANCELLED,
        _ => EXIT_FAILED,
    }
}

/// Print the effective configuration (file + env overrides) as JSON
pub fn show_config(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

pub async fn init_project(path: &str) -> Result<()> {
    println!("🚀 Initializing coderun project at: {}", path);

    let project_path = Path::new(path);
    let config_dir = project_path.join("config");
    fs::create_dir_all(&config_dir)
        .with_context(|| format!("Failed to create directory: {}", config_dir.display()))?;
    println!("  ✅ Created: config");

    let config_file = project_path.join(DEFAULT_CONFIG_PATH);
    if config_file.exists() {
        println!("  ⏭️  Skipped: {} already exists", DEFAULT_CONFIG_PATH);
    } else {
        let json_content = serde_json::to_string_pretty(&EngineConfig::default())?;
        fs::write(&config_file, json_content)
            .with_context(|| format!("Failed to write {}", config_file.display()))?;
        println!("  ✅ Created: {}", DEFAULT_CONFIG_PATH);
    }

    println!("✅ Project initialized successfully!");
    println!("\n📋 Next steps:");
    println!("  1. Point interpreter.command at your Python install if needed");
    println!("  2. Run a script: coderun-cli run hello.py");
    println!("  3. Start the server: coderun-api");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use coderun_common::types::{ExecutionFinished, OutputFrame};
    use std::time::Duration;
    use uuid::Uuid;

    fn report(state: JobState, exit_code: Option<i32>) -> JobReport {
        JobReport {
            job_id: Uuid::new_v4(),
            session_id: CLI_SESSION.to_string(),
            state,
            exit_code,
            error: None,
            duration: Duration::from_millis(1500),
            stdout_lines: 0,
            stderr_lines: 0,
            pid: None,
            script_path: None,
        }
    }

    fn frame(stream_kind: StreamKind, text: &str) -> ExecutionEvent {
        ExecutionEvent::OutputFrame(OutputFrame {
            job_id: Uuid::new_v4(),
            stream_kind,
            text: text.to_string(),
            sequence: 0,
            timestamp: String::new(),
        })
    }

    fn sh_config(dir: &Path) -> std::path::PathBuf {
        let mut config = EngineConfig::default();
        config.interpreter.command = "sh".to_string();
        config.interpreter.args = vec![];
        config.interpreter.file_extension = "sh".to_string();
        config.kill_grace_secs = 0.5;
        config.scratch_dir = Some(dir.to_path_buf());
        let path = dir.join("engine.json");
        fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();
        path
    }

    #[test]
    fn test_render_routes_streams() {
        let mut out = Vec::new();
        let mut err = Vec::new();
        render_event(&frame(StreamKind::Stdout, "to out"), &mut out, &mut err).unwrap();
        render_event(&frame(StreamKind::Stderr, "to err"), &mut out, &mut err).unwrap();
        let finished = ExecutionEvent::ExecutionFinished(ExecutionFinished::new(
            Uuid::new_v4(),
            JobState::TimedOut,
            Some("Execution timed out after 1 seconds".to_string()),
            None,
            Duration::from_secs(1),
        ));
        render_event(&finished, &mut out, &mut err).unwrap();

        assert_eq!(String::from_utf8(out).unwrap(), "to out\n");
        let err = String::from_utf8(err).unwrap();
        assert!(err.starts_with("to err\n"));
        assert!(err.contains("timed out"));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code_for(&report(JobState::Completed, Some(0))), 0);
        assert_eq!(exit_code_for(&report(JobState::Completed, Some(2))), 2);
        assert_eq!(exit_code_for(&report(JobState::TimedOut, None)), EXIT_TIMED_OUT);
        assert_eq!(exit_code_for(&report(JobState::Cancelled, None)), EXIT_CANCELLED);
        assert_eq!(exit_code_for(&report(JobState::Failed, None)), EXIT_FAILED);
    }

    #[test]
    fn test_summary_line() {
        assert!(summary_line(&report(JobState::Completed, Some(0))).contains("Completed in 1.50s"));
        assert!(summary_line(&report(JobState::Completed, Some(3))).contains("code 3"));
        assert!(summary_line(&report(JobState::Cancelled, None)).contains("cancelled"));
    }

    #[tokio::test]
    async fn test_init_project_writes_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_str().unwrap();
        init_project(root).await.unwrap();

        let written = dir.path().join(DEFAULT_CONFIG_PATH);
        let loaded = load_config(Some(&written)).unwrap();
        assert_eq!(loaded.max_source_chars, EngineConfig::default().max_source_chars);

        // A second init leaves an edited file untouched
        fs::write(&written, r#"{"default_timeout_secs": 5}"#).unwrap();
        init_project(root).await.unwrap();
        assert_eq!(fs::read_to_string(&written).unwrap(), r#"{"default_timeout_secs": 5}"#);
    }

    #[tokio::test]
    async fn test_run_script_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let config = sh_config(dir.path());

        let ok = dir.path().join("ok.sh");
        fs::write(&ok, "echo fine\n").unwrap();
        assert_eq!(run_script(&ok, None, Some(&config)).await.unwrap(), 0);

        let failing = dir.path().join("fail.sh");
        fs::write(&failing, "echo oops >&2\nexit 3\n").unwrap();
        assert_eq!(run_script(&failing, None, Some(&config)).await.unwrap(), 3);

        let slow = dir.path().join("slow.sh");
        fs::write(&slow, "sleep 30\n").unwrap();
        assert_eq!(run_script(&slow, Some(1), Some(&config)).await.unwrap(), EXIT_TIMED_OUT);
    }

    #[tokio::test]
    async fn test_run_script_rejects_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = sh_config(dir.path());
        let empty = dir.path().join("empty.sh");
        fs::write(&empty, "  \n").unwrap();
        assert!(run_script(&empty, None, Some(&config)).await.is_err());
        assert!(run_script(&dir.path().join("missing.sh"), None, Some(&config)).await.is_err());
    }
}
