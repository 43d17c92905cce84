use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Opaque client-session identity used to route events and to gate
/// one running job per session.
pub type SessionId = String;

/// RFC 3339 UTC timestamp with millisecond precision, attached to every event.
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub session_id: SessionId,
    pub source_text: String,
    /// Requested wall-clock limit in seconds; `None` or 0 means "use the default".
    pub timeout_seconds: Option<u64>,
}

impl ExecutionRequest {
    pub fn new(session_id: impl Into<SessionId>, source_text: impl Into<String>, timeout_seconds: Option<u64>) -> Self {
        Self {
            session_id: session_id.into(),
            source_text: source_text.into(),
            timeout_seconds,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job lifecycle.
///
/// `Pending → Launching → Running → {Completed, Failed, TimedOut, Cancelled}`,
/// with `Launching → Failed` when the script cannot be stored or spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Launching,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::TimedOut | JobState::Cancelled
        )
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        match (self, next) {
            (JobState::Pending, JobState::Launching) => true,
            (JobState::Launching, JobState::Running) | (JobState::Launching, JobState::Failed) => true,
            (JobState::Running, next) => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Launching => "launching",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::TimedOut => "timed_out",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of child output. Ordered within `stream_kind` only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputFrame {
    pub job_id: Uuid,
    pub stream_kind: StreamKind,
    pub text: String,
    pub sequence: u64,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStarted {
    pub job_id: Uuid,
    pub message: String,
    pub timestamp: String,
}

/// Terminal event, delivered exactly once per job and always last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionFinished {
    pub job_id: Uuid,
    pub success: bool,
    pub state: JobState,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub duration_seconds: f64,
    pub timestamp: String,
}

impl ExecutionFinished {
    pub fn new(
        job_id: Uuid,
        state: JobState,
        error: Option<String>,
        exit_code: Option<i32>,
        duration: Duration,
    ) -> Self {
        Self {
            job_id,
            success: state == JobState::Completed,
            state,
            error,
            exit_code,
            duration_seconds: duration.as_secs_f64(),
            timestamp: timestamp_now(),
        }
    }
}

/// Everything the engine sends back to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    ExecutionStarted(ExecutionStarted),
    OutputFrame(OutputFrame),
    ExecutionFinished(ExecutionFinished),
}

impl ExecutionEvent {
    pub fn job_id(&self) -> Uuid {
        match self {
            ExecutionEvent::ExecutionStarted(e) => e.job_id,
            ExecutionEvent::OutputFrame(f) => f.job_id,
            ExecutionEvent::ExecutionFinished(e) => e.job_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionEvent::ExecutionFinished(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::TimedOut.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Running.is_terminal());
    }

    #[test]
    fn test_no_transition_out_of_terminal() {
        for terminal in [JobState::Completed, JobState::Failed, JobState::TimedOut, JobState::Cancelled] {
            assert!(!terminal.can_transition_to(JobState::Running));
            assert!(!terminal.can_transition_to(JobState::Completed));
        }
        assert!(JobState::Launching.can_transition_to(JobState::Failed));
        assert!(!JobState::Launching.can_transition_to(JobState::TimedOut));
        assert!(!JobState::Pending.can_transition_to(JobState::Running));
    }

    #[test]
    fn test_event_wire_shape() {
        let frame = ExecutionEvent::OutputFrame(OutputFrame {
            job_id: Uuid::nil(),
            stream_kind: StreamKind::Stderr,
            text: "boom".to_string(),
            sequence: 0,
            timestamp: timestamp_now(),
        });
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["event"], "output_frame");
        assert_eq!(value["stream_kind"], "stderr");
        assert_eq!(value["text"], "boom");

        let finished = ExecutionEvent::ExecutionFinished(ExecutionFinished::new(
            Uuid::nil(),
            JobState::TimedOut,
            Some("timed out".to_string()),
            None,
            Duration::from_millis(1500),
        ));
        let value = serde_json::to_value(&finished).unwrap();
        assert_eq!(value["event"], "execution_finished");
        assert_eq!(value["state"], "timed_out");
        assert_eq!(value["success"], false);
        assert_eq!(value["duration_seconds"], 1.5);
        assert!(value["exit_code"].is_null());
    }

    #[test]
    fn test_success_only_when_completed() {
        let done = ExecutionFinished::new(Uuid::nil(), JobState::Completed, None, Some(1), Duration::ZERO);
        assert!(done.success, "non-zero exit is still a completed run");
        let cancelled = ExecutionFinished::new(Uuid::nil(), JobState::Cancelled, None, None, Duration::ZERO);
        assert!(!cancelled.success);
    }
}
