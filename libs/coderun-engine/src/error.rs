use thiserror::Error;

/// Reasons a submission is refused before any process exists.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    #[error("A job is already running for this session")]
    SessionBusy,
    #[error("Source text exceeds the maximum of {max_chars} characters")]
    RequestTooLarge { max_chars: usize },
    #[error("Source text is empty")]
    EmptyRequest,
}

impl Rejection {
    /// Stable reason name for the wire.
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::SessionBusy => "SessionBusy",
            Rejection::RequestTooLarge { .. } => "RequestTooLarge",
            Rejection::EmptyRequest => "EmptyRequest",
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelError {
    #[error("No active job for this session")]
    NoActiveJob,
}

impl CancelError {
    pub fn reason(&self) -> &'static str {
        match self {
            CancelError::NoActiveJob => "NoActiveJob",
        }
    }
}

/// Failures before the child process exists.
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Failed to store script: {0}")]
    Storage(#[source] std::io::Error),
    #[error("Failed to start interpreter '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Child process is missing its {0} pipe")]
    MissingPipe(&'static str),
}
