//! Interactive code-execution engine.
//!
//! Accepts source text for a session, runs it as a child process, streams
//! stdout/stderr lines back through the session's sink, and enforces a
//! wall-clock timeout and client cancellation.

pub mod coordinator;
pub mod error;
pub mod launcher;
pub mod registry;
pub mod relay;
pub mod script_store;
pub mod watchdog;


pub use coordinator::{Coordinator, JobReport, SubmittedJob};
pub use error::{CancelError, LaunchError, Rejection};
pub use registry::{EventSink, SessionRegistry};
