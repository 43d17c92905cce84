// Prometheus metrics for the coderun API
use coderun_common::types::{ExecutionEvent, StreamKind};
use coderun_engine::{EventSink, JobReport};
use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref SUBMISSIONS: IntCounter =
        IntCounter::new("coderun_submissions_total", "Execution requests received")
            .expect("valid metric definition");
    pub static ref REJECTIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("coderun_rejections_total", "Execution requests rejected, by reason"),
        &["reason"]
    )
    .expect("valid metric definition");
    pub static ref JOBS_FINISHED: IntCounterVec = IntCounterVec::new(
        Opts::new("coderun_jobs_finished_total", "Jobs that reached a terminal state"),
        &["state"]
    )
    .expect("valid metric definition");
    pub static ref OUTPUT_FRAMES: IntCounterVec = IntCounterVec::new(
        Opts::new("coderun_output_frames_total", "Output lines delivered to clients"),
        &["stream"]
    )
    .expect("valid metric definition");
}

/// Register all collectors with [`REGISTRY`]. Call once at startup.
pub fn register() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(SUBMISSIONS.clone()))?;
    REGISTRY.register(Box::new(REJECTIONS.clone()))?;
    REGISTRY.register(Box::new(JOBS_FINISHED.clone()))?;
    REGISTRY.register(Box::new(OUTPUT_FRAMES.clone()))?;
    Ok(())
}

pub fn record_finished(report: &JobReport) {
    JOBS_FINISHED.with_label_values(&[report.state.as_str()]).inc();
}

pub fn record_frame(kind: StreamKind) {
    OUTPUT_FRAMES.with_label_values(&[kind.as_str()]).inc();
}

pub fn render() -> anyhow::Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Sink decorator that counts delivered frames before forwarding them.
pub struct MeteredSink<S> {
    inner: S,
}

impl<S> MeteredSink<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S: EventSink> EventSink for MeteredSink<S> {
    fn deliver(&self, event: &ExecutionEvent) -> bool {
        let delivered = self.inner.deliver(event);
        if delivered {
            if let ExecutionEvent::OutputFrame(frame) = event {
                record_frame(frame.stream_kind);
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coderun_common::types::JobState;

    #[test]
    fn test_state_labels_are_stable() {
        let before = JOBS_FINISHED.with_label_values(&[JobState::TimedOut.as_str()]).get();
        JOBS_FINISHED.with_label_values(&["timed_out"]).inc();
        assert_eq!(
            JOBS_FINISHED.with_label_values(&[JobState::TimedOut.as_str()]).get(),
            before + 1
        );
    }
}
