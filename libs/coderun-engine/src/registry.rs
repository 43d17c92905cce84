/// Session Registry
///
/// Maps a session id to its active job (if any) and to the sink that carries
/// events back to that client. This is the only state shared between the
/// submit, cancel and finalization paths; every mutation goes through one
/// mutex so check-and-occupy is a single atomic step.
///
/// Delivery to an unknown or disconnected session drops the event silently.
/// Detaching a sink never touches the running job.

use crate::watchdog::CancelHandle;
use coderun_common::types::{ExecutionEvent, SessionId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Transport-side receiver of a session's events.
pub trait EventSink: Send + Sync {
    /// Returns false once the receiving side is gone.
    fn deliver(&self, event: &ExecutionEvent) -> bool;
}

impl EventSink for mpsc::UnboundedSender<ExecutionEvent> {
    fn deliver(&self, event: &ExecutionEvent) -> bool {
        self.send(event.clone()).is_ok()
    }
}

#[derive(Debug, Clone)]
struct ActiveJob {
    job_id: Uuid,
    cancel: CancelHandle,
}

#[derive(Default)]
struct SessionSlot {
    active_job: Option<ActiveJob>,
    sink: Option<Arc<dyn EventSink>>,
}

impl SessionSlot {
    fn is_vacant(&self) -> bool {
        self.active_job.is_none() && self.sink.is_none()
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionSlot>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, SessionSlot>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Occupy the session's slot for `job_id`. False if a job already holds it.
    pub fn acquire(&self, session_id: &str, job_id: Uuid, cancel: CancelHandle) -> bool {
        let mut sessions = self.sessions();
        let slot = sessions.entry(session_id.to_string()).or_default();
        if slot.active_job.is_some() {
            return false;
        }
        slot.active_job = Some(ActiveJob { job_id, cancel });
        true
    }

    /// Free the slot, but only if `job_id` is the job holding it.
    pub fn release(&self, session_id: &str, job_id: Uuid) -> bool {
        let mut sessions = self.sessions();
        let Some(slot) = sessions.get_mut(session_id) else {
            return false;
        };
        if slot.active_job.as_ref().map(|j| j.job_id) != Some(job_id) {
            return false;
        }
        slot.active_job = None;
        if slot.is_vacant() {
            sessions.remove(session_id);
        }
        true
    }

    pub fn active_job(&self, session_id: &str) -> Option<Uuid> {
        self.sessions()
            .get(session_id)
            .and_then(|slot| slot.active_job.as_ref())
            .map(|job| job.job_id)
    }

    pub(crate) fn cancel_handle(&self, session_id: &str) -> Option<(Uuid, CancelHandle)> {
        self.sessions()
            .get(session_id)
            .and_then(|slot| slot.active_job.as_ref())
            .map(|job| (job.job_id, job.cancel.clone()))
    }

    /// Snapshot of every active job with its cancel trigger.
    pub(crate) fn cancel_handles(&self) -> Vec<(SessionId, Uuid, CancelHandle)> {
        self.sessions()
            .iter()
            .filter_map(|(session_id, slot)| {
                slot.active_job
                    .as_ref()
                    .map(|job| (session_id.clone(), job.job_id, job.cancel.clone()))
            })
            .collect()
    }

    /// Number of sessions that currently hold a running job.
    pub fn running_jobs(&self) -> usize {
        self.sessions()
            .values()
            .filter(|slot| slot.active_job.is_some())
            .count()
    }

    /// Register `sink` for the session, replacing any previous one.
    pub fn attach_sink(&self, session_id: &str, sink: Arc<dyn EventSink>) {
        let mut sessions = self.sessions();
        sessions.entry(session_id.to_string()).or_default().sink = Some(sink);
        debug!(session_id, "Sink attached");
    }

    pub fn detach_sink(&self, session_id: &str) {
        let mut sessions = self.sessions();
        if let Some(slot) = sessions.get_mut(session_id) {
            slot.sink = None;
            if slot.is_vacant() {
                sessions.remove(session_id);
            }
        }
        debug!(session_id, "Sink detached");
    }

    /// Detach only if `sink` is still the one registered; a newer connection
    /// for the same session is left alone.
    pub fn detach_sink_if_current(&self, session_id: &str, sink: &Arc<dyn EventSink>) -> bool {
        let mut sessions = self.sessions();
        let Some(slot) = sessions.get_mut(session_id) else {
            return false;
        };
        if !slot.sink.as_ref().is_some_and(|current| same_sink(current, sink)) {
            return false;
        }
        slot.sink = None;
        if slot.is_vacant() {
            sessions.remove(session_id);
        }
        debug!(session_id, "Sink detached");
        true
    }

    /// Route `event` to the session's sink. Unknown sessions drop it.
    pub fn deliver(&self, session_id: &str, event: ExecutionEvent) {
        // Clone the sink out so a slow transport never blocks other sessions.
        let sink = self
            .sessions()
            .get(session_id)
            .and_then(|slot| slot.sink.clone());

        let Some(sink) = sink else {
            return;
        };

        if !sink.deliver(&event) {
            debug!(session_id, job_id = %event.job_id(), "Sink closed, dropping it");
            self.detach_sink_if_current(session_id, &sink);
        }
    }
}

fn same_sink(a: &Arc<dyn EventSink>, b: &Arc<dyn EventSink>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
