/// Timeout/Cancellation Controller
///
/// **Responsibility:**
/// Race a job's deadline and an explicit cancel request against natural exit,
/// and tear down the child's whole process tree when either fires.
///
/// The watchdog never mutates job state. It only reports *why* it fired;
/// the coordinator performs the transition.

use std::process::ExitStatus;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::Notify;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    TimedOut,
    Cancelled,
}

const OPEN: u8 = 0;
const CANCELLED: u8 = 1;
const CLOSED: u8 = 2;

#[derive(Debug, Default)]
struct CancelState {
    notify: Notify,
    /// OPEN until either a cancel is accepted or the job is closed; the
    /// first of the two wins.
    phase: AtomicU8,
}

/// Cloneable trigger for an in-flight job, held by the session registry.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request immediate termination. Returns false once the job has already
    /// been closed, in which case nothing happens. Repeated cancels of the
    /// same job all report true.
    pub fn cancel(&self) -> bool {
        match self
            .state
            .phase
            .compare_exchange(OPEN, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                // notify_one stores a permit, so a cancel that lands before the
                // watchdog starts waiting is still observed.
                self.state.notify.notify_one();
                true
            }
            Err(phase) => phase == CANCELLED,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.phase.load(Ordering::Acquire) != OPEN
    }

    /// Stop accepting cancels. Returns true if a cancel was accepted first,
    /// in which case the job must end as cancelled.
    pub(crate) fn close(&self) -> bool {
        match self
            .state
            .phase
            .compare_exchange(OPEN, CLOSED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => false,
            Err(phase) => phase == CANCELLED,
        }
    }
}

#[derive(Debug)]
pub struct Watchdog {
    job_id: Uuid,
    deadline: Instant,
    handle: CancelHandle,
}

impl Watchdog {
    /// Start the countdown for `job_id`. Cancels that arrive through
    /// `handle` before or after arming both count.
    pub fn arm(job_id: Uuid, timeout: Duration, handle: CancelHandle) -> Self {
        debug!(job_id = %job_id, timeout_ms = timeout.as_millis() as u64, "Watchdog armed");
        Self {
            job_id,
            deadline: Instant::now() + timeout,
            handle,
        }
    }

    /// Resolves when the deadline passes or a cancel is requested.
    pub async fn fired(&self) -> StopReason {
        tokio::select! {
            biased;
            _ = self.handle.state.notify.notified() => StopReason::Cancelled,
            _ = sleep_until(self.deadline) => StopReason::TimedOut,
        }
    }

    /// Close the job to further cancels. Returns true if a cancel won the
    /// race, even one that arrived after the process had already exited.
    pub fn disarm(self) -> bool {
        let cancelled = self.handle.close();
        debug!(job_id = %self.job_id, cancelled, "Watchdog disarmed");
        cancelled
    }
}

/// Terminate the process tree rooted at `child` and reap it.
///
/// SIGTERM goes to the whole process group first; if the leader has not
/// exited within `grace`, SIGKILL follows. The final wait is bounded by
/// `grace` as well so a stuck reap cannot hold the job open forever.
pub async fn terminate_tree(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    let Some(pid) = child.id() else {
        // Already reaped.
        return child.try_wait().ok().flatten();
    };

    signal_group(pid, Signal::Terminate);

    match timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            // Leader is gone; make sure nothing else in its group survives.
            signal_group(pid, Signal::Kill);
            return Some(status);
        }
        Ok(Err(e)) => warn!(pid, error = %e, "Wait failed after SIGTERM"),
        Err(_) => warn!(pid, grace_ms = grace.as_millis() as u64, "Process ignored SIGTERM, escalating to SIGKILL"),
    }

    signal_group(pid, Signal::Kill);
    if let Err(e) = child.start_kill() {
        debug!(pid, error = %e, "start_kill after group SIGKILL");
    }

    match timeout(grace, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            warn!(pid, error = %e, "Failed to reap killed process");
            None
        }
        Err(_) => {
            warn!(pid, "Killed process did not exit within grace period");
            None
        }
    }
}

/// Kill whatever is left in the process group led by `pid`. Used after a
/// natural exit so backgrounded descendants cannot keep the pipes open.
pub fn reap_orphans(pid: u32) {
    signal_group(pid, Signal::Kill);
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: Signal) {
    let signo = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let Ok(pgid) = i32::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) with a negative pid targets the process group; no memory is touched.
    let rc = unsafe { libc::kill(-pgid, signo) };
    if rc == -1 {
        let err = std::io::Error::last_os_error();
        // ESRCH: the group is already empty.
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(pgid, signal = ?signal, error = %err, "Failed to signal process group");
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: Signal) {}
