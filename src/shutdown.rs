//! Graceful-shutdown coordination
//!
//! One monotonic state machine (`accepting -> draining -> terminated`) that
//! the signal handler, the HTTP intake, and the executor all observe. Once
//! draining, new task intake refuses with 503; in-flight work gets a bounded
//! window to finish before remaining tasks are signalled.

use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::registry::TaskRegistry;

/// Default drain window, seconds
pub const DEFAULT_DRAIN_TIMEOUT_S: u64 = 30;

/// How often the drain loop re-checks the in-flight count
const DRAIN_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Accepting,
    Draining,
    Terminated,
}

/// Outcome of a completed drain
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub completed: usize,
    pub cancelled: usize,
    pub timed_out: bool,
    pub duration_ms: u64,
}

pub struct ShutdownCoordinator {
    phase: watch::Sender<Phase>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (phase, _) = watch::channel(Phase::Accepting);
        Self { phase }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn is_accepting(&self) -> bool {
        self.phase() == Phase::Accepting
    }

    /// Observe phase transitions (server accept loop, executor)
    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Transition `accepting -> draining`. Returns whether this call
    /// performed the transition; later transitions are never undone.
    pub fn begin_drain(&self) -> bool {
        self.phase.send_if_modified(|phase| {
            if *phase == Phase::Accepting {
                *phase = Phase::Draining;
                true
            } else {
                false
            }
        })
    }

    fn terminate(&self) {
        self.phase.send_if_modified(|phase| {
            if *phase != Phase::Terminated {
                *phase = Phase::Terminated;
                true
            } else {
                false
            }
        });
    }

    /// Drain in-flight work: wait until the registry empties or the
    /// watchdog fires, then signal whatever remains via `cancel_child`.
    pub async fn drain(
        &self,
        registry: &TaskRegistry,
        cancel_child: impl Fn(&str) -> bool,
        timeout: Duration,
    ) -> DrainReport {
        self.begin_drain();
        let started = Instant::now();
        let initial = registry.pending_count();
        info!(in_flight = initial, timeout_s = timeout.as_secs(), "Draining in-flight tasks");

        let deadline = started + timeout;
        while registry.pending_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL).await;
        }

        let remaining = registry.pending_ids();
        let timed_out = !remaining.is_empty();
        for task_id in &remaining {
            if !registry.cancel(task_id, &cancel_child) {
                warn!(task_id = %task_id, "Task did not respond to drain cancellation");
            }
        }

        self.terminate();
        let report = DrainReport {
            completed: initial.saturating_sub(remaining.len()),
            cancelled: remaining.len(),
            timed_out,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            completed = report.completed,
            cancelled = report.cancelled,
            timed_out = report.timed_out,
            duration_ms = report.duration_ms,
            "Drain finished"
        );
        report
    }
}
