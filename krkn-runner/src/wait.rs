//! Blocking wait for a chaos run started with `run_async`.
//!
//! Two clocks apply to a run. The monitor ceiling is enforced inside the
//! execution thread and is fatal for that run. `max_wait` belongs to the
//! caller: when it passes first, the waiter asks the execution thread to stop,
//! terminates Kraken and reports `WaitTimeout`, whatever the thread later
//! publishes. When the ceiling passes first, the thread's `Timeout` is what
//! the waiter returns.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::detector::CompletionDetector;
use crate::error::ChaosError;
use crate::process::{is_process_alive, send_signal_to_process};
use crate::supervisor::{RunOutcome, RunSummary, SharedRunState};

/// How long to let the execution thread finish once the log shows success.
pub const DEFAULT_JOIN_GRACE: Duration = Duration::from_secs(30);
/// Time between SIGTERM and SIGKILL on caller timeout.
pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(5);

const TERMINATE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitState {
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

#[derive(Debug)]
pub struct WaitController {
    state: Arc<SharedRunState>,
    detector: CompletionDetector,
    join_grace: Duration,
    terminate_grace: Duration,
}

impl WaitController {
    pub fn new(state: Arc<SharedRunState>, detector: CompletionDetector) -> Self {
        Self {
            state,
            detector,
            join_grace: DEFAULT_JOIN_GRACE,
            terminate_grace: DEFAULT_TERMINATE_GRACE,
        }
    }

    pub fn with_join_grace(mut self, grace: Duration) -> Self {
        self.join_grace = grace;
        self
    }

    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    /// Block until the run finishes, polling every `check_interval`.
    ///
    /// With `max_wait` set, Kraken is terminated (TERM, then KILL after the
    /// terminate grace) once it passes, and `WaitTimeout` is returned.
    pub fn wait_for_completion(
        &self,
        check_interval: Duration,
        max_wait: Option<Duration>,
    ) -> Result<RunSummary, ChaosError> {
        let start = Instant::now();
        let mut iteration: u64 = 0;
        debug!(
            state = ?WaitState::Running,
            check_interval = ?check_interval,
            max_wait = ?max_wait,
            "Waiting for chaos run"
        );

        loop {
            iteration += 1;

            if let Some(outcome) = self.state.outcome() {
                return self.finish(outcome, start);
            }

            let (log_success, detail) = self.detector.check_success_completion();
            if log_success || self.detector.check_output_log_for_completion() {
                info!(detail = %detail, "Completion detected in Kraken log, joining execution thread");
                let grace = bounded(self.join_grace, start, max_wait);
                if let Some(outcome) = self.state.wait_outcome(grace) {
                    return self.finish(outcome, start);
                }
                info!(grace = ?grace, "Execution thread still busy after success was logged, continuing to wait");
            }

            let elapsed = start.elapsed();
            match max_wait {
                Some(limit) if elapsed >= limit => return Err(self.terminate(elapsed, limit)),
                Some(limit) => debug!(
                    iteration,
                    elapsed_secs = elapsed.as_secs(),
                    limit_secs = limit.as_secs(),
                    "Chaos run in progress"
                ),
                None => info!(iteration, elapsed_secs = elapsed.as_secs(), "Chaos run in progress"),
            }

            let pause = bounded(check_interval, start, max_wait);
            if let Some(outcome) = self.state.wait_outcome(pause) {
                return self.finish(outcome, start);
            }
        }
    }

    fn finish(&self, outcome: RunOutcome, start: Instant) -> Result<RunSummary, ChaosError> {
        let state = if outcome.is_ok() {
            WaitState::Succeeded
        } else {
            WaitState::Failed
        };
        info!(state = ?state, waited_ms = start.elapsed().as_millis() as u64, "Chaos run finished");
        outcome
    }

    fn terminate(&self, waited: Duration, max_wait: Duration) -> ChaosError {
        warn!(
            state = ?WaitState::TimedOut,
            waited_secs = waited.as_secs(),
            max_wait_secs = max_wait.as_secs(),
            "Chaos run exceeded max wait, terminating Kraken"
        );
        self.state.request_cancel();

        if let Some(pid) = self.state.child_pid() {
            send_signal_to_process(pid, false);
            let deadline = Instant::now() + self.terminate_grace;
            while self.still_running(pid) && Instant::now() < deadline {
                thread::sleep(TERMINATE_POLL);
            }
            if self.still_running(pid) {
                warn!(pid, "Kraken ignored SIGTERM, sending SIGKILL");
                send_signal_to_process(pid, true);
            }
        }

        if self.state.wait_outcome(self.terminate_grace).is_none() {
            warn!("Execution thread has not stopped after termination");
        }
        ChaosError::WaitTimeout { waited, max_wait }
    }

    fn still_running(&self, pid: u32) -> bool {
        self.state.child_pid() == Some(pid) && is_process_alive(pid)
    }
}

/// `interval`, cut short so a wait never runs past `max_wait`.
fn bounded(interval: Duration, start: Instant, max_wait: Option<Duration>) -> Duration {
    match max_wait {
        Some(limit) => interval.min(limit.saturating_sub(start.elapsed())),
        None => interval,
    }
}
