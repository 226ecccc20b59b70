//! Attempt classification and retry policy for Kraken launches.
//!
//! Kept free of process handling so attempt counting and retryability can be
//! tested on their own.

use std::time::Duration;

use tracing::{debug, warn};

/// Substrings of stderr that mean Kraken's signal server could not bind.
pub const PORT_CONFLICT_SIGNATURES: &[&str] = &[
    "Address already in use",
    "address already in use",
];

/// Errors that can be retried.
pub trait RetryableError {
    /// Whether another attempt could succeed.
    fn is_retryable(&self) -> bool;
}

/// Why a single launch attempt did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptFailure {
    /// Non-zero exit with a bind failure in stderr.
    PortConflict { exit_code: Option<i32> },
    /// Non-zero exit (or death by signal when `exit_code` is `None`).
    NonZeroExit { exit_code: Option<i32> },
    /// Spawn or monitor failure.
    Unexpected(String),
    /// Monitor ceiling exceeded with the process still alive.
    Timeout { ceiling: Duration },
}

impl AttemptFailure {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::PortConflict { exit_code } | Self::NonZeroExit { exit_code } => *exit_code,
            Self::Unexpected(_) | Self::Timeout { .. } => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::PortConflict { exit_code } => {
                format!("signal port already in use (exit code {exit_code:?})")
            }
            Self::NonZeroExit { exit_code: Some(code) } => format!("exit code {code}"),
            Self::NonZeroExit { exit_code: None } => "terminated by signal".to_string(),
            Self::Unexpected(msg) => format!("unexpected error: {msg}"),
            Self::Timeout { ceiling } => format!("monitor ceiling of {ceiling:?} exceeded"),
        }
    }
}

impl RetryableError for AttemptFailure {
    fn is_retryable(&self) -> bool {
        !matches!(self, Self::Timeout { .. })
    }
}

/// How a process exit is interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitClass {
    Success,
    /// Some scenarios failed but Kraken itself ran to completion.
    SoftSuccess,
    Failed(AttemptFailure),
}

/// Exit codes Kraken uses for success and partial success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitCodePolicy {
    pub success_codes: Vec<i32>,
    pub soft_success_codes: Vec<i32>,
}

impl Default for ExitCodePolicy {
    fn default() -> Self {
        Self {
            success_codes: vec![0],
            soft_success_codes: vec![2],
        }
    }
}

impl ExitCodePolicy {
    /// Classify an exit. `None` means the process was killed by a signal.
    pub fn classify(&self, exit_code: Option<i32>, stderr: &str) -> ExitClass {
        match exit_code {
            Some(code) if self.success_codes.contains(&code) => ExitClass::Success,
            Some(code) if self.soft_success_codes.contains(&code) => ExitClass::SoftSuccess,
            _ if stderr_indicates_port_conflict(stderr) => {
                ExitClass::Failed(AttemptFailure::PortConflict { exit_code })
            }
            _ => ExitClass::Failed(AttemptFailure::NonZeroExit { exit_code }),
        }
    }
}

pub fn stderr_indicates_port_conflict(stderr: &str) -> bool {
    PORT_CONFLICT_SIGNATURES
        .iter()
        .any(|signature| stderr.contains(signature))
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Pick a new signal port, rewrite the config, then relaunch.
    RemediatePortAndRetry,
    Retry,
    GiveUp,
}

/// Retry policy for Kraken launches.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts including the first try (minimum 1).
    pub max_attempts: u32,
    /// Pause after rewriting the port before relaunching.
    pub conflict_backoff: Duration,
    /// Pause before relaunching after any other failure.
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            conflict_backoff: Duration::from_secs(2),
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Decide the next step after `failure` on `attempt` (1-based).
    pub fn decide<E>(&self, failure: &E, attempt: u32) -> RetryDecision
    where
        E: RetryableError + PortConflictAware,
    {
        let max_attempts = self.max_attempts();
        if !failure.is_retryable() {
            warn!(attempt, max_attempts, "Attempt failed (non-retryable)");
            return RetryDecision::GiveUp;
        }
        if attempt >= max_attempts {
            warn!(attempt, max_attempts, "Attempt failed, no attempts left");
            return RetryDecision::GiveUp;
        }
        if failure.is_port_conflict() {
            debug!(attempt, max_attempts, "Port conflict, remediating before retry");
            RetryDecision::RemediatePortAndRetry
        } else {
            debug!(attempt, max_attempts, "Attempt failed (retryable)");
            RetryDecision::Retry
        }
    }

    /// Delay to sleep before the next attempt.
    pub fn delay_for(&self, decision: RetryDecision) -> Duration {
        match decision {
            RetryDecision::RemediatePortAndRetry => self.conflict_backoff,
            RetryDecision::Retry => self.retry_delay,
            RetryDecision::GiveUp => Duration::ZERO,
        }
    }
}

/// Failures that may have been caused by a port collision.
pub trait PortConflictAware {
    fn is_port_conflict(&self) -> bool;
}

impl PortConflictAware for AttemptFailure {
    fn is_port_conflict(&self) -> bool {
        matches!(self, Self::PortConflict { .. })
    }
}
