//! Error taxonomy for chaos runs.
//!
//! `ChaosError` is `Clone` because an error captured on the execution thread is
//! published through a shared slot and may be observed by more than one
//! `wait_for_completion` call. Non-clonable sources are wrapped in `Arc`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use krkn_common::{ConfigError, PortExhaustionError};

/// Lines of captured output shown in error messages.
const DISPLAY_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ChaosError {
    #[error("Environment validation failed: {0}")]
    EnvironmentValidation(String),

    #[error("Invalid supervisor settings: {0}")]
    InvalidSettings(String),

    #[error(
        "Kraken failed after {attempts} attempt(s): {reason}\n  command: {command}\n  config: {}\n  stderr (tail):\n{stderr_tail}",
        .config_path.display(),
        stderr_tail = tail_lines(.stderr, DISPLAY_TAIL_LINES)
    )]
    ProcessFailed {
        attempts: u32,
        exit_code: Option<i32>,
        reason: String,
        stdout: String,
        stderr: String,
        command: String,
        config_path: PathBuf,
    },

    #[error(
        "Kraken still running after monitor ceiling of {ceiling:?}; process killed\n  command: {command}\n  stderr (tail):\n{stderr_tail}",
        stderr_tail = tail_lines(.stderr, DISPLAY_TAIL_LINES)
    )]
    Timeout {
        ceiling: Duration,
        command: String,
        stdout: String,
        stderr: String,
    },

    #[error("Kraken did not complete within {max_wait:?} (waited {waited:?}); process terminated")]
    WaitTimeout { waited: Duration, max_wait: Duration },

    #[error("Kraken execution validation failed: {message} (log: {})", .log_path.display())]
    ValidationFailed { message: String, log_path: PathBuf },

    #[error("Malformed chaos output: {0}")]
    MalformedOutput(String),

    #[error("Chaos data is not valid JSON: {0}")]
    Json(Arc<serde_json::Error>),

    #[error(transparent)]
    PortExhaustion(Arc<PortExhaustionError>),

    #[error(transparent)]
    Config(Arc<ConfigError>),

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("A chaos run is already active for this supervisor")]
    AlreadyRunning,

    #[error("No chaos run has been started")]
    NotStarted,

    #[error("Chaos run cancelled after the caller's wait timeout")]
    Cancelled,

    #[error("Execution thread panicked: {0}")]
    WorkerPanicked(String),
}

impl ChaosError {
    /// Captured stderr, for variants that carry it.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::ProcessFailed { stderr, .. } | Self::Timeout { stderr, .. } => Some(stderr),
            _ => None,
        }
    }

    /// Captured stdout, for variants that carry it.
    pub fn stdout(&self) -> Option<&str> {
        match self {
            Self::ProcessFailed { stdout, .. } | Self::Timeout { stdout, .. } => Some(stdout),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ChaosError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(Arc::new(err))
    }
}

impl From<PortExhaustionError> for ChaosError {
    fn from(err: PortExhaustionError) -> Self {
        Self::PortExhaustion(Arc::new(err))
    }
}

impl From<ConfigError> for ChaosError {
    fn from(err: ConfigError) -> Self {
        Self::Config(Arc::new(err))
    }
}

impl From<std::io::Error> for ChaosError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

/// Last `n` lines of `text`, indented for error display.
pub(crate) fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..]
        .iter()
        .map(|line| format!("    {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_lines() {
        let text = (1..=30).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let tail = tail_lines(&text, 3);
        assert_eq!(tail, "    line 28\n    line 29\n    line 30");
        assert_eq!(tail_lines("", 3), "");
    }

    #[test]
    fn test_process_failed_display_has_diagnostics() {
        let err = ChaosError::ProcessFailed {
            attempts: 3,
            exit_code: Some(1),
            reason: "exit code 1".to_string(),
            stdout: "out".to_string(),
            stderr: "Traceback\nOSError: boom".to_string(),
            command: "python3 run_kraken.py --config c.yaml".to_string(),
            config_path: PathBuf::from("/tmp/c.yaml"),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("3 attempt(s)"));
        assert!(rendered.contains("run_kraken.py"));
        assert!(rendered.contains("/tmp/c.yaml"));
        assert!(rendered.contains("OSError: boom"));
        assert_eq!(err.stdout(), Some("out"));
    }

    #[test]
    fn test_error_is_clone() {
        let err = ChaosError::from(std::io::Error::other("disk gone"));
        let copy = err.clone();
        assert_eq!(err.to_string(), copy.to_string());
    }
}
