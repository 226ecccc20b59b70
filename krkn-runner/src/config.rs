//! Supervisor settings.
//!
//! Defaults match a stock Kraken checkout under `KRKN_HOME` with its own
//! virtualenv. Every field can be overridden through `KRKN_*` variables or set
//! directly by callers that build the struct themselves.

use std::path::PathBuf;
use std::time::Duration;

use krkn_common::{AuthConfig, EnvParser, Platform, PortRange, validate_port_range};
use tracing::debug;

use crate::error::ChaosError;
use crate::markers::CompletionMarkers;
use crate::monitor::{MonitorSettings, ReadMode};
use crate::retry::{ExitCodePolicy, RetryPolicy};

/// Default Kraken checkout location.
pub const DEFAULT_KRKN_HOME: &str = "~/krkn";
/// Output monitor ceiling for a single attempt.
pub const DEFAULT_MONITOR_CEILING: Duration = Duration::from_secs(4 * 60 * 60);
/// Readiness wait per monitor iteration.
pub const DEFAULT_POLL_SLICE: Duration = Duration::from_millis(100);
/// How long to wait for exit after a secondary completion phrase.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a process may linger after the primary marker before it is killed.
pub const DEFAULT_REAP_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Python interpreter, normally the checkout's virtualenv.
    pub interpreter: PathBuf,
    /// `run_kraken.py`.
    pub entry_script: PathBuf,
    /// Working directory for the Kraken process; `None` inherits ours.
    pub working_dir: Option<PathBuf>,
    pub monitor_ceiling: Duration,
    pub poll_slice: Duration,
    pub read_mode: ReadMode,
    pub drain_timeout: Duration,
    pub reap_grace: Duration,
    pub retry: RetryPolicy,
    pub exit_codes: ExitCodePolicy,
    pub platform: Platform,
    /// Auth file consulted by platform environment builders.
    pub auth_config: Option<PathBuf>,
    pub port_range: PortRange,
    pub markers: CompletionMarkers,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::for_home(expand(DEFAULT_KRKN_HOME))
    }
}

impl SupervisorConfig {
    /// Defaults for a Kraken checkout at `home`.
    pub fn for_home(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            interpreter: home.join("venv").join("bin").join("python3"),
            entry_script: home.join("run_kraken.py"),
            working_dir: Some(home),
            monitor_ceiling: DEFAULT_MONITOR_CEILING,
            poll_slice: DEFAULT_POLL_SLICE,
            read_mode: ReadMode::default(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            reap_grace: DEFAULT_REAP_GRACE,
            retry: RetryPolicy::default(),
            exit_codes: ExitCodePolicy::default(),
            platform: Platform::default(),
            auth_config: None,
            port_range: PortRange::default(),
            markers: CompletionMarkers::default(),
        }
    }

    /// Load from `KRKN_*` environment variables.
    ///
    /// All invalid variables are reported together.
    pub fn from_env() -> Result<Self, ChaosError> {
        let mut parser = EnvParser::new();

        let home = parser.get_path("HOME", DEFAULT_KRKN_HOME, false);
        let mut config = Self::for_home(home);

        if let Some(interpreter) = parser.get_optional_path("INTERPRETER") {
            config.interpreter = interpreter;
        }
        if let Some(entry_script) = parser.get_optional_path("ENTRY_SCRIPT") {
            config.entry_script = entry_script;
        }

        config.monitor_ceiling = Duration::from_secs(parser.get_u64_range(
            "MONITOR_CEILING_SECS",
            DEFAULT_MONITOR_CEILING.as_secs(),
            1,
            7 * 24 * 60 * 60,
        ));
        config.poll_slice = Duration::from_millis(parser.get_u64_range(
            "POLL_SLICE_MS",
            DEFAULT_POLL_SLICE.as_millis() as u64,
            1,
            10_000,
        ));
        config.retry.max_attempts =
            parser.get_u32_range("MAX_ATTEMPTS", config.retry.max_attempts, 1, 20);
        config.exit_codes.soft_success_codes =
            parser.get_i32_list("SOFT_SUCCESS_CODES", &config.exit_codes.soft_success_codes);
        if parser.get_bool("FIXED_INTERVAL_READS", false) {
            config.read_mode = ReadMode::FixedInterval;
        }

        let platform = parser.get_string("PLATFORM", "generic");
        let platform_error = match platform.parse::<Platform>() {
            Ok(platform) => {
                config.platform = platform;
                None
            }
            Err(e) => Some(format!("KRKN_PLATFORM: {e}")),
        };
        config.auth_config = parser.get_optional_path("AUTH_CONFIG");

        let mut problems: Vec<String> = parser.take_errors().iter().map(|e| e.to_string()).collect();
        problems.extend(platform_error);
        if !problems.is_empty() {
            return Err(ChaosError::InvalidSettings(problems.join("; ")));
        }
        config.validate()?;

        debug!(
            interpreter = %config.interpreter.display(),
            entry_script = %config.entry_script.display(),
            platform = %config.platform,
            max_attempts = config.retry.max_attempts,
            "Loaded supervisor settings from environment"
        );
        Ok(config)
    }

    /// Reject settings the supervisor cannot run with.
    pub fn validate(&self) -> Result<(), ChaosError> {
        let mut problems = Vec::new();
        let range = &self.port_range;
        if !validate_port_range(range.start.into(), range.end.into()) {
            problems.push(format!(
                "port range {}..={} must start at 1024 or above and span at least 10 ports",
                range.start, range.end
            ));
        } else if !range.contains(range.default_port) {
            problems.push(format!(
                "default port {} outside port range {}..={}",
                range.default_port, range.start, range.end
            ));
        }
        if self.poll_slice.is_zero() {
            problems.push("poll slice must be non-zero".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ChaosError::InvalidSettings(problems.join("; ")))
        }
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            ceiling: self.monitor_ceiling,
            poll_slice: self.poll_slice,
            read_mode: self.read_mode,
            drain_timeout: self.drain_timeout,
        }
    }

    /// Auth config for the selected platform, if one is configured.
    pub fn load_auth(&self) -> Result<Option<AuthConfig>, ChaosError> {
        match &self.auth_config {
            Some(path) => Ok(Some(AuthConfig::load(path)?)),
            None => Ok(None),
        }
    }
}

fn expand(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::{Mutex, MutexGuard, OnceLock};

    const VARS: &[&str] = &[
        "KRKN_HOME",
        "KRKN_INTERPRETER",
        "KRKN_ENTRY_SCRIPT",
        "KRKN_MONITOR_CEILING_SECS",
        "KRKN_POLL_SLICE_MS",
        "KRKN_MAX_ATTEMPTS",
        "KRKN_SOFT_SUCCESS_CODES",
        "KRKN_FIXED_INTERVAL_READS",
        "KRKN_PLATFORM",
        "KRKN_AUTH_CONFIG",
    ];

    fn env_lock() -> MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn clear() {
        for var in VARS {
            // SAFETY: Tests are serialized via env_lock
            unsafe { env::remove_var(var) };
        }
    }

    fn set(key: &str, value: &str) {
        // SAFETY: Tests are serialized via env_lock
        unsafe { env::set_var(key, value) };
    }

    #[test]
    fn test_default_settings_are_valid() {
        assert!(SupervisorConfig::for_home("/opt/krkn").validate().is_ok());
    }

    #[test]
    fn test_inverted_port_range_rejected() {
        let mut config = SupervisorConfig::for_home("/opt/krkn");
        config.port_range = PortRange {
            start: 9000,
            end: 8000,
            default_port: 9000,
            ..PortRange::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ChaosError::InvalidSettings(ref msg) if msg.contains("9000..=8000")));
    }

    #[test]
    fn test_default_port_outside_range_rejected() {
        let mut config = SupervisorConfig::for_home("/opt/krkn");
        config.port_range.default_port = 9500;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ChaosError::InvalidSettings(ref msg) if msg.contains("default port 9500")));
    }

    #[test]
    fn test_for_home_layout() {
        let config = SupervisorConfig::for_home("/opt/krkn");
        assert_eq!(config.interpreter, PathBuf::from("/opt/krkn/venv/bin/python3"));
        assert_eq!(config.entry_script, PathBuf::from("/opt/krkn/run_kraken.py"));
        assert_eq!(config.monitor_ceiling, Duration::from_secs(14_400));
        assert_eq!(config.poll_slice, Duration::from_millis(100));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.exit_codes.soft_success_codes, vec![2]);
    }

    #[test]
    fn test_from_env_overrides() {
        let _guard = env_lock();
        clear();
        set("KRKN_HOME", "/srv/krkn");
        set("KRKN_ENTRY_SCRIPT", "/srv/other/run.py");
        set("KRKN_POLL_SLICE_MS", "250");
        set("KRKN_MAX_ATTEMPTS", "5");
        set("KRKN_SOFT_SUCCESS_CODES", "2, 3");
        set("KRKN_PLATFORM", "ibm_cloud");

        let config = SupervisorConfig::from_env().unwrap();
        assert_eq!(config.interpreter, PathBuf::from("/srv/krkn/venv/bin/python3"));
        assert_eq!(config.entry_script, PathBuf::from("/srv/other/run.py"));
        assert_eq!(config.poll_slice, Duration::from_millis(250));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.exit_codes.soft_success_codes, vec![2, 3]);
        assert_eq!(config.platform, Platform::IbmCloud);
        clear();
    }

    #[test]
    fn test_from_env_collects_all_errors() {
        let _guard = env_lock();
        clear();
        set("KRKN_MAX_ATTEMPTS", "0");
        set("KRKN_POLL_SLICE_MS", "fast");
        set("KRKN_PLATFORM", "mainframe");

        let err = SupervisorConfig::from_env().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("KRKN_MAX_ATTEMPTS"), "{message}");
        assert!(message.contains("KRKN_POLL_SLICE_MS"), "{message}");
        assert!(message.contains("mainframe"), "{message}");
        clear();
    }
}
