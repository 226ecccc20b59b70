//! Launch, monitor and retry Kraken on a background thread.
//!
//! One [`ProcessSupervisor`] owns at most one execution thread at a time. The
//! thread runs the attempt loop and publishes exactly one outcome through
//! [`SharedRunState`]; waiters never touch the `Child` handle directly.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use krkn_common::{
    EnvironmentBuilder, KrknConfigFile, PortAllocator, builder_for_platform, mask_sensitive_env,
};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::SupervisorConfig;
use crate::error::ChaosError;
use crate::markers::CompletionSignal;
use crate::monitor::{Completion, MonitorError, OutputMonitor};
use crate::retry::{AttemptFailure, ExitClass, RetryDecision};
use crate::slot::OutcomeSlot;

/// Bind address Kraken uses when `kraken.signal_address` is unset.
pub const DEFAULT_SIGNAL_ADDRESS: &str = "0.0.0.0";

/// The `kraken` settings the supervisor reads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalSettings {
    pub port: Option<u16>,
    pub address: Option<String>,
    pub kubeconfig: Option<PathBuf>,
}

/// Read and rewrite access to the Kraken config file.
pub trait ConfigRewriter: fmt::Debug + Send + Sync {
    fn read_settings(&self, config: &Path) -> Result<SignalSettings, ChaosError>;

    /// Set `kraken.port`, returning the previous value.
    fn rewrite_port(&self, config: &Path, port: u16) -> Result<Option<u16>, ChaosError>;
}

/// Rewrites the YAML file in place.
#[derive(Debug, Clone, Default)]
pub struct YamlConfigRewriter;

impl ConfigRewriter for YamlConfigRewriter {
    fn read_settings(&self, config: &Path) -> Result<SignalSettings, ChaosError> {
        let file = KrknConfigFile::load(config)?;
        Ok(SignalSettings {
            port: file.signal_port(),
            address: file.signal_address().map(str::to_string),
            kubeconfig: file.kubeconfig_path(),
        })
    }

    fn rewrite_port(&self, config: &Path, port: u16) -> Result<Option<u16>, ChaosError> {
        Ok(KrknConfigFile::rewrite_signal_port(config, port)?)
    }
}

/// Everything needed to build the Kraken command line.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub interpreter: PathBuf,
    pub entry_script: PathBuf,
    pub config_path: PathBuf,
    pub output_log: PathBuf,
    pub working_dir: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn new(
        settings: &SupervisorConfig,
        config_path: impl Into<PathBuf>,
        output_log: impl Into<PathBuf>,
    ) -> Self {
        Self {
            interpreter: settings.interpreter.clone(),
            entry_script: settings.entry_script.clone(),
            config_path: config_path.into(),
            output_log: output_log.into(),
            working_dir: settings.working_dir.clone(),
        }
    }

    pub fn args(&self) -> Vec<String> {
        vec![
            self.entry_script.display().to_string(),
            "--config".to_string(),
            self.config_path.display().to_string(),
            format!("--output={}", self.output_log.display()),
        ]
    }

    pub fn command_line(&self) -> String {
        format!("{} {}", self.interpreter.display(), self.args().join(" "))
    }

    /// Check every path the launch depends on. Returns the kubeconfig the
    /// config refers to, if any.
    pub fn validate(&self, rewriter: &dyn ConfigRewriter) -> Result<Option<PathBuf>, ChaosError> {
        let mut missing = Vec::new();
        if !self.interpreter.exists() {
            missing.push(format!("interpreter {}", self.interpreter.display()));
        }
        if !self.entry_script.exists() {
            missing.push(format!("entry script {}", self.entry_script.display()));
        }
        if !self.config_path.exists() {
            missing.push(format!("config {}", self.config_path.display()));
        }
        if !missing.is_empty() {
            return Err(ChaosError::EnvironmentValidation(format!(
                "missing {}",
                missing.join(", ")
            )));
        }

        let settings = rewriter.read_settings(&self.config_path)?;
        if let Some(kubeconfig) = &settings.kubeconfig {
            if !kubeconfig.exists() {
                return Err(ChaosError::EnvironmentValidation(format!(
                    "kubeconfig {} referenced by {} does not exist",
                    kubeconfig.display(),
                    self.config_path.display()
                )));
            }
        }
        Ok(settings.kubeconfig)
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.interpreter);
        cmd.args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

/// How a successful run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunVerdict {
    Success,
    /// Exit code in the soft-success set.
    SoftSuccess,
    /// Completion marker seen before the process exited.
    CompletionMarker,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortChange {
    pub attempt: u32,
    pub old_port: u16,
    pub new_port: u16,
}

/// What a successful run looked like.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub attempts: u32,
    pub exit_code: Option<i32>,
    pub verdict: RunVerdict,
    pub port_changes: Vec<PortChange>,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    #[serde(skip)]
    pub stdout: String,
    #[serde(skip)]
    pub stderr: String,
}

pub type RunOutcome = Result<RunSummary, ChaosError>;

/// State shared between the execution thread and waiters.
#[derive(Debug, Default)]
pub struct SharedRunState {
    outcome: OutcomeSlot<RunOutcome>,
    child_pid: AtomicU32,
    cancel_requested: AtomicBool,
}

impl SharedRunState {
    pub fn outcome(&self) -> Option<RunOutcome> {
        self.outcome.get()
    }

    pub fn wait_outcome(&self, timeout: Duration) -> Option<RunOutcome> {
        self.outcome.wait_timeout(timeout)
    }

    /// The unit is alive until it has published an outcome.
    pub fn is_alive(&self) -> bool {
        !self.outcome.is_set()
    }

    /// PID of the current Kraken process, if one is running.
    pub fn child_pid(&self) -> Option<u32> {
        match self.child_pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Ask the execution thread to stop after the current attempt.
    pub fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn publish(&self, outcome: RunOutcome) {
        match &outcome {
            Ok(summary) => info!(
                attempts = summary.attempts,
                verdict = ?summary.verdict,
                elapsed_ms = summary.elapsed.as_millis() as u64,
                "Chaos run succeeded"
            ),
            Err(e) => error!(error = %e, "Chaos run failed"),
        }
        if !self.outcome.set(outcome) {
            debug!("Outcome already published, ignoring");
        }
    }

    fn set_pid(&self, pid: u32) {
        self.child_pid.store(pid, Ordering::SeqCst);
    }

    fn clear_pid(&self) {
        self.child_pid.store(0, Ordering::SeqCst);
    }
}

/// Publishes `WorkerPanicked` if the execution thread unwinds.
struct PanicGuard(Arc<SharedRunState>);

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.clear_pid();
            self.0
                .outcome
                .set(Err(ChaosError::WorkerPanicked("attempt loop panicked".to_string())));
        }
    }
}

pub struct ProcessSupervisor {
    settings: Arc<SupervisorConfig>,
    launch: LaunchSpec,
    environment: Arc<dyn EnvironmentBuilder>,
    rewriter: Arc<dyn ConfigRewriter>,
    state: Option<Arc<SharedRunState>>,
    handle: Option<JoinHandle<()>>,
}

impl ProcessSupervisor {
    /// Supervisor with the platform's environment builder and the YAML rewriter.
    pub fn new(
        settings: SupervisorConfig,
        config_path: impl Into<PathBuf>,
        output_log: impl Into<PathBuf>,
    ) -> Result<Self, ChaosError> {
        settings.validate()?;
        let auth = settings.load_auth()?;
        let environment: Arc<dyn EnvironmentBuilder> =
            Arc::from(builder_for_platform(settings.platform, auth));
        let launch = LaunchSpec::new(&settings, config_path, output_log);
        Ok(Self {
            settings: Arc::new(settings),
            launch,
            environment,
            rewriter: Arc::new(YamlConfigRewriter),
            state: None,
            handle: None,
        })
    }

    pub fn with_environment(mut self, environment: impl EnvironmentBuilder + 'static) -> Self {
        self.environment = Arc::new(environment);
        self
    }

    pub fn with_rewriter(mut self, rewriter: impl ConfigRewriter + 'static) -> Self {
        self.rewriter = Arc::new(rewriter);
        self
    }

    pub fn settings(&self) -> &SupervisorConfig {
        &self.settings
    }

    pub fn launch_spec(&self) -> &LaunchSpec {
        &self.launch
    }

    /// State of the current or most recent run.
    pub fn state(&self) -> Option<Arc<SharedRunState>> {
        self.state.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state.as_ref().is_some_and(|state| state.is_alive())
    }

    /// Validate, then start the attempt loop on a background thread.
    pub fn run_async(&mut self) -> Result<(), ChaosError> {
        if self.is_running() {
            return Err(ChaosError::AlreadyRunning);
        }
        if let Some(previous) = self.handle.take() {
            // Previous outcome is published; the thread may still be reaping.
            if previous.join().is_err() {
                warn!("Previous execution thread panicked");
            }
        }

        self.launch.validate(self.rewriter.as_ref())?;

        let state = Arc::new(SharedRunState::default());
        let execution = Execution {
            settings: Arc::clone(&self.settings),
            launch: self.launch.clone(),
            environment: Arc::clone(&self.environment),
            rewriter: Arc::clone(&self.rewriter),
            allocator: PortAllocator::new(self.settings.port_range),
            state: Arc::clone(&state),
        };

        let handle = thread::Builder::new()
            .name("krkn-supervisor".to_string())
            .spawn(move || execution.run())?;

        info!(command = %self.launch.command_line(), "Started chaos run");
        self.state = Some(state);
        self.handle = Some(handle);
        Ok(())
    }
}

impl fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("launch", &self.launch)
            .field("environment", &self.environment)
            .field("running", &self.is_running())
            .finish()
    }
}

enum AttemptOutcome {
    Succeeded {
        verdict: RunVerdict,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    /// Marker seen; the process still needs reaping.
    MarkerWhileRunning { child: Child, monitor: OutputMonitor },
    Failed {
        failure: AttemptFailure,
        stdout: String,
        stderr: String,
    },
    Fatal(ChaosError),
}

struct Execution {
    settings: Arc<SupervisorConfig>,
    launch: LaunchSpec,
    environment: Arc<dyn EnvironmentBuilder>,
    rewriter: Arc<dyn ConfigRewriter>,
    allocator: PortAllocator,
    state: Arc<SharedRunState>,
}

impl Execution {
    fn run(self) {
        let _guard = PanicGuard(Arc::clone(&self.state));
        let started_at = Utc::now();
        let clock = Instant::now();
        let max_attempts = self.settings.retry.max_attempts();
        let mut port_changes = Vec::new();
        let mut attempt = 1;

        loop {
            if self.state.cancel_requested() {
                self.state.publish(Err(ChaosError::Cancelled));
                return;
            }

            info!(attempt, max_attempts, "Launching Kraken");
            let summary = |verdict: RunVerdict,
                           exit_code: Option<i32>,
                           stdout: String,
                           stderr: String,
                           port_changes: Vec<PortChange>| RunSummary {
                attempts: attempt,
                exit_code,
                verdict,
                port_changes,
                started_at,
                elapsed: clock.elapsed(),
                stdout,
                stderr,
            };

            match self.attempt(attempt) {
                AttemptOutcome::Succeeded {
                    verdict,
                    exit_code,
                    stdout,
                    stderr,
                } => {
                    self.state
                        .publish(Ok(summary(verdict, exit_code, stdout, stderr, port_changes)));
                    return;
                }
                AttemptOutcome::MarkerWhileRunning { child, monitor } => {
                    self.state.publish(Ok(summary(
                        RunVerdict::CompletionMarker,
                        None,
                        monitor.stdout().to_string(),
                        monitor.stderr().to_string(),
                        port_changes,
                    )));
                    self.reap(child, monitor);
                    return;
                }
                AttemptOutcome::Fatal(err) => {
                    self.state.publish(Err(err));
                    return;
                }
                AttemptOutcome::Failed {
                    failure,
                    stdout,
                    stderr,
                } => {
                    warn!(attempt, max_attempts, reason = %failure.describe(), "Kraken attempt failed");
                    if self.state.cancel_requested() {
                        info!(attempt, "Cancellation requested, not retrying");
                        self.state.publish(Err(ChaosError::Cancelled));
                        return;
                    }

                    let decision = self.settings.retry.decide(&failure, attempt);
                    match decision {
                        RetryDecision::GiveUp => {
                            if let AttemptFailure::Timeout { ceiling } = failure {
                                self.state.publish(Err(ChaosError::Timeout {
                                    ceiling,
                                    command: self.launch.command_line(),
                                    stdout,
                                    stderr,
                                }));
                                return;
                            }
                            self.state.publish(Err(ChaosError::ProcessFailed {
                                attempts: attempt,
                                exit_code: failure.exit_code(),
                                reason: failure.describe(),
                                stdout,
                                stderr,
                                command: self.launch.command_line(),
                                config_path: self.launch.config_path.clone(),
                            }));
                            return;
                        }
                        RetryDecision::RemediatePortAndRetry => match self.remediate_port(attempt) {
                            Ok(change) => port_changes.push(change),
                            Err(e) => {
                                self.state.publish(Err(e));
                                return;
                            }
                        },
                        RetryDecision::Retry => {}
                    }

                    if !self.pause(self.settings.retry.delay_for(decision)) {
                        self.state.publish(Err(ChaosError::Cancelled));
                        return;
                    }
                    attempt += 1;
                }
            }
        }
    }

    fn attempt(&self, attempt: u32) -> AttemptOutcome {
        let kubeconfig = match self.launch.validate(self.rewriter.as_ref()) {
            Ok(kubeconfig) => kubeconfig,
            Err(e) => return AttemptOutcome::Fatal(e),
        };

        let extra_env = self.environment.build(kubeconfig.as_deref());
        debug!(attempt, env = %mask_sensitive_env(&extra_env), "Kraken environment");

        let mut cmd = self.launch.command();
        cmd.envs(extra_env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(attempt, error = %e, command = %self.launch.command_line(), "Failed to spawn Kraken");
                return AttemptOutcome::Failed {
                    failure: AttemptFailure::Unexpected(format!("spawn failed: {e}")),
                    stdout: String::new(),
                    stderr: String::new(),
                };
            }
        };
        self.state.set_pid(child.id());
        // A waiter that gave up before the pid was published had nothing to signal.
        if self.state.cancel_requested() {
            info!(attempt, pid = child.id(), "Cancellation requested during launch, stopping Kraken");
            kill_and_reap(&mut child);
            self.state.clear_pid();
            return AttemptOutcome::Fatal(ChaosError::Cancelled);
        }
        debug!(attempt, pid = child.id(), "Kraken process started");

        let mut monitor = OutputMonitor::start(
            &mut child,
            self.settings.monitor_settings(),
            self.settings.markers.clone(),
        );

        match monitor.run(&mut child) {
            Err(MonitorError::Timeout(ceiling)) => {
                kill_and_reap(&mut child);
                self.state.clear_pid();
                monitor.drain(self.settings.drain_timeout);
                let (stdout, stderr) = monitor.into_output();
                AttemptOutcome::Failed {
                    failure: AttemptFailure::Timeout { ceiling },
                    stdout,
                    stderr,
                }
            }
            Err(MonitorError::Lost(reason)) => {
                kill_and_reap(&mut child);
                self.state.clear_pid();
                let (stdout, stderr) = monitor.into_output();
                AttemptOutcome::Failed {
                    failure: AttemptFailure::Unexpected(reason),
                    stdout,
                    stderr,
                }
            }
            Ok(Completion {
                status: None,
                signal: Some(signal),
            }) => {
                debug!(attempt, ?signal, "Completion marker seen while Kraken still running");
                AttemptOutcome::MarkerWhileRunning { child, monitor }
            }
            Ok(Completion {
                status: None,
                signal: None,
            }) => {
                kill_and_reap(&mut child);
                self.state.clear_pid();
                let (stdout, stderr) = monitor.into_output();
                AttemptOutcome::Failed {
                    failure: AttemptFailure::Unexpected("monitor returned without exit status".into()),
                    stdout,
                    stderr,
                }
            }
            Ok(Completion {
                status: Some(status),
                signal,
            }) => {
                self.state.clear_pid();
                let exit_code = status.code();
                let (stdout, stderr) = monitor.into_output();
                info!(attempt, exit_code = ?exit_code, "Kraken exited");

                if signal == Some(CompletionSignal::Primary) {
                    if !self.settings.exit_codes.success_codes.contains(&exit_code.unwrap_or(-1)) {
                        warn!(exit_code = ?exit_code, "Completion marker seen, ignoring exit status");
                    }
                    return AttemptOutcome::Succeeded {
                        verdict: RunVerdict::CompletionMarker,
                        exit_code,
                        stdout,
                        stderr,
                    };
                }

                match self.settings.exit_codes.classify(exit_code, &stderr) {
                    ExitClass::Success => AttemptOutcome::Succeeded {
                        verdict: RunVerdict::Success,
                        exit_code,
                        stdout,
                        stderr,
                    },
                    ExitClass::SoftSuccess => {
                        warn!(exit_code = ?exit_code, "Kraken finished with failed scenarios (soft success)");
                        AttemptOutcome::Succeeded {
                            verdict: RunVerdict::SoftSuccess,
                            exit_code,
                            stdout,
                            stderr,
                        }
                    }
                    ExitClass::Failed(failure) => AttemptOutcome::Failed {
                        failure,
                        stdout,
                        stderr,
                    },
                }
            }
        }
    }

    /// Move Kraken to a free signal port before the next attempt.
    fn remediate_port(&self, attempt: u32) -> Result<PortChange, ChaosError> {
        let config = &self.launch.config_path;
        let settings = self.rewriter.read_settings(config)?;
        let host = settings
            .address
            .unwrap_or_else(|| DEFAULT_SIGNAL_ADDRESS.to_string());
        let old_port = settings
            .port
            .unwrap_or(self.allocator.range().default_port);

        let new_port = self.allocator.find_alternate_port(old_port, &host)?;
        self.rewriter.rewrite_port(config, new_port)?;
        info!(attempt, old_port, new_port, host = %host, "Signal port conflict, moved Kraken to a new port");
        Ok(PortChange {
            attempt,
            old_port,
            new_port,
        })
    }

    /// Let a process that already printed the completion marker exit on its own.
    fn reap(&self, mut child: Child, mut monitor: OutputMonitor) {
        let grace = self.settings.reap_grace;
        match monitor.wait_for_exit(&mut child, grace) {
            Some(status) => debug!(exit_code = ?status.code(), "Kraken exited after completion marker"),
            None => {
                warn!(grace = ?grace, "Kraken still running after completion marker, killing it");
                kill_and_reap(&mut child);
            }
        }
        self.state.clear_pid();
    }

    /// Sleep for `delay` unless cancelled. Returns false on cancellation.
    fn pause(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        let slice = self.settings.poll_slice.max(Duration::from_millis(1));
        loop {
            if self.state.cancel_requested() {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return true;
            }
            thread::sleep(remaining.min(slice));
        }
    }
}

fn kill_and_reap(child: &mut Child) {
    if let Err(e) = child.kill() {
        debug!(error = %e, "Kill failed (process likely already exited)");
    }
    if let Err(e) = child.wait() {
        warn!(error = %e, "Failed to reap Kraken process");
    }
}
