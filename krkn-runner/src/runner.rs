//! Caller-facing handle for one Kraken configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use krkn_common::EnvironmentBuilder;
use tracing::{debug, warn};

use crate::config::SupervisorConfig;
use crate::detector::CompletionDetector;
use crate::error::ChaosError;
use crate::result::ChaosResult;
use crate::supervisor::{ConfigRewriter, ProcessSupervisor, RunSummary};
use crate::wait::{DEFAULT_JOIN_GRACE, DEFAULT_TERMINATE_GRACE, WaitController};

/// Runs Kraken with one config file and exposes its results.
///
/// ```ignore
/// let mut runner = KrknRunner::new(SupervisorConfig::from_env()?, "chaos.yaml", "kraken.log")?;
/// runner.run_async()?;
/// runner.wait_for_completion(Duration::from_secs(30), Some(Duration::from_secs(3600)))?;
/// let data = runner.get_chaos_data()?;
/// ```
#[derive(Debug)]
pub struct KrknRunner {
    supervisor: ProcessSupervisor,
    detector: CompletionDetector,
    output_log: PathBuf,
    chaos_data_marker: String,
    join_grace: Duration,
    terminate_grace: Duration,
}

impl KrknRunner {
    pub fn new(
        settings: SupervisorConfig,
        config_path: impl Into<PathBuf>,
        output_log: impl Into<PathBuf>,
    ) -> Result<Self, ChaosError> {
        let output_log = output_log.into();
        let detector = CompletionDetector::new(&output_log, settings.markers.clone());
        let chaos_data_marker = settings.markers.chaos_data.clone();
        let supervisor = ProcessSupervisor::new(settings, config_path, &output_log)?;
        Ok(Self {
            supervisor,
            detector,
            output_log,
            chaos_data_marker,
            join_grace: DEFAULT_JOIN_GRACE,
            terminate_grace: DEFAULT_TERMINATE_GRACE,
        })
    }

    pub fn with_environment(mut self, environment: impl EnvironmentBuilder + 'static) -> Self {
        self.supervisor = self.supervisor.with_environment(environment);
        self
    }

    pub fn with_rewriter(mut self, rewriter: impl ConfigRewriter + 'static) -> Self {
        self.supervisor = self.supervisor.with_rewriter(rewriter);
        self
    }

    /// Override the waiter's join and SIGTERM graces.
    pub fn with_wait_graces(mut self, join_grace: Duration, terminate_grace: Duration) -> Self {
        self.join_grace = join_grace;
        self.terminate_grace = terminate_grace;
        self
    }

    pub fn output_log(&self) -> &Path {
        &self.output_log
    }

    pub fn command_line(&self) -> String {
        self.supervisor.launch_spec().command_line()
    }

    /// Start a run. Log checks only look at what this run appends.
    pub fn run_async(&mut self) -> Result<(), ChaosError> {
        let offset = fs::metadata(&self.output_log).map(|m| m.len()).unwrap_or(0);
        self.supervisor.run_async()?;
        if offset > 0 {
            debug!(log = %self.output_log.display(), offset, "Output log already has content, checking from offset");
        }
        self.detector.set_start_offset(offset);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.supervisor.is_running()
    }

    pub fn wait_for_completion(
        &self,
        check_interval: Duration,
        max_wait: Option<Duration>,
    ) -> Result<RunSummary, ChaosError> {
        let state = self.supervisor.state().ok_or(ChaosError::NotStarted)?;
        WaitController::new(state, self.detector.clone())
            .with_join_grace(self.join_grace)
            .with_terminate_grace(self.terminate_grace)
            .wait_for_completion(check_interval, max_wait)
    }

    /// Summary of the last finished run, if it succeeded.
    pub fn summary(&self) -> Option<RunSummary> {
        self.supervisor.state()?.outcome()?.ok()
    }

    /// Chaos data this run wrote to the output log, falling back to captured
    /// output.
    pub fn get_chaos_data(&self) -> Result<ChaosResult, ChaosError> {
        let from_log = self
            .detector
            .read_log()
            .map_err(ChaosError::from)
            .and_then(|log| ChaosResult::from_output(&log, &self.chaos_data_marker));
        let err = match from_log {
            Ok(result) => return Ok(result),
            Err(err @ (ChaosError::MalformedOutput(_) | ChaosError::Io(_))) => err,
            Err(err) => return Err(err),
        };

        let Some(summary) = self.summary() else {
            return Err(err);
        };
        debug!(error = %err, "No chaos data in output log, trying captured output");
        let captured = format!("{}\n{}", summary.stdout, summary.stderr);
        ChaosResult::from_output(&captured, &self.chaos_data_marker).inspect_err(|e| {
            warn!(error = %e, log = %self.output_log.display(), "No chaos data found");
        })
    }

    pub fn check_success_completion(&self) -> (bool, String) {
        self.detector.check_success_completion()
    }

    pub fn check_output_log_for_completion(&self) -> bool {
        self.detector.check_output_log_for_completion()
    }

    pub fn validate_execution_success(&self) -> Result<bool, ChaosError> {
        self.detector.validate_execution_success()
    }
}
