use std::fs;
use std::path::PathBuf;
use std::sync::Once;
use std::time::Duration;

use krkn_common::{KrknConfigFile, KubeconfigEnvironment};
use krkn_runner::{KrknRunner, SupervisorConfig};
use tempfile::TempDir;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_test_writer()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_thread_ids(true)
                    .json(),
            )
            .with(filter)
            .init();
    });
}

/// Preamble every fake Kraken script starts with.
///
/// Invoked as `sh run_kraken.sh --config <path> --output=<log>`.
const PREAMBLE: &str = r#"#!/bin/sh
CONFIG="$2"
LOG="${3#--output=}"
HERE="$(dirname "$0")"
"#;

/// A shell script standing in for `run_kraken.py`, with its config and log.
pub struct FakeKraken {
    pub dir: TempDir,
    pub script: PathBuf,
    pub config: PathBuf,
    pub log: PathBuf,
}

#[allow(dead_code)]
impl FakeKraken {
    pub fn new(body: &str) -> Self {
        Self::with_config(body, "kraken:\n  port: 8081\n  signal_address: 127.0.0.1\n")
    }

    pub fn with_config(body: &str, config: &str) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let script = dir.path().join("run_kraken.sh");
        fs::write(&script, format!("{PREAMBLE}{body}\n")).expect("write script");
        let config_path = dir.path().join("config.yaml");
        fs::write(&config_path, config).expect("write config");
        let log = dir.path().join("kraken.log");
        Self {
            dir,
            script,
            config: config_path,
            log,
        }
    }

    /// Settings with short timings suitable for tests.
    pub fn settings(&self) -> SupervisorConfig {
        let mut settings = SupervisorConfig::for_home(self.dir.path());
        settings.interpreter = PathBuf::from("/bin/sh");
        settings.entry_script = self.script.clone();
        settings.working_dir = None;
        settings.poll_slice = Duration::from_millis(20);
        settings.drain_timeout = Duration::from_secs(2);
        settings.reap_grace = Duration::from_secs(10);
        settings.retry.conflict_backoff = Duration::from_millis(50);
        settings.retry.retry_delay = Duration::from_millis(50);
        settings
    }

    pub fn runner(&self) -> KrknRunner {
        self.runner_with(self.settings())
    }

    pub fn runner_with(&self, settings: SupervisorConfig) -> KrknRunner {
        KrknRunner::new(settings, &self.config, &self.log)
            .expect("runner")
            .with_environment(KubeconfigEnvironment)
            .with_wait_graces(Duration::from_secs(5), Duration::from_millis(500))
    }

    pub fn config_port(&self) -> Option<u16> {
        KrknConfigFile::load(&self.config).expect("config").signal_port()
    }

    /// Contents of a file the script wrote next to itself.
    pub fn read(&self, name: &str) -> String {
        fs::read_to_string(self.dir.path().join(name)).unwrap_or_default()
    }
}
