//! Supervisor for Kraken chaos runs.
//!
//! [`KrknRunner`] launches Kraken on a background thread, retries signal-port
//! conflicts, watches output for completion markers, and parses the
//! `Chaos data:` block once the run is over. The lower-level pieces are
//! public for callers that need only one of them.

pub mod config;
pub mod detector;
pub mod error;
pub mod markers;
pub mod monitor;
pub mod process;
pub mod result;
pub mod retry;
pub mod runner;
pub mod slot;
pub mod supervisor;
pub mod wait;

pub use config::SupervisorConfig;
pub use detector::CompletionDetector;
pub use error::ChaosError;
pub use markers::{CompletionMarkers, CompletionSignal};
pub use monitor::{OutputMonitor, ReadMode};
pub use result::{ChaosResult, extract_last_json_block};
pub use retry::{AttemptFailure, ExitCodePolicy, RetryPolicy, RetryableError};
pub use runner::KrknRunner;
pub use supervisor::{
    ConfigRewriter, LaunchSpec, ProcessSupervisor, RunSummary, RunVerdict, YamlConfigRewriter,
};
pub use wait::WaitController;
