//! Configuration inputs for the chaos-run supervisor.
//!
//! - Kraken's own YAML config (only the signal server and kubeconfig keys are read)
//! - the auth config holding cloud-provider credentials
//! - `KRKN_*` environment variables with type-safe parsing and error collection

pub mod auth;
pub mod env;
pub mod krkn;

pub use auth::{AuthConfig, IbmCloudAuth};
pub use env::{EnvError, EnvParser};
pub use krkn::KrknConfigFile;

use std::path::PathBuf;
use thiserror::Error;

/// Errors reading or rewriting configuration files.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid YAML in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml_ng::Error,
    },

    #[error("Failed to serialize {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_yaml_ng::Error,
    },

    #[error("Missing or invalid key '{key}' in {path}")]
    InvalidKey { path: PathBuf, key: String },
}

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
