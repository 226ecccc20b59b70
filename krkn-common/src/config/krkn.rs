//! Access to the handful of Kraken config keys the supervisor cares about.
//!
//! ```yaml
//! kraken:
//!     kubeconfig_path: ~/.kube/config
//!     signal_address: 0.0.0.0
//!     port: 8081
//! ```
//!
//! Everything else in the file is carried through untouched when the port is
//! rewritten.

use std::fs;
use std::path::{Path, PathBuf};

use serde_yaml_ng::Value;
use tracing::{debug, info};

use super::ConfigError;

/// Top-level section holding the signal server settings.
pub const KRAKEN_SECTION: &str = "kraken";
pub const PORT_KEY: &str = "port";
pub const SIGNAL_ADDRESS_KEY: &str = "signal_address";
pub const KUBECONFIG_KEY: &str = "kubeconfig_path";

/// A loaded Kraken config document.
#[derive(Debug, Clone)]
pub struct KrknConfigFile {
    path: PathBuf,
    document: Value,
}

impl KrknConfigFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(ConfigError::NotFound(path));
        }
        let content = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let document = if content.trim().is_empty() {
            Value::Mapping(Default::default())
        } else {
            serde_yaml_ng::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?
        };
        Ok(Self { path, document })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn section(&self) -> Option<&Value> {
        self.document.get(KRAKEN_SECTION)
    }

    /// `kraken.port`, accepting either an integer or a numeric string.
    pub fn signal_port(&self) -> Option<u16> {
        let value = self.section()?.get(PORT_KEY)?;
        match value {
            Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// `kraken.signal_address`.
    pub fn signal_address(&self) -> Option<&str> {
        self.section()?.get(SIGNAL_ADDRESS_KEY)?.as_str()
    }

    /// `kraken.kubeconfig_path` with `~` expanded.
    pub fn kubeconfig_path(&self) -> Option<PathBuf> {
        let raw = self.section()?.get(KUBECONFIG_KEY)?.as_str()?;
        if raw.trim().is_empty() {
            return None;
        }
        Some(PathBuf::from(shellexpand::tilde(raw).into_owned()))
    }

    /// Set `kraken.port` in memory, creating the section if needed.
    pub fn set_signal_port(&mut self, port: u16) -> Result<(), ConfigError> {
        let port_value = serde_yaml_ng::to_value(port).map_err(|source| ConfigError::Serialize {
            path: self.path.clone(),
            source,
        })?;

        let Value::Mapping(root) = &mut self.document else {
            return Err(ConfigError::InvalidKey {
                path: self.path.clone(),
                key: KRAKEN_SECTION.to_string(),
            });
        };
        let section = root
            .entry(Value::String(KRAKEN_SECTION.to_string()))
            .or_insert_with(|| Value::Mapping(Default::default()));
        let Value::Mapping(section) = section else {
            return Err(ConfigError::InvalidKey {
                path: self.path.clone(),
                key: KRAKEN_SECTION.to_string(),
            });
        };
        section.insert(Value::String(PORT_KEY.to_string()), port_value);
        Ok(())
    }

    /// Write the document back to its path.
    ///
    /// Writes a sibling temp file and renames it over the original so a
    /// concurrent reader sees either the old or the new document.
    pub fn save(&self) -> Result<(), ConfigError> {
        let content =
            serde_yaml_ng::to_string(&self.document).map_err(|source| ConfigError::Serialize {
                path: self.path.clone(),
                source,
            })?;
        let mut tmp_name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        tmp_name.push(".krkn-tmp");
        let tmp_path = self.path.with_file_name(tmp_name);

        fs::write(&tmp_path, content).map_err(|source| ConfigError::Write {
            path: tmp_path.clone(),
            source,
        })?;
        fs::rename(&tmp_path, &self.path).map_err(|source| ConfigError::Write {
            path: self.path.clone(),
            source,
        })?;
        debug!(path = %self.path.display(), "Rewrote Kraken config");
        Ok(())
    }

    /// Load, set `kraken.port`, save. Returns the previous port if there was one.
    pub fn rewrite_signal_port(path: impl AsRef<Path>, port: u16) -> Result<Option<u16>, ConfigError> {
        let mut config = Self::load(path)?;
        let previous = config.signal_port();
        config.set_signal_port(port)?;
        config.save()?;
        info!(
            path = %config.path.display(),
            old_port = ?previous,
            new_port = port,
            "Updated Kraken signal port"
        );
        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
kraken:
  distribution: openshift
  kubeconfig_path: /tmp/kubeconfig
  exit_on_failure: false
  publish_kraken_status: true
  signal_state: RUN
  signal_address: 0.0.0.0
  port: 8081
  chaos_scenarios:
    - pod_disruption_scenarios:
        - scenarios/odf/osd.yaml
tunings:
  wait_duration: 60
  iterations: 1
"#;

    fn write_config(dir: &TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("config.yaml");
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_reads_signal_settings() {
        let dir = TempDir::new().unwrap();
        let config = KrknConfigFile::load(write_config(&dir, SAMPLE)).unwrap();
        assert_eq!(config.signal_port(), Some(8081));
        assert_eq!(config.signal_address(), Some("0.0.0.0"));
        assert_eq!(config.kubeconfig_path(), Some(PathBuf::from("/tmp/kubeconfig")));
    }

    #[test]
    fn test_missing_file() {
        let err = KrknConfigFile::load("/nonexistent/krkn/config.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_string_port_accepted() {
        let dir = TempDir::new().unwrap();
        let config =
            KrknConfigFile::load(write_config(&dir, "kraken:\n  port: \"9090\"\n")).unwrap();
        assert_eq!(config.signal_port(), Some(9090));
        assert_eq!(config.signal_address(), None);
        assert_eq!(config.kubeconfig_path(), None);
    }

    #[test]
    fn test_rewrite_port_preserves_other_keys() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, SAMPLE);

        let previous = KrknConfigFile::rewrite_signal_port(&path, 8099).unwrap();
        assert_eq!(previous, Some(8081));

        let reloaded = KrknConfigFile::load(&path).unwrap();
        assert_eq!(reloaded.signal_port(), Some(8099));
        assert_eq!(reloaded.signal_address(), Some("0.0.0.0"));

        let raw: Value = serde_yaml_ng::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["tunings"]["iterations"].as_u64(), Some(1));
        assert_eq!(raw["kraken"]["signal_state"].as_str(), Some("RUN"));
        assert!(!dir.path().join("config.yaml.krkn-tmp").exists());
    }

    #[test]
    fn test_set_port_creates_section() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "tunings:\n  iterations: 2\n");
        let mut config = KrknConfigFile::load(&path).unwrap();
        assert_eq!(config.signal_port(), None);
        config.set_signal_port(8100).unwrap();
        assert_eq!(config.signal_port(), Some(8100));
    }

    #[test]
    fn test_set_port_rejects_non_mapping_section() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "kraken: just-a-string\n");
        let mut config = KrknConfigFile::load(&path).unwrap();
        assert!(matches!(
            config.set_signal_port(8100),
            Err(ConfigError::InvalidKey { .. })
        ));
    }
}
