//! Process-wide cloud credentials used to build the Kraken environment.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Credentials file contents. Unknown providers are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub ibmcloud: Option<IbmCloudAuth>,
}

/// IBM Cloud API credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IbmCloudAuth {
    #[serde(default)]
    pub api_key: Option<String>,
    /// Explicit VPC API endpoint; derived from `region` when absent.
    #[serde(default)]
    pub api_endpoint: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
}

impl AuthConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml_ng::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_ibmcloud_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.yaml");
        fs::write(
            &path,
            "ibmcloud:\n  api_key: abc123\n  region: eu-de\nother:\n  token: x\n",
        )
        .unwrap();

        let auth = AuthConfig::load(&path).unwrap();
        let ibm = auth.ibmcloud.unwrap();
        assert_eq!(ibm.api_key.as_deref(), Some("abc123"));
        assert_eq!(ibm.region.as_deref(), Some("eu-de"));
        assert_eq!(ibm.api_endpoint, None);
    }

    #[test]
    fn test_empty_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.yaml");
        fs::write(&path, "").unwrap();
        assert_eq!(AuthConfig::load(&path).unwrap(), AuthConfig::default());
    }
}
