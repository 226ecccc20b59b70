//! Environment variables injected into the Kraken process.
//!
//! The supervisor inherits its own environment and layers the output of an
//! [`EnvironmentBuilder`] on top. Missing inputs are warnings only: Kraken is
//! allowed to fail on its own if a scenario really needs them.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use tracing::{debug, warn};

use crate::config::AuthConfig;

pub const KUBECONFIG_VAR: &str = "KUBECONFIG";
pub const IBMC_APIKEY_VAR: &str = "IBMC_APIKEY";
pub const IBMC_URL_VAR: &str = "IBMC_URL";
pub const DEFAULT_IBMCLOUD_REGION: &str = "us-south";

/// Platform the chaos run targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Platform {
    #[default]
    Generic,
    IbmCloud,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Generic => write!(f, "generic"),
            Self::IbmCloud => write!(f, "ibm_cloud"),
        }
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "generic" | "baremetal" | "vsphere" | "aws" | "azure" | "gcp" => {
                Ok(Self::Generic)
            }
            "ibm_cloud" | "ibmcloud" | "ibm-cloud" => Ok(Self::IbmCloud),
            other => Err(format!("unknown platform '{other}'")),
        }
    }
}

/// Produces the extra environment for one Kraken launch.
pub trait EnvironmentBuilder: fmt::Debug + Send + Sync {
    /// Variables to set on top of the inherited environment.
    fn build(&self, kubeconfig: Option<&Path>) -> Vec<(String, String)>;
}

/// Injects only `KUBECONFIG`.
#[derive(Debug, Clone, Default)]
pub struct KubeconfigEnvironment;

impl EnvironmentBuilder for KubeconfigEnvironment {
    fn build(&self, kubeconfig: Option<&Path>) -> Vec<(String, String)> {
        kubeconfig_vars(kubeconfig)
    }
}

fn kubeconfig_vars(kubeconfig: Option<&Path>) -> Vec<(String, String)> {
    match kubeconfig {
        Some(path) if path.exists() => {
            debug!(kubeconfig = %path.display(), "Injecting KUBECONFIG");
            vec![(KUBECONFIG_VAR.to_string(), path.display().to_string())]
        }
        Some(path) => {
            warn!(kubeconfig = %path.display(), "Kubeconfig path does not exist, not injecting");
            Vec::new()
        }
        None => {
            warn!("No kubeconfig_path in Kraken config, relying on inherited environment");
            Vec::new()
        }
    }
}

/// `KUBECONFIG` plus IBM Cloud API key and VPC endpoint.
#[derive(Debug, Clone, Default)]
pub struct IbmCloudEnvironment {
    auth: AuthConfig,
}

impl IbmCloudEnvironment {
    pub fn new(auth: AuthConfig) -> Self {
        Self { auth }
    }

    /// VPC endpoint for a region, e.g. `https://us-south.iaas.cloud.ibm.com/v1`.
    pub fn endpoint_for_region(region: &str) -> String {
        format!("https://{region}.iaas.cloud.ibm.com/v1")
    }
}

impl EnvironmentBuilder for IbmCloudEnvironment {
    fn build(&self, kubeconfig: Option<&Path>) -> Vec<(String, String)> {
        let mut vars = kubeconfig_vars(kubeconfig);

        let Some(ibm) = self.auth.ibmcloud.as_ref() else {
            warn!("IBM Cloud platform selected but auth config has no ibmcloud section");
            return vars;
        };

        match ibm.api_key.as_deref() {
            Some(key) if !key.is_empty() => {
                vars.push((IBMC_APIKEY_VAR.to_string(), key.to_string()));
            }
            _ => warn!("IBM Cloud API key missing from auth config"),
        }

        let endpoint = match ibm.api_endpoint.as_deref() {
            Some(endpoint) if !endpoint.is_empty() => endpoint.to_string(),
            _ => {
                let region = ibm.region.as_deref().unwrap_or(DEFAULT_IBMCLOUD_REGION);
                Self::endpoint_for_region(region)
            }
        };
        vars.push((IBMC_URL_VAR.to_string(), endpoint));
        vars
    }
}

/// Builder matching a platform.
pub fn builder_for_platform(
    platform: Platform,
    auth: Option<AuthConfig>,
) -> Box<dyn EnvironmentBuilder> {
    match platform {
        Platform::Generic => Box::new(KubeconfigEnvironment),
        Platform::IbmCloud => Box::new(IbmCloudEnvironment::new(auth.unwrap_or_default())),
    }
}
