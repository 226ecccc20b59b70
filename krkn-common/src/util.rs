//! Shared utilities.

const SENSITIVE_KEY_FRAGMENTS: &[&str] = &[
    "APIKEY",
    "API_KEY",
    "TOKEN",
    "SECRET",
    "PASSWORD",
    "PRIVATE_KEY",
    "ACCESS_KEY",
];

fn is_sensitive_key(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    SENSITIVE_KEY_FRAGMENTS
        .iter()
        .any(|fragment| upper.contains(fragment))
}

/// Render injected environment variables for logging with secret values masked.
///
/// Output looks like `KUBECONFIG=/path IBMC_APIKEY=***`.
pub fn mask_sensitive_env(vars: &[(String, String)]) -> String {
    vars.iter()
        .map(|(key, value)| {
            if is_sensitive_key(key) {
                format!("{key}=***")
            } else {
                format!("{key}={value}")
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
