//! `KRKN_*` environment variable parsing.
//!
//! Values fall back to their defaults on parse failure and the failure is
//! recorded, so every misconfigured variable can be reported in one go.

use std::env;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during environment variable parsing.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Invalid value for a variable.
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    /// Path does not exist.
    #[error("Path not found for {var}: {path}")]
    PathNotFound { var: String, path: PathBuf },

    /// Value out of valid range.
    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },

    /// Invalid log level.
    #[error("Invalid log level for {var}: {value}")]
    InvalidLogLevel { var: String, value: String },
}

/// Type-safe environment variable parser.
pub struct EnvParser {
    prefix: &'static str,
    errors: Vec<EnvError>,
}

impl EnvParser {
    /// Create a new parser with the KRKN_ prefix.
    pub fn new() -> Self {
        Self {
            prefix: "KRKN_",
            errors: Vec::new(),
        }
    }

    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Get a string value with default.
    pub fn get_string(&mut self, name: &str, default: &str) -> String {
        env::var(self.var_name(name)).unwrap_or_else(|_| default.to_string())
    }

    /// Get an optional string (None if not set or empty).
    pub fn get_optional_string(&mut self, name: &str) -> Option<String> {
        match env::var(self.var_name(name)) {
            Ok(value) if value.is_empty() => None,
            Ok(value) => Some(value),
            Err(_) => None,
        }
    }

    /// Get a boolean value with default.
    ///
    /// Accepts: 1, true, yes, on (for true)
    ///          0, false, no, off, "" (for false)
    pub fn get_bool(&mut self, name: &str, default: bool) -> bool {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => match value.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" | "" => false,
                _ => {
                    self.errors.push(EnvError::InvalidValue {
                        var: var_name,
                        expected: "boolean (true/false/1/0/yes/no)".to_string(),
                        value,
                    });
                    default
                }
            },
            Err(_) => default,
        }
    }

    /// Get a u32 value with default and range validation.
    pub fn get_u32_range(&mut self, name: &str, default: u32, min: u32, max: u32) -> u32 {
        let value = self.get_u64_range(name, default as u64, min as u64, max as u64);
        u32::try_from(value).unwrap_or(default)
    }

    /// Get a u64 value with default and range validation.
    pub fn get_u64_range(&mut self, name: &str, default: u64, min: u64, max: u64) -> u64 {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => match value.trim().parse::<u64>() {
                Ok(n) if n >= min && n <= max => n,
                Ok(n) => {
                    self.errors.push(EnvError::OutOfRange {
                        var: var_name,
                        value: n.to_string(),
                        min: min.to_string(),
                        max: max.to_string(),
                    });
                    default
                }
                Err(_) => {
                    self.errors.push(EnvError::InvalidValue {
                        var: var_name,
                        expected: "unsigned 64-bit integer".to_string(),
                        value,
                    });
                    default
                }
            },
            Err(_) => default,
        }
    }

    /// Get a comma-separated list of exit codes.
    ///
    /// An empty value yields an empty list; any unparsable entry records an
    /// error and the whole default is used.
    pub fn get_i32_list(&mut self, name: &str, default: &[i32]) -> Vec<i32> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => {
                let parsed: Result<Vec<i32>, _> = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::parse::<i32>)
                    .collect();
                match parsed {
                    Ok(codes) => codes,
                    Err(_) => {
                        self.errors.push(EnvError::InvalidValue {
                            var: var_name,
                            expected: "comma-separated integers".to_string(),
                            value,
                        });
                        default.to_vec()
                    }
                }
            }
            Err(_) => default.to_vec(),
        }
    }

    /// Get a path value with ~ expansion.
    ///
    /// If `must_exist` is true, records an error if the path doesn't exist.
    pub fn get_path(&mut self, name: &str, default: &str, must_exist: bool) -> PathBuf {
        let var_name = self.var_name(name);
        let raw = env::var(&var_name).unwrap_or_else(|_| default.to_string());
        let expanded = PathBuf::from(shellexpand::tilde(&raw).into_owned());

        if must_exist && !expanded.exists() {
            self.errors.push(EnvError::PathNotFound {
                var: var_name,
                path: expanded.clone(),
            });
        }
        expanded
    }

    /// Get an optional path with ~ expansion (None if unset or empty).
    pub fn get_optional_path(&mut self, name: &str) -> Option<PathBuf> {
        self.get_optional_string(name)
            .map(|raw| PathBuf::from(shellexpand::tilde(&raw).into_owned()))
    }

    /// Get a log level value with validation.
    pub fn get_log_level(&mut self, name: &str, default: &str) -> String {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => {
                let lower = value.to_lowercase();
                match lower.as_str() {
                    "trace" | "debug" | "info" | "warn" | "error" | "off" => lower,
                    _ => {
                        self.errors.push(EnvError::InvalidLogLevel {
                            var: var_name,
                            value,
                        });
                        default.to_string()
                    }
                }
            }
            Err(_) => default.to_string(),
        }
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::config::env_test_lock;
    use std::env;

    fn cleanup_env(vars: &[&str]) {
        for var in vars {
            // SAFETY: Tests are serialized via env_test_lock
            unsafe { env::remove_var(var) };
        }
    }

    fn set_env(key: &str, value: &str) {
        // SAFETY: Tests are serialized via env_test_lock
        unsafe { env::set_var(key, value) };
    }

    #[test]
    fn test_get_bool_values() {
        let _guard = env_test_lock();
        let vars = ["KRKN_TEST_BOOL"];
        cleanup_env(&vars);

        for val in &["1", "true", "yes", "on", "TRUE"] {
            set_env("KRKN_TEST_BOOL", val);
            let mut parser = EnvParser::new();
            assert!(parser.get_bool("TEST_BOOL", false), "Expected true for '{}'", val);
            assert!(!parser.has_errors());
        }
        for val in &["0", "false", "no", "off", ""] {
            set_env("KRKN_TEST_BOOL", val);
            let mut parser = EnvParser::new();
            assert!(!parser.get_bool("TEST_BOOL", true), "Expected false for '{}'", val);
        }

        set_env("KRKN_TEST_BOOL", "maybe");
        let mut parser = EnvParser::new();
        assert!(parser.get_bool("TEST_BOOL", true));
        assert!(parser.has_errors());

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_u64_range() {
        let _guard = env_test_lock();
        let vars = ["KRKN_TEST_U64"];
        cleanup_env(&vars);

        set_env("KRKN_TEST_U64", "50");
        let mut parser = EnvParser::new();
        assert_eq!(parser.get_u64_range("TEST_U64", 10, 0, 100), 50);
        assert!(!parser.has_errors());

        set_env("KRKN_TEST_U64", "200");
        let mut parser = EnvParser::new();
        assert_eq!(parser.get_u64_range("TEST_U64", 10, 0, 100), 10);
        assert!(matches!(parser.errors()[0], EnvError::OutOfRange { .. }));

        set_env("KRKN_TEST_U64", "lots");
        let mut parser = EnvParser::new();
        assert_eq!(parser.get_u64_range("TEST_U64", 10, 0, 100), 10);
        assert!(matches!(parser.errors()[0], EnvError::InvalidValue { .. }));

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_i32_list() {
        let _guard = env_test_lock();
        let vars = ["KRKN_TEST_CODES"];
        cleanup_env(&vars);

        let mut parser = EnvParser::new();
        assert_eq!(parser.get_i32_list("TEST_CODES", &[2]), vec![2]);

        set_env("KRKN_TEST_CODES", "2, 3,4");
        assert_eq!(parser.get_i32_list("TEST_CODES", &[2]), vec![2, 3, 4]);

        set_env("KRKN_TEST_CODES", "");
        assert!(parser.get_i32_list("TEST_CODES", &[2]).is_empty());

        set_env("KRKN_TEST_CODES", "2,x");
        assert_eq!(parser.get_i32_list("TEST_CODES", &[2]), vec![2]);
        assert!(parser.has_errors());

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_log_level() {
        let _guard = env_test_lock();
        let vars = ["KRKN_TEST_LEVEL"];
        cleanup_env(&vars);

        set_env("KRKN_TEST_LEVEL", "DEBUG");
        let mut parser = EnvParser::new();
        assert_eq!(parser.get_log_level("TEST_LEVEL", "info"), "debug");

        set_env("KRKN_TEST_LEVEL", "chatty");
        assert_eq!(parser.get_log_level("TEST_LEVEL", "info"), "info");
        assert!(parser.has_errors());

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_path_records_missing() {
        let _guard = env_test_lock();
        let vars = ["KRKN_TEST_PATH"];
        cleanup_env(&vars);

        set_env("KRKN_TEST_PATH", "/definitely/not/here/krkn");
        let mut parser = EnvParser::new();
        let path = parser.get_path("TEST_PATH", "/tmp", true);
        assert_eq!(path, PathBuf::from("/definitely/not/here/krkn"));
        assert!(matches!(parser.errors()[0], EnvError::PathNotFound { .. }));

        let mut parser = EnvParser::new();
        assert!(parser.get_optional_path("TEST_MISSING_PATH").is_none());

        cleanup_env(&vars);
    }
}
