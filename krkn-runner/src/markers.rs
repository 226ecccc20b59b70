//! Phrases Kraken writes that the supervisor keys off.

/// Printed by Kraken as its very last log line on a clean run.
pub const PRIMARY_SUCCESS_PHRASE: &str = "Successfully finished running Kraken";

/// Weaker completion hints, consulted only when the primary phrase is absent.
pub const SECONDARY_SUCCESS_PHRASES: &[&str] = &[
    "Finished running Kraken",
    "Kraken run completed",
    "All chaos scenarios completed",
];

/// Matched case-insensitively, only after no success phrase was found.
pub const FAILURE_INDICATORS: &[&str] = &[
    "FAILED",
    "ERROR",
    "CRITICAL",
    "Exception",
    "Traceback",
    "Failed to",
];

/// Prefix of the telemetry block Kraken prints at the end of a run.
pub const CHAOS_DATA_MARKER: &str = "Chaos data:";

/// Which completion phrase matched a line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionSignal {
    Primary,
    Secondary(String),
}

/// Configurable phrase sets shared by the monitor, detector and extractor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionMarkers {
    pub primary: String,
    pub secondary: Vec<String>,
    pub failure_indicators: Vec<String>,
    pub chaos_data: String,
}

impl Default for CompletionMarkers {
    fn default() -> Self {
        Self {
            primary: PRIMARY_SUCCESS_PHRASE.to_string(),
            secondary: SECONDARY_SUCCESS_PHRASES.iter().map(|s| s.to_string()).collect(),
            failure_indicators: FAILURE_INDICATORS.iter().map(|s| s.to_string()).collect(),
            chaos_data: CHAOS_DATA_MARKER.to_string(),
        }
    }
}

impl CompletionMarkers {
    /// Primary first; secondary phrases only if the primary is absent.
    pub fn scan(&self, text: &str) -> Option<CompletionSignal> {
        if text.contains(&self.primary) {
            return Some(CompletionSignal::Primary);
        }
        self.secondary
            .iter()
            .find(|phrase| text.contains(phrase.as_str()))
            .map(|phrase| CompletionSignal::Secondary(phrase.clone()))
    }

    /// Failure indicators present in `text`, compared case-insensitively.
    pub fn failure_matches(&self, text: &str) -> Vec<String> {
        let lower = text.to_lowercase();
        self.failure_indicators
            .iter()
            .filter(|indicator| lower.contains(&indicator.to_lowercase()))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_takes_precedence() {
        let markers = CompletionMarkers::default();
        let line = "2024-05-01 INFO Successfully finished running Kraken. Finished running Kraken";
        assert_eq!(markers.scan(line), Some(CompletionSignal::Primary));
    }

    #[test]
    fn test_secondary_match() {
        let markers = CompletionMarkers::default();
        assert_eq!(
            markers.scan("INFO All chaos scenarios completed"),
            Some(CompletionSignal::Secondary("All chaos scenarios completed".to_string()))
        );
        assert_eq!(markers.scan("INFO Injecting pod failure"), None);
    }

    #[test]
    fn test_failure_matches_case_insensitive() {
        let markers = CompletionMarkers::default();
        let found = markers.failure_matches("scenario failed to recover\nerror: timeout");
        assert!(found.contains(&"FAILED".to_string()));
        assert!(found.contains(&"ERROR".to_string()));
        assert!(found.contains(&"Failed to".to_string()));
        assert!(!found.contains(&"Traceback".to_string()));
    }
}
