//! Extraction of the `Chaos data:` telemetry block from Kraken output.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::ChaosError;

pub const TELEMETRY_KEY: &str = "telemetry";
pub const SCENARIOS_KEY: &str = "scenarios";

/// The JSON object following the last `marker` in `text`.
///
/// Scans from the first `{` after the marker, counting brace depth outside
/// string literals. Braces inside strings and escaped quotes do not count.
pub fn extract_last_json_block<'a>(text: &'a str, marker: &str) -> Result<&'a str, ChaosError> {
    let marker_at = text
        .rfind(marker)
        .ok_or_else(|| ChaosError::MalformedOutput(format!("no '{marker}' marker in output")))?;
    let after = &text[marker_at + marker.len()..];
    let open = after.find('{').ok_or_else(|| {
        ChaosError::MalformedOutput(format!("no JSON object after last '{marker}' marker"))
    })?;
    let body = &after[open..];
    let end = find_object_end(body).ok_or_else(|| {
        ChaosError::MalformedOutput(format!("unbalanced braces after last '{marker}' marker"))
    })?;
    Ok(&body[..end])
}

/// Byte length of the object starting at `s[0] == '{'`, if it closes.
fn find_object_end(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, b) in s.bytes().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        if in_string {
            match b {
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Normalized chaos run output: a `telemetry` object plus passthrough keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChaosResult {
    pub telemetry: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChaosResult {
    /// Normalize a decoded block.
    ///
    /// Without a `telemetry` key the whole object is taken as telemetry and its
    /// keys are also kept at the top level.
    pub fn from_value(value: Value) -> Result<Self, ChaosError> {
        let Value::Object(mut object) = value else {
            return Err(ChaosError::MalformedOutput(
                "chaos data is not a JSON object".to_string(),
            ));
        };
        let telemetry = match object.remove(TELEMETRY_KEY) {
            Some(telemetry) => telemetry,
            None => Value::Object(object.clone()),
        };
        Ok(Self {
            telemetry,
            extra: object,
        })
    }

    /// Parse the last `marker` block in `text`.
    pub fn from_output(text: &str, marker: &str) -> Result<Self, ChaosError> {
        let block = extract_last_json_block(text, marker)?;
        debug!(bytes = block.len(), "Extracted chaos data block");
        let value: Value = serde_json::from_str(block)?;
        Self::from_value(value)
    }

    /// Parse the last `marker` block in the log file at `path`.
    pub fn from_log_file(path: &Path, marker: &str) -> Result<Self, ChaosError> {
        let bytes = fs::read(path)?;
        Self::from_output(&String::from_utf8_lossy(&bytes), marker)
    }

    /// `telemetry.scenarios`, or an empty slice when absent.
    pub fn scenarios(&self) -> &[Value] {
        self.telemetry
            .get(SCENARIOS_KEY)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn to_value(&self) -> Value {
        let mut object = self.extra.clone();
        object.insert(TELEMETRY_KEY.to_string(), self.telemetry.clone());
        Value::Object(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markers::CHAOS_DATA_MARKER;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_braces_inside_strings() {
        let text = r#"INFO Chaos data: {"msg": "a } b { c", "n": 1} trailing"#;
        let block = extract_last_json_block(text, CHAOS_DATA_MARKER).unwrap();
        assert_eq!(block, r#"{"msg": "a } b { c", "n": 1}"#);
    }

    #[test]
    fn test_scenario_value_with_closing_brace() {
        let text = r#"INFO Chaos data: {"telemetry":{"scenarios":[{"a":"}"}]}} INFO done"#;
        let block = extract_last_json_block(text, CHAOS_DATA_MARKER).unwrap();
        assert_eq!(block, r#"{"telemetry":{"scenarios":[{"a":"}"}]}}"#);

        let result = ChaosResult::from_output(text, CHAOS_DATA_MARKER).unwrap();
        assert_eq!(result.scenarios(), &[json!({"a": "}"})]);
        let reserialized = serde_json::to_string(&result.to_value()).unwrap();
        let reparsed = ChaosResult::from_output(&format!("Chaos data: {reserialized}"), CHAOS_DATA_MARKER).unwrap();
        assert_eq!(reparsed.scenarios(), result.scenarios());
    }

    #[test]
    fn test_escaped_quotes_inside_strings() {
        let text = r#"Chaos data: {"msg": "say \"}\" now", "ok": true}"#;
        let block = extract_last_json_block(text, CHAOS_DATA_MARKER).unwrap();
        let value: Value = serde_json::from_str(block).unwrap();
        assert_eq!(value["msg"], "say \"}\" now");
    }

    #[test]
    fn test_last_marker_wins() {
        let text = "Chaos data: {\"run\": 1}\nmore logs\nChaos data: {\"run\": 2}\n";
        let result = ChaosResult::from_output(text, CHAOS_DATA_MARKER).unwrap();
        assert_eq!(result.telemetry, json!({"run": 2}));
    }

    #[test]
    fn test_multiline_block() {
        let text = "2024 INFO Chaos data:\n{\n  \"telemetry\": {\n    \"scenarios\": [{\"name\": \"pod\"}]\n  },\n  \"critical_alerts\": null\n}\nSuccessfully finished running Kraken\n";
        let result = ChaosResult::from_output(text, CHAOS_DATA_MARKER).unwrap();
        assert_eq!(result.scenarios().len(), 1);
        assert_eq!(result.extra.get("critical_alerts"), Some(&Value::Null));
    }

    #[test]
    fn test_malformed_inputs() {
        assert!(matches!(
            extract_last_json_block("no data here", CHAOS_DATA_MARKER),
            Err(ChaosError::MalformedOutput(_))
        ));
        assert!(matches!(
            extract_last_json_block("Chaos data: none", CHAOS_DATA_MARKER),
            Err(ChaosError::MalformedOutput(_))
        ));
        assert!(matches!(
            extract_last_json_block("Chaos data: {\"a\": {\"b\": 1}", CHAOS_DATA_MARKER),
            Err(ChaosError::MalformedOutput(_))
        ));
        assert!(matches!(
            ChaosResult::from_output("Chaos data: {not json}", CHAOS_DATA_MARKER),
            Err(ChaosError::Json(_))
        ));
    }

    #[test]
    fn test_normalization_with_telemetry_key() {
        let result = ChaosResult::from_value(json!({
            "telemetry": {"scenarios": [{"name": "a"}, {"name": "b"}]},
            "cluster_version": "4.15"
        }))
        .unwrap();
        assert_eq!(result.scenarios().len(), 2);
        assert_eq!(result.extra.get("cluster_version"), Some(&json!("4.15")));
        assert!(!result.extra.contains_key("telemetry"));
    }

    #[test]
    fn test_normalization_without_telemetry_key() {
        let result = ChaosResult::from_value(json!({"scenarios": [], "run_uuid": "x"})).unwrap();
        assert_eq!(result.telemetry, json!({"scenarios": [], "run_uuid": "x"}));
        assert_eq!(result.extra.get("run_uuid"), Some(&json!("x")));
        assert!(result.scenarios().is_empty());
    }

    #[test]
    fn test_non_object_rejected() {
        assert!(matches!(
            ChaosResult::from_value(json!([1, 2])),
            Err(ChaosError::MalformedOutput(_))
        ));
    }

    #[test]
    fn test_serialized_shape() {
        let result = ChaosResult::from_value(json!({"telemetry": {"x": 1}, "y": 2})).unwrap();
        assert_eq!(serde_json::to_value(&result).unwrap(), json!({"telemetry": {"x": 1}, "y": 2}));
        assert_eq!(result.to_value(), json!({"telemetry": {"x": 1}, "y": 2}));
    }

    fn json_leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            ".*".prop_map(Value::String),
        ]
    }

    fn json_object() -> impl Strategy<Value = Value> {
        json_leaf()
            .prop_recursive(3, 24, 4, |inner| {
                prop_oneof![
                    prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                    prop::collection::btree_map("[a-z{}\"]{0,6}", inner, 0..4)
                        .prop_map(|m| Value::Object(m.into_iter().collect())),
                ]
            })
            .prop_map(|v| json!({"telemetry": v}))
    }

    proptest! {
        #[test]
        fn prop_extracts_any_embedded_object(value in json_object(), noise in "[^C]{0,40}") {
            let encoded = serde_json::to_string(&value).unwrap();
            let text = format!("{noise}\nChaos data: {encoded}\n{noise}");
            let block = extract_last_json_block(&text, CHAOS_DATA_MARKER).unwrap();
            let decoded: Value = serde_json::from_str(block).unwrap();
            prop_assert_eq!(decoded, value);
        }

        #[test]
        fn prop_normalized_always_has_telemetry_key(value in json_object()) {
            let result = ChaosResult::from_value(value).unwrap();
            prop_assert!(result.to_value().get(TELEMETRY_KEY).is_some());
            prop_assert!(!result.extra.contains_key(TELEMETRY_KEY));
        }
    }
}
