//! Structured Output
//!
//! Schema-typed answer shape returned alongside the free-text response.

use serde::{Deserialize, Serialize};
use serde_json::json;

/// Top-level keys every structured answer must carry
pub const REQUIRED_FIELDS: [&str; 3] = ["summary", "locations", "classification"];

/// Sentinel summary used when nothing could be recovered
pub const UNKNOWN_SUMMARY: &str = "unknown";

/// What the query was about
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Weather,
    Agriculture,
    Mixed,
    General,
    #[default]
    #[serde(other)]
    Unknown,
}

impl Classification {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "weather" => Self::Weather,
            "agriculture" | "agricultural" | "farming" => Self::Agriculture,
            "mixed" => Self::Mixed,
            "general" => Self::General,
            _ => Self::Unknown,
        }
    }
}

/// A place the answer refers to
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResolvedLocation {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub confidence: f64,
}

impl ResolvedLocation {
    pub fn has_valid_coordinates(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// Reference to a tool output that fed the answer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutputRef {
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    pub ok: bool,
}

/// Schema-valid structured answer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StructuredResult {
    pub summary: String,
    pub locations: Vec<ResolvedLocation>,
    pub classification: Classification,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub tool_outputs: Vec<ToolOutputRef>,
}

impl StructuredResult {
    /// Sentinel result: every required field present, zero confidence
    pub fn fallback(warning: impl Into<String>) -> Self {
        Self {
            summary: UNKNOWN_SUMMARY.into(),
            locations: Vec::new(),
            classification: Classification::Unknown,
            confidence: 0.0,
            warnings: vec![warning.into()],
            tool_outputs: Vec::new(),
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.summary == UNKNOWN_SUMMARY && self.classification == Classification::Unknown
    }
}

/// Declared output schema handed to the model backend
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutputSchema {
    pub name: String,
    pub json_schema: serde_json::Value,
}

impl Default for OutputSchema {
    fn default() -> Self {
        Self::structured_result()
    }
}

impl OutputSchema {
    /// JSON Schema for [`StructuredResult`]
    pub fn structured_result() -> Self {
        Self {
            name: "structured_result".into(),
            json_schema: json!({
                "type": "object",
                "required": REQUIRED_FIELDS,
                "properties": {
                    "summary": {"type": "string"},
                    "locations": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "required": ["name", "latitude", "longitude"],
                            "properties": {
                                "name": {"type": "string"},
                                "latitude": {"type": "number"},
                                "longitude": {"type": "number"},
                                "confidence": {"type": "number"}
                            }
                        }
                    },
                    "classification": {
                        "type": "string",
                        "enum": ["weather", "agriculture", "mixed", "general", "unknown"]
                    },
                    "confidence": {"type": "number"},
                    "warnings": {"type": "array", "items": {"type": "string"}}
                }
            }),
        }
    }

    pub fn required_fields(&self) -> Vec<&str> {
        self.json_schema
            .get("required")
            .and_then(|r| r.as_array())
            .map(|r| r.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default()
    }

    /// Prompt text for backends without native schema-constrained output
    pub fn instructions(&self) -> String {
        format!(
            "Respond with a single JSON object matching this schema and nothing else:\n{}",
            self.json_schema
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_has_required_fields() {
        let fallback = StructuredResult::fallback("model output was not JSON");
        let value = serde_json::to_value(&fallback).unwrap();
        for field in REQUIRED_FIELDS {
            assert!(value.get(field).is_some(), "missing {field}");
        }
        assert_eq!(value["classification"], "unknown");
        assert!(fallback.is_fallback());
    }

    #[test]
    fn test_unknown_classification_values() {
        let c: Classification = serde_json::from_value(json!("volcanology")).unwrap();
        assert_eq!(c, Classification::Unknown);
        assert_eq!(Classification::parse(" Agriculture "), Classification::Agriculture);
    }

    #[test]
    fn test_coordinate_bounds() {
        let ok = ResolvedLocation { name: "Quito".into(), latitude: -0.18, longitude: -78.47, confidence: 1.0 };
        let bad = ResolvedLocation { latitude: 120.0, ..ok.clone() };
        assert!(ok.has_valid_coordinates());
        assert!(!bad.has_valid_coordinates());
    }

    #[test]
    fn test_schema_required_list() {
        assert_eq!(OutputSchema::default().required_fields(), REQUIRED_FIELDS.to_vec());
    }
}
