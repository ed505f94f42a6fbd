//! Structured Response Validator
//!
//! Turns raw model output into a schema-valid [`StructuredResult`] in three
//! tiers: direct JSON decode, deterministic key/value extraction, and a
//! sentinel fallback. `validate` never fails.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AgentError, Result};
use crate::structured::{Classification, OutputSchema, ResolvedLocation, StructuredResult};

/// Confidence assigned when the model states none
const DEFAULT_CONFIDENCE: f64 = 0.5;

/// Confidence of values recovered by extraction
const EXTRACTED_CONFIDENCE: f64 = 0.5;

const SUMMARY_PATTERN: &str = r#"(?im)"?summary"?\s*[:=]\s*(?:"((?:[^"\\]|\\.)*)"|([^\n"{}]+))"#;

const CLASSIFICATION_PATTERN: &str = r#"(?i)"?classification"?\s*[:=]\s*"?([a-z_]+)"#;

const LOCATION_PATTERN: &str = concat!(
    r#"(?i)(?:"?name"?\s*[:=]\s*"([^"]+)"\s*,\s*)?"#,
    r#""?lat(?:itude)?"?\s*[:=]\s*(-?\d+(?:\.\d+)?)\s*,?\s*"#,
    r#""?(?:lon|lng|longitude)"?\s*[:=]\s*(-?\d+(?:\.\d+)?)"#,
);

/// Which tier produced the result
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationTier {
    Primary,
    Extracted,
    Fallback,
}

/// Validator output
#[derive(Clone, Debug, PartialEq)]
pub struct Validated {
    pub result: StructuredResult,
    pub tier: ValidationTier,
}

/// Three-tier structured output validator
#[derive(Clone, Debug)]
pub struct StructuredResponseValidator {
    summary: Regex,
    classification: Regex,
    location: Regex,
}

impl StructuredResponseValidator {
    pub fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| AgentError::Config(format!("invalid extraction pattern: {}", e)))
        };
        Ok(Self {
            summary: compile(SUMMARY_PATTERN)?,
            classification: compile(CLASSIFICATION_PATTERN)?,
            location: compile(LOCATION_PATTERN)?,
        })
    }

    /// Validate raw model text against `schema`
    pub fn validate(&self, raw: &str, schema: &OutputSchema) -> Validated {
        let primary_err = match self.primary(raw, schema) {
            Ok(result) => {
                return Validated {
                    result,
                    tier: ValidationTier::Primary,
                };
            }
            Err(e) => e,
        };
        tracing::debug!(error = %primary_err, "Primary structured parse failed");

        match self.extract(raw) {
            Ok(mut result) => {
                result.warnings.insert(
                    0,
                    format!("structured output recovered by extraction ({})", primary_err),
                );
                Validated {
                    result,
                    tier: ValidationTier::Extracted,
                }
            }
            Err(extract_err) => {
                tracing::info!(error = %extract_err, "Structured output fell back to sentinel");
                Validated {
                    result: StructuredResult::fallback(format!(
                        "structured output unavailable ({}); returning sentinel values",
                        primary_err
                    )),
                    tier: ValidationTier::Fallback,
                }
            }
        }
    }

    /// Validate an already-decoded JSON value (native structured output)
    pub fn validate_value(&self, value: &Value, raw: &str, schema: &OutputSchema) -> Validated {
        match check_and_decode(value, schema) {
            Ok(result) => Validated {
                result,
                tier: ValidationTier::Primary,
            },
            Err(_) => self.validate(raw, schema),
        }
    }

    fn primary(&self, raw: &str, schema: &OutputSchema) -> Result<StructuredResult> {
        let candidate = json_candidate(raw)
            .ok_or_else(|| AgentError::ValidationExhausted("no JSON object in output".into()))?;
        let value: Value = serde_json::from_str(candidate)
            .map_err(|e| AgentError::ValidationExhausted(format!("invalid JSON: {}", e)))?;
        check_and_decode(&value, schema)
    }

    fn extract(&self, raw: &str) -> Result<StructuredResult> {
        let summary = self
            .summary
            .captures(raw)
            .and_then(|c| c.get(1).or_else(|| c.get(2)))
            .map(|m| m.as_str().replace("\\\"", "\"").trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AgentError::ValidationExhausted("no summary field found".into()))?;

        let classification = self
            .classification
            .captures(raw)
            .and_then(|c| c.get(1))
            .map_or(Classification::Unknown, |m| Classification::parse(m.as_str()));

        let mut warnings = Vec::new();
        let mut locations = Vec::new();
        for caps in self.location.captures_iter(raw) {
            let name = caps.get(1).map_or("unnamed", |m| m.as_str()).to_string();
            let (Some(lat), Some(lon)) = (
                caps.get(2).and_then(|m| m.as_str().parse::<f64>().ok()),
                caps.get(3).and_then(|m| m.as_str().parse::<f64>().ok()),
            ) else {
                continue;
            };
            let location = ResolvedLocation {
                name,
                latitude: lat,
                longitude: lon,
                confidence: EXTRACTED_CONFIDENCE,
            };
            if location.has_valid_coordinates() {
                locations.push(location);
            } else {
                warnings.push(format!("dropped location '{}' with invalid coordinates", location.name));
            }
        }

        Ok(StructuredResult {
            summary,
            locations,
            classification,
            confidence: EXTRACTED_CONFIDENCE,
            warnings,
            tool_outputs: Vec::new(),
        })
    }
}

/// Strip code fences and slice from the first `{` to the last `}`
fn json_candidate(raw: &str) -> Option<&str> {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```") {
        let rest = rest.trim_start_matches(|c: char| c.is_ascii_alphabetic());
        text = rest.strip_suffix("```").unwrap_or(rest).trim();
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn check_and_decode(value: &Value, schema: &OutputSchema) -> Result<StructuredResult> {
    let object = value
        .as_object()
        .ok_or_else(|| AgentError::ValidationExhausted("output is not a JSON object".into()))?;

    let missing: Vec<&str> = schema
        .required_fields()
        .into_iter()
        .filter(|f| !object.contains_key(*f))
        .collect();
    if !missing.is_empty() {
        return Err(AgentError::ValidationExhausted(format!(
            "missing required fields: {}",
            missing.join(", ")
        )));
    }

    let summary = object
        .get("summary")
        .and_then(Value::as_str)
        .ok_or_else(|| AgentError::ValidationExhausted("summary is not a string".into()))?
        .to_string();

    let classification = match object.get("classification") {
        Some(Value::String(s)) => Classification::parse(s),
        Some(Value::Null) | None => Classification::Unknown,
        Some(_) => {
            return Err(AgentError::ValidationExhausted("classification is not a string".into()));
        }
    };

    let mut warnings: Vec<String> = object
        .get("warnings")
        .and_then(Value::as_array)
        .map(|w| w.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default();

    let raw_locations = match object.get("locations") {
        Some(Value::Array(items)) => items.as_slice(),
        Some(Value::Null) | None => &[],
        Some(_) => {
            return Err(AgentError::ValidationExhausted("locations is not an array".into()));
        }
    };

    let mut locations = Vec::with_capacity(raw_locations.len());
    for item in raw_locations {
        match serde_json::from_value::<ResolvedLocation>(item.clone()) {
            Ok(mut location) if location.has_valid_coordinates() => {
                location.confidence = clamp_confidence(location.confidence);
                locations.push(location);
            }
            Ok(location) => {
                warnings.push(format!("dropped location '{}' with invalid coordinates", location.name));
            }
            Err(e) => warnings.push(format!("dropped malformed location: {}", e)),
        }
    }

    let confidence = object
        .get("confidence")
        .and_then(Value::as_f64)
        .map_or(DEFAULT_CONFIDENCE, clamp_confidence);

    Ok(StructuredResult {
        summary,
        locations,
        classification,
        confidence,
        warnings,
        tool_outputs: Vec::new(),
    })
}

fn clamp_confidence(value: f64) -> f64 {
    if value.is_finite() { value.clamp(0.0, 1.0) } else { 0.0 }
}
