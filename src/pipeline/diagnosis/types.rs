use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::DiagnosisError;
use crate::pipeline_config::Sampling;

// ──────────────────────────────────────────────
// Closed enumerations (lenient on input)
// ──────────────────────────────────────────────

/// Defines a closed tag set that still accepts out-of-set model output.
///
/// Known tags are matched case-insensitively; anything else lands in
/// `Unrecognized` verbatim so downstream consumers can judge it themselves.
macro_rules! lenient_tag {
    (
        $(#[$meta:meta])*
        $name:ident, default = $default:ident {
            $($(#[$vmeta:meta])* $variant:ident => $tag:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(from = "String", into = "String")]
        pub enum $name {
            $($(#[$vmeta])* $variant,)+
            /// Value outside the closed set, kept verbatim.
            Unrecognized(String),
        }

        impl $name {
            pub fn as_str(&self) -> &str {
                match self {
                    $(Self::$variant => $tag,)+
                    Self::Unrecognized(raw) => raw,
                }
            }

            pub fn is_recognized(&self) -> bool {
                !matches!(self, Self::Unrecognized(_))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::$default
            }
        }

        impl From<String> for $name {
            fn from(raw: String) -> Self {
                match raw.trim().to_ascii_lowercase().as_str() {
                    $($tag => Self::$variant,)+
                    _ => Self::Unrecognized(raw),
                }
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.as_str().to_string()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.pad(self.as_str())
            }
        }
    };
}

lenient_tag! {
    /// How the image agrees with the written description.
    ImageTextCorrelation, default = NoImage {
        Consistent => "consistent",
        Contradictory => "contradictory",
        Poor => "poor",
        NoImage => "no_image",
    }
}

lenient_tag! {
    /// Quality of the visual evidence seen by the diagnoser.
    EvidenceQuality, default = NoEvidence {
        Excellent => "excellent",
        Good => "good",
        Poor => "poor",
        NoEvidence => "none",
    }
}

lenient_tag! {
    /// Validator's view of the evidence behind the diagnosis.
    EvidenceAssessment, default = Weak {
        Strong => "strong",
        Moderate => "moderate",
        Weak => "weak",
    }
}

lenient_tag! {
    /// Validator's closing verdict.
    FinalRecommendation, default = RequestExpert {
        SupportPrimary => "support_primary",
        PreferAlternative => "prefer_alternative",
        InsufficientData => "insufficient_data",
        RequestExpert => "request_expert",
    }
}

impl FinalRecommendation {
    /// Anything other than plain agreement with the primary finding.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::PreferAlternative | Self::InsufficientData | Self::RequestExpert
        )
    }
}

// ──────────────────────────────────────────────
// Structured stage payloads
// ──────────────────────────────────────────────

/// Lowest confidence on the 1–10 scale.
pub const MIN_CONFIDENCE: i32 = 1;
/// Largest penalty the validator can apply.
pub const MAX_CONFIDENCE_PENALTY: i32 = -3;

/// Diagnoser's independent warning flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFlags {
    #[serde(default, deserialize_with = "lenient::boolean")]
    pub equally_likely: bool,
    #[serde(default, deserialize_with = "lenient::boolean")]
    pub contradictory_symptoms: bool,
    #[serde(default, deserialize_with = "lenient::boolean")]
    pub insufficient_evidence: bool,
}

/// Stage-1 structured output.
///
/// Field names are the external document keys; renderers and saved files key off them.
/// Every field tolerates missing or oddly-typed values: the extractor only promises a
/// syntactically valid object, not a domain-valid one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisRecord {
    #[serde(default, deserialize_with = "lenient::text")]
    pub primary_diagnosis: String,
    #[serde(default = "min_confidence", deserialize_with = "lenient::confidence")]
    pub primary_confidence: i32,
    #[serde(default, deserialize_with = "lenient::text")]
    pub alternative_diagnosis: String,
    #[serde(default = "min_confidence", deserialize_with = "lenient::confidence")]
    pub alternative_confidence: i32,
    #[serde(default, deserialize_with = "lenient::tag")]
    pub image_text_correlation: ImageTextCorrelation,
    #[serde(default, deserialize_with = "lenient::text")]
    pub key_symptoms_observed: String,
    #[serde(default, deserialize_with = "lenient::tag")]
    pub visual_evidence_quality: EvidenceQuality,
    #[serde(default, deserialize_with = "lenient::object")]
    pub error_flags: ErrorFlags,
    #[serde(default, deserialize_with = "lenient::text")]
    pub diagnostic_reasoning: String,
    /// Keys the model added beyond the schema.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Stage-2 structured output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRecord {
    #[serde(default, deserialize_with = "lenient::boolean")]
    pub primary_diagnosis_valid: bool,
    #[serde(default = "max_penalty", deserialize_with = "lenient::adjustment")]
    pub primary_confidence_adjustment: i32,
    #[serde(default, deserialize_with = "lenient::boolean")]
    pub alternative_diagnosis_preferred: bool,
    #[serde(default, deserialize_with = "lenient::text")]
    pub critical_concerns: String,
    #[serde(default, deserialize_with = "lenient::tag")]
    pub evidence_quality_assessment: EvidenceAssessment,
    #[serde(default, deserialize_with = "lenient::text")]
    pub overlooked_factors: String,
    #[serde(default, deserialize_with = "lenient::text")]
    pub bias_detection: String,
    #[serde(default, deserialize_with = "lenient::text")]
    pub additional_diagnostics_needed: String,
    #[serde(default, deserialize_with = "lenient::tag")]
    pub final_recommendation: FinalRecommendation,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn min_confidence() -> i32 {
    MIN_CONFIDENCE
}

fn max_penalty() -> i32 {
    MAX_CONFIDENCE_PENALTY
}

/// Confidence after applying the validator's adjustment, clamped to 1–10.
pub fn adjusted_confidence(diagnosis: &DiagnosisRecord, validation: &ValidationRecord) -> i32 {
    diagnosis
        .primary_confidence
        .saturating_add(validation.primary_confidence_adjustment)
        .clamp(1, 10)
}

// ──────────────────────────────────────────────
// Stage results
// ──────────────────────────────────────────────

/// The three pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Diagnoser,
    Validator,
    Advisor,
}

impl StageKind {
    pub const ALL: [StageKind; 3] = [Self::Diagnoser, Self::Validator, Self::Advisor];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Diagnoser => "diagnoser",
            Self::Validator => "validator",
            Self::Advisor => "advisor",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Outcome of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageStatus {
    #[serde(rename = "success")]
    Success,
    /// Model answered but nothing parseable was found; fallback record substituted.
    #[serde(rename = "json_error_recovered")]
    Recovered,
    /// Model call failed; fallback record synthesized locally (validator only).
    #[serde(rename = "error_recovered")]
    ErrorRecovered,
    /// Model call failed and nothing was substituted.
    #[serde(rename = "error")]
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Recovered => "json_error_recovered",
            Self::ErrorRecovered => "error_recovered",
            Self::Failed => "error",
        }
    }

    /// The stage produced a payload the next stage can consume.
    pub fn is_usable(&self) -> bool {
        match self {
            Self::Success | Self::Recovered | Self::ErrorRecovered => true,
            Self::Failed => false,
        }
    }

    pub fn is_recovered(&self) -> bool {
        match self {
            Self::Recovered | Self::ErrorRecovered => true,
            Self::Success | Self::Failed => false,
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Outcome of one stage of one run. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult<P> {
    pub stage: StageKind,
    pub status: StageStatus,
    pub model: String,
    /// Resolved payload: real, fallback, or absent when the stage failed.
    pub payload: Option<P>,
    /// Untouched model output, when the model answered at all.
    pub raw_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(with = "duration_secs")]
    pub elapsed: Duration,
}

impl<P> StageResult<P> {
    pub fn success(
        stage: StageKind,
        model: &str,
        payload: P,
        raw_text: String,
        elapsed: Duration,
    ) -> Self {
        Self {
            stage,
            status: StageStatus::Success,
            model: model.to_string(),
            payload: Some(payload),
            raw_text: Some(raw_text),
            error_detail: None,
            elapsed,
        }
    }

    /// Extraction failed on real model text; `fallback` stands in.
    pub fn recovered(
        stage: StageKind,
        model: &str,
        fallback: P,
        raw_text: String,
        error_detail: String,
        elapsed: Duration,
    ) -> Self {
        Self {
            stage,
            status: StageStatus::Recovered,
            model: model.to_string(),
            payload: Some(fallback),
            raw_text: Some(raw_text),
            error_detail: Some(error_detail),
            elapsed,
        }
    }

    /// The model call itself failed; `fallback` was synthesized locally.
    pub fn error_recovered(
        stage: StageKind,
        model: &str,
        fallback: P,
        error_detail: String,
        elapsed: Duration,
    ) -> Self {
        Self {
            stage,
            status: StageStatus::ErrorRecovered,
            model: model.to_string(),
            payload: Some(fallback),
            raw_text: None,
            error_detail: Some(error_detail),
            elapsed,
        }
    }

    pub fn failed(
        stage: StageKind,
        model: &str,
        raw_text: Option<String>,
        error_detail: String,
        elapsed: Duration,
    ) -> Self {
        Self {
            stage,
            status: StageStatus::Failed,
            model: model.to_string(),
            payload: None,
            raw_text,
            error_detail: Some(error_detail),
            elapsed,
        }
    }
}

// ──────────────────────────────────────────────
// Analysis run
// ──────────────────────────────────────────────

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// All three stages were attempted.
    Completed,
    /// The diagnoser's model call failed; later stages were never attempted.
    Aborted,
}

/// Descriptive data about a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub problem: String,
    #[serde(default)]
    pub image: Option<PathBuf>,
    pub has_image: bool,
    /// Wall-clock span from the first stage start to the end of the last stage.
    #[serde(with = "duration_secs")]
    pub total_time: Duration,
}

/// Aggregate result of one pipeline invocation, handed to the caller once terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRun {
    pub metadata: RunMetadata,
    pub outcome: RunOutcome,
    pub diagnoser: StageResult<DiagnosisRecord>,
    #[serde(default)]
    pub validator: Option<StageResult<ValidationRecord>>,
    #[serde(default)]
    pub advisor: Option<StageResult<String>>,
}

impl AnalysisRun {
    pub fn is_aborted(&self) -> bool {
        self.outcome == RunOutcome::Aborted
    }

    /// Diagnosis the later stages consumed (real or fallback).
    pub fn diagnosis(&self) -> Option<&DiagnosisRecord> {
        self.diagnoser.payload.as_ref()
    }

    pub fn validation(&self) -> Option<&ValidationRecord> {
        self.validator.as_ref().and_then(|v| v.payload.as_ref())
    }

    /// Advisory free text, when the advisor answered.
    pub fn advice(&self) -> Option<&str> {
        self.advisor.as_ref().and_then(|a| a.payload.as_deref())
    }

    /// Status of every attempted stage, in execution order.
    pub fn stage_statuses(&self) -> Vec<(StageKind, StageStatus)> {
        let mut statuses = vec![(StageKind::Diagnoser, self.diagnoser.status)];
        if let Some(v) = &self.validator {
            statuses.push((StageKind::Validator, v.status));
        }
        if let Some(a) = &self.advisor {
            statuses.push((StageKind::Advisor, a.status));
        }
        statuses
    }
}

// ──────────────────────────────────────────────
// Model collaborator
// ──────────────────────────────────────────────

/// One request to the model collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    pub system: Option<String>,
    pub images: Vec<PathBuf>,
    pub sampling: Sampling,
}

/// Model invocation capability (allows mocking).
pub trait LlmClient: Send + Sync {
    /// Run one generation and return the raw text.
    fn generate(&self, request: &GenerateRequest) -> Result<String, DiagnosisError>;
}

// ──────────────────────────────────────────────
// Serde helpers
// ──────────────────────────────────────────────

/// `Duration` as fractional seconds.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Tolerant field readers for model-produced JSON.
///
/// None of these fail on a wrong JSON type; they coerce or fall back to the
/// cautious default so a syntactically valid object is always a record.
mod lenient {
    use serde::de::DeserializeOwned;
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    use super::{MAX_CONFIDENCE_PENALTY, MIN_CONFIDENCE};

    pub fn text<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::String(s) => s,
            Value::Null => String::new(),
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(", "),
            other => other.to_string(),
        })
    }

    pub fn boolean<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Bool(b) => b,
            Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
            Value::String(s) => matches!(
                s.trim().to_ascii_lowercase().as_str(),
                "true" | "yes" | "1"
            ),
            _ => false,
        })
    }

    pub fn confidence<'de, D: Deserializer<'de>>(d: D) -> Result<i32, D::Error> {
        Ok(integer(Value::deserialize(d)?).unwrap_or(MIN_CONFIDENCE))
    }

    pub fn adjustment<'de, D: Deserializer<'de>>(d: D) -> Result<i32, D::Error> {
        Ok(integer(Value::deserialize(d)?).unwrap_or(MAX_CONFIDENCE_PENALTY))
    }

    pub fn tag<'de, D, T>(d: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: From<String> + Default,
    {
        Ok(match Value::deserialize(d)? {
            Value::String(s) => T::from(s),
            Value::Null => T::default(),
            other => T::from(other.to_string()),
        })
    }

    pub fn object<'de, D, T>(d: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: DeserializeOwned + Default,
    {
        let value = Value::deserialize(d)?;
        Ok(serde_json::from_value(value).unwrap_or_default())
    }

    /// Integers, floats (rounded) and numeric strings such as `"8"` or `"+2"`.
    fn integer(value: Value) -> Option<i32> {
        let n = match value {
            Value::Number(n) => n.as_f64()?,
            Value::String(s) => s.trim().trim_start_matches('+').parse::<f64>().ok()?,
            _ => return None,
        };
        if !n.is_finite() {
            return None;
        }
        Some(n.round().clamp(i32::MIN as f64, i32::MAX as f64) as i32)
    }
}
