//! Deterministic stand-in records for stages whose output could not be used.
//!
//! Every value is pinned to its most cautious extreme: minimum confidence,
//! maximum penalty, weakest evidence, escalate to an expert. A parse failure
//! must never read as a confident diagnosis downstream.

use serde::Serialize;

use super::types::{
    DiagnosisRecord, ErrorFlags, EvidenceAssessment, EvidenceQuality, FinalRecommendation,
    ImageTextCorrelation, StageKind, ValidationRecord, MAX_CONFIDENCE_PENALTY, MIN_CONFIDENCE,
};

/// Sentinel primary finding for a diagnosis that could not be read.
pub const DIAGNOSIS_FAILURE_SENTINEL: &str = "Analysis failed - JSON parsing error";

/// A fallback record for one of the structured stages.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FallbackRecord {
    Diagnosis(DiagnosisRecord),
    Validation(ValidationRecord),
}

/// Fallback for a stage, or `None` for the free-text advisor (it has no record).
pub fn fallback(stage: StageKind, error_detail: &str) -> Option<FallbackRecord> {
    match stage {
        StageKind::Diagnoser => Some(FallbackRecord::Diagnosis(fallback_diagnosis(error_detail))),
        StageKind::Validator => Some(FallbackRecord::Validation(fallback_validation(
            error_detail,
        ))),
        StageKind::Advisor => None,
    }
}

pub fn fallback_diagnosis(error_detail: &str) -> DiagnosisRecord {
    DiagnosisRecord {
        primary_diagnosis: DIAGNOSIS_FAILURE_SENTINEL.to_string(),
        primary_confidence: MIN_CONFIDENCE,
        alternative_diagnosis: "Unable to determine".to_string(),
        alternative_confidence: MIN_CONFIDENCE,
        image_text_correlation: ImageTextCorrelation::NoImage,
        key_symptoms_observed: "Parsing error occurred".to_string(),
        visual_evidence_quality: EvidenceQuality::NoEvidence,
        error_flags: ErrorFlags {
            equally_likely: false,
            contradictory_symptoms: false,
            insufficient_evidence: true,
        },
        diagnostic_reasoning: format!("JSON parsing failed: {error_detail}"),
        extra: serde_json::Map::new(),
    }
}

pub fn fallback_validation(error_detail: &str) -> ValidationRecord {
    ValidationRecord {
        primary_diagnosis_valid: false,
        primary_confidence_adjustment: MAX_CONFIDENCE_PENALTY,
        alternative_diagnosis_preferred: false,
        critical_concerns: format!("Validation failed: {error_detail}"),
        evidence_quality_assessment: EvidenceAssessment::Weak,
        overlooked_factors: "Unable to assess due to validation failure".to_string(),
        bias_detection: "none identified".to_string(),
        additional_diagnostics_needed: "Retry analysis or consult a plant health specialist"
            .to_string(),
        final_recommendation: FinalRecommendation::RequestExpert,
        extra: serde_json::Map::new(),
    }
}

impl TryFrom<FallbackRecord> for DiagnosisRecord {
    type Error = FallbackRecord;

    fn try_from(record: FallbackRecord) -> Result<Self, Self::Error> {
        match record {
            FallbackRecord::Diagnosis(record) => Ok(record),
            other => Err(other),
        }
    }
}

impl TryFrom<FallbackRecord> for ValidationRecord {
    type Error = FallbackRecord;

    fn try_from(record: FallbackRecord) -> Result<Self, Self::Error> {
        match record {
            FallbackRecord::Validation(record) => Ok(record),
            other => Err(other),
        }
    }
}

impl DiagnosisRecord {
    /// True for records produced by `fallback_diagnosis`.
    pub fn is_fallback(&self) -> bool {
        self.primary_diagnosis == DIAGNOSIS_FAILURE_SENTINEL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnosis_fallback_is_maximally_cautious() {
        let record = fallback_diagnosis("no braces in output");
        assert_eq!(record.primary_diagnosis, DIAGNOSIS_FAILURE_SENTINEL);
        assert_eq!(record.primary_confidence, 1);
        assert_eq!(record.alternative_confidence, 1);
        assert_eq!(record.image_text_correlation, ImageTextCorrelation::NoImage);
        assert_eq!(record.visual_evidence_quality, EvidenceQuality::NoEvidence);
        assert!(record.error_flags.insufficient_evidence);
        assert!(!record.error_flags.equally_likely);
        assert!(!record.error_flags.contradictory_symptoms);
        assert!(record.is_fallback());
    }

    #[test]
    fn diagnosis_fallback_carries_error_detail() {
        let record = fallback_diagnosis("Could not extract valid JSON from: I think...");
        assert!(record
            .diagnostic_reasoning
            .contains("Could not extract valid JSON from: I think..."));
    }

    #[test]
    fn validation_fallback_is_maximally_cautious() {
        let record = fallback_validation("connection refused");
        assert!(!record.primary_diagnosis_valid);
        assert_eq!(record.primary_confidence_adjustment, -3);
        assert!(!record.alternative_diagnosis_preferred);
        assert_eq!(record.evidence_quality_assessment, EvidenceAssessment::Weak);
        assert_eq!(record.final_recommendation, FinalRecommendation::RequestExpert);
        assert!(record.critical_concerns.contains("connection refused"));
    }

    #[test]
    fn fallback_is_deterministic() {
        assert_eq!(fallback_diagnosis("x"), fallback_diagnosis("x"));
        assert_eq!(fallback_validation("y"), fallback_validation("y"));
    }

    #[test]
    fn fallback_by_stage_kind() {
        assert!(matches!(
            fallback(StageKind::Diagnoser, "e"),
            Some(FallbackRecord::Diagnosis(_))
        ));
        assert!(matches!(
            fallback(StageKind::Validator, "e"),
            Some(FallbackRecord::Validation(_))
        ));
        assert!(fallback(StageKind::Advisor, "e").is_none());
    }

    #[test]
    fn fallback_converts_only_to_its_own_record() {
        let record = fallback(StageKind::Validator, "e").unwrap();
        assert!(DiagnosisRecord::try_from(record.clone()).is_err());
        let validation = ValidationRecord::try_from(record).unwrap();
        assert_eq!(validation, fallback_validation("e"));
    }

    #[test]
    fn fallback_serializes_with_external_field_names() {
        let json = serde_json::to_value(fallback_diagnosis("boom")).unwrap();
        assert_eq!(json["primary_confidence"], 1);
        assert_eq!(json["image_text_correlation"], "no_image");
        assert_eq!(json["visual_evidence_quality"], "none");
        assert_eq!(json["error_flags"]["insufficient_evidence"], true);

        let json = serde_json::to_value(fallback_validation("boom")).unwrap();
        assert_eq!(json["primary_confidence_adjustment"], -3);
        assert_eq!(json["final_recommendation"], "request_expert");
    }

    #[test]
    fn real_diagnosis_is_not_fallback() {
        let record: DiagnosisRecord =
            serde_json::from_str(r#"{"primary_diagnosis": "leaf spot"}"#).unwrap();
        assert!(!record.is_fallback());
    }
}
