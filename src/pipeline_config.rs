//! Stage table for the diagnosis pipeline.
//!
//! Maps each stage (diagnoser, validator, advisor) to the model it runs on,
//! its system prompt, its instruction template and its sampling options.
//! The table is injected into `DiagnosisPipeline` at construction so tests
//! and deployments can swap models or prompts without touching orchestration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::pipeline::diagnosis::prompt::{
    ADVISOR_INSTRUCTION, ADVISOR_SYSTEM_PROMPT, DIAGNOSER_INSTRUCTION, DIAGNOSER_SYSTEM_PROMPT,
    VALIDATOR_INSTRUCTION, VALIDATOR_SYSTEM_PROMPT,
};
use crate::pipeline::diagnosis::types::StageKind;
use crate::pipeline::diagnosis::DiagnosisError;

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// Sampling options passed through to the model collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sampling {
    pub temperature: f32,
    /// Maximum tokens to generate (Ollama `num_predict`).
    pub max_output_tokens: u32,
    pub top_p: f32,
}

/// Configuration for one pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    pub model: String,
    /// Human-readable role, used in logs only.
    pub role: String,
    pub system_prompt: String,
    /// Instruction with `{problem}`, `{image_note}`, `{diagnosis_json}` and
    /// `{validation_json}` placeholders.
    pub instruction_template: String,
    pub sampling: Sampling,
}

/// The full stage table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub diagnoser: StageConfig,
    pub validator: StageConfig,
    pub advisor: StageConfig,
}

// ═══════════════════════════════════════════════════════════
// Defaults
// ═══════════════════════════════════════════════════════════

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            diagnoser: StageConfig {
                model: "mistral-small3.2:24b".into(),
                role: "Critical Plant Pathologist".into(),
                system_prompt: DIAGNOSER_SYSTEM_PROMPT.into(),
                instruction_template: DIAGNOSER_INSTRUCTION.into(),
                sampling: Sampling {
                    temperature: 0.05,
                    max_output_tokens: 500,
                    top_p: 0.9,
                },
            },
            validator: StageConfig {
                model: "gemma3:27b".into(),
                role: "Skeptical Quality Reviewer".into(),
                system_prompt: VALIDATOR_SYSTEM_PROMPT.into(),
                instruction_template: VALIDATOR_INSTRUCTION.into(),
                sampling: Sampling {
                    temperature: 0.2,
                    max_output_tokens: 400,
                    top_p: 0.9,
                },
            },
            advisor: StageConfig {
                model: "phi4:14b".into(),
                role: "Conservative Extension Agent".into(),
                system_prompt: ADVISOR_SYSTEM_PROMPT.into(),
                instruction_template: ADVISOR_INSTRUCTION.into(),
                sampling: Sampling {
                    temperature: 0.15,
                    max_output_tokens: 400,
                    top_p: 0.9,
                },
            },
        }
    }
}

impl PipelineConfig {
    /// Look up the configuration for one stage.
    pub fn stage(&self, kind: StageKind) -> &StageConfig {
        match kind {
            StageKind::Diagnoser => &self.diagnoser,
            StageKind::Validator => &self.validator,
            StageKind::Advisor => &self.advisor,
        }
    }

    /// Use the same model for every stage (handy for small local setups).
    pub fn with_single_model(mut self, model: &str) -> Self {
        for stage in [&mut self.diagnoser, &mut self.validator, &mut self.advisor] {
            stage.model = model.to_string();
        }
        self
    }

    /// Load a stage table from a JSON file and validate it.
    pub fn from_file(path: &Path) -> Result<Self, DiagnosisError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "Loaded pipeline config");
        Ok(config)
    }

    /// Reject tables the collaborator could never honour.
    pub fn validate(&self) -> Result<(), DiagnosisError> {
        for kind in StageKind::ALL {
            let stage = self.stage(kind);
            if stage.model.trim().is_empty() {
                return Err(DiagnosisError::Config(format!("{kind}: model is empty")));
            }
            if stage.instruction_template.trim().is_empty() {
                return Err(DiagnosisError::Config(format!(
                    "{kind}: instruction template is empty"
                )));
            }
            let s = &stage.sampling;
            if !(0.0..=2.0).contains(&s.temperature) {
                return Err(DiagnosisError::Config(format!(
                    "{kind}: temperature {} outside [0, 2]",
                    s.temperature
                )));
            }
            if !(s.top_p > 0.0 && s.top_p <= 1.0) {
                return Err(DiagnosisError::Config(format!(
                    "{kind}: top_p {} outside (0, 1]",
                    s.top_p
                )));
            }
            if s.max_output_tokens == 0 {
                return Err(DiagnosisError::Config(format!(
                    "{kind}: max_output_tokens must be positive"
                )));
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_matches_agent_roster() {
        let config = PipelineConfig::default();
        assert_eq!(config.diagnoser.model, "mistral-small3.2:24b");
        assert_eq!(config.validator.model, "gemma3:27b");
        assert_eq!(config.advisor.model, "phi4:14b");
        assert!((config.diagnoser.sampling.temperature - 0.05).abs() < f32::EPSILON);
        assert_eq!(config.diagnoser.sampling.max_output_tokens, 500);
        assert_eq!(config.validator.sampling.max_output_tokens, 400);
        assert!((config.advisor.sampling.top_p - 0.9).abs() < f32::EPSILON);
    }

    #[test]
    fn default_table_is_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn stage_lookup_by_kind() {
        let config = PipelineConfig::default();
        assert_eq!(config.stage(StageKind::Validator).model, "gemma3:27b");
        assert_eq!(config.stage(StageKind::Advisor).role, "Conservative Extension Agent");
    }

    #[test]
    fn single_model_override() {
        let config = PipelineConfig::default().with_single_model("llama3:8b");
        for kind in StageKind::ALL {
            assert_eq!(config.stage(kind).model, "llama3:8b");
        }
    }

    #[test]
    fn validate_rejects_empty_model() {
        let mut config = PipelineConfig::default();
        config.validator.model = "  ".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("validator"));
    }

    #[test]
    fn validate_rejects_bad_sampling() {
        let mut config = PipelineConfig::default();
        config.advisor.sampling.top_p = 0.0;
        assert!(matches!(config.validate(), Err(DiagnosisError::Config(_))));

        let mut config = PipelineConfig::default();
        config.diagnoser.sampling.temperature = 3.5;
        assert!(matches!(config.validate(), Err(DiagnosisError::Config(_))));

        let mut config = PipelineConfig::default();
        config.diagnoser.sampling.max_output_tokens = 0;
        assert!(matches!(config.validate(), Err(DiagnosisError::Config(_))));
    }

    #[test]
    fn loads_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        let config = PipelineConfig::default().with_single_model("qwen2.5:7b");
        std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

        let loaded = PipelineConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn from_file_rejects_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            PipelineConfig::from_file(&path),
            Err(DiagnosisError::Serialization(_))
        ));
    }

    #[test]
    fn sampling_serializes_with_field_names() {
        let json = serde_json::to_value(PipelineConfig::default().diagnoser.sampling).unwrap();
        assert_eq!(json["max_output_tokens"], 500);
        assert!(json.get("top_p").is_some());
    }
}
