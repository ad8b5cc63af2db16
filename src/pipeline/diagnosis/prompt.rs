use super::types::{DiagnosisRecord, ValidationRecord};

pub const DIAGNOSER_SYSTEM_PROMPT: &str = r#"
You are a forensic plant pathologist with 20 years of experience.

MISSION: Analyze the text description and the image (if provided). DETECT
contradictions between image and text.

OUTPUT ONLY valid JSON in this EXACT format:
{
  "primary_diagnosis": "specific disease/condition name",
  "primary_confidence": 8,
  "alternative_diagnosis": "second most likely condition",
  "alternative_confidence": 5,
  "image_text_correlation": "consistent | contradictory | poor | no_image",
  "key_symptoms_observed": "brief list of main symptoms seen",
  "visual_evidence_quality": "excellent | good | poor | none",
  "error_flags": {
    "equally_likely": false,
    "contradictory_symptoms": false,
    "insufficient_evidence": false
  },
  "diagnostic_reasoning": "brief explanation of primary diagnosis choice"
}

CONFIDENCE SCALE: 1-10 (1 = very uncertain, 10 = extremely confident)

IMAGE/TEXT CORRELATION:
- Symptoms described but NOT visible in the image -> "contradictory"
- Image shows different symptoms than described -> "contradictory"
- Image quality too poor to confirm -> "poor"
- No image provided -> "no_image"

ERROR FLAGS (true when applicable):
- "equally_likely": several diagnoses have similar probability
- "contradictory_symptoms": symptoms do not align logically
- "insufficient_evidence": not enough information for a confident diagnosis

Output ONLY the JSON object. No text before or after it.
"#;

pub const VALIDATOR_SYSTEM_PROMPT: &str = r#"
You are a veteran plant clinic director known for catching diagnostic errors.

MISSION: Challenge the diagnosis you are given. Find flaws, question
assumptions, detect bias.

OUTPUT ONLY valid JSON in this EXACT format:
{
  "primary_diagnosis_valid": true,
  "primary_confidence_adjustment": -1,
  "alternative_diagnosis_preferred": false,
  "critical_concerns": "specific diagnostic issues identified or none",
  "evidence_quality_assessment": "strong | moderate | weak",
  "overlooked_factors": "environmental/seasonal factors missed or none",
  "bias_detection": "confirmation bias detected or none",
  "additional_diagnostics_needed": "laboratory tests/imaging required or none",
  "final_recommendation": "support_primary | prefer_alternative | insufficient_data | request_expert"
}

PROTOCOL:
1. Question evidence sufficiency
2. Challenge the diagnostic reasoning
3. Identify potential biases
4. Consider alternative explanations
5. Assess seasonal and environmental factors
6. Flag missing information

CONFIDENCE ADJUSTMENT: -3 to +3.
FINAL RECOMMENDATION:
- "support_primary": agree with the primary diagnosis
- "prefer_alternative": the alternative is more likely
- "insufficient_data": more information is needed
- "request_expert": complex case needing a specialist

Output ONLY the JSON object. No explanatory text.
"#;

pub const ADVISOR_SYSTEM_PROMPT: &str = r#"
You are a conservative agricultural extension specialist.

Recommendations must be proportional to certainty:
- High confidence (8-10): specific treatments with timelines
- Medium confidence (5-7): conservative monitoring approach
- Low confidence (1-4): diagnostic steps only

You receive a JSON diagnosis and a JSON peer review. Synthesize them into
practical recommendations using this format:

**DIAGNOSTIC SYNTHESIS**: combine both analyses
**CONFIDENCE ASSESSMENT**: final confidence level with reasoning
**IMAGE-TEXT CORRELATION**: note any contradictions flagged
**CRITICAL CONCERNS**: address the reviewer's concerns
**RECOMMENDED ACTION**: guidance matched to the final confidence level
**MONITORING PLAN**: what to watch for
**WHEN TO ESCALATE**: red flags requiring professional help

Always include cost-benefit considerations, environmental impact, a timeline
for expected results, at least one limitation, and safety considerations for
the grower. Prioritize grower safety and practicality.
"#;

pub const DIAGNOSER_INSTRUCTION: &str = "FORENSIC PLANT ANALYSIS:\n\n\
PROBLEM: {problem}\n\
IMAGE PROVIDED: {image_note}";

pub const VALIDATOR_INSTRUCTION: &str = "PEER REVIEW CHALLENGE:\n\n\
ORIGINAL PROBLEM: {problem}\n\
DIAGNOSIS JSON:\n{diagnosis_json}\n\n\
Challenge every aspect of this diagnosis with scientific skepticism.";

pub const ADVISOR_INSTRUCTION: &str = "EXTENSION CONSULTATION:\n\n\
GROWER'S PROBLEM: {problem}\n\n\
DIAGNOSTIC ANALYSIS (JSON):\n{diagnosis_json}\n\n\
PEER REVIEW (JSON):\n{validation_json}\n\n\
Provide practical, evidence-based recommendations considering both analyses.";

/// Values available to instruction templates.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptContext<'a> {
    pub problem: &'a str,
    pub has_image: bool,
    pub diagnosis: Option<&'a DiagnosisRecord>,
    pub validation: Option<&'a ValidationRecord>,
}

impl PromptContext<'_> {
    fn image_note(&self) -> &'static str {
        if self.has_image {
            "Yes - analyze visual evidence"
        } else {
            "No - text-only analysis"
        }
    }

    fn lookup(&self, placeholder: &str) -> Option<String> {
        match placeholder {
            "problem" => Some(self.problem.to_string()),
            "image_note" => Some(self.image_note().to_string()),
            "diagnosis_json" => Some(to_context_json(self.diagnosis)),
            "validation_json" => Some(to_context_json(self.validation)),
            _ => None,
        }
    }
}

/// Pretty JSON for a record fed to the next stage; `{}` when absent.
fn to_context_json<T: serde::Serialize>(record: Option<&T>) -> String {
    record
        .and_then(|r| serde_json::to_string_pretty(r).ok())
        .unwrap_or_else(|| "{}".to_string())
}

/// Substitute `{placeholder}` tokens in a single pass.
///
/// Substituted values are never rescanned, so braces or placeholder-like
/// text inside the problem description or records stay literal. Unknown
/// tokens are left as written.
pub fn render_instruction(template: &str, ctx: &PromptContext<'_>) -> String {
    let mut out = String::with_capacity(template.len() + ctx.problem.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let token_end = after
            .find('}')
            .filter(|&end| after[..end].chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));

        match token_end.and_then(|end| ctx.lookup(&after[..end]).map(|v| (end, v))) {
            Some((end, value)) => {
                out.push_str(&value);
                rest = &after[end + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::diagnosis::fallback::{fallback_diagnosis, fallback_validation};

    #[test]
    fn diagnoser_instruction_mentions_problem_and_image() {
        let ctx = PromptContext {
            problem: "white powdery spots on leaves",
            has_image: true,
            ..Default::default()
        };
        let prompt = render_instruction(DIAGNOSER_INSTRUCTION, &ctx);
        assert!(prompt.contains("PROBLEM: white powdery spots on leaves"));
        assert!(prompt.contains("Yes - analyze visual evidence"));
    }

    #[test]
    fn text_only_note_without_image() {
        let ctx = PromptContext {
            problem: "yellow leaves",
            ..Default::default()
        };
        let prompt = render_instruction(DIAGNOSER_INSTRUCTION, &ctx);
        assert!(prompt.contains("No - text-only analysis"));
    }

    #[test]
    fn validator_instruction_embeds_diagnosis_json() {
        let diagnosis = fallback_diagnosis("boom");
        let ctx = PromptContext {
            problem: "wilting",
            diagnosis: Some(&diagnosis),
            ..Default::default()
        };
        let prompt = render_instruction(VALIDATOR_INSTRUCTION, &ctx);
        assert!(prompt.contains("\"primary_confidence\": 1"));
        assert!(prompt.contains("\"insufficient_evidence\": true"));
    }

    #[test]
    fn advisor_instruction_embeds_both_records() {
        let diagnosis = fallback_diagnosis("a");
        let validation = fallback_validation("b");
        let ctx = PromptContext {
            problem: "wilting",
            has_image: false,
            diagnosis: Some(&diagnosis),
            validation: Some(&validation),
        };
        let prompt = render_instruction(ADVISOR_INSTRUCTION, &ctx);
        assert!(prompt.contains("\"primary_diagnosis\""));
        assert!(prompt.contains("\"final_recommendation\": \"request_expert\""));
        assert!(!prompt.contains("{validation_json}"));
    }

    #[test]
    fn missing_record_renders_empty_object() {
        let ctx = PromptContext {
            problem: "x",
            ..Default::default()
        };
        assert_eq!(render_instruction("{diagnosis_json}", &ctx), "{}");
    }

    #[test]
    fn substituted_text_is_not_rescanned() {
        let ctx = PromptContext {
            problem: "spots {validation_json} and {braces}",
            ..Default::default()
        };
        let prompt = render_instruction("P: {problem}", &ctx);
        assert_eq!(prompt, "P: spots {validation_json} and {braces}");
    }

    #[test]
    fn unknown_and_unclosed_tokens_stay_literal() {
        let ctx = PromptContext {
            problem: "rot",
            ..Default::default()
        };
        assert_eq!(render_instruction("{unknown} {problem} {", &ctx), "{unknown} rot {");
        assert_eq!(render_instruction("{ \"a\": 1 }", &ctx), "{ \"a\": 1 }");
    }

    #[test]
    fn system_prompts_request_json_fields() {
        assert!(DIAGNOSER_SYSTEM_PROMPT.contains("\"primary_diagnosis\""));
        assert!(DIAGNOSER_SYSTEM_PROMPT.contains("\"error_flags\""));
        assert!(VALIDATOR_SYSTEM_PROMPT.contains("\"final_recommendation\""));
        assert!(ADVISOR_SYSTEM_PROMPT.contains("WHEN TO ESCALATE"));
    }
}
