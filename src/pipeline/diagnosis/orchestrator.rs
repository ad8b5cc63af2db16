use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use super::extract::extract_with_strategy;
use super::fallback::{fallback, fallback_validation, FallbackRecord};
use super::history::AnalysisHistory;
use super::prompt::{render_instruction, PromptContext};
use super::types::{
    AnalysisRun, DiagnosisRecord, GenerateRequest, LlmClient, RunMetadata, RunOutcome,
    StageKind, StageResult, ValidationRecord,
};
use super::DiagnosisError;
use crate::pipeline_config::PipelineConfig;

/// Runs the three-stage diagnosis:
/// diagnose → validate → advise.
///
/// Each stage's resolved output (real or fallback) feeds the next. Only a
/// failed diagnoser call ends a run early; a failed validator call is replaced
/// by a local fallback record and a failed advisor call leaves the advice empty.
pub struct DiagnosisPipeline {
    llm: Arc<dyn LlmClient>,
    config: PipelineConfig,
    history: Option<Arc<AnalysisHistory>>,
}

impl DiagnosisPipeline {
    pub fn new(llm: Arc<dyn LlmClient>, config: PipelineConfig) -> Self {
        Self {
            llm,
            config,
            history: None,
        }
    }

    /// Append every finished run to a shared history.
    pub fn with_history(mut self, history: Arc<AnalysisHistory>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Analyze one plant problem. Always returns a run, aborted or not.
    pub fn analyze(&self, problem: &str, image: Option<&Path>) -> AnalysisRun {
        let run_id = Uuid::new_v4();
        let _span = tracing::info_span!("analysis_run", run_id = %run_id, has_image = image.is_some())
            .entered();
        let run_started = Instant::now();

        let mut metadata = RunMetadata {
            run_id,
            timestamp: Utc::now(),
            problem: problem.to_string(),
            image: image.map(Path::to_path_buf),
            has_image: image.is_some(),
            total_time: Default::default(),
        };

        // DIAGNOSE
        let diagnoser = self.diagnose(problem, image);
        let diagnosis = match diagnoser.payload.clone() {
            Some(record) => record,
            None => {
                metadata.total_time = run_started.elapsed();
                tracing::error!(
                    error = diagnoser.error_detail.as_deref().unwrap_or_default(),
                    "Diagnoser unavailable, aborting run"
                );
                return self.finish(AnalysisRun {
                    metadata,
                    outcome: RunOutcome::Aborted,
                    diagnoser,
                    validator: None,
                    advisor: None,
                });
            }
        };

        // VALIDATE
        let validator = self.validate(problem, &diagnosis);
        let validation = validator
            .payload
            .clone()
            .unwrap_or_else(|| fallback_validation("validator produced no record"));

        // ADVISE
        let advisor = self.advise(problem, image.is_some(), &diagnosis, &validation);

        metadata.total_time = run_started.elapsed();
        self.finish(AnalysisRun {
            metadata,
            outcome: RunOutcome::Completed,
            diagnoser,
            validator: Some(validator),
            advisor: Some(advisor),
        })
    }

    fn finish(&self, run: AnalysisRun) -> AnalysisRun {
        tracing::info!(
            outcome = ?run.outcome,
            total_ms = run.metadata.total_time.as_millis() as u64,
            "Analysis run finished"
        );
        if let Some(history) = &self.history {
            history.append(run.clone());
        }
        run
    }

    fn diagnose(&self, problem: &str, image: Option<&Path>) -> StageResult<DiagnosisRecord> {
        let kind = StageKind::Diagnoser;
        let stage = self.config.stage(kind);
        let _span = tracing::info_span!("stage", stage = %kind, role = %stage.role).entered();
        let started = Instant::now();
        let model = &stage.model;

        let ctx = PromptContext {
            problem,
            has_image: image.is_some(),
            ..Default::default()
        };
        let images: Vec<PathBuf> = image.map(Path::to_path_buf).into_iter().collect();

        match self.invoke(kind, &ctx, images) {
            Ok(text) => resolve_record(kind, model, text, started),
            Err(e) => {
                tracing::error!(model = %model, error = %e, "Diagnoser call failed");
                StageResult::failed(kind, model, None, e.to_string(), started.elapsed())
            }
        }
    }

    fn validate(&self, problem: &str, diagnosis: &DiagnosisRecord) -> StageResult<ValidationRecord> {
        let kind = StageKind::Validator;
        let stage = self.config.stage(kind);
        let _span = tracing::info_span!("stage", stage = %kind, role = %stage.role).entered();
        let started = Instant::now();
        let model = &stage.model;

        let ctx = PromptContext {
            problem,
            diagnosis: Some(diagnosis),
            ..Default::default()
        };

        match self.invoke(kind, &ctx, Vec::new()) {
            Ok(text) => resolve_record(kind, model, text, started),
            Err(e) => {
                let detail = e.to_string();
                tracing::warn!(
                    model = %model,
                    error = %detail,
                    "Validator call failed, continuing with fallback review"
                );
                match stage_fallback(kind, &detail) {
                    Some(record) => {
                        StageResult::error_recovered(kind, model, record, detail, started.elapsed())
                    }
                    None => StageResult::failed(kind, model, None, detail, started.elapsed()),
                }
            }
        }
    }

    fn advise(
        &self,
        problem: &str,
        has_image: bool,
        diagnosis: &DiagnosisRecord,
        validation: &ValidationRecord,
    ) -> StageResult<String> {
        let kind = StageKind::Advisor;
        let stage = self.config.stage(kind);
        let _span = tracing::info_span!("stage", stage = %kind, role = %stage.role).entered();
        let started = Instant::now();
        let model = &stage.model;

        let ctx = PromptContext {
            problem,
            has_image,
            diagnosis: Some(diagnosis),
            validation: Some(validation),
        };

        match self.invoke(kind, &ctx, Vec::new()) {
            Ok(text) => {
                let elapsed = started.elapsed();
                tracing::info!(model = %model, elapsed_ms = elapsed.as_millis() as u64, "Advisor complete");
                StageResult::success(kind, model, text.clone(), text, elapsed)
            }
            Err(e) => {
                tracing::warn!(model = %model, error = %e, "Advisor call failed");
                StageResult::failed(kind, model, None, e.to_string(), started.elapsed())
            }
        }
    }

    /// One collaborator call. Blank output counts as a failed call.
    fn invoke(
        &self,
        kind: StageKind,
        ctx: &PromptContext<'_>,
        images: Vec<PathBuf>,
    ) -> Result<String, DiagnosisError> {
        let stage = self.config.stage(kind);
        let system = Some(stage.system_prompt.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let request = GenerateRequest {
            model: stage.model.clone(),
            prompt: render_instruction(&stage.instruction_template, ctx),
            system,
            images,
            sampling: stage.sampling,
        };

        let text = self.llm.generate(&request)?;
        tracing::debug!(stage = %kind, chars = text.len(), raw = %text, "Model response");
        if text.trim().is_empty() {
            return Err(DiagnosisError::EmptyResponse);
        }
        Ok(text)
    }
}

/// The stage's fallback as its concrete record type.
fn stage_fallback<T: TryFrom<FallbackRecord>>(kind: StageKind, detail: &str) -> Option<T> {
    fallback(kind, detail).and_then(|record| T::try_from(record).ok())
}

/// Extract a stage record from model text, substituting the stage fallback on failure.
fn resolve_record<T: DeserializeOwned + TryFrom<FallbackRecord>>(
    kind: StageKind,
    model: &str,
    text: String,
    started: Instant,
) -> StageResult<T> {
    match extract_with_strategy::<T>(&text) {
        Ok((record, strategy)) => {
            let elapsed = started.elapsed();
            tracing::info!(
                model = %model,
                strategy = strategy.name(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Stage complete"
            );
            StageResult::success(kind, model, record, text, elapsed)
        }
        Err(failure) => {
            let detail = failure.to_string();
            tracing::warn!(model = %model, chars = text.len(), "No parseable record, using fallback");
            tracing::debug!(preview = %failure.preview, "Unparseable model output");
            match stage_fallback(kind, &detail) {
                Some(record) => {
                    StageResult::recovered(kind, model, record, text, detail, started.elapsed())
                }
                None => StageResult::failed(kind, model, Some(text), detail, started.elapsed()),
            }
        }
    }
}
