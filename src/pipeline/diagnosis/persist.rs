//! Saved analysis runs.
//!
//! One pretty-printed JSON document per run:
//! ```text
//! {dir}/analysis_{YYYYmmdd_HHMMSS}_{run id prefix}.json
//! ```

use std::path::{Path, PathBuf};

use super::types::AnalysisRun;
use super::DiagnosisError;

/// File name for a run, derived from its timestamp and id.
pub fn run_file_name(run: &AnalysisRun) -> String {
    let id = run.metadata.run_id.simple().to_string();
    format!(
        "analysis_{}_{}.json",
        run.metadata.timestamp.format("%Y%m%d_%H%M%S"),
        &id[..8]
    )
}

/// Write a run to `dir`, creating it if needed. Returns the file path.
pub fn save_run(run: &AnalysisRun, dir: &Path) -> Result<PathBuf, DiagnosisError> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(run_file_name(run));
    let json = serde_json::to_string_pretty(run)?;
    std::fs::write(&path, json.as_bytes())?;

    tracing::info!(
        path = %path.display(),
        size = json.len(),
        run_id = %run.metadata.run_id,
        "Analysis saved"
    );
    Ok(path)
}

/// Read a run previously written by `save_run`.
pub fn load_run(path: &Path) -> Result<AnalysisRun, DiagnosisError> {
    let json = std::fs::read_to_string(path)?;
    let run = serde_json::from_str(&json)?;
    tracing::debug!(path = %path.display(), "Analysis loaded");
    Ok(run)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::pipeline::diagnosis::ollama::MockLlmClient;
    use crate::pipeline::diagnosis::orchestrator::DiagnosisPipeline;
    use crate::pipeline::diagnosis::types::StageStatus;
    use crate::pipeline_config::PipelineConfig;

    fn sample_run() -> AnalysisRun {
        let mock = MockLlmClient::new()
            .reply("Looks like rust: {\"primary_diagnosis\": \"leaf rust\", \"primary_confidence\": 6, \"vendor_note\": 1}")
            .reply("not json")
            .reply("Apply sulfur fungicide.");
        let mut run = DiagnosisPipeline::new(Arc::new(mock), PipelineConfig::default())
            .analyze("orange pustules under leaves", None);
        run.metadata.total_time = Duration::from_millis(3500);
        run.diagnoser.elapsed = Duration::from_millis(2000);
        if let Some(v) = run.validator.as_mut() {
            v.elapsed = Duration::from_millis(1000);
        }
        if let Some(a) = run.advisor.as_mut() {
            a.elapsed = Duration::from_millis(500);
        }
        run
    }

    #[test]
    fn file_name_uses_timestamp_and_short_id() {
        let run = sample_run();
        let name = run_file_name(&run);
        assert!(name.starts_with("analysis_"));
        assert!(name.ends_with(".json"));
        // analysis_ + 15 timestamp chars + _ + 8 id chars + .json
        assert_eq!(name.len(), "analysis_".len() + 15 + 1 + 8 + ".json".len());
        let id = run.metadata.run_id.simple().to_string();
        assert!(name.contains(&id[..8]));
    }

    #[test]
    fn saved_run_loads_back_identical() {
        let dir = tempfile::tempdir().unwrap();
        let run = sample_run();

        let path = save_run(&run, &dir.path().join("analyses")).unwrap();
        assert!(path.exists());

        let loaded = load_run(&path).unwrap();
        assert_eq!(loaded, run);
        assert_eq!(loaded.validator.unwrap().status, StageStatus::Recovered);
        assert_eq!(loaded.diagnoser.payload.unwrap().extra["vendor_note"], 1);
    }

    #[test]
    fn saved_document_uses_external_field_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = save_run(&sample_run(), dir.path()).unwrap();
        let doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();

        assert_eq!(doc["metadata"]["problem"], "orange pustules under leaves");
        assert_eq!(doc["metadata"]["total_time"], 3.5);
        assert_eq!(doc["outcome"], "completed");
        assert_eq!(doc["diagnoser"]["status"], "success");
        assert_eq!(doc["validator"]["status"], "json_error_recovered");
        assert_eq!(doc["validator"]["raw_text"], "not json");
        assert_eq!(
            doc["validator"]["payload"]["final_recommendation"],
            "request_expert"
        );
        assert_eq!(doc["advisor"]["payload"], "Apply sulfur fungicide.");
    }

    #[test]
    fn loading_missing_file_is_io_error() {
        let err = load_run(Path::new("/definitely/not/here.json")).unwrap_err();
        assert!(matches!(err, DiagnosisError::Io(_)));
    }

    #[test]
    fn loading_garbage_is_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            load_run(&path).unwrap_err(),
            DiagnosisError::Serialization(_)
        ));
    }
}
