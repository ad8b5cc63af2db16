use std::fmt;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use super::types::{AnalysisRun, StageKind, StageStatus};

/// Append-only log of finished runs, shared across pipelines and threads.
#[derive(Debug, Default)]
pub struct AnalysisHistory {
    runs: Mutex<Vec<Arc<AnalysisRun>>>,
}

impl AnalysisHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finished run. Appends are atomic with respect to each other.
    pub fn append(&self, run: AnalysisRun) -> Arc<AnalysisRun> {
        let run = Arc::new(run);
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(run.clone());
        run
    }

    /// Runs recorded so far, oldest first.
    pub fn snapshot(&self) -> Vec<Arc<AnalysisRun>> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.runs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn summary(&self) -> PerformanceSummary {
        PerformanceSummary::from_runs(&self.snapshot())
    }
}

/// Aggregate view over a set of runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceSummary {
    pub total: usize,
    /// Every stage succeeded outright.
    pub full_success: usize,
    /// At least one usable stage, but not a clean sweep.
    pub partial_recovery: usize,
    /// No stage produced a usable payload.
    pub failed: usize,
    pub average_time_secs: f64,
    /// Share of runs whose validator did not plainly support the primary finding.
    pub critical_rate: f64,
    pub with_images: usize,
}

impl PerformanceSummary {
    pub fn from_runs<R: AsRef<AnalysisRun>>(runs: &[R]) -> Self {
        let mut summary = Self {
            total: runs.len(),
            full_success: 0,
            partial_recovery: 0,
            failed: 0,
            average_time_secs: 0.0,
            critical_rate: 0.0,
            with_images: 0,
        };
        if runs.is_empty() {
            return summary;
        }

        let mut total_secs = 0.0;
        let mut critical = 0usize;
        for run in runs {
            let run: &AnalysisRun = run.as_ref();
            let statuses: Vec<StageStatus> =
                run.stage_statuses().into_iter().map(|(_, s)| s).collect();

            if !statuses.iter().any(StageStatus::is_usable) {
                summary.failed += 1;
            } else if statuses.len() == StageKind::ALL.len()
                && statuses.iter().all(|s| *s == StageStatus::Success)
            {
                summary.full_success += 1;
            } else {
                summary.partial_recovery += 1;
            }

            if run
                .validation()
                .is_some_and(|v| v.final_recommendation.is_critical())
            {
                critical += 1;
            }
            if run.metadata.has_image {
                summary.with_images += 1;
            }
            total_secs += run.metadata.total_time.as_secs_f64();
        }

        summary.average_time_secs = total_secs / runs.len() as f64;
        summary.critical_rate = critical as f64 / runs.len() as f64;
        summary
    }
}

impl fmt::Display for PerformanceSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Total analyses:      {}", self.total)?;
        writeln!(f, "Full success:        {}", self.full_success)?;
        writeln!(f, "Partial recovery:    {}", self.partial_recovery)?;
        writeln!(f, "Failed:              {}", self.failed)?;
        writeln!(f, "Average time:        {:.1}s", self.average_time_secs)?;
        writeln!(f, "Critical cases:      {:.0}%", self.critical_rate * 100.0)?;
        write!(f, "With images:         {}", self.with_images)
    }
}
