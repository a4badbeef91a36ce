//! Full-run driver: build, test and analyze in order, stopping at the first
//! stage that fails and keeping whatever the earlier stages produced.

use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{Level, info, instrument, span, warn};

use crate::analysis::compare::STARTUP_QUERY;
use crate::analysis::{
    AnalyzeRequest, Analyzer, CompareRequest, MetricDelta, ReportFormat, ReportSummary, TraceSet,
};
use crate::build::{BuildOutcome, BuildStage, BuildVariant};
use crate::cache::{ArtifactSet, BuildIdentity};
use crate::error::{PerftestError, Result};
use crate::observability::MetricsCollector;
use crate::testrun::{TestOptions, TestOutcome, TestStage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStage {
    Build,
    Test,
    Analyze,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Build => "build",
            Self::Test => "test",
            Self::Analyze => "analyze",
        })
    }
}

#[derive(Debug, Clone)]
pub struct FullRunRequest {
    pub identity: BuildIdentity,
    /// When set, this identity is built and tested too and the analysis
    /// stage compares its startup latency against `identity`.
    pub baseline: Option<BuildIdentity>,
    pub variant: BuildVariant,
    pub test: TestOptions,
    pub skip_build: bool,
    pub skip_analysis: bool,
    pub queries: Vec<String>,
    pub custom_queries: Vec<PathBuf>,
    pub format: ReportFormat,
}

/// What a full run produced. On failure the same value travels inside
/// [`PipelineError`] with the stages that never ran left empty.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub identity: BuildIdentity,
    pub started_at: DateTime<Utc>,
    pub baseline: Option<BuildIdentity>,
    pub build: Option<BuildOutcome>,
    pub test: Option<TestOutcome>,
    pub baseline_build: Option<BuildOutcome>,
    pub baseline_test: Option<TestOutcome>,
    pub report_path: Option<PathBuf>,
    pub report_summary: Option<ReportSummary>,
    pub comparison: Option<Vec<MetricDelta>>,
    #[serde(skip)]
    pub summary_path: Option<PathBuf>,
}

impl PipelineResult {
    fn new(identity: BuildIdentity, baseline: Option<BuildIdentity>) -> Self {
        Self {
            identity,
            started_at: Utc::now(),
            baseline,
            build: None,
            test: None,
            baseline_build: None,
            baseline_test: None,
            report_path: None,
            report_summary: None,
            comparison: None,
            summary_path: None,
        }
    }

    pub fn artifacts(&self) -> Option<&ArtifactSet> {
        self.build.as_ref().map(|build| &build.artifacts)
    }

    pub fn is_partial_analysis(&self) -> bool {
        self.report_summary
            .as_ref()
            .is_some_and(|summary| summary.failed > 0)
    }
}

#[derive(Debug, Error)]
#[error("{stage} stage failed")]
pub struct PipelineError {
    pub stage: PipelineStage,
    #[source]
    pub source: PerftestError,
    pub partial: Box<PipelineResult>,
}

pub struct Pipeline {
    build: BuildStage,
    test: TestStage,
    analyzer: Analyzer,
    reports_dir: PathBuf,
    metrics: MetricsCollector,
}

impl Pipeline {
    /// Wires one shared metrics collector through every stage.
    pub fn new(build: BuildStage, test: TestStage, analyzer: Analyzer, reports_dir: impl Into<PathBuf>) -> Self {
        let metrics = MetricsCollector::new();
        Self {
            build: build.with_metrics(metrics.clone()),
            test: test.with_metrics(metrics.clone()),
            analyzer: analyzer.with_metrics(metrics.clone()),
            reports_dir: reports_dir.into(),
            metrics,
        }
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    #[instrument(skip_all, fields(branch = %request.identity.branch, commit = %request.identity.commit))]
    pub fn full_run(&self, request: &FullRunRequest) -> std::result::Result<PipelineResult, PipelineError> {
        let total_start = Instant::now();
        let mut result = PipelineResult::new(request.identity.clone(), request.baseline.clone());

        let outcome = self.run_stages(request, &mut result);
        self.metrics.record_total_duration(total_start.elapsed());

        let failure = outcome.err();
        let summary_path = self.summary_path(&request.identity);
        match write_summary(&summary_path, &result, failure.as_ref()) {
            Ok(()) => result.summary_path = Some(summary_path),
            Err(err) => warn!(path = %summary_path.display(), error = %err, "Cannot write full-run summary"),
        }

        match failure {
            None => {
                info!(
                    cache_hit = result.build.as_ref().is_some_and(|b| b.cache_hit),
                    report = ?result.report_path,
                    "Full run finished"
                );
                Ok(result)
            }
            Some((stage, source)) => Err(PipelineError {
                stage,
                source,
                partial: Box::new(result),
            }),
        }
    }

    fn run_stages(
        &self,
        request: &FullRunRequest,
        result: &mut PipelineResult,
    ) -> std::result::Result<(), (PipelineStage, PerftestError)> {
        {
            let stage_span = span!(Level::INFO, "stage", stage = %PipelineStage::Build);
            let _enter = stage_span.enter();
            if let Some(baseline) = &request.baseline {
                let build = self
                    .run_build(baseline, request)
                    .map_err(|err| (PipelineStage::Build, err))?;
                result.baseline_build = Some(build);
            }
            let build = self
                .run_build(&request.identity, request)
                .map_err(|err| (PipelineStage::Build, err))?;
            result.build = Some(build);
        }

        {
            let stage_span = span!(Level::INFO, "stage", stage = %PipelineStage::Test);
            let _enter = stage_span.enter();
            let mut options = request.test.clone();
            options.wait = true;
            if let Some(build) = &result.baseline_build {
                let outcome = self
                    .test
                    .run(&build.artifacts, &options)
                    .map_err(|err| (PipelineStage::Test, err))?;
                result.baseline_test = Some(outcome);
            }
            if let Some(build) = &result.build {
                let outcome = self
                    .test
                    .run(&build.artifacts, &options)
                    .map_err(|err| (PipelineStage::Test, err))?;
                result.test = Some(outcome);
            }
        }

        if request.skip_analysis {
            info!("Skipping analysis");
            return Ok(());
        }

        let stage_span = span!(Level::INFO, "stage", stage = %PipelineStage::Analyze);
        let _enter = stage_span.enter();
        self.run_analysis(request, result)
            .map_err(|err| (PipelineStage::Analyze, err))
    }

    fn run_analysis(&self, request: &FullRunRequest, result: &mut PipelineResult) -> Result<()> {
        let Some(test) = &result.test else {
            return Ok(());
        };

        if let (Some(baseline), Some(baseline_test)) = (&request.baseline, &result.baseline_test) {
            downloaded_traces(baseline_test)?;
            downloaded_traces(test)?;
            let compared = self.analyzer.compare(&CompareRequest {
                base: TraceSet::new(baseline.cache_key(), trace_root(baseline_test)),
                test: TraceSet::new(request.identity.cache_key(), trace_root(test)),
                query: STARTUP_QUERY.to_string(),
                format: request.format,
                output: None,
            })?;
            result.comparison = Some(compared.comparison.deltas);
            result.report_path = Some(compared.path);
            return Ok(());
        }

        let analysis = self.analyzer.run(&AnalyzeRequest {
            trace_files: downloaded_traces(test)?,
            trace_dir: None,
            queries: request.queries.clone(),
            custom_queries: request.custom_queries.clone(),
            format: request.format,
            output: None,
        })?;
        result.report_summary = Some(analysis.report.summary.clone());
        result.report_path = Some(analysis.path);
        Ok(())
    }

    fn run_build(&self, identity: &BuildIdentity, request: &FullRunRequest) -> Result<BuildOutcome> {
        if !request.skip_build {
            return self.build.build(identity, &request.variant);
        }
        let artifacts = self
            .build
            .cache()
            .resolve(identity)
            .ok_or_else(|| PerftestError::ArtifactsNotFound(identity.to_string()))?;
        info!(%identity, app_apk = %artifacts.app_apk.display(), "Skipping build; using cached artifacts");
        Ok(BuildOutcome {
            identity: identity.clone(),
            artifacts,
            cache_hit: true,
        })
    }

    fn summary_path(&self, identity: &BuildIdentity) -> PathBuf {
        self.reports_dir.join(format!(
            "full-run-{}-{}.json",
            identity.cache_key(),
            Utc::now().format("%Y%m%d-%H%M%S")
        ))
    }
}

/// Traces fetched by the test stage, or `TraceFileNotFound` for the run's
/// trace directory when there are none to analyze.
fn downloaded_traces(outcome: &TestOutcome) -> Result<Vec<PathBuf>> {
    let Some(downloads) = &outcome.downloads else {
        return Err(PerftestError::TraceFileNotFound(PathBuf::from(format!(
            "traces of {} (downloads disabled)",
            outcome.run.run_arn
        ))));
    };
    let traces: Vec<PathBuf> = downloads.traces().map(Path::to_path_buf).collect();
    if traces.is_empty() {
        return Err(PerftestError::TraceFileNotFound(downloads.trace_dir.clone()));
    }
    Ok(traces)
}

/// Directory holding one run's per-device traces and its `run.json`.
fn trace_root(outcome: &TestOutcome) -> PathBuf {
    outcome
        .downloads
        .as_ref()
        .map(|downloads| downloads.trace_dir.clone())
        .unwrap_or_default()
}

#[derive(Serialize)]
struct FullRunSummary<'a> {
    result: &'a PipelineResult,
    failed_stage: Option<PipelineStage>,
    error: Option<String>,
    finished_at: DateTime<Utc>,
}

fn write_summary(
    path: &Path,
    result: &PipelineResult,
    failure: Option<&(PipelineStage, PerftestError)>,
) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(PerftestError::at(parent))?;
    }
    let file = File::create(path).map_err(PerftestError::at(path))?;
    serde_json::to_writer_pretty(
        file,
        &FullRunSummary {
            result,
            failed_stage: failure.map(|(stage, _)| *stage),
            error: failure.map(|(_, err)| err.to_string()),
            finished_at: Utc::now(),
        },
    )?;
    Ok(())
}
