//! Analyze stage: run static SQL queries over Perfetto traces and collect
//! every (trace, query) outcome into a report.

pub mod compare;
pub mod engine;
pub mod queries;
pub mod report;

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::error::{PerftestError, Result};
use crate::observability::MetricsCollector;

pub use compare::{CompareRequest, Comparison, MetricDelta, MetricStats, TraceSet};
pub use engine::{QueryTable, ShellTraceProcessor, TraceProcessor, TraceSession};
pub use queries::{Query, QueryLibrary, QuerySource};
pub use report::{Report, ReportFormat, ReportSummary};

/// Outcome of one query against one trace. A failed query keeps its slot
/// with `error` set and no rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceQueryResult {
    pub query_name: String,
    pub source_trace: PathBuf,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub error: Option<String>,
}

impl TraceQueryResult {
    fn failed(query: &Query, trace: &Path, message: String) -> Self {
        Self {
            query_name: query.name.clone(),
            source_trace: trace.to_path_buf(),
            columns: Vec::new(),
            rows: Vec::new(),
            error: Some(message),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnalyzeRequest {
    pub trace_files: Vec<PathBuf>,
    pub trace_dir: Option<PathBuf>,
    pub queries: Vec<String>,
    pub custom_queries: Vec<PathBuf>,
    pub format: ReportFormat,
    pub output: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComparisonOutcome {
    pub comparison: Comparison,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisOutcome {
    pub report: Report,
    pub path: PathBuf,
}

pub struct Analyzer {
    engine: Box<dyn TraceProcessor>,
    library: QueryLibrary,
    reports_dir: PathBuf,
    trace_pattern: String,
    metrics: MetricsCollector,
}

impl Analyzer {
    pub fn new(
        engine: Box<dyn TraceProcessor>,
        library: QueryLibrary,
        reports_dir: impl Into<PathBuf>,
        trace_pattern: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            library,
            reports_dir: reports_dir.into(),
            trace_pattern: trace_pattern.into(),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    /// Resolve queries and traces, run everything and write the report.
    /// Unknown queries and missing traces fail before any query runs.
    #[instrument(skip_all, fields(format = ?request.format))]
    pub fn run(&self, request: &AnalyzeRequest) -> Result<AnalysisOutcome> {
        let queries = self
            .library
            .resolve_all(&request.queries, &request.custom_queries)?;
        if queries.is_empty() {
            return Err(PerftestError::Config("no queries selected".into()));
        }
        let traces = discover_traces(
            &request.trace_files,
            request.trace_dir.as_deref(),
            &self.trace_pattern,
        )?;
        info!(traces = traces.len(), queries = queries.len(), "Analyzing traces");

        let sections = self.analyze(&traces, &queries);
        let report = Report::new(request.format, traces.len(), queries.len(), sections);
        let path = request
            .output
            .clone()
            .unwrap_or_else(|| report.default_path(&self.reports_dir));
        report.write(&path)?;

        if report.is_partial() {
            warn!(
                failed = report.summary.failed,
                succeeded = report.summary.succeeded,
                report = %path.display(),
                "Analysis finished with query failures"
            );
        } else {
            info!(sections = report.sections.len(), report = %path.display(), "Report written");
        }
        Ok(AnalysisOutcome { report, path })
    }

    /// Measure both trace sets with the startup query and write the
    /// base-versus-test report.
    #[instrument(skip_all, fields(base = %request.base.label, test = %request.test.label))]
    pub fn compare(&self, request: &CompareRequest) -> Result<ComparisonOutcome> {
        let query = self.library.resolve(&request.query)?;
        let _timer = self.metrics.start_stage("analyze.compare");

        let base = compare::measure_side(self.engine.as_ref(), &query, &request.base, &self.trace_pattern)?;
        let test = compare::measure_side(self.engine.as_ref(), &query, &request.test, &self.trace_pattern)?;
        let comparison = Comparison::new(request.format, &query.name, base, test);

        let path = request
            .output
            .clone()
            .unwrap_or_else(|| comparison.default_path(&self.reports_dir));
        comparison.write(&path)?;
        for delta in &comparison.deltas {
            info!(
                metric = %delta.metric,
                base_mean = delta.base_mean,
                test_mean = delta.test_mean,
                delta_ms = delta.mean_delta_ms,
                "Comparison"
            );
        }
        info!(skipped = comparison.skipped(), report = %path.display(), "Comparison written");
        Ok(ComparisonOutcome { comparison, path })
    }

    /// Run every query against every trace. Always returns
    /// `traces.len() * queries.len()` results, trace-major.
    pub fn analyze(&self, traces: &[PathBuf], queries: &[Query]) -> Vec<TraceQueryResult> {
        let mut results = Vec::with_capacity(traces.len() * queries.len());

        for trace in traces {
            let _timer = self.metrics.start_stage("analyze.trace");
            let mut session = match self.engine.open(trace) {
                Ok(session) => session,
                Err(err) => {
                    warn!(trace = %trace.display(), error = %err, "Cannot open trace");
                    let message = err.to_string();
                    results.extend(
                        queries
                            .iter()
                            .map(|query| TraceQueryResult::failed(query, trace, message.clone())),
                    );
                    continue;
                }
            };

            for query in queries {
                match session.query(query) {
                    Ok(table) => results.push(TraceQueryResult {
                        query_name: query.name.clone(),
                        source_trace: trace.clone(),
                        columns: table.columns,
                        rows: table.rows,
                        error: None,
                    }),
                    Err(err) => {
                        warn!(
                            trace = %trace.display(),
                            query = %query.name,
                            error = %err,
                            "Query failed"
                        );
                        results.push(TraceQueryResult::failed(query, trace, err.to_string()));
                    }
                }
            }
        }
        results
    }
}

/// Explicit files plus a recursive match of `pattern` under `dir`, skipping
/// hidden directories. Sorted and deduplicated.
pub fn discover_traces(files: &[PathBuf], dir: Option<&Path>, pattern: &str) -> Result<Vec<PathBuf>> {
    let mut traces = Vec::new();

    for file in files {
        if !file.is_file() {
            return Err(PerftestError::TraceFileNotFound(file.clone()));
        }
        traces.push(file.clone());
    }

    if let Some(dir) = dir {
        if !dir.is_dir() {
            return Err(PerftestError::TraceFileNotFound(dir.to_path_buf()));
        }
        let glob_pattern = format!("{}/**/{pattern}", glob::Pattern::escape(&dir.to_string_lossy()));
        let matches = glob::glob(&glob_pattern)
            .map_err(|err| PerftestError::Config(format!("invalid trace pattern '{pattern}': {err}")))?;
        let found: Vec<PathBuf> = matches
            .filter_map(|entry| entry.ok())
            .filter(|path| path.is_file() && !is_hidden_below(dir, path))
            .collect();
        if found.is_empty() {
            return Err(PerftestError::TraceFileNotFound(dir.to_path_buf()));
        }
        traces.extend(found);
    }

    if traces.is_empty() {
        return Err(PerftestError::TraceFileNotFound(
            dir.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(".")),
        ));
    }
    traces.sort();
    traces.dedup();
    Ok(traces)
}

fn is_hidden_below(root: &Path, path: &Path) -> bool {
    path.strip_prefix(root)
        .map(|relative| {
            relative
                .components()
                .any(|c| c.as_os_str().to_string_lossy().starts_with('.'))
        })
        .unwrap_or(false)
}
