//! Base-versus-test comparison of cold start latency.
//!
//! Each side is a trace directory. Directories below it holding a `run.json`
//! are batches (one Device Farm run each); without any, the directory itself
//! is the only batch. Every trace named `...iter<N>...` is measured with the
//! startup query and the two sides are summarized and diffed.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use minijinja::{Environment, context};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::engine::TraceProcessor;
use super::queries::Query;
use super::report::ReportFormat;
use super::discover_traces;
use crate::devicefarm::artifacts::sanitize_component;
use crate::error::{PerftestError, Result};

const HTML_TEMPLATE: &str = include_str!("../../templates/compare.html");

pub const STARTUP_QUERY: &str = "startup_metrics";
pub const STARTUP_COLUMN: &str = "startup_latency_ms";
pub const RENDER_COLUMN: &str = "render_latency_ms";

/// One side of a comparison: a label for the report and where its traces are.
#[derive(Debug, Clone)]
pub struct TraceSet {
    pub label: String,
    pub dir: PathBuf,
}

impl TraceSet {
    pub fn new(label: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            label: label.into(),
            dir: dir.into(),
        }
    }

    /// Label taken from the directory name.
    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let label = dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| dir.display().to_string());
        Self { label, dir }
    }
}

#[derive(Debug, Clone)]
pub struct CompareRequest {
    pub base: TraceSet,
    pub test: TraceSet,
    /// Query producing `startup_latency_ms` and `render_latency_ms`.
    pub query: String,
    pub format: ReportFormat,
    pub output: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceMetrics {
    pub trace_file: PathBuf,
    pub iteration: u32,
    pub batch: usize,
    pub run_id: String,
    pub startup_latency_ms: f64,
    pub render_latency_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedTrace {
    pub trace_file: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MetricStats {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    pub stddev: f64,
}

impl MetricStats {
    /// Sample statistics; an empty slice yields all zeros.
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);

        let count = sorted.len();
        let mean = sorted.iter().sum::<f64>() / count as f64;
        let median = if count % 2 == 0 {
            (sorted[count / 2 - 1] + sorted[count / 2]) / 2.0
        } else {
            sorted[count / 2]
        };
        let stddev = if count > 1 {
            let variance =
                sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (count - 1) as f64;
            variance.sqrt()
        } else {
            0.0
        };

        Self {
            count,
            mean,
            median,
            min: sorted[0],
            max: sorted[count - 1],
            stddev,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
    pub batch: usize,
    pub run_id: String,
    pub startup_latency_ms: MetricStats,
    pub render_latency_ms: MetricStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct SideSummary {
    pub label: String,
    pub trace_dir: PathBuf,
    pub startup_latency_ms: MetricStats,
    pub render_latency_ms: MetricStats,
    pub batches: Vec<BatchSummary>,
    pub measurements: Vec<TraceMetrics>,
    pub skipped: Vec<SkippedTrace>,
}

impl SideSummary {
    fn new(set: &TraceSet, measurements: Vec<TraceMetrics>, skipped: Vec<SkippedTrace>) -> Self {
        let mut batches: Vec<BatchSummary> = Vec::new();
        for metrics in &measurements {
            if batches.iter().any(|b| b.batch == metrics.batch) {
                continue;
            }
            let members: Vec<&TraceMetrics> =
                measurements.iter().filter(|m| m.batch == metrics.batch).collect();
            batches.push(BatchSummary {
                batch: metrics.batch,
                run_id: metrics.run_id.clone(),
                startup_latency_ms: stats_of(&members, |m| m.startup_latency_ms),
                render_latency_ms: stats_of(&members, |m| m.render_latency_ms),
            });
        }

        let all: Vec<&TraceMetrics> = measurements.iter().collect();
        Self {
            label: set.label.clone(),
            trace_dir: set.dir.clone(),
            startup_latency_ms: stats_of(&all, |m| m.startup_latency_ms),
            render_latency_ms: stats_of(&all, |m| m.render_latency_ms),
            batches,
            measurements,
            skipped,
        }
    }

    fn stats(&self, metric: &str) -> MetricStats {
        if metric == RENDER_COLUMN {
            self.render_latency_ms
        } else {
            self.startup_latency_ms
        }
    }
}

fn stats_of(members: &[&TraceMetrics], value: impl Fn(&TraceMetrics) -> f64) -> MetricStats {
    let values: Vec<f64> = members.iter().map(|m| value(m)).collect();
    MetricStats::from_values(&values)
}

/// Test minus base. Positive deltas mean the test side is slower.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricDelta {
    pub metric: String,
    pub base_mean: f64,
    pub test_mean: f64,
    pub mean_delta_ms: f64,
    pub mean_delta_pct: Option<f64>,
    pub base_median: f64,
    pub test_median: f64,
    pub median_delta_ms: f64,
}

impl MetricDelta {
    fn between(metric: &str, base: MetricStats, test: MetricStats) -> Self {
        let mean_delta_ms = test.mean - base.mean;
        Self {
            metric: metric.to_string(),
            base_mean: base.mean,
            test_mean: test.mean,
            mean_delta_ms,
            mean_delta_pct: (base.mean != 0.0).then(|| mean_delta_ms / base.mean * 100.0),
            base_median: base.median,
            test_median: test.median,
            median_delta_ms: test.median - base.median,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Comparison {
    pub format: ReportFormat,
    pub generated_at: DateTime<Utc>,
    pub query: String,
    pub base: SideSummary,
    pub test: SideSummary,
    pub deltas: Vec<MetricDelta>,
}

impl Comparison {
    pub fn new(format: ReportFormat, query: impl Into<String>, base: SideSummary, test: SideSummary) -> Self {
        let deltas = [STARTUP_COLUMN, RENDER_COLUMN]
            .into_iter()
            .map(|metric| MetricDelta::between(metric, base.stats(metric), test.stats(metric)))
            .collect();
        Self {
            format,
            generated_at: Utc::now(),
            query: query.into(),
            base,
            test,
            deltas,
        }
    }

    pub fn skipped(&self) -> usize {
        self.base.skipped.len() + self.test.skipped.len()
    }

    /// `<reports_dir>/compare-<base>-vs-<test>-<timestamp>.<ext>`
    pub fn default_path(&self, reports_dir: &Path) -> PathBuf {
        reports_dir.join(format!(
            "compare-{}-vs-{}-{}.{}",
            sanitize_component(&self.base.label),
            sanitize_component(&self.test.label),
            self.generated_at.format("%Y%m%d-%H%M%S"),
            self.format.extension()
        ))
    }

    pub fn render(&self) -> Result<String> {
        match self.format {
            ReportFormat::Csv => self.render_csv(),
            ReportFormat::Json => Ok(serde_json::to_string_pretty(self)?),
            ReportFormat::Html => self.render_html(),
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let content = self.render()?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(PerftestError::at(parent))?;
        }
        fs::write(path, content).map_err(PerftestError::at(path))
    }

    /// One line per metric: both sides' statistics, then the deltas.
    fn render_csv(&self) -> Result<String> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        let mut header = vec!["metric".to_string()];
        for side in ["base", "test"] {
            for stat in ["count", "mean", "median", "min", "max", "stddev"] {
                header.push(format!("{side}_{stat}"));
            }
        }
        header.extend(["mean_delta_ms", "mean_delta_pct", "median_delta_ms"].map(String::from));
        writer.write_record(&header).map_err(csv_error)?;

        for delta in &self.deltas {
            let mut record = vec![delta.metric.clone()];
            for side in [&self.base, &self.test] {
                let stats = side.stats(&delta.metric);
                record.push(stats.count.to_string());
                record.extend(
                    [stats.mean, stats.median, stats.min, stats.max, stats.stddev].map(ms),
                );
            }
            record.push(ms(delta.mean_delta_ms));
            record.push(delta.mean_delta_pct.map(ms).unwrap_or_default());
            record.push(ms(delta.median_delta_ms));
            writer.write_record(&record).map_err(csv_error)?;
        }

        let bytes = writer
            .into_inner()
            .map_err(|err| PerftestError::Report(err.to_string()))?;
        String::from_utf8(bytes).map_err(|err| PerftestError::Report(err.to_string()))
    }

    fn render_html(&self) -> Result<String> {
        let mut env = Environment::new();
        env.add_template("compare.html", HTML_TEMPLATE)
            .map_err(|err| PerftestError::Report(err.to_string()))?;
        let template = env
            .get_template("compare.html")
            .map_err(|err| PerftestError::Report(err.to_string()))?;
        template
            .render(context! { comparison => self })
            .map_err(|err| PerftestError::Report(err.to_string()))
    }
}

fn ms(value: f64) -> String {
    format!("{value:.3}")
}

fn csv_error(err: csv::Error) -> PerftestError {
    PerftestError::Report(err.to_string())
}

/// Measure every iteration trace of one side. Traces that cannot be
/// measured are kept as skipped; a side with no measurement at all fails.
pub fn measure_side(
    engine: &dyn TraceProcessor,
    query: &Query,
    set: &TraceSet,
    pattern: &str,
) -> Result<SideSummary> {
    let mut measurements = Vec::new();
    let mut skipped = Vec::new();
    let mut discovered = 0;

    for (batch, (run_id, dir)) in discover_batches(&set.dir)?.into_iter().enumerate() {
        let traces = match discover_traces(&[], Some(&dir), pattern) {
            Ok(traces) => traces,
            Err(PerftestError::TraceFileNotFound(_)) => {
                warn!(batch = %dir.display(), "Batch has no traces");
                continue;
            }
            Err(err) => return Err(err),
        };
        discovered += traces.len();

        for trace in traces {
            match measure_trace(engine, query, &trace) {
                Ok((iteration, startup, render)) => measurements.push(TraceMetrics {
                    trace_file: trace,
                    iteration,
                    batch,
                    run_id: run_id.clone(),
                    startup_latency_ms: startup,
                    render_latency_ms: render,
                }),
                Err(reason) => {
                    debug!(trace = %trace.display(), reason = %reason, "Trace skipped");
                    skipped.push(SkippedTrace {
                        trace_file: trace,
                        reason,
                    });
                }
            }
        }
    }

    if discovered == 0 {
        return Err(PerftestError::TraceFileNotFound(set.dir.clone()));
    }
    if measurements.is_empty() {
        return Err(PerftestError::Analysis {
            query: query.name.clone(),
            trace: set.dir.clone(),
            message: format!(
                "no trace yielded {STARTUP_COLUMN} and {RENDER_COLUMN} ({} skipped)",
                skipped.len()
            ),
        });
    }
    if !skipped.is_empty() {
        warn!(side = %set.label, skipped = skipped.len(), "Some traces were not measured");
    }
    info!(side = %set.label, measured = measurements.len(), "Side measured");
    Ok(SideSummary::new(set, measurements, skipped))
}

fn measure_trace(
    engine: &dyn TraceProcessor,
    query: &Query,
    trace: &Path,
) -> std::result::Result<(u32, f64, f64), String> {
    let name = trace
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let iteration = iteration_number(&name).ok_or("file name has no iter<N> marker")?;

    let mut session = engine.open(trace).map_err(|err| err.to_string())?;
    let table = session.query(query).map_err(|err| err.to_string())?;
    let row = table.rows.first().ok_or("startup markers missing from trace")?;
    let column = |name: &str| {
        table
            .columns
            .iter()
            .position(|c| c == name)
            .and_then(|idx| row.get(idx))
            .and_then(Value::as_f64)
    };
    match (column(STARTUP_COLUMN), column(RENDER_COLUMN)) {
        (Some(startup), Some(render)) => Ok((iteration, startup, render)),
        _ => Err(format!("query returned no {STARTUP_COLUMN}/{RENDER_COLUMN}")),
    }
}

/// Digits following the first `iter` that has any, e.g. `coldStartup_iter12`.
pub fn iteration_number(file_name: &str) -> Option<u32> {
    file_name.match_indices("iter").find_map(|(idx, marker)| {
        let digits: String = file_name[idx + marker.len()..]
            .chars()
            .take_while(char::is_ascii_digit)
            .collect();
        digits.parse().ok()
    })
}

/// `(run id, directory)` per batch, sorted by directory name.
fn discover_batches(root: &Path) -> Result<Vec<(String, PathBuf)>> {
    if !root.is_dir() {
        return Err(PerftestError::TraceFileNotFound(root.to_path_buf()));
    }

    let mut batches: Vec<(String, PathBuf)> = fs::read_dir(root)
        .map_err(PerftestError::at(root))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.join("run.json").is_file())
        .filter_map(|path| {
            let name = path.file_name()?.to_string_lossy().into_owned();
            (!name.starts_with('.')).then_some((name, path))
        })
        .collect();
    batches.sort();

    if batches.is_empty() {
        let name = root
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| root.display().to_string());
        batches.push((name, root.to_path_buf()));
    }
    Ok(batches)
}
