mod common;

use std::fs;

use common::{FakeTraceProcessor, startup_trace, write_file};
use perftest::PerftestError;
use perftest::analysis::{
    AnalyzeRequest, Analyzer, CompareRequest, QueryLibrary, ReportFormat, TraceSet,
};
use tempfile::tempdir;

fn request(traces: Vec<std::path::PathBuf>, queries: &[&str], format: ReportFormat) -> AnalyzeRequest {
    AnalyzeRequest {
        trace_files: traces,
        trace_dir: None,
        queries: queries.iter().map(|q| q.to_string()).collect(),
        custom_queries: Vec::new(),
        format,
        output: None,
    }
}

#[test]
fn failing_query_is_reported_next_to_successful_ones() {
    let temp = tempdir().unwrap();
    let trace = write_file(&temp.path().join("traces/startup.perfetto-trace"), b"trace");
    let analyzer = Analyzer::new(
        Box::new(FakeTraceProcessor::failing(&["cpu_usage"])),
        QueryLibrary::default(),
        temp.path().join("reports"),
        "*.perfetto-trace",
    );

    let outcome = analyzer
        .run(&request(vec![trace.clone()], &["frame_metrics", "cpu_usage"], ReportFormat::Json))
        .unwrap();

    let report = &outcome.report;
    assert_eq!(report.sections.len(), 2);
    assert_eq!(report.sections[0].query_name, "frame_metrics");
    assert!(report.sections[0].error.is_none());
    assert_eq!(report.sections[0].rows.len(), 1);
    assert_eq!(report.sections[1].query_name, "cpu_usage");
    assert!(report.sections[1].error.as_deref().unwrap().contains("no such table"));
    assert!(report.is_partial());

    assert!(outcome.path.starts_with(temp.path().join("reports")));
    let written: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&outcome.path).unwrap()).unwrap();
    assert_eq!(written["summary"]["succeeded"], 1);
    assert_eq!(written["summary"]["failed"], 1);
}

#[test]
fn every_trace_gets_every_query() {
    let temp = tempdir().unwrap();
    let dir = temp.path().join("traces");
    write_file(&dir.join("Pixel_7/a.perfetto-trace"), b"t");
    write_file(&dir.join("Pixel_8/b.perfetto-trace"), b"t");
    write_file(&dir.join("Pixel_8/c.perfetto-trace"), b"t");
    write_file(&dir.join("Pixel_8/logcat.txt"), b"log");

    let engine = FakeTraceProcessor::failing(&["memory_usage"]);
    let opened = engine.opened.clone();
    let analyzer = Analyzer::new(
        Box::new(engine),
        QueryLibrary::default(),
        temp.path().join("reports"),
        "*.perfetto-trace",
    );

    let mut req = request(
        Vec::new(),
        &["frame_metrics", "cpu_usage", "memory_usage"],
        ReportFormat::Csv,
    );
    req.trace_dir = Some(dir);
    let outcome = analyzer.run(&req).unwrap();

    let summary = &outcome.report.summary;
    assert_eq!(summary.traces, 3);
    assert_eq!(summary.queries, 3);
    assert_eq!(summary.succeeded + summary.failed, 9);
    assert_eq!(summary.failed, 3);
    assert_eq!(opened.borrow().len(), 3);

    let csv = fs::read_to_string(&outcome.path).unwrap();
    assert_eq!(csv.lines().count(), 10);
}

#[test]
fn unreadable_trace_fills_every_query_slot() {
    let temp = tempdir().unwrap();
    let good = write_file(&temp.path().join("good.perfetto-trace"), b"t");
    let gone = write_file(&temp.path().join("gone.perfetto-trace"), b"t");
    let analyzer = Analyzer::new(
        Box::new(FakeTraceProcessor::default()),
        QueryLibrary::default(),
        temp.path().join("reports"),
        "*.perfetto-trace",
    );
    let queries = QueryLibrary::default()
        .resolve_all(&["frame_metrics".into(), "cpu_usage".into()], &[])
        .unwrap();
    fs::remove_file(&gone).unwrap();

    let results = analyzer.analyze(&[good, gone.clone()], &queries);
    assert_eq!(results.len(), 4);
    assert!(results[2..].iter().all(|r| r.source_trace == gone && r.error.is_some()));
}

#[test]
fn custom_query_file_is_named_after_its_stem() {
    let temp = tempdir().unwrap();
    let trace = write_file(&temp.path().join("a.perfetto-trace"), b"t");
    let custom = write_file(&temp.path().join("sql/binder_calls.sql"), b"SELECT 1;");
    let analyzer = Analyzer::new(
        Box::new(FakeTraceProcessor::default()),
        QueryLibrary::default(),
        temp.path().join("reports"),
        "*.perfetto-trace",
    );

    let mut req = request(vec![trace], &[], ReportFormat::Html);
    req.custom_queries = vec![custom];
    req.output = Some(temp.path().join("out/report.html"));
    let outcome = analyzer.run(&req).unwrap();

    assert_eq!(outcome.path, temp.path().join("out/report.html"));
    assert_eq!(outcome.report.sections[0].query_name, "binder_calls");
    let html = fs::read_to_string(&outcome.path).unwrap();
    assert!(html.contains("binder_calls"));
}

#[test]
fn unknown_query_fails_before_opening_traces() {
    let temp = tempdir().unwrap();
    let trace = write_file(&temp.path().join("a.perfetto-trace"), b"t");
    let engine = FakeTraceProcessor::default();
    let opened = engine.opened.clone();
    let analyzer = Analyzer::new(
        Box::new(engine),
        QueryLibrary::default(),
        temp.path().join("reports"),
        "*.perfetto-trace",
    );

    let err = analyzer
        .run(&request(vec![trace], &["gpu_usage"], ReportFormat::Csv))
        .unwrap_err();
    assert!(matches!(err, PerftestError::QueryNotFound { .. }));
    assert!(opened.borrow().is_empty());
}

#[test]
fn directory_without_traces_is_an_error() {
    let temp = tempdir().unwrap();
    write_file(&temp.path().join("traces/run.json"), b"{}");
    let analyzer = Analyzer::new(
        Box::new(FakeTraceProcessor::default()),
        QueryLibrary::default(),
        temp.path().join("reports"),
        "*.perfetto-trace",
    );

    let mut req = request(Vec::new(), &["frame_metrics"], ReportFormat::Csv);
    req.trace_dir = Some(temp.path().join("traces"));
    let err = analyzer.run(&req).unwrap_err();
    assert!(matches!(err, PerftestError::TraceFileNotFound(_)));
    assert!(!temp.path().join("reports").exists());
}

#[test]
fn trace_named_explicitly_and_by_directory_is_analyzed_once() {
    let temp = tempdir().unwrap();
    let dir = temp.path().join("traces");
    write_file(&dir.join("a.perfetto-trace"), b"t");
    let b = write_file(&dir.join("b.perfetto-trace"), b"t");
    let analyzer = Analyzer::new(
        Box::new(FakeTraceProcessor::default()),
        QueryLibrary::default(),
        temp.path().join("reports"),
        "*.perfetto-trace",
    );

    let mut req = request(vec![b], &["frame_metrics", "cpu_usage"], ReportFormat::Json);
    req.trace_dir = Some(dir);
    let outcome = analyzer.run(&req).unwrap();

    assert_eq!(outcome.report.summary.traces, 2);
    assert_eq!(outcome.report.sections.len(), 4);
}

fn compare_request(base: &std::path::Path, test: &std::path::Path, format: ReportFormat) -> CompareRequest {
    CompareRequest {
        base: TraceSet::new("main_abc123", base),
        test: TraceSet::new("feature_def456", test),
        query: "startup_metrics".into(),
        format,
        output: None,
    }
}

#[test]
fn compare_summarizes_both_sides_by_batch() {
    let temp = tempdir().unwrap();
    let base = temp.path().join("base");
    for run in ["run-1", "run-2"] {
        write_file(&base.join(run).join("run.json"), b"{}");
    }
    startup_trace(&base.join("run-1/Pixel_7_14/coldStartup_iter1.perfetto-trace"), 100.0, 150.0);
    startup_trace(&base.join("run-1/Pixel_7_14/coldStartup_iter2.perfetto-trace"), 200.0, 250.0);
    startup_trace(&base.join("run-2/Pixel_7_14/coldStartup_iter1.perfetto-trace"), 300.0, 350.0);
    write_file(&base.join("run-2/Pixel_7_14/coldStartup_iter2.perfetto-trace"), b"no markers");

    let test = temp.path().join("test");
    startup_trace(&test.join("Pixel_7_14/coldStartup_iter1.perfetto-trace"), 250.0, 300.0);
    startup_trace(&test.join("Pixel_7_14/coldStartup_iter2.perfetto-trace"), 250.0, 300.0);
    startup_trace(&test.join("Pixel_7_14/warmup.perfetto-trace"), 1.0, 1.0);

    let analyzer = Analyzer::new(
        Box::new(FakeTraceProcessor::default()),
        QueryLibrary::default(),
        temp.path().join("reports"),
        "*.perfetto-trace",
    );
    let outcome = analyzer
        .compare(&compare_request(&base, &test, ReportFormat::Csv))
        .unwrap();
    let comparison = &outcome.comparison;

    assert_eq!(comparison.base.measurements.len(), 3);
    assert_eq!(comparison.base.skipped.len(), 1);
    assert_eq!(comparison.base.batches.len(), 2);
    assert_eq!(comparison.base.batches[0].run_id, "run-1");
    assert_eq!(comparison.base.batches[0].startup_latency_ms.mean, 150.0);
    assert_eq!(comparison.base.batches[1].run_id, "run-2");
    assert_eq!(comparison.base.startup_latency_ms.mean, 200.0);
    assert_eq!(comparison.test.batches.len(), 1);
    assert_eq!(comparison.test.batches[0].run_id, "test");
    assert!(comparison.test.skipped[0].reason.contains("iter"));
    assert!(
        comparison.base.measurements.iter().map(|m| m.iteration).eq([1, 2, 1]),
        "iterations come from file names"
    );

    let startup = &comparison.deltas[0];
    assert_eq!(startup.metric, "startup_latency_ms");
    assert_eq!(startup.mean_delta_ms, 50.0);
    assert_eq!(startup.mean_delta_pct, Some(25.0));
    assert_eq!(comparison.deltas[1].metric, "render_latency_ms");

    let file_name = outcome.path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(file_name.starts_with("compare-main_abc123-vs-feature_def456-"));
    let csv = fs::read_to_string(&outcome.path).unwrap();
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("metric,base_count,base_mean,base_median"));
    assert!(lines[1].starts_with("startup_latency_ms,3,200.000,200.000,100.000,300.000,100.000,2,250.000"));
    assert!(lines[1].ends_with("50.000,25.000,50.000"));
}

#[test]
fn compare_fails_when_a_side_has_no_measurable_trace() {
    let temp = tempdir().unwrap();
    let base = temp.path().join("base");
    startup_trace(&base.join("coldStartup_iter1.perfetto-trace"), 100.0, 150.0);
    let test = temp.path().join("test");
    write_file(&test.join("coldStartup_iter1.perfetto-trace"), b"no markers");

    let analyzer = Analyzer::new(
        Box::new(FakeTraceProcessor::default()),
        QueryLibrary::default(),
        temp.path().join("reports"),
        "*.perfetto-trace",
    );
    let err = analyzer
        .compare(&compare_request(&base, &test, ReportFormat::Json))
        .unwrap_err();
    assert!(matches!(err, PerftestError::Analysis { .. }));
    assert!(err.to_string().contains("1 skipped"));

    let missing = analyzer
        .compare(&compare_request(&base, &temp.path().join("absent"), ReportFormat::Json))
        .unwrap_err();
    assert!(matches!(missing, PerftestError::TraceFileNotFound(_)));
    assert!(!temp.path().join("reports").exists());
}
