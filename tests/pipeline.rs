mod common;

use std::fs;

use common::{
    FakeClock, FakeDeviceFarm, FakeFetcher, FakeTool, FakeTraceProcessor, identity, test_options,
    variant,
};
use perftest::analysis::{Analyzer, QueryLibrary, ReportFormat};
use perftest::build::BuildStage;
use perftest::devicefarm::RunStatus;
use perftest::pipeline::{FullRunRequest, Pipeline, PipelineStage};
use perftest::testrun::TestStage;
use perftest::{ArtifactCache, PerftestError};
use tempfile::{TempDir, tempdir};

struct Harness {
    temp: TempDir,
    fetcher: FakeFetcher,
    tool: FakeTool,
    farm: FakeDeviceFarm,
    engine: FakeTraceProcessor,
}

impl Harness {
    fn new(farm: FakeDeviceFarm) -> Self {
        Self {
            temp: tempdir().unwrap(),
            fetcher: FakeFetcher::default(),
            tool: FakeTool::default(),
            farm,
            engine: FakeTraceProcessor::default(),
        }
    }

    fn output(&self) -> std::path::PathBuf {
        self.temp.path().join("output")
    }

    fn pipeline(&self) -> Pipeline {
        let output = self.output();
        Pipeline::new(
            BuildStage::new(
                ArtifactCache::new(&output),
                Box::new(self.fetcher.clone()),
                Box::new(self.tool.clone()),
            ),
            TestStage::new(
                Box::new(self.farm.clone()),
                Box::new(FakeClock::default()),
                &output,
            ),
            Analyzer::new(
                Box::new(self.engine.clone()),
                QueryLibrary::default(),
                output.join("reports"),
                "*.perfetto-trace",
            ),
            output.join("reports"),
        )
    }
}

fn request(skip_build: bool) -> FullRunRequest {
    FullRunRequest {
        identity: identity("main", "abc123"),
        baseline: None,
        variant: variant(),
        test: test_options(),
        skip_build,
        skip_analysis: false,
        queries: vec!["frame_metrics".into(), "cpu_usage".into()],
        custom_queries: Vec::new(),
        format: ReportFormat::Json,
    }
}

#[test]
fn full_run_builds_tests_and_analyzes() {
    let harness = Harness::new(
        FakeDeviceFarm::new().with_device("Pixel 7", &["cold.perfetto-trace"], &[]),
    );
    let pipeline = harness.pipeline();

    let result = pipeline.full_run(&request(false)).unwrap();

    assert!(!result.build.as_ref().unwrap().cache_hit);
    assert_eq!(result.test.as_ref().unwrap().run.status, RunStatus::Completed);
    assert!(result.report_path.as_ref().unwrap().is_file());
    let summary = result.report_summary.as_ref().unwrap();
    assert_eq!((summary.traces, summary.queries, summary.failed), (1, 2, 0));
    assert!(!result.is_partial_analysis());

    let summary_path = result.summary_path.as_ref().unwrap();
    let file_name = summary_path.file_name().unwrap().to_string_lossy();
    assert!(file_name.starts_with("full-run-main_abc123-"));
    let written: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(summary_path).unwrap()).unwrap();
    assert!(written["failed_stage"].is_null());

    let metrics = pipeline.metrics().snapshot();
    for stage in ["build.fetch", "build.compile", "test.upload", "test.wait", "analyze.trace"] {
        assert!(metrics.stages.contains_key(stage), "missing timing for {stage}");
    }
}

#[test]
fn skip_build_without_cache_fails_fast() {
    let harness = Harness::new(FakeDeviceFarm::new());

    let err = harness.pipeline().full_run(&request(true)).unwrap_err();

    assert_eq!(err.stage, PipelineStage::Build);
    assert!(matches!(err.source, PerftestError::ArtifactsNotFound(_)));
    assert!(err.source.to_string().contains("not found in cache"));
    assert_eq!(harness.fetcher.calls.get(), 0);
    assert_eq!(harness.tool.calls.get(), 0);
    assert!(harness.farm.state.borrow().uploads.is_empty());
}

#[test]
fn skip_build_uses_a_previous_build() {
    let harness = Harness::new(
        FakeDeviceFarm::new().with_device("Pixel 7", &["cold.perfetto-trace"], &[]),
    );
    harness.pipeline().full_run(&request(false)).unwrap();

    let result = harness.pipeline().full_run(&request(true)).unwrap();
    assert!(result.build.unwrap().cache_hit);
    assert_eq!(harness.tool.calls.get(), 1);
}

#[test]
fn analysis_without_traces_keeps_the_test_run() {
    let harness = Harness::new(FakeDeviceFarm::new().with_device("Pixel 7", &[], &[]));

    let err = harness.pipeline().full_run(&request(false)).unwrap_err();

    assert_eq!(err.stage, PipelineStage::Analyze);
    assert!(matches!(err.source, PerftestError::TraceFileNotFound(_)));
    let test = err.partial.test.as_ref().unwrap();
    assert_eq!(test.run.status, RunStatus::Completed);
    assert!(err.partial.artifacts().is_some());

    let written: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(err.partial.summary_path.as_ref().unwrap()).unwrap(),
    )
    .unwrap();
    assert_eq!(written["failed_stage"], "analyze");
}

#[test]
fn skip_analysis_stops_after_the_test_stage() {
    let harness = Harness::new(FakeDeviceFarm::new().with_device("Pixel 7", &[], &[]));
    let mut req = request(false);
    req.skip_analysis = true;

    let result = harness.pipeline().full_run(&req).unwrap();
    assert!(result.test.is_some());
    assert!(result.report_path.is_none());
}

#[test]
fn test_timeout_aborts_analysis() {
    let harness = Harness::new(FakeDeviceFarm::new().run_script(vec![("RUNNING", None)]));

    let err = harness.pipeline().full_run(&request(false)).unwrap_err();

    assert_eq!(err.stage, PipelineStage::Test);
    assert!(err.source.is_timeout());
    assert!(err.partial.build.is_some());
    assert!(err.partial.test.is_none());
    assert!(err.partial.report_path.is_none());
}

#[test]
fn partial_query_failure_is_flagged() {
    let mut harness = Harness::new(
        FakeDeviceFarm::new().with_device("Pixel 7", &["cold.perfetto-trace"], &[]),
    );
    harness.engine = FakeTraceProcessor::failing(&["cpu_usage"]);

    let result = harness.pipeline().full_run(&request(false)).unwrap();
    assert!(result.is_partial_analysis());
}

#[test]
fn baseline_is_built_tested_and_compared() {
    let harness = Harness::new(
        FakeDeviceFarm::new()
            .with_device(
                "Pixel 7",
                &["coldStartup_iter1.perfetto-trace", "coldStartup_iter2.perfetto-trace"],
                &[],
            )
            .startup_per_run(vec![(200.0, 300.0), (260.0, 330.0)]),
    );
    let mut req = request(false);
    req.identity = identity("feature", "abc123");
    req.baseline = Some(identity("main", "0ff1ce"));

    let result = harness.pipeline().full_run(&req).unwrap();

    assert_eq!(harness.tool.calls.get(), 2);
    assert_eq!(harness.farm.state.borrow().scheduled.len(), 2);
    let baseline_traces = &result.baseline_test.as_ref().unwrap().downloads.as_ref().unwrap().trace_dir;
    let target_traces = &result.test.as_ref().unwrap().downloads.as_ref().unwrap().trace_dir;
    assert_ne!(baseline_traces, target_traces);

    let deltas = result.comparison.as_ref().unwrap();
    assert_eq!(deltas[0].metric, "startup_latency_ms");
    assert_eq!(deltas[0].mean_delta_ms, 60.0);
    assert_eq!(deltas[1].mean_delta_ms, 30.0);
    assert!(result.report_summary.is_none());

    let report = result.report_path.as_ref().unwrap();
    let name = report.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("compare-main_0ff1ce-vs-feature_abc123-"), "{name}");
    let written: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(report).unwrap()).unwrap();
    assert_eq!(written["base"]["startup_latency_ms"]["count"], 2);
}
