#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use perftest::analysis::{Query, QueryTable, TraceProcessor, TraceSession};
use perftest::build::{BuildTool, BuildVariant, SourceFetcher};
use perftest::config::DeviceFarmConfig;
use perftest::devicefarm::{
    Artifact, ArtifactCategory, DeviceFarm, Device, DevicePool, Job, RemoteRun, ScheduleRunRequest,
    Suite, Test, Upload, UploadType,
};
use perftest::poll::{Clock, PollPolicy};
use perftest::testrun::TestOptions;
use perftest::{ArtifactSet, BuildIdentity, PerftestError, Result};
use serde_json::json;

pub const PROJECT_ARN: &str = "arn:aws:devicefarm:us-west-2:123456789012:project:perf";
pub const POOL_ARN: &str = "arn:aws:devicefarm:us-west-2:123456789012:devicepool:perf/pixels";
pub const RUN_ARN: &str = "arn:aws:devicefarm:us-west-2:123456789012:run:perf/run-1";

pub fn identity(branch: &str, commit: &str) -> BuildIdentity {
    BuildIdentity::new(branch, commit).unwrap()
}

pub fn variant() -> BuildVariant {
    BuildVariant::new(None, "debug")
}

/// Clock that advances only when something sleeps on it.
#[derive(Default)]
pub struct FakeClock {
    now: Cell<Duration>,
}

impl Clock for FakeClock {
    fn now(&self) -> Duration {
        self.now.get()
    }

    fn sleep(&self, duration: Duration) {
        self.now.set(self.now.get() + duration);
    }
}

#[derive(Clone, Default)]
pub struct FakeFetcher {
    pub calls: Rc<Cell<usize>>,
}

impl SourceFetcher for FakeFetcher {
    fn fetch(&self, _identity: &BuildIdentity, dest: &Path) -> Result<()> {
        self.calls.set(self.calls.get() + 1);
        fs::create_dir_all(dest).map_err(PerftestError::at(dest))?;
        fs::write(dest.join("gradlew"), "#!/bin/sh\n").map_err(PerftestError::at(dest))
    }
}

/// Writes two small APKs into the checkout, like a successful Gradle run.
#[derive(Clone, Default)]
pub struct FakeTool {
    pub calls: Rc<Cell<usize>>,
    pub fail: bool,
}

impl BuildTool for FakeTool {
    fn build(&self, project: &Path, variant: &BuildVariant) -> Result<ArtifactSet> {
        self.calls.set(self.calls.get() + 1);
        if self.fail {
            return Err(PerftestError::BuildTool {
                tool: format!("gradlew assemble{}", variant.task_suffix()),
                status: "exit status: 1".into(),
                tail: "BUILD FAILED".into(),
            });
        }
        let app_dir = project.join("app/build/outputs/apk/debug");
        let test_dir = project.join("benchmark/build/outputs/apk/debug");
        fs::create_dir_all(&app_dir).map_err(PerftestError::at(&app_dir))?;
        fs::create_dir_all(&test_dir).map_err(PerftestError::at(&test_dir))?;
        let app = app_dir.join("app-debug.apk");
        let test = test_dir.join("benchmark-debug.apk");
        fs::write(&app, b"PK\x03\x04app").map_err(PerftestError::at(&app))?;
        fs::write(&test, b"PK\x03\x04test").map_err(PerftestError::at(&test))?;
        ArtifactSet::from_paths(app, test)
    }
}

#[derive(Default)]
pub struct FarmState {
    pub pools: Vec<DevicePool>,
    pub upload_status: String,
    /// Statuses returned by successive `get_run` calls; the last one repeats.
    pub run_script: Vec<(&'static str, Option<&'static str>)>,
    pub jobs: Vec<Job>,
    pub suites: HashMap<String, Vec<Suite>>,
    pub tests: HashMap<String, Vec<Test>>,
    pub artifacts: HashMap<String, Vec<Artifact>>,
    pub files: HashMap<String, Vec<u8>>,
    pub uploads: Vec<(String, UploadType)>,
    pub scheduled: Vec<ScheduleRunRequest>,
    pub get_run_calls: usize,
    pub list_jobs_fails: bool,
    /// `(startup_ms, render_ms)` written into every trace of the n-th run.
    pub startup_per_run: Vec<(f64, f64)>,
}

/// In-process Device Farm. Clones share state so tests can inspect calls
/// after handing a box to the stage.
#[derive(Clone)]
pub struct FakeDeviceFarm {
    pub state: Rc<RefCell<FarmState>>,
}

impl FakeDeviceFarm {
    pub fn new() -> Self {
        let state = FarmState {
            pools: vec![DevicePool {
                arn: POOL_ARN.into(),
                name: "Pixel pool".into(),
                pool_type: Some("PRIVATE".into()),
            }],
            upload_status: "SUCCEEDED".into(),
            run_script: vec![("SCHEDULING", None), ("RUNNING", None), ("COMPLETED", Some("PASSED"))],
            ..FarmState::default()
        };
        Self {
            state: Rc::new(RefCell::new(state)),
        }
    }

    /// Add a device job whose single test produced `traces`. Traces listed
    /// in `broken` have no downloadable content.
    pub fn with_device(self, name: &str, traces: &[&str], broken: &[&str]) -> Self {
        {
            let mut state = self.state.borrow_mut();
            let index = state.jobs.len();
            let job_arn = format!("arn:aws:devicefarm:us-west-2:123456789012:job:perf/run-1/{index}");
            let suite_arn = format!("{job_arn}/suite");
            let test_arn = format!("{suite_arn}/test");
            state.jobs.push(Job {
                arn: job_arn.clone(),
                name: name.into(),
                status: "COMPLETED".into(),
                result: Some("PASSED".into()),
                device: Some(Device {
                    name: name.into(),
                    os: Some("14".into()),
                }),
            });
            state.suites.insert(
                job_arn.clone(),
                vec![Suite {
                    arn: suite_arn.clone(),
                    name: "Instrumentation".into(),
                }],
            );
            state.tests.insert(
                suite_arn,
                vec![Test {
                    arn: test_arn.clone(),
                    name: "startup".into(),
                }],
            );

            let mut artifacts = Vec::new();
            for (n, trace) in traces.iter().enumerate() {
                let url = format!("https://files.example.test/{index}/{n}/{trace}");
                if !broken.contains(trace) {
                    state.files.insert(url.clone(), format!("trace {trace}").into_bytes());
                }
                artifacts.push(Artifact {
                    arn: format!("{test_arn}/artifact/{n}"),
                    name: trace.trim_end_matches(".perfetto-trace").into(),
                    artifact_type: "CUSTOMER_ARTIFACT_LOG".into(),
                    extension: "perfetto-trace".into(),
                    url,
                });
            }
            state.artifacts.insert(test_arn, artifacts);
        }
        self
    }

    pub fn startup_per_run(self, values: Vec<(f64, f64)>) -> Self {
        self.state.borrow_mut().startup_per_run = values;
        self
    }

    pub fn run_script(self, script: Vec<(&'static str, Option<&'static str>)>) -> Self {
        self.state.borrow_mut().run_script = script;
        self
    }

    /// Each scheduled run gets its own ARN: `run-1`, `run-2`, ...
    fn remote_run(&self, status: &str, result: Option<&str>) -> RemoteRun {
        let runs = self.state.borrow().scheduled.len().max(1);
        RemoteRun {
            arn: RUN_ARN.replace("run-1", &format!("run-{runs}")),
            name: "perftest".into(),
            status: status.into(),
            result: result.map(str::to_string),
            device_pool_arn: Some(POOL_ARN.into()),
            started: Some(1_700_000_000.0),
            stopped: None,
            counters: None,
        }
    }
}

impl DeviceFarm for FakeDeviceFarm {
    fn list_device_pools(&self, _project_arn: &str) -> Result<Vec<DevicePool>> {
        Ok(self.state.borrow().pools.clone())
    }

    fn create_upload(&self, _project_arn: &str, name: &str, kind: UploadType) -> Result<Upload> {
        let mut state = self.state.borrow_mut();
        state.uploads.push((name.to_string(), kind));
        Ok(Upload {
            arn: format!("arn:aws:devicefarm:us-west-2:123456789012:upload:perf/{}", state.uploads.len()),
            name: name.to_string(),
            status: "INITIALIZED".into(),
            url: Some("https://uploads.example.test/put".into()),
            message: None,
            metadata: None,
        })
    }

    fn upload_file(&self, _upload: &Upload, path: &Path) -> Result<()> {
        if path.is_file() {
            Ok(())
        } else {
            Err(PerftestError::remote("UploadFile", format!("{} missing", path.display())))
        }
    }

    fn get_upload(&self, arn: &str) -> Result<Upload> {
        Ok(Upload {
            arn: arn.to_string(),
            name: String::new(),
            status: self.state.borrow().upload_status.clone(),
            url: None,
            message: None,
            metadata: None,
        })
    }

    fn schedule_run(&self, request: &ScheduleRunRequest) -> Result<RemoteRun> {
        self.state.borrow_mut().scheduled.push(request.clone());
        Ok(self.remote_run("SCHEDULING", None))
    }

    fn get_run(&self, _arn: &str) -> Result<RemoteRun> {
        let (status, result) = {
            let mut state = self.state.borrow_mut();
            let index = state.get_run_calls.min(state.run_script.len().saturating_sub(1));
            state.get_run_calls += 1;
            state.run_script.get(index).copied().unwrap_or(("RUNNING", None))
        };
        Ok(self.remote_run(status, result))
    }

    fn list_jobs(&self, _run_arn: &str) -> Result<Vec<Job>> {
        let state = self.state.borrow();
        if state.list_jobs_fails {
            return Err(PerftestError::remote("ListJobs", "service unavailable"));
        }
        Ok(state.jobs.clone())
    }

    fn list_suites(&self, job_arn: &str) -> Result<Vec<Suite>> {
        Ok(self.state.borrow().suites.get(job_arn).cloned().unwrap_or_default())
    }

    fn list_tests(&self, suite_arn: &str) -> Result<Vec<Test>> {
        Ok(self.state.borrow().tests.get(suite_arn).cloned().unwrap_or_default())
    }

    fn list_artifacts(&self, arn: &str, _category: ArtifactCategory) -> Result<Vec<Artifact>> {
        Ok(self.state.borrow().artifacts.get(arn).cloned().unwrap_or_default())
    }

    fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        let state = self.state.borrow();
        let Some(content) = state.files.get(url) else {
            return Err(PerftestError::Remote {
                operation: "Download".into(),
                status: Some(403),
                code: None,
                message: format!("{url} expired"),
            });
        };
        let run = state.scheduled.len().saturating_sub(1);
        let content = match state.startup_per_run.get(run) {
            Some((startup, render)) => format!("{startup},{render}").into_bytes(),
            None => content.clone(),
        };
        fs::write(dest, &content).map_err(PerftestError::at(dest))?;
        Ok(content.len() as u64)
    }
}

/// Trace engine answering every query with one row, except the named
/// queries which fail.
#[derive(Clone, Default)]
pub struct FakeTraceProcessor {
    pub failing: HashSet<String>,
    pub opened: Rc<RefCell<Vec<PathBuf>>>,
}

impl FakeTraceProcessor {
    pub fn failing(queries: &[&str]) -> Self {
        Self {
            failing: queries.iter().map(|q| q.to_string()).collect(),
            ..Self::default()
        }
    }
}

impl TraceProcessor for FakeTraceProcessor {
    fn open(&self, trace: &Path) -> Result<Box<dyn TraceSession + '_>> {
        if !trace.is_file() {
            return Err(PerftestError::TraceFileNotFound(trace.to_path_buf()));
        }
        self.opened.borrow_mut().push(trace.to_path_buf());
        Ok(Box::new(FakeSession {
            failing: &self.failing,
            trace: trace.to_path_buf(),
        }))
    }
}

struct FakeSession<'a> {
    failing: &'a HashSet<String>,
    trace: PathBuf,
}

impl TraceSession for FakeSession<'_> {
    fn query(&mut self, query: &Query) -> Result<QueryTable> {
        if self.failing.contains(&query.name) {
            return Err(PerftestError::Analysis {
                query: query.name.clone(),
                trace: self.trace.clone(),
                message: "no such table: sched".into(),
            });
        }
        if query.name == "startup_metrics" {
            return Ok(startup_table(&self.trace));
        }
        Ok(QueryTable {
            columns: vec!["metric".into(), "value".into()],
            rows: vec![vec![json!(query.name), json!(42)]],
        })
    }
}

/// Startup traces hold `<startup_ms>,<render_ms>`; anything else has no
/// startup markers and yields no rows.
fn startup_table(trace: &Path) -> QueryTable {
    let content = fs::read_to_string(trace).unwrap_or_default();
    let values: Vec<f64> = content
        .trim()
        .split(',')
        .filter_map(|v| v.parse().ok())
        .collect();
    let rows = match values.as_slice() {
        [startup, render] => vec![vec![json!(startup), json!(render)]],
        _ => Vec::new(),
    };
    QueryTable {
        columns: vec!["startup_latency_ms".into(), "render_latency_ms".into()],
        rows,
    }
}

pub fn startup_trace(path: &Path, startup_ms: f64, render_ms: f64) -> PathBuf {
    write_file(path, format!("{startup_ms},{render_ms}").as_bytes())
}

pub fn test_options() -> TestOptions {
    let config = DeviceFarmConfig {
        project_arn: PROJECT_ARN.into(),
        device_pool: Some("Pixel pool".into()),
        ..DeviceFarmConfig::default()
    };
    let mut options = TestOptions::from_config(&config);
    options.run_policy = PollPolicy::new(Duration::from_secs(10), Duration::from_secs(600));
    options.upload_policy = PollPolicy::new(Duration::from_secs(2), Duration::from_secs(60));
    options
}

pub fn write_file(path: &Path, content: &[u8]) -> PathBuf {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
    path.to_path_buf()
}
