//! Upload/test stage: push APKs to Device Farm, run them on a device pool,
//! wait for the run and collect traces per device.

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::cache::ArtifactSet;
use crate::config::DeviceFarmConfig;
use crate::devicefarm::artifacts::{extract_traces, sanitize_component};
use crate::devicefarm::{
    ArtifactCategory, Counters, DeviceFarm, ExecutionConfiguration, Job, RemoteRun, RunStatus,
    ScheduleRunRequest, ScheduleTest, Upload, UploadType, arn_id, is_arn,
};
use crate::error::{PerftestError, Result};
use crate::observability::MetricsCollector;
use crate::poll::{Clock, PollPolicy, PollState, Pollable, poll_until_terminal};

#[derive(Debug, Clone)]
pub struct TestOptions {
    pub project_arn: String,
    pub device_pool: String,
    pub run_name: Option<String>,
    pub test_type: String,
    pub test_filter: Option<String>,
    pub test_spec_template: Option<PathBuf>,
    pub iterations: Option<u32>,
    pub job_timeout_minutes: u32,
    pub run_policy: PollPolicy,
    pub upload_policy: PollPolicy,
    pub download_traces: bool,
    pub download_artifacts: bool,
    pub wait: bool,
}

impl TestOptions {
    pub fn from_config(config: &DeviceFarmConfig) -> Self {
        Self {
            project_arn: config.project_arn.clone(),
            device_pool: config.device_pool.clone().unwrap_or_default(),
            run_name: None,
            test_type: config.test_type.clone(),
            test_filter: config.test_filter.clone(),
            test_spec_template: config.test_spec_template.clone(),
            iterations: config.iterations,
            job_timeout_minutes: config.job_timeout_minutes,
            run_policy: PollPolicy::new(
                Duration::from_secs(config.poll_interval_secs),
                Duration::from_secs(config.test_timeout_secs),
            ),
            upload_policy: PollPolicy::new(
                Duration::from_secs(config.upload_poll_interval_secs),
                Duration::from_secs(config.upload_timeout_secs),
            ),
            download_traces: true,
            download_artifacts: true,
            wait: true,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.project_arn.trim().is_empty() {
            return Err(PerftestError::Config(
                "Device Farm project ARN is required (--project-arn or AWS_DEVICEFARM_PROJECT_ARN)"
                    .into(),
            ));
        }
        if self.device_pool.trim().is_empty() {
            return Err(PerftestError::Config(
                "device pool is required (--device-pool or DEVICEFARM_DEVICE_POOL)".into(),
            ));
        }
        self.validate_polling()
    }

    /// A zero interval would spin against the service without sleeping.
    fn validate_polling(&self) -> Result<()> {
        for (name, policy) in [("run", &self.run_policy), ("upload", &self.upload_policy)] {
            if policy.interval.is_zero() {
                return Err(PerftestError::Config(format!(
                    "{name} poll interval must be greater than zero"
                )));
            }
        }
        Ok(())
    }
}

/// Local view of a remote run. Every field comes from the service; nothing
/// here is inferred locally.
#[derive(Debug, Clone, Serialize)]
pub struct TestRun {
    pub run_arn: String,
    pub project_arn: String,
    pub device_pool_arn: Option<String>,
    pub name: String,
    pub status: RunStatus,
    pub result: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub counters: Option<Counters>,
    pub artifact_manifest: Vec<PathBuf>,
}

impl TestRun {
    fn from_remote(remote: &RemoteRun, project_arn: &str) -> Self {
        Self {
            run_arn: remote.arn.clone(),
            project_arn: project_arn.to_string(),
            device_pool_arn: remote.device_pool_arn.clone(),
            name: remote.name.clone(),
            status: remote.status(),
            result: remote.result.clone(),
            started_at: remote.started_at(),
            completed_at: remote.stopped_at(),
            counters: remote.counters.clone(),
            artifact_manifest: Vec::new(),
        }
    }

    pub fn run_id(&self) -> &str {
        arn_id(&self.run_arn)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadKind {
    Trace,
    Artifact,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadedFile {
    pub kind: DownloadKind,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceDownload {
    pub device: String,
    pub files: Vec<DownloadedFile>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DownloadReport {
    pub trace_dir: PathBuf,
    pub devices: Vec<DeviceDownload>,
}

impl DownloadReport {
    pub fn traces(&self) -> impl Iterator<Item = &Path> {
        self.devices
            .iter()
            .flat_map(|d| d.files.iter())
            .filter(|f| f.kind == DownloadKind::Trace)
            .map(|f| f.path.as_path())
    }

    pub fn failures(&self) -> impl Iterator<Item = &DeviceDownload> {
        self.devices.iter().filter(|d| d.error.is_some())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TestOutcome {
    pub run: TestRun,
    pub downloads: Option<DownloadReport>,
    pub summary_path: Option<PathBuf>,
}

pub struct TestStage {
    farm: Box<dyn DeviceFarm>,
    clock: Box<dyn Clock>,
    output_dir: PathBuf,
    metrics: MetricsCollector,
}

impl TestStage {
    pub fn new(farm: Box<dyn DeviceFarm>, clock: Box<dyn Clock>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            farm,
            clock,
            output_dir: output_dir.into(),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    /// Upload, schedule, wait and download. A timeout leaves the run active
    /// remotely; [`resume`](Self::resume) picks it up again by ARN.
    #[instrument(skip_all, fields(project = %options.project_arn, pool = %options.device_pool))]
    pub fn run(&self, artifacts: &ArtifactSet, options: &TestOptions) -> Result<TestOutcome> {
        options.validate()?;
        let pool_arn = self.resolve_pool(&options.project_arn, &options.device_pool)?;

        let (app_arn, test_arn, spec_arn) = {
            let _timer = self.metrics.start_stage("test.upload");
            let app = self.upload(&options.project_arn, &artifacts.app_apk, UploadType::AndroidApp, options)?;
            let test = self.upload(
                &options.project_arn,
                &artifacts.test_apk,
                UploadType::InstrumentationTestPackage,
                options,
            )?;
            let spec = match &options.test_spec_template {
                Some(template) => Some(self.upload_test_spec(template, options)?),
                None => None,
            };
            (app, test, spec)
        };

        let mut parameters = BTreeMap::new();
        if let Some(filter) = &options.test_filter {
            parameters.insert("TEST_CLASS".to_string(), filter.clone());
        }
        let request = ScheduleRunRequest {
            project_arn: options.project_arn.clone(),
            app_arn,
            device_pool_arn: pool_arn,
            name: options
                .run_name
                .clone()
                .unwrap_or_else(|| format!("perftest {}", Utc::now().format("%Y-%m-%d %H:%M:%S"))),
            test: ScheduleTest {
                test_type: options.test_type.clone(),
                test_package_arn: test_arn,
                test_spec_arn: spec_arn,
                parameters,
            },
            execution_configuration: ExecutionConfiguration {
                job_timeout_minutes: options.job_timeout_minutes,
                accounts_cleanup: true,
                app_packages_cleanup: true,
            },
        };

        let scheduled = self.farm.schedule_run(&request)?;
        info!(run_arn = %scheduled.arn, status = %scheduled.status, "Scheduled test run");

        if !options.wait {
            let run = TestRun::from_remote(&scheduled, &options.project_arn);
            return Ok(TestOutcome {
                run,
                downloads: None,
                summary_path: None,
            });
        }
        self.finish(&scheduled.arn, &options.project_arn, options)
    }

    /// Poll an existing run to completion and download its results.
    #[instrument(skip(self, options))]
    pub fn resume(&self, run_arn: &str, options: &TestOptions) -> Result<TestOutcome> {
        options.validate_polling()?;
        self.finish(run_arn, &options.project_arn, options)
    }

    fn finish(&self, run_arn: &str, project_arn: &str, options: &TestOptions) -> Result<TestOutcome> {
        let remote = {
            let _timer = self.metrics.start_stage("test.wait");
            let mut watcher = RunWatcher {
                farm: self.farm.as_ref(),
                arn: run_arn,
            };
            poll_until_terminal(&mut watcher, options.run_policy, self.clock.as_ref())?
        };

        let mut run = TestRun::from_remote(&remote, project_arn);
        match run.status {
            RunStatus::Completed => info!(run_arn, result = ?run.result, "Test run completed"),
            status => warn!(run_arn, %status, result = ?run.result, "Test run did not pass"),
        }

        let trace_root = self.output_dir.join("traces").join(run.run_id());
        let downloads = if options.download_traces || options.download_artifacts {
            let _timer = self.metrics.start_stage("test.download");
            let report = self.download_all(&run, &trace_root, options)?;
            run.artifact_manifest = report
                .devices
                .iter()
                .flat_map(|d| d.files.iter().map(|f| f.path.clone()))
                .collect();
            Some(report)
        } else {
            None
        };

        let summary_path = trace_root.join("run.json");
        write_summary(&summary_path, &run, downloads.as_ref())?;

        Ok(TestOutcome {
            run,
            downloads,
            summary_path: Some(summary_path),
        })
    }

    /// ARNs are used verbatim; names must match exactly one listed pool.
    pub fn resolve_pool(&self, project_arn: &str, reference: &str) -> Result<String> {
        if is_arn(reference) {
            return Ok(reference.to_string());
        }
        let pools = self.farm.list_device_pools(project_arn)?;
        if let Some(pool) = pools.iter().find(|pool| pool.name == reference) {
            info!(pool = %pool.name, arn = %pool.arn, "Resolved device pool");
            return Ok(pool.arn.clone());
        }
        Err(PerftestError::PoolNotFound {
            name: reference.to_string(),
            available: pools
                .iter()
                .map(|pool| pool.name.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        })
    }

    fn upload(&self, project_arn: &str, path: &Path, kind: UploadType, options: &TestOptions) -> Result<String> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".into());
        let upload_error = |message: String| PerftestError::Upload {
            name: name.clone(),
            message,
        };

        let created = self.farm.create_upload(project_arn, &name, kind)?;
        info!(upload = %name, arn = %created.arn, "Uploading");
        self.farm.upload_file(&created, path)?;

        let mut watcher = UploadWatcher {
            farm: self.farm.as_ref(),
            arn: &created.arn,
        };
        let processed = poll_until_terminal(&mut watcher, options.upload_policy, self.clock.as_ref())
            .map_err(|err| match err {
                PerftestError::Timeout { waited, last_status, .. } => upload_error(format!(
                    "not processed after {}s (last status {last_status})",
                    waited.as_secs()
                )),
                other => other,
            })?;

        if processed.status == "SUCCEEDED" {
            info!(upload = %name, "Upload processed");
            Ok(processed.arn)
        } else {
            Err(upload_error(
                processed
                    .message
                    .or(processed.metadata)
                    .unwrap_or_else(|| format!("status {}", processed.status)),
            ))
        }
    }

    fn upload_test_spec(&self, template: &Path, options: &TestOptions) -> Result<String> {
        let content = fs::read_to_string(template).map_err(PerftestError::at(template))?;
        let rendered = render_test_spec(&content, options.test_filter.as_deref(), options.iterations);

        let dir = self.output_dir.join("testspec");
        fs::create_dir_all(&dir).map_err(PerftestError::at(&dir))?;
        let spec_path = dir.join(format!("testspec-{}.yml", Utc::now().format("%Y%m%d%H%M%S")));
        fs::write(&spec_path, rendered).map_err(PerftestError::at(&spec_path))?;

        self.upload(
            &options.project_arn,
            &spec_path,
            UploadType::InstrumentationTestSpec,
            options,
        )
    }

    fn download_all(&self, run: &TestRun, trace_root: &Path, options: &TestOptions) -> Result<DownloadReport> {
        let jobs = self.farm.list_jobs(&run.run_arn)?;
        let artifact_root = self.output_dir.join("artifacts").join(run.run_id());
        let mut used = HashSet::new();
        let mut report = DownloadReport {
            trace_dir: trace_root.to_path_buf(),
            devices: Vec::new(),
        };

        for job in &jobs {
            let device = unique_label(&mut used, &sanitize_component(&job.device_label()));
            let trace_dir = trace_root.join(&device);
            let artifact_dir = artifact_root.join(&device);

            let mut files = Vec::new();
            let outcome = self.download_job(job, &trace_dir, &artifact_dir, options, &mut files);
            if let Err(err) = &outcome {
                warn!(device = %device, error = %err, "Download failed for device; continuing");
            } else {
                info!(device = %device, files = files.len(), "Downloaded device results");
            }
            report.devices.push(DeviceDownload {
                device,
                files,
                error: outcome.err().map(|err| err.to_string()),
            });
        }

        if report.traces().next().is_none() && options.download_traces {
            warn!(run_arn = %run.run_arn, "No Perfetto traces found in run artifacts");
        }
        Ok(report)
    }

    fn download_job(
        &self,
        job: &Job,
        trace_dir: &Path,
        artifact_dir: &Path,
        options: &TestOptions,
        files: &mut Vec<DownloadedFile>,
    ) -> Result<()> {
        let scratch = tempfile::tempdir().map_err(PerftestError::at(std::env::temp_dir()))?;

        for artifact in self.farm.list_artifacts(&job.arn, ArtifactCategory::File)? {
            let keep = options.download_artifacts;
            if artifact.is_customer_archive() {
                let dir = if keep { artifact_dir } else { scratch.path() };
                fs::create_dir_all(dir).map_err(PerftestError::at(dir))?;
                let zip_path = dir.join(artifact.file_name());
                self.farm.download(&artifact.url, &zip_path)?;
                if keep {
                    files.push(DownloadedFile {
                        kind: DownloadKind::Artifact,
                        path: zip_path.clone(),
                    });
                }
                if options.download_traces {
                    for path in extract_traces(&zip_path, trace_dir)? {
                        files.push(DownloadedFile {
                            kind: DownloadKind::Trace,
                            path,
                        });
                    }
                }
            } else if keep {
                fs::create_dir_all(artifact_dir).map_err(PerftestError::at(artifact_dir))?;
                let path = artifact_dir.join(artifact.file_name());
                self.farm.download(&artifact.url, &path)?;
                files.push(DownloadedFile {
                    kind: DownloadKind::Artifact,
                    path,
                });
            }
        }

        if !options.download_traces {
            return Ok(());
        }
        for suite in self.farm.list_suites(&job.arn)? {
            for test in self.farm.list_tests(&suite.arn)? {
                for artifact in self.farm.list_artifacts(&test.arn, ArtifactCategory::File)? {
                    if !artifact.is_perfetto_trace() {
                        continue;
                    }
                    fs::create_dir_all(trace_dir).map_err(PerftestError::at(trace_dir))?;
                    let path = trace_dir.join(artifact.file_name());
                    self.farm.download(&artifact.url, &path)?;
                    files.push(DownloadedFile {
                        kind: DownloadKind::Trace,
                        path,
                    });
                }
            }
        }
        Ok(())
    }
}

struct RunWatcher<'a> {
    farm: &'a dyn DeviceFarm,
    arn: &'a str,
}

impl Pollable for RunWatcher<'_> {
    type Output = RemoteRun;

    fn resource(&self) -> String {
        format!("run {}", self.arn)
    }

    fn poll(&mut self) -> Result<PollState<RemoteRun>> {
        let run = self.farm.get_run(self.arn)?;
        if run.status().is_terminal() {
            Ok(PollState::Terminal(run))
        } else {
            Ok(PollState::Pending { status: run.status })
        }
    }
}

struct UploadWatcher<'a> {
    farm: &'a dyn DeviceFarm,
    arn: &'a str,
}

impl Pollable for UploadWatcher<'_> {
    type Output = Upload;

    fn resource(&self) -> String {
        format!("upload {}", self.arn)
    }

    fn poll(&mut self) -> Result<PollState<Upload>> {
        let upload = self.farm.get_upload(self.arn)?;
        match upload.status.as_str() {
            "SUCCEEDED" | "FAILED" => Ok(PollState::Terminal(upload)),
            _ => Ok(PollState::Pending {
                status: upload.status,
            }),
        }
    }
}

/// Fill the `{{TEST_SELECTOR}}` and `{{NUM_ITERATIONS}}` placeholders.
pub fn render_test_spec(template: &str, test_filter: Option<&str>, iterations: Option<u32>) -> String {
    let selector = test_filter
        .map(|filter| format!("-e class {filter}"))
        .unwrap_or_default();
    let iterations = iterations.unwrap_or(1).to_string();
    template
        .replace("{{TEST_SELECTOR}}", &selector)
        .replace("{{NUM_ITERATIONS}}", &iterations)
}

fn unique_label(used: &mut HashSet<String>, base: &str) -> String {
    let mut label = base.to_string();
    let mut n = 2;
    while !used.insert(label.clone()) {
        label = format!("{base}-{n}");
        n += 1;
    }
    label
}

#[derive(Serialize)]
struct RunSummary<'a> {
    run: &'a TestRun,
    downloads: Option<&'a DownloadReport>,
    written_at: DateTime<Utc>,
}

fn write_summary(path: &Path, run: &TestRun, downloads: Option<&DownloadReport>) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(PerftestError::at(parent))?;
    }
    let file = File::create(path).map_err(PerftestError::at(path))?;
    serde_json::to_writer_pretty(
        file,
        &RunSummary {
            run,
            downloads,
            written_at: Utc::now(),
        },
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_placeholders_are_rendered() {
        let template = "commands:\n  - am instrument {{TEST_SELECTOR}} -e iterations {{NUM_ITERATIONS}}\n";
        assert_eq!(
            render_test_spec(template, Some("com.acme.Startup#cold"), Some(5)),
            "commands:\n  - am instrument -e class com.acme.Startup#cold -e iterations 5\n"
        );
        assert_eq!(
            render_test_spec(template, None, None),
            "commands:\n  - am instrument  -e iterations 1\n"
        );
    }

    #[test]
    fn duplicate_device_labels_get_suffixes() {
        let mut used = HashSet::new();
        assert_eq!(unique_label(&mut used, "Pixel_7"), "Pixel_7");
        assert_eq!(unique_label(&mut used, "Pixel_7"), "Pixel_7-2");
        assert_eq!(unique_label(&mut used, "Pixel_7"), "Pixel_7-3");
    }
}
