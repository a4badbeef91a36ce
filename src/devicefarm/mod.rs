//! AWS Device Farm access: the operations the test stage needs, the wire
//! types they exchange and the mapping of remote run states.

pub mod artifacts;
pub mod client;
pub mod sigv4;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use client::DeviceFarmClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl RunStatus {
    /// Collapse Device Farm's `status` and `result` pair into a run status.
    pub fn from_remote(status: &str, result: Option<&str>) -> Self {
        match status {
            "COMPLETED" => match result {
                Some("FAILED") | Some("ERRORED") => Self::Failed,
                Some("STOPPED") => Self::Stopped,
                _ => Self::Completed,
            },
            "STOPPED" => Self::Stopped,
            "PREPARING" | "RUNNING" | "STOPPING" => Self::Running,
            _ => Self::Pending,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadType {
    AndroidApp,
    InstrumentationTestPackage,
    InstrumentationTestSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactCategory {
    File,
    Log,
    Screenshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicePool {
    pub arn: String,
    pub name: String,
    #[serde(default, rename = "type")]
    pub pool_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Upload {
    pub arn: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub metadata: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Counters {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub warned: u32,
    pub errored: u32,
    pub stopped: u32,
    pub skipped: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRun {
    pub arn: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub device_pool_arn: Option<String>,
    /// Epoch seconds.
    #[serde(default)]
    pub started: Option<f64>,
    #[serde(default)]
    pub stopped: Option<f64>,
    #[serde(default)]
    pub counters: Option<Counters>,
}

impl RemoteRun {
    pub fn status(&self) -> RunStatus {
        RunStatus::from_remote(&self.status, self.result.as_deref())
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started.and_then(epoch_to_utc)
    }

    pub fn stopped_at(&self) -> Option<DateTime<Utc>> {
        self.stopped.and_then(epoch_to_utc)
    }
}

fn epoch_to_utc(seconds: f64) -> Option<DateTime<Utc>> {
    let whole = seconds.trunc() as i64;
    let nanos = ((seconds - seconds.trunc()) * 1e9).round() as u32;
    Utc.timestamp_opt(whole, nanos.min(999_999_999)).single()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub os: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub arn: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub device: Option<Device>,
}

impl Job {
    /// Human-readable device name, falling back to the job name.
    pub fn device_label(&self) -> String {
        match &self.device {
            Some(device) if !device.name.is_empty() => match &device.os {
                Some(os) if !os.is_empty() => format!("{} {}", device.name, os),
                _ => device.name.clone(),
            },
            _ => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suite {
    pub arn: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Test {
    pub arn: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub arn: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub artifact_type: String,
    #[serde(default)]
    pub extension: String,
    #[serde(default)]
    pub url: String,
}

impl Artifact {
    pub fn is_customer_archive(&self) -> bool {
        self.artifact_type == "CUSTOMER_ARTIFACT" && self.extension.eq_ignore_ascii_case("zip")
    }

    pub fn is_perfetto_trace(&self) -> bool {
        self.name.contains(".perfetto-trace")
            || self.extension.trim_start_matches('.') == "perfetto-trace"
    }

    /// Local file name: the artifact name plus its extension when the name
    /// does not already carry it.
    pub fn file_name(&self) -> String {
        let base = artifacts::sanitize_component(&self.name);
        let extension = self.extension.trim_start_matches('.');
        if extension.is_empty() || base.ends_with(&format!(".{extension}")) {
            base
        } else {
            format!("{base}.{extension}")
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleTest {
    #[serde(rename = "type")]
    pub test_type: String,
    pub test_package_arn: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_spec_arn: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionConfiguration {
    pub job_timeout_minutes: u32,
    pub accounts_cleanup: bool,
    pub app_packages_cleanup: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRunRequest {
    pub project_arn: String,
    pub app_arn: String,
    pub device_pool_arn: String,
    pub name: String,
    pub test: ScheduleTest,
    pub execution_configuration: ExecutionConfiguration,
}

/// The subset of the Device Farm API the pipeline drives. Implemented over
/// HTTPS by [`DeviceFarmClient`] and by in-process fakes in tests.
pub trait DeviceFarm {
    fn list_device_pools(&self, project_arn: &str) -> Result<Vec<DevicePool>>;
    fn create_upload(&self, project_arn: &str, name: &str, kind: UploadType) -> Result<Upload>;
    /// PUT the file to the upload's presigned URL.
    fn upload_file(&self, upload: &Upload, path: &Path) -> Result<()>;
    fn get_upload(&self, arn: &str) -> Result<Upload>;
    fn schedule_run(&self, request: &ScheduleRunRequest) -> Result<RemoteRun>;
    fn get_run(&self, arn: &str) -> Result<RemoteRun>;
    fn list_jobs(&self, run_arn: &str) -> Result<Vec<Job>>;
    fn list_suites(&self, job_arn: &str) -> Result<Vec<Suite>>;
    fn list_tests(&self, suite_arn: &str) -> Result<Vec<Test>>;
    fn list_artifacts(&self, arn: &str, category: ArtifactCategory) -> Result<Vec<Artifact>>;
    /// GET `url` into `dest`, returning the number of bytes written.
    fn download(&self, url: &str, dest: &Path) -> Result<u64>;
}

/// Whether `reference` already names a pool by ARN rather than by name.
pub fn is_arn(reference: &str) -> bool {
    reference.starts_with("arn:")
}

/// Last path segment of an ARN, used to name local directories.
pub fn arn_id(arn: &str) -> &str {
    arn.rsplit(['/', ':']).next().unwrap_or(arn)
}
