use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::analysis::QueryLibrary;
use crate::config::Config;
use crate::credentials::AwsCredentials;
use crate::devicefarm::is_arn;

/// Outcome of `perftest validate`. Only `errors` make the check fail.
#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub checks: Vec<String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.checks.extend(other.checks);
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// Check the configuration and the local toolchain the stages depend on.
/// `lookup` is `std::env::var` in production.
pub fn validate_environment<F>(config: &Config, lookup: F) -> ValidationReport
where
    F: Fn(&str) -> Option<String>,
{
    let mut report = validate_config(config);
    report.merge(validate_output_dirs(config));
    report.merge(validate_credentials(&lookup));
    report.merge(validate_tools(config, lookup("PATH").as_deref()));
    report.merge(validate_queries(config));
    report
}

pub fn validate_config(config: &Config) -> ValidationReport {
    let mut report = ValidationReport::default();

    if config.build.repository_url.trim().is_empty() {
        report
            .warnings
            .push("build.repository_url is not set; `build` needs --repo-url".into());
    } else {
        report
            .checks
            .push(format!("repository: {}", config.build.repository_url));
    }

    let farm = &config.devicefarm;
    if farm.project_arn.trim().is_empty() {
        report
            .warnings
            .push("Device Farm project ARN is not set (AWS_DEVICEFARM_PROJECT_ARN)".into());
    } else if !is_arn(&farm.project_arn) {
        report
            .errors
            .push(format!("'{}' is not a Device Farm ARN", farm.project_arn));
    } else {
        report.checks.push(format!("project: {}", farm.project_arn));
    }
    match &farm.device_pool {
        Some(pool) if !pool.trim().is_empty() => report.checks.push(format!("device pool: {pool}")),
        _ => report
            .warnings
            .push("no default device pool (DEVICEFARM_DEVICE_POOL)".into()),
    }
    report.checks.push(format!("region: {}", farm.region));

    if farm.poll_interval_secs == 0 || farm.upload_poll_interval_secs == 0 {
        report
            .errors
            .push("poll intervals must be at least one second".into());
    }
    if farm.test_timeout_secs < farm.poll_interval_secs {
        report.errors.push(format!(
            "test timeout ({}s) is shorter than the poll interval ({}s)",
            farm.test_timeout_secs, farm.poll_interval_secs
        ));
    }
    if let Some(template) = &farm.test_spec_template
        && !template.is_file()
    {
        report.errors.push(format!(
            "test spec template {} does not exist",
            template.display()
        ));
    }

    if let Err(err) = glob::Pattern::new(&config.analysis.trace_pattern) {
        report.errors.push(format!(
            "trace pattern '{}' is not a valid glob: {err}",
            config.analysis.trace_pattern
        ));
    }

    report
}

fn validate_output_dirs(config: &Config) -> ValidationReport {
    let mut report = ValidationReport::default();
    for subdir in ["traces", "artifacts", "reports"] {
        let dir = config.output_dir(subdir);
        match fs::create_dir_all(&dir) {
            Ok(()) => report.checks.push(format!("output: {}", dir.display())),
            Err(err) => report
                .errors
                .push(format!("cannot create {}: {err}", dir.display())),
        }
    }
    report
}

fn validate_credentials<F>(lookup: &F) -> ValidationReport
where
    F: Fn(&str) -> Option<String>,
{
    let mut report = ValidationReport::default();

    match lookup("GITHUB_PAT").filter(|token| !token.trim().is_empty()) {
        Some(_) => report.checks.push("GITHUB_PAT is set".into()),
        None => report
            .warnings
            .push("GITHUB_PAT is not set; private repositories cannot be cloned".into()),
    }

    match AwsCredentials::from_lookup(lookup) {
        Ok(creds) => report.checks.push(format!(
            "AWS credentials present (access key {})",
            crate::credentials::mask_secret(&creds.access_key_id, 4)
        )),
        Err(err) => report.errors.push(format!("AWS credentials: {err}")),
    }

    report
}

fn validate_tools(config: &Config, path_var: Option<&str>) -> ValidationReport {
    let mut report = ValidationReport::default();

    match &config.build.android_home {
        Some(home) if home.is_dir() => report
            .checks
            .push(format!("ANDROID_HOME: {}", home.display())),
        Some(home) => report.errors.push(format!(
            "ANDROID_HOME {} is not a directory",
            home.display()
        )),
        None => report
            .warnings
            .push("ANDROID_HOME is not set; builds will rely on local.properties".into()),
    }

    let shell = &config.analysis.trace_processor_path;
    if shell.is_file() {
        report
            .checks
            .push(format!("trace processor: {}", shell.display()));
    } else {
        report.warnings.push(format!(
            "trace processor not found at {} (set PERFETTO_PATH)",
            shell.display()
        ));
    }

    match find_on_path("git", path_var) {
        Some(git) => report.checks.push(format!("git: {}", git.display())),
        None => report.errors.push("git was not found on PATH".into()),
    }

    report
}

fn validate_queries(config: &Config) -> ValidationReport {
    let mut report = ValidationReport::default();
    for dir in &config.analysis.query_dirs {
        if !dir.is_dir() {
            report
                .warnings
                .push(format!("query directory {} does not exist", dir.display()));
        }
    }

    let library = QueryLibrary::new(config.analysis.query_dirs.clone());
    for name in &config.analysis.default_queries {
        match library.resolve(name) {
            Ok(_) => report.checks.push(format!("query: {name}")),
            Err(err) => report
                .errors
                .push(format!("{err}; available: {}", library.available().join(", "))),
        }
    }
    report
}

fn find_on_path(binary: &str, path_var: Option<&str>) -> Option<PathBuf> {
    let path_var = path_var?;
    std::env::split_paths(path_var)
        .map(|dir| dir.join(binary))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::metadata(path)
            .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}
