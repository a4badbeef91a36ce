use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PerftestError, Result};

const SEARCH_PATHS: &[&str] = &["config/default.yaml", "/workspace/config/default.yaml"];

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub build: BuildConfig,
    pub devicefarm: DeviceFarmConfig,
    pub analysis: AnalysisConfig,
    pub output: OutputConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BuildConfig {
    pub repository_url: String,
    pub default_branch: String,
    pub flavor: Option<String>,
    pub build_type: String,
    pub app_module: String,
    pub test_module: String,
    pub gradle_options: Vec<String>,
    pub properties_file: Option<PathBuf>,
    pub google_services_file: Option<PathBuf>,
    pub android_home: Option<PathBuf>,
    pub java_home: Option<PathBuf>,
    pub github_user: Option<String>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            repository_url: String::new(),
            default_branch: "main".into(),
            flavor: None,
            build_type: "debug".into(),
            app_module: "app".into(),
            test_module: "benchmark".into(),
            gradle_options: vec!["--no-daemon".into(), "--stacktrace".into()],
            properties_file: None,
            google_services_file: None,
            android_home: None,
            java_home: None,
            github_user: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DeviceFarmConfig {
    pub project_arn: String,
    pub region: String,
    pub device_pool: Option<String>,
    pub test_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub upload_timeout_secs: u64,
    pub upload_poll_interval_secs: u64,
    pub test_type: String,
    pub job_timeout_minutes: u32,
    pub test_spec_template: Option<PathBuf>,
    pub iterations: Option<u32>,
    pub test_filter: Option<String>,
    pub tests_catalog: PathBuf,
}

impl Default for DeviceFarmConfig {
    fn default() -> Self {
        Self {
            project_arn: String::new(),
            region: "us-west-2".into(),
            device_pool: None,
            test_timeout_secs: 3600,
            poll_interval_secs: 10,
            upload_timeout_secs: 300,
            upload_poll_interval_secs: 2,
            test_type: "INSTRUMENTATION".into(),
            job_timeout_minutes: 60,
            test_spec_template: None,
            iterations: None,
            test_filter: None,
            tests_catalog: PathBuf::from("config/benchmark_tests.yml"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub trace_processor_path: PathBuf,
    pub query_dirs: Vec<PathBuf>,
    pub default_queries: Vec<String>,
    pub trace_pattern: String,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            trace_processor_path: PathBuf::from("/usr/local/bin/trace_processor_shell"),
            query_dirs: Vec::new(),
            default_queries: vec!["frame_metrics".into(), "cpu_usage".into()],
            trace_pattern: "*.perfetto-trace".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OutputConfig {
    pub base_dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./output"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: None,
        }
    }
}

impl Config {
    /// Load from an explicit path, or from the first default location that
    /// exists, falling back to built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        let source = match path {
            Some(path) if !path.exists() => {
                return Err(PerftestError::Config(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            Some(path) => Some(path.to_path_buf()),
            None => SEARCH_PATHS
                .iter()
                .map(PathBuf::from)
                .find(|candidate| candidate.is_file()),
        };

        let config = match &source {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        Ok((config, source))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(PerftestError::at(path))?;
        Self::from_yaml(&content)
            .map_err(|err| PerftestError::Config(format!("{}: {err}", path.display())))
    }

    pub fn from_yaml(content: &str) -> std::result::Result<Self, serde_yaml::Error> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    /// Apply the documented environment variable overrides. `lookup` is
    /// `std::env::var` in production.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(arn) = get("AWS_DEVICEFARM_PROJECT_ARN") {
            self.devicefarm.project_arn = arn;
        }
        if let Some(region) = get("AWS_REGION").or_else(|| get("AWS_DEFAULT_REGION")) {
            self.devicefarm.region = region;
        }
        if let Some(pool) = get("DEVICEFARM_DEVICE_POOL") {
            self.devicefarm.device_pool = Some(pool);
        }
        if let Some(path) = get("PERFETTO_PATH") {
            self.analysis.trace_processor_path = PathBuf::from(path);
        }
        if let Some(dir) = get("PERFTEST_OUTPUT_DIR") {
            self.output.base_dir = PathBuf::from(dir);
        }
        if let Some(level) = get("PERFTEST_LOG_LEVEL") {
            self.logging.level = level.to_lowercase();
        }
        if let Some(home) = get("ANDROID_HOME") {
            self.build.android_home.get_or_insert_with(|| PathBuf::from(home));
        }
        if let Some(home) = get("JAVA_HOME") {
            self.build.java_home.get_or_insert_with(|| PathBuf::from(home));
        }
        if let Some(user) = get("GITHUB_USER") {
            self.build.github_user.get_or_insert(user);
        }
    }

    pub fn output_dir(&self, subdir: &str) -> PathBuf {
        self.output.base_dir.join(subdir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_yaml_keeps_defaults_for_missing_fields() {
        let config = Config::from_yaml(
            r#"
build:
  repository_url: https://github.com/acme/app.git
devicefarm:
  poll_interval_secs: 5
"#,
        )
        .unwrap();

        assert_eq!(config.build.repository_url, "https://github.com/acme/app.git");
        assert_eq!(config.build.test_module, "benchmark");
        assert_eq!(config.devicefarm.poll_interval_secs, 5);
        assert_eq!(config.devicefarm.test_timeout_secs, 3600);
        assert_eq!(config.output.base_dir, PathBuf::from("./output"));
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let mut config = Config::default();
        let env: HashMap<&str, &str> = [
            ("AWS_DEVICEFARM_PROJECT_ARN", "arn:aws:devicefarm:us-west-2:1:project:p"),
            ("AWS_DEFAULT_REGION", "eu-west-1"),
            ("AWS_REGION", "us-west-2"),
            ("PERFTEST_OUTPUT_DIR", "/tmp/out"),
            ("PERFTEST_LOG_LEVEL", "DEBUG"),
            ("DEVICEFARM_DEVICE_POOL", ""),
        ]
        .into_iter()
        .collect();

        config.apply_env(|key| env.get(key).map(|value| value.to_string()));

        assert_eq!(
            config.devicefarm.project_arn,
            "arn:aws:devicefarm:us-west-2:1:project:p"
        );
        assert_eq!(config.devicefarm.region, "us-west-2");
        assert_eq!(config.output.base_dir, PathBuf::from("/tmp/out"));
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.devicefarm.device_pool, None);
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        let err = Config::load(Some(Path::new("/nonexistent/perftest.yaml"))).unwrap_err();
        assert!(matches!(err, PerftestError::Config(_)));
    }
}
