use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;

use tracing::{debug, error, info, warn};

use super::apk::{find_aapt, locate_apks, validate_pair};
use super::{BuildTool, BuildVariant};
use crate::cache::ArtifactSet;
use crate::config::BuildConfig;
use crate::credentials::Secret;
use crate::error::{PerftestError, Result};

const TAIL_LINES: usize = 40;
const JVM_ARGS: &str = "org.gradle.jvmargs=-Xmx4g -XX:MaxMetaspaceSize=512m -XX:+HeapDumpOnOutOfMemoryError";

/// Drives `./gradlew` in a checked-out Android project.
pub struct GradleBuild {
    android_home: Option<PathBuf>,
    java_home: Option<PathBuf>,
    github_user: Option<String>,
    github_token: Option<Secret>,
    app_module: String,
    test_module: String,
    options: Vec<String>,
    properties_file: Option<PathBuf>,
    google_services_file: Option<PathBuf>,
}

impl GradleBuild {
    pub fn from_config(config: &BuildConfig, github_token: Option<Secret>) -> Self {
        Self {
            android_home: config.android_home.clone(),
            java_home: config.java_home.clone(),
            github_user: config.github_user.clone(),
            github_token,
            app_module: config.app_module.clone(),
            test_module: config.test_module.clone(),
            options: config.gradle_options.clone(),
            properties_file: config.properties_file.clone(),
            google_services_file: config.google_services_file.clone(),
        }
    }

    /// Write the SDK location and JVM settings, then copy the configured
    /// project files into place.
    pub fn prepare(&self, project: &Path) -> Result<()> {
        if let Some(sdk) = &self.android_home {
            let path = project.join("local.properties");
            fs::write(&path, format!("sdk.dir={}\n", sdk.display()))
                .map_err(PerftestError::at(&path))?;
            debug!(path = %path.display(), "Wrote local.properties");
        }

        let props = project.join("gradle.properties");
        let existing = fs::read_to_string(&props).unwrap_or_default();
        if !existing.contains("org.gradle.jvmargs") {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&props)
                .map_err(PerftestError::at(&props))?;
            let mut block = String::new();
            if !existing.is_empty() && !existing.ends_with('\n') {
                block.push('\n');
            }
            block.push_str(JVM_ARGS);
            block.push_str("\norg.gradle.workers.max=2\n");
            if existing.is_empty() {
                block.push_str("org.gradle.daemon=false\norg.gradle.parallel=false\norg.gradle.caching=true\n");
            }
            file.write_all(block.as_bytes())
                .map_err(PerftestError::at(&props))?;
            info!(path = %props.display(), "Added JVM memory settings to gradle.properties");
        }

        if let Some(source) = &self.properties_file {
            copy_into(source, project)?;
        }
        if let Some(source) = &self.google_services_file {
            copy_into(source, &project.join(&self.app_module))?;
        }
        Ok(())
    }

    fn command(&self, gradlew: &Path, project: &Path, task: &str) -> Command {
        let mut command = Command::new(gradlew);
        command
            .arg(task)
            .args(&self.options)
            .current_dir(project)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(sdk) = &self.android_home {
            command.env("ANDROID_HOME", sdk).env("ANDROID_SDK_ROOT", sdk);
            let mut paths = vec![
                sdk.join("cmdline-tools/latest/bin"),
                sdk.join("platform-tools"),
            ];
            if let Some(current) = std::env::var_os("PATH") {
                paths.extend(std::env::split_paths(&current));
            }
            if let Ok(joined) = std::env::join_paths(paths) {
                command.env("PATH", joined);
            }
        }
        if let Some(java) = &self.java_home {
            command.env("JAVA_HOME", java);
        }
        if let Some(user) = &self.github_user {
            command.env("GITHUB_USER", user);
        }
        if let Some(token) = &self.github_token {
            command.env("GITHUB_TOKEN", token.expose());
        }
        command
    }

    fn run_task(&self, gradlew: &Path, project: &Path, task: &str) -> Result<()> {
        info!(task, "Running Gradle task");
        let mut child = self
            .command(gradlew, project, task)
            .spawn()
            .map_err(|err| PerftestError::BuildTool {
                tool: "gradlew".into(),
                status: "failed to start".into(),
                tail: err.to_string(),
            })?;

        let stderr_reader = child.stderr.take().map(|stderr| {
            thread::spawn(move || {
                let mut tail = VecDeque::with_capacity(TAIL_LINES);
                for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                    log_build_line(&line);
                    push_tail(&mut tail, line);
                }
                tail
            })
        });

        let mut tail = VecDeque::with_capacity(TAIL_LINES);
        if let Some(stdout) = child.stdout.take() {
            for line in BufReader::new(stdout).lines().map_while(|l| l.ok()) {
                log_build_line(&line);
                push_tail(&mut tail, line);
            }
        }

        let status = child.wait().map_err(|err| PerftestError::BuildTool {
            tool: "gradlew".into(),
            status: "unknown".into(),
            tail: err.to_string(),
        })?;
        let stderr_tail = stderr_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        if status.success() {
            return Ok(());
        }

        let mut combined: Vec<String> = tail.into_iter().collect();
        combined.extend(stderr_tail);
        let start = combined.len().saturating_sub(TAIL_LINES);
        let mut output = combined[start..].join("\n");
        if let Some(token) = &self.github_token
            && !token.expose().is_empty()
        {
            output = output.replace(token.expose(), "***");
        }
        Err(PerftestError::BuildTool {
            tool: format!("gradlew {task}"),
            status: status.to_string(),
            tail: output,
        })
    }
}

impl BuildTool for GradleBuild {
    fn build(&self, project: &Path, variant: &BuildVariant) -> Result<ArtifactSet> {
        let gradlew = project.join("gradlew");
        if !gradlew.is_file() {
            return Err(PerftestError::BuildTool {
                tool: "gradlew".into(),
                status: "not found".into(),
                tail: format!("no gradlew in {}", project.display()),
            });
        }
        make_executable(&gradlew)?;
        self.prepare(project)?;

        let suffix = variant.task_suffix();
        self.run_task(&gradlew, project, &format!("assemble{suffix}"))?;
        self.run_task(
            &gradlew,
            project,
            &format!(":{}:assemble{suffix}", self.test_module),
        )?;

        let artifacts = locate_apks(project, &self.app_module, &self.test_module, variant)?;
        let aapt = self.android_home.as_deref().and_then(find_aapt);
        validate_pair(&artifacts, aapt.as_deref())?;
        info!(
            app_apk = %artifacts.app_apk.display(),
            test_apk = %artifacts.test_apk.display(),
            "Build produced APKs"
        );
        Ok(artifacts)
    }
}

fn log_build_line(line: &str) {
    let trimmed = line.trim_end();
    if trimmed.is_empty() {
        return;
    }
    let lowered = trimmed.to_lowercase();
    if lowered.contains("error") || lowered.contains("failed") {
        error!(target: "perftest::gradle", "{trimmed}");
    } else if lowered.contains("warning") {
        warn!(target: "perftest::gradle", "{trimmed}");
    } else {
        debug!(target: "perftest::gradle", "{trimmed}");
    }
}

fn push_tail(tail: &mut VecDeque<String>, line: String) {
    if tail.len() == TAIL_LINES {
        tail.pop_front();
    }
    tail.push_back(line);
}

fn copy_into(source: &Path, dir: &Path) -> Result<()> {
    let name = source.file_name().ok_or_else(|| {
        PerftestError::Config(format!("{} has no file name", source.display()))
    })?;
    if !source.is_file() {
        return Err(PerftestError::Config(format!(
            "file {} does not exist",
            source.display()
        )));
    }
    fs::create_dir_all(dir).map_err(PerftestError::at(dir))?;
    let target = dir.join(name);
    fs::copy(source, &target).map_err(PerftestError::at(source))?;
    debug!(from = %source.display(), to = %target.display(), "Copied project file");
    Ok(())
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path).map_err(PerftestError::at(path))?.permissions();
    perms.set_mode(perms.mode() | 0o755);
    fs::set_permissions(path, perms).map_err(PerftestError::at(path))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_appends_jvm_settings_once() {
        let temp = tempfile::tempdir().unwrap();
        let project = temp.path();
        fs::write(project.join("gradle.properties"), "android.useAndroidX=true").unwrap();

        let config = BuildConfig {
            android_home: Some(PathBuf::from("/opt/android-sdk")),
            ..BuildConfig::default()
        };
        let gradle = GradleBuild::from_config(&config, None);
        gradle.prepare(project).unwrap();
        gradle.prepare(project).unwrap();

        let props = fs::read_to_string(project.join("gradle.properties")).unwrap();
        assert!(props.starts_with("android.useAndroidX=true\n"));
        assert_eq!(props.matches("org.gradle.jvmargs").count(), 1);
        let local = fs::read_to_string(project.join("local.properties")).unwrap();
        assert_eq!(local, "sdk.dir=/opt/android-sdk\n");
    }

    #[test]
    fn tail_keeps_latest_lines() {
        let mut tail = VecDeque::new();
        for i in 0..(TAIL_LINES + 5) {
            push_tail(&mut tail, i.to_string());
        }
        assert_eq!(tail.len(), TAIL_LINES);
        assert_eq!(tail.front().map(String::as_str), Some("5"));
    }

    #[cfg(unix)]
    #[test]
    fn failing_build_reports_output_tail() {
        let temp = tempfile::tempdir().unwrap();
        let project = temp.path();
        fs::write(
            project.join("gradlew"),
            "#!/bin/sh\necho \"> Task $1\"\necho 'FAILURE: Build failed with an exception.' >&2\nexit 1\n",
        )
        .unwrap();

        let config = BuildConfig {
            gradle_options: Vec::new(),
            ..BuildConfig::default()
        };
        let gradle = GradleBuild::from_config(&config, None);
        let err = gradle
            .build(project, &BuildVariant::new(None, "debug"))
            .unwrap_err();
        match err {
            PerftestError::BuildTool { tool, tail, .. } => {
                assert_eq!(tool, "gradlew assembleDebug");
                assert!(tail.contains("> Task assembleDebug"));
                assert!(tail.contains("Build failed"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
