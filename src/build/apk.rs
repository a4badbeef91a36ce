use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Serialize;
use tracing::{debug, warn};

use super::BuildVariant;
use crate::cache::ArtifactSet;
use crate::error::{PerftestError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApkInfo {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub package_name: Option<String>,
    pub version_code: Option<String>,
    pub version_name: Option<String>,
    pub app_label: Option<String>,
    pub min_sdk: Option<String>,
    pub target_sdk: Option<String>,
}

/// Find the app and test APKs Gradle wrote for `variant`.
///
/// The app APK lives under `<app_module>/build/outputs/apk` and is not an
/// androidTest APK; the test APK lives under `<test_module>/build/outputs/apk`.
/// Both names must mention the flavor (if any) and the build type.
pub fn locate_apks(
    project: &Path,
    app_module: &str,
    test_module: &str,
    variant: &BuildVariant,
) -> Result<ArtifactSet> {
    let app_dir = project.join(app_module).join("build/outputs/apk");
    let test_dir = project.join(test_module).join("build/outputs/apk");

    let app_apk = find_apk(&app_dir, variant, true).ok_or_else(|| {
        PerftestError::ArtifactMissing {
            role: format!("app ({variant})"),
            searched: app_dir.clone(),
        }
    })?;
    let test_apk = find_apk(&test_dir, variant, false).ok_or_else(|| {
        PerftestError::ArtifactMissing {
            role: format!("test ({variant})"),
            searched: test_dir.clone(),
        }
    })?;

    debug!(app = %app_apk.display(), test = %test_apk.display(), "Located APKs");
    Ok(ArtifactSet { app_apk, test_apk })
}

fn find_apk(dir: &Path, variant: &BuildVariant, skip_android_test: bool) -> Option<PathBuf> {
    let pattern = format!("{}/**/*.apk", glob::Pattern::escape(&dir.to_string_lossy()));
    let flavor = variant.flavor.as_deref().map(str::to_lowercase);
    let build_type = variant.build_type.to_lowercase();

    let mut candidates: Vec<PathBuf> = glob::glob(&pattern)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|path| {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            if skip_android_test && name.contains("androidtest") {
                return false;
            }
            let flavor_ok = flavor.as_deref().is_none_or(|f| name.contains(f));
            flavor_ok && name.contains(&build_type)
        })
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

/// Check that `path` is a non-empty file and, when `aapt` is available,
/// read its badging.
pub fn validate_apk(path: &Path, aapt: Option<&Path>) -> Result<ApkInfo> {
    let meta = std::fs::metadata(path).map_err(|err| PerftestError::InvalidApk {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;
    if !meta.is_file() {
        return Err(PerftestError::InvalidApk {
            path: path.to_path_buf(),
            reason: "not a regular file".into(),
        });
    }
    if meta.len() == 0 {
        return Err(PerftestError::InvalidApk {
            path: path.to_path_buf(),
            reason: "file is empty".into(),
        });
    }

    let mut info = ApkInfo {
        path: path.to_path_buf(),
        size_bytes: meta.len(),
        ..ApkInfo::default()
    };

    if let Some(aapt) = aapt {
        match Command::new(aapt).args(["dump", "badging"]).arg(path).output() {
            Ok(output) if output.status.success() => {
                let parsed = parse_aapt_badging(&String::from_utf8_lossy(&output.stdout));
                info = ApkInfo {
                    path: info.path,
                    size_bytes: info.size_bytes,
                    ..parsed
                };
            }
            Ok(output) => warn!(
                apk = %path.display(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "aapt could not read APK"
            ),
            Err(err) => debug!(error = %err, "aapt not runnable"),
        }
    }

    debug!(
        apk = %path.display(),
        size_bytes = info.size_bytes,
        package = info.package_name.as_deref().unwrap_or("unknown"),
        "APK validated"
    );
    Ok(info)
}

/// Validate both APKs; a test package that is not `<app>.test` only warns.
pub fn validate_pair(artifacts: &ArtifactSet, aapt: Option<&Path>) -> Result<(ApkInfo, ApkInfo)> {
    let app = validate_apk(&artifacts.app_apk, aapt)?;
    let test = validate_apk(&artifacts.test_apk, aapt)?;

    if let (Some(app_pkg), Some(test_pkg)) = (&app.package_name, &test.package_name) {
        let expected = format!("{app_pkg}.test");
        if test_pkg != &expected {
            warn!(
                test_package = %test_pkg,
                expected = %expected,
                "Test APK package does not follow the app package"
            );
        }
    }
    Ok((app, test))
}

/// Newest `aapt` under `<android_home>/build-tools/*`.
pub fn find_aapt(android_home: &Path) -> Option<PathBuf> {
    let mut versions: Vec<PathBuf> = std::fs::read_dir(android_home.join("build-tools"))
        .ok()?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    versions.sort();
    versions
        .into_iter()
        .rev()
        .map(|dir| dir.join("aapt"))
        .find(|aapt| aapt.is_file())
}

/// Parse `aapt dump badging` output.
pub fn parse_aapt_badging(output: &str) -> ApkInfo {
    let mut info = ApkInfo::default();

    for line in output.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix("package:") {
            for part in rest.split_whitespace() {
                if let Some((key, value)) = part.split_once('=') {
                    let value = value.trim_matches('\'').to_string();
                    match key {
                        "name" => info.package_name = Some(value),
                        "versionCode" => info.version_code = Some(value),
                        "versionName" => info.version_name = Some(value),
                        _ => {}
                    }
                }
            }
        } else if let Some(rest) = line.strip_prefix("application-label:") {
            info.app_label = Some(rest.trim().trim_matches('\'').to_string());
        } else if let Some(rest) = line.strip_prefix("sdkVersion:") {
            info.min_sdk = Some(rest.trim().trim_matches('\'').to_string());
        } else if let Some(rest) = line.strip_prefix("targetSdkVersion:") {
            info.target_sdk = Some(rest.trim().trim_matches('\'').to_string());
        }
    }
    info
}
