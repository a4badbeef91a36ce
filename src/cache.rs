use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{PerftestError, Result};
use crate::security::compute_sha256;

const MANIFEST_FILE: &str = "manifest.json";
const APK_DIR: &str = "apks";

/// The (branch, commit) pair a build is memoized under. Compared exactly,
/// without case folding or hash normalization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildIdentity {
    pub branch: String,
    pub commit: String,
}

impl BuildIdentity {
    pub fn new(branch: impl Into<String>, commit: impl Into<String>) -> Result<Self> {
        let branch = branch.into();
        let commit = commit.into();

        if branch.trim().is_empty() {
            return Err(PerftestError::InvalidIdentity("branch cannot be empty".into()));
        }
        if !(4..=40).contains(&commit.len()) || !commit.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(PerftestError::InvalidIdentity(format!(
                "commit '{commit}' must be 4 to 40 hexadecimal characters"
            )));
        }

        Ok(Self { branch, commit })
    }

    /// Directory name of the cache entry: `{branch}_{commit}` with the
    /// characters that could alias another branch percent-encoded.
    pub fn cache_key(&self) -> String {
        let mut key = String::with_capacity(self.branch.len() + self.commit.len() + 1);
        for ch in self.branch.chars() {
            match ch {
                '%' => key.push_str("%25"),
                '/' => key.push_str("%2F"),
                '\\' => key.push_str("%5C"),
                other => key.push(other),
            }
        }
        key.push('_');
        key.push_str(&self.commit);
        key
    }
}

impl fmt::Display for BuildIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.branch, self.commit)
    }
}

/// Locations of the two APKs a test run needs. A transient view; the cache
/// directory on disk is authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSet {
    pub app_apk: PathBuf,
    pub test_apk: PathBuf,
}

impl ArtifactSet {
    /// Accept caller supplied paths after checking both files are usable.
    pub fn from_paths(app_apk: impl Into<PathBuf>, test_apk: impl Into<PathBuf>) -> Result<Self> {
        let set = Self {
            app_apk: app_apk.into(),
            test_apk: test_apk.into(),
        };
        for (role, path) in [("app", &set.app_apk), ("test", &set.test_apk)] {
            if !is_non_empty_file(path) {
                return Err(PerftestError::ArtifactMissing {
                    role: role.into(),
                    searched: path.clone(),
                });
            }
        }
        Ok(set)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApkRecord {
    pub file_name: String,
    pub sha256: String,
    pub size: u64,
}

/// Written last into a staged entry; its presence marks the entry complete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheManifest {
    pub identity: BuildIdentity,
    pub variant: String,
    pub built_at: DateTime<Utc>,
    pub app_apk: ApkRecord,
    pub test_apk: ApkRecord,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    pub directory: PathBuf,
    pub manifest: CacheManifest,
}

#[derive(Debug, Clone)]
pub struct ArtifactCache {
    root: PathBuf,
}

impl ArtifactCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_dir(&self, identity: &BuildIdentity) -> PathBuf {
        self.root.join(identity.cache_key())
    }

    /// Return the cached artifacts for `identity`, or `None` when the build
    /// has to run. Presence is the validity signal; digests are recorded but
    /// not re-verified.
    pub fn resolve(&self, identity: &BuildIdentity) -> Option<ArtifactSet> {
        let dir = self.entry_dir(identity);
        let manifest = match read_manifest(&dir) {
            Some(manifest) => manifest,
            None => {
                debug!(entry = %dir.display(), "No complete cache entry");
                return None;
            }
        };

        if &manifest.identity != identity {
            warn!(
                entry = %dir.display(),
                recorded = %manifest.identity,
                requested = %identity,
                "Cache entry belongs to a different identity; ignoring"
            );
            return None;
        }

        let apks = dir.join(APK_DIR);
        let set = ArtifactSet {
            app_apk: apks.join(&manifest.app_apk.file_name),
            test_apk: apks.join(&manifest.test_apk.file_name),
        };
        if is_non_empty_file(&set.app_apk) && is_non_empty_file(&set.test_apk) {
            Some(set)
        } else {
            debug!(entry = %dir.display(), "Cache entry is missing APK files");
            None
        }
    }

    /// Manifest of the complete entry for `identity`, if there is one.
    pub fn manifest(&self, identity: &BuildIdentity) -> Option<CacheManifest> {
        read_manifest(&self.entry_dir(identity))
    }

    /// Copy `built` into the entry for `identity`. The entry becomes visible
    /// to [`resolve`](Self::resolve) only through the final rename.
    pub fn commit(
        &self,
        identity: &BuildIdentity,
        built: &ArtifactSet,
        variant: &str,
    ) -> Result<ArtifactSet> {
        fs::create_dir_all(&self.root).map_err(PerftestError::at(&self.root))?;

        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&self.root)
            .map_err(PerftestError::at(&self.root))?;
        let staged_apks = staging.path().join(APK_DIR);
        fs::create_dir_all(&staged_apks).map_err(PerftestError::at(&staged_apks))?;

        let app_apk = stage_apk(&built.app_apk, &staged_apks)?;
        let test_apk = stage_apk(&built.test_apk, &staged_apks)?;
        if app_apk.file_name == test_apk.file_name {
            return Err(PerftestError::InvalidApk {
                path: built.test_apk.clone(),
                reason: "app and test APKs share a file name".into(),
            });
        }

        let manifest = CacheManifest {
            identity: identity.clone(),
            variant: variant.to_string(),
            built_at: Utc::now(),
            app_apk,
            test_apk,
        };
        let manifest_path = staging.path().join(MANIFEST_FILE);
        let file = File::create(&manifest_path).map_err(PerftestError::at(&manifest_path))?;
        serde_json::to_writer_pretty(file, &manifest)?;

        let target = self.entry_dir(identity);
        if target.exists() {
            // Left over from an interrupted or foreign write; never resolvable as is.
            warn!(entry = %target.display(), "Replacing incomplete cache entry");
            fs::remove_dir_all(&target).map_err(PerftestError::at(&target))?;
        }
        fs::rename(staging.path(), &target).map_err(PerftestError::at(&target))?;

        info!(
            identity = %identity,
            entry = %target.display(),
            "Cached build artifacts"
        );

        self.resolve(identity).ok_or_else(|| PerftestError::ArtifactMissing {
            role: "cached".into(),
            searched: target.join(APK_DIR),
        })
    }

    /// Every complete entry under the cache root, sorted by directory name.
    pub fn list(&self) -> Result<Vec<CacheEntry>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for item in fs::read_dir(&self.root).map_err(PerftestError::at(&self.root))? {
            let item = item.map_err(PerftestError::at(&self.root))?;
            let directory = item.path();
            let hidden = item.file_name().to_string_lossy().starts_with('.');
            if hidden || !directory.is_dir() {
                continue;
            }
            if let Some(manifest) = read_manifest(&directory)
                && self.resolve(&manifest.identity).is_some()
            {
                entries.push(CacheEntry {
                    directory,
                    manifest,
                });
            }
        }
        entries.sort_by(|a, b| a.directory.cmp(&b.directory));
        Ok(entries)
    }
}

fn read_manifest(dir: &Path) -> Option<CacheManifest> {
    let content = fs::read(dir.join(MANIFEST_FILE)).ok()?;
    match serde_json::from_slice(&content) {
        Ok(manifest) => Some(manifest),
        Err(err) => {
            warn!(entry = %dir.display(), error = %err, "Unreadable cache manifest");
            None
        }
    }
}

fn stage_apk(source: &Path, apk_dir: &Path) -> Result<ApkRecord> {
    let file_name = source
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| PerftestError::InvalidApk {
            path: source.to_path_buf(),
            reason: "path has no file name".into(),
        })?;
    let target = apk_dir.join(&file_name);
    let size = fs::copy(source, &target).map_err(PerftestError::at(source))?;
    let sha256 = compute_sha256(&target)?;
    Ok(ApkRecord {
        file_name,
        sha256,
        size,
    })
}

fn is_non_empty_file(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_keeps_distinct_branches_distinct() {
        let slash = BuildIdentity::new("feature/a", "abc123").unwrap();
        let dash = BuildIdentity::new("feature-a", "abc123").unwrap();
        let encoded = BuildIdentity::new("feature%2Fa", "abc123").unwrap();

        assert_eq!(slash.cache_key(), "feature%2Fa_abc123");
        assert_eq!(dash.cache_key(), "feature-a_abc123");
        assert_eq!(encoded.cache_key(), "feature%252Fa_abc123");
    }

    #[test]
    fn commit_must_be_hex() {
        assert!(BuildIdentity::new("main", "abc123").is_ok());
        assert!(BuildIdentity::new("main", "xyz123").is_err());
        assert!(BuildIdentity::new("main", "abc").is_err());
        assert!(BuildIdentity::new("", "abc123").is_err());
    }

    #[test]
    fn identity_equality_is_case_sensitive() {
        let lower = BuildIdentity::new("main", "abc123").unwrap();
        let upper = BuildIdentity::new("main", "ABC123").unwrap();
        assert_ne!(lower, upper);
        assert_ne!(lower.cache_key(), upper.cache_key());
    }
}
