//! Build stage: fetch sources at a commit, run the Android build and
//! memoize the resulting APKs in the artifact cache.

pub mod apk;
pub mod git;
pub mod gradle;

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::cache::{ArtifactCache, ArtifactSet, BuildIdentity};
use crate::error::{PerftestError, Result};
use crate::observability::MetricsCollector;

pub use apk::{ApkInfo, locate_apks, parse_aapt_badging, validate_apk};
pub use git::GitFetcher;
pub use gradle::GradleBuild;

/// Product flavor plus build type, e.g. `production` + `release`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildVariant {
    pub flavor: Option<String>,
    pub build_type: String,
}

impl BuildVariant {
    pub fn new(flavor: Option<String>, build_type: impl Into<String>) -> Self {
        Self {
            flavor: flavor.filter(|f| !f.trim().is_empty()),
            build_type: build_type.into(),
        }
    }

    /// `ProductionRelease`, the suffix of the Gradle assemble task.
    pub fn task_suffix(&self) -> String {
        let mut suffix = String::new();
        if let Some(flavor) = &self.flavor {
            suffix.push_str(&capitalize(flavor));
        }
        suffix.push_str(&capitalize(&self.build_type));
        suffix
    }
}

impl fmt::Display for BuildVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.flavor {
            Some(flavor) => write!(f, "{flavor}{}", capitalize(&self.build_type)),
            None => f.write_str(&self.build_type),
        }
    }
}

fn capitalize(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Produces a working tree for `identity` inside `dest`.
pub trait SourceFetcher {
    fn fetch(&self, identity: &BuildIdentity, dest: &Path) -> Result<()>;
}

/// Runs the native build in a checked-out project and reports the APKs it
/// produced.
pub trait BuildTool {
    fn build(&self, project: &Path, variant: &BuildVariant) -> Result<ArtifactSet>;
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildOutcome {
    pub identity: BuildIdentity,
    pub artifacts: ArtifactSet,
    pub cache_hit: bool,
}

pub struct BuildStage {
    cache: ArtifactCache,
    fetcher: Box<dyn SourceFetcher>,
    tool: Box<dyn BuildTool>,
    workspace: PathBuf,
    metrics: MetricsCollector,
}

impl BuildStage {
    pub fn new(
        cache: ArtifactCache,
        fetcher: Box<dyn SourceFetcher>,
        tool: Box<dyn BuildTool>,
    ) -> Self {
        let workspace = cache.root().join(".workspace");
        Self {
            cache,
            fetcher,
            tool,
            workspace,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    #[instrument(skip(self), fields(branch = %identity.branch, commit = %identity.commit))]
    pub fn build(&self, identity: &BuildIdentity, variant: &BuildVariant) -> Result<BuildOutcome> {
        if let Some(artifacts) = self.cache.resolve(identity) {
            info!(app_apk = %artifacts.app_apk.display(), "Using cached build artifacts");
            let requested = variant.to_string();
            if let Some(manifest) = self.cache.manifest(identity)
                && manifest.variant != requested
            {
                warn!(
                    cached = %manifest.variant,
                    requested = %requested,
                    "Cached build was produced for a different variant"
                );
            }
            return Ok(BuildOutcome {
                identity: identity.clone(),
                artifacts,
                cache_hit: true,
            });
        }

        std::fs::create_dir_all(&self.workspace).map_err(PerftestError::at(&self.workspace))?;
        let scratch = tempfile::Builder::new()
            .prefix("checkout-")
            .tempdir_in(&self.workspace)
            .map_err(PerftestError::at(&self.workspace))?;
        let source_dir = scratch.path().join("source");

        {
            let _timer = self.metrics.start_stage("build.fetch");
            info!(dest = %source_dir.display(), "Fetching sources");
            self.fetcher.fetch(identity, &source_dir)?;
        }

        let built = {
            let _timer = self.metrics.start_stage("build.compile");
            info!(variant = %variant, "Running build tool");
            self.tool.build(&source_dir, variant)?
        };

        let artifacts = self.cache.commit(identity, &built, &variant.to_string())?;
        Ok(BuildOutcome {
            identity: identity.clone(),
            artifacts,
            cache_hit: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_suffix_capitalizes_flavor_and_type() {
        let variant = BuildVariant::new(Some("production".into()), "release");
        assert_eq!(variant.task_suffix(), "ProductionRelease");
        assert_eq!(variant.to_string(), "productionRelease");

        let plain = BuildVariant::new(Some(String::new()), "debug");
        assert_eq!(plain.task_suffix(), "Debug");
        assert_eq!(plain.to_string(), "debug");
    }
}
