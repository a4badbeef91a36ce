use std::path::Path;
use std::process::Command;

use tracing::{debug, info};

use super::SourceFetcher;
use crate::cache::BuildIdentity;
use crate::credentials::Secret;
use crate::error::{PerftestError, Result};

const AUTH_MARKERS: &[&str] = &[
    "authentication failed",
    "could not read username",
    "could not read password",
    "returned error: 401",
    "returned error: 403",
    "permission denied",
];

const MISSING_REF_MARKERS: &[&str] = &[
    "did not match any",
    "unknown revision",
    "reference is not a tree",
    "not found in upstream",
    "remote branch",
];

/// Clones a private https remote with a token and detaches at the commit.
pub struct GitFetcher {
    repository_url: String,
    token: Option<Secret>,
    git: String,
}

impl GitFetcher {
    pub fn new(repository_url: impl Into<String>, token: Option<Secret>) -> Self {
        Self {
            repository_url: repository_url.into(),
            token,
            git: "git".into(),
        }
    }

    /// Use a different git executable.
    pub fn with_git(mut self, git: impl Into<String>) -> Self {
        self.git = git.into();
        self
    }

    fn run(&self, operation: &str, dir: Option<&Path>, args: &[&str]) -> Result<String> {
        let mut command = Command::new(&self.git);
        command.args(args).env("GIT_TERMINAL_PROMPT", "0");
        if let Some(dir) = dir {
            command.current_dir(dir);
        }

        let output = command.output().map_err(|err| PerftestError::Git {
            operation: operation.into(),
            message: format!("could not run {}: {err}", self.git),
        })?;

        let stderr = self.redact(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            return Err(PerftestError::Git {
                operation: operation.into(),
                message: stderr.trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn redact(&self, text: &str) -> String {
        match &self.token {
            Some(token) if !token.expose().is_empty() => text.replace(token.expose(), "***"),
            _ => text.to_string(),
        }
    }
}

impl SourceFetcher for GitFetcher {
    fn fetch(&self, identity: &BuildIdentity, dest: &Path) -> Result<()> {
        if self.repository_url.trim().is_empty() {
            return Err(PerftestError::Config(
                "build.repository_url is not configured".into(),
            ));
        }
        if let Some(parent) = dest.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(PerftestError::at(parent))?;
        }

        let url = authenticated_url(&self.repository_url, self.token.as_ref());
        let dest_str = dest.to_string_lossy();
        info!(
            repository = %self.repository_url,
            branch = %identity.branch,
            "Cloning repository"
        );
        if let Some(token) = &self.token {
            debug!(token = %token.masked(), "Using access token");
        }

        self.run(
            "clone",
            None,
            &[
                "clone",
                "--single-branch",
                "--branch",
                &identity.branch,
                &url,
                &dest_str,
            ],
        )
        .map_err(|err| classify(err, identity, &self.repository_url))?;

        self.run("checkout", Some(dest), &["checkout", "--detach", &identity.commit])
            .map_err(|err| classify(err, identity, &self.repository_url))?;

        let head = self.run("rev-parse", Some(dest), &["rev-parse", "HEAD"])?;
        info!(head = %head.trim(), "Checked out commit");
        Ok(())
    }
}

/// Embed the token as basic-auth user info in an https URL. Other schemes
/// are returned unchanged.
pub fn authenticated_url(url: &str, token: Option<&Secret>) -> String {
    match (url.strip_prefix("https://"), token) {
        (Some(rest), Some(token)) if !token.expose().is_empty() => {
            format!("https://{}@{rest}", token.expose())
        }
        _ => url.to_string(),
    }
}

/// Map raw git failures onto the error kinds callers can act on.
pub fn classify(err: PerftestError, identity: &BuildIdentity, remote: &str) -> PerftestError {
    let PerftestError::Git { operation, message } = err else {
        return err;
    };
    let lowered = message.to_lowercase();

    if AUTH_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        PerftestError::Auth {
            remote: remote.to_string(),
            message,
        }
    } else if MISSING_REF_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        PerftestError::CommitNotFound {
            branch: identity.branch.clone(),
            commit: identity.commit.clone(),
            message,
        }
    } else {
        PerftestError::Git { operation, message }
    }
}
