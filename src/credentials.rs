use std::fmt;

use crate::error::{PerftestError, Result};

const PLACEHOLDERS: &[&str] = &["placeholder", "your_key_here", "your_secret_here"];

/// A credential that never prints its value.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into().trim().to_string())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn masked(&self) -> String {
        mask_secret(&self.0, 4)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret({})", self.masked())
    }
}

/// `abcd...wxyz` for long values, `***` for anything too short to reveal.
pub fn mask_secret(secret: &str, visible: usize) -> String {
    if secret.chars().count() <= visible * 2 {
        return "***".to_string();
    }
    let head: String = secret.chars().take(visible).collect();
    let tail: String = secret
        .chars()
        .rev()
        .take(visible)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("{head}...{tail}")
}

#[derive(Debug, Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: Secret,
    pub session_token: Option<Secret>,
}

impl AwsCredentials {
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let access_key_id = required(&lookup, "AWS_ACCESS_KEY_ID")?;
        let secret_access_key = required(&lookup, "AWS_SECRET_ACCESS_KEY")?;
        let session_token = lookup("AWS_SESSION_TOKEN")
            .filter(|value| !is_placeholder(value))
            .map(Secret::new);

        Ok(Self {
            access_key_id: access_key_id.trim().to_string(),
            secret_access_key: Secret::new(secret_access_key),
            session_token,
        })
    }
}

/// Everything the stages need to talk to private remotes, resolved once and
/// passed in explicitly.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub github_token: Option<Secret>,
    pub aws: Option<AwsCredentials>,
}

impl Credentials {
    pub fn github_token(&self) -> Result<&Secret> {
        self.github_token.as_ref().ok_or_else(|| {
            PerftestError::Config(
                "GitHub token required; set GITHUB_PAT or pass --github-token".into(),
            )
        })
    }

    pub fn aws(&self) -> Result<&AwsCredentials> {
        self.aws.as_ref().ok_or_else(|| {
            PerftestError::Config(
                "AWS credentials required; set AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY".into(),
            )
        })
    }
}

fn required<F>(lookup: &F, key: &str) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) if !is_placeholder(&value) => Ok(value),
        _ => Err(PerftestError::Config(format!(
            "{key} is not set or is a placeholder"
        ))),
    }
}

fn is_placeholder(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty() || PLACEHOLDERS.contains(&trimmed.to_lowercase().as_str())
}
