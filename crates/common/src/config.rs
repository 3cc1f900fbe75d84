//! Declarative build job configuration
//!
//! A repository describes its builds in a YAML file:
//!
//! ```yaml
//! version: 1
//! jobs:
//!   build:
//!     image: rust-1.80
//!     cache:
//!       writeTo: "cargo/{Branch}"
//!       loadFrom: ["cargo/{Branch}", "cargo/main"]
//!     steps:
//!       - name: Compile
//!         command: cargo build --release
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// The only configuration schema version this build of kiln understands.
pub const SUPPORTED_VERSION: u32 = 1;

/// Placeholder substituted with the checkout branch in cache templates.
pub const BRANCH_PLACEHOLDER: &str = "{Branch}";

/// Errors raised while loading or querying a job configuration
#[derive(Debug, Error)]
pub enum JobConfigError {
    #[error("job configuration file {} not found", .path.display())]
    NotFound { path: PathBuf },

    #[error("failed to read job configuration {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid job configuration at `{path}`: {message}")]
    Parse { path: String, message: String },

    #[error(
        "unsupported configuration version {found} (expected {expected})",
        expected = SUPPORTED_VERSION
    )]
    UnsupportedVersion { found: u32 },

    #[error("job `{0}` is not defined in the configuration")]
    MissingJob(String),

    #[error("job `{job}` is invalid: {reason}")]
    InvalidJob { job: String, reason: String },
}

/// Top-level build configuration document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildJobConfig {
    pub version: u32,
    pub jobs: BTreeMap<String, JobConfig>,
}

/// A single named job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub cache: CacheConfig,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub artifacts: ArtifactsConfig,
}

/// One build step, executed in its own subshell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub when: When,
}

/// Condition under which a step runs, given the outcome of earlier steps
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum When {
    /// Run only if every earlier step succeeded
    Success,
    /// Run only if some earlier step failed
    Failure,
    /// Run regardless of earlier outcomes
    #[default]
    Always,
}

/// Cache locations, expressed as templates relative to the trust-partitioned cache base
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    #[serde(default, alias = "write_to")]
    pub write_to: Option<String>,
    #[serde(default, alias = "load_from")]
    pub load_from: Vec<String>,
    /// Read-write caches shared between jobs: name -> container path
    #[serde(default)]
    pub shared: BTreeMap<String, PathBuf>,
    /// Read-only caches provisioned by the host: name -> container path
    #[serde(default)]
    pub system: BTreeMap<String, PathBuf>,
}

/// Build outputs to collect after the run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactsConfig {
    #[serde(default)]
    pub paths: Vec<String>,
}

impl BuildJobConfig {
    /// Load and validate a configuration file
    pub fn from_path(path: &Path) -> Result<Self, JobConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                JobConfigError::NotFound {
                    path: path.to_path_buf(),
                }
            } else {
                JobConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;

        debug!("Loaded job configuration from {}", path.display());
        Self::parse(&contents)
    }

    /// Parse and validate a configuration document
    pub fn parse(contents: &str) -> Result<Self, JobConfigError> {
        let deserializer = serde_yaml::Deserializer::from_str(contents);
        let config: Self = serde_path_to_error::deserialize(deserializer).map_err(|e| {
            JobConfigError::Parse {
                path: e.path().to_string(),
                message: e.inner().to_string(),
            }
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Look up a job by name
    pub fn job(&self, name: &str) -> Result<&JobConfig, JobConfigError> {
        self.jobs
            .get(name)
            .ok_or_else(|| JobConfigError::MissingJob(name.to_string()))
    }

    fn validate(&self) -> Result<(), JobConfigError> {
        if self.version != SUPPORTED_VERSION {
            return Err(JobConfigError::UnsupportedVersion {
                found: self.version,
            });
        }

        for (name, job) in &self.jobs {
            job.validate()
                .map_err(|reason| JobConfigError::InvalidJob {
                    job: name.clone(),
                    reason,
                })?;
        }

        Ok(())
    }
}

impl JobConfig {
    fn validate(&self) -> Result<(), String> {
        if self.steps.is_empty() {
            return Err("at least one step is required".to_string());
        }

        for (index, step) in self.steps.iter().enumerate() {
            if step.name.trim().is_empty() {
                return Err(format!("step {} has an empty name", index + 1));
            }
            if step.name.contains(['\n', '\r']) {
                return Err(format!("step name `{}` spans multiple lines", step.name.trim()));
            }
        }

        if self.artifacts.paths.iter().any(|p| p.trim().is_empty()) {
            return Err("artifact paths must not be empty".to_string());
        }

        Ok(())
    }
}

impl CacheConfig {
    /// Parse the JSON cache options blob handed to the agent by its host
    pub fn from_json(blob: &str) -> Result<Self, serde_json::Error> {
        if blob.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(blob)
    }
}

/// Substitute the branch placeholder in a cache template
pub fn expand_template(template: &str, branch: &str) -> String {
    template.replace(BRANCH_PLACEHOLDER, branch)
}
