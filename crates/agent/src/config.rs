//! Agent configuration
//!
//! Everything the agent needs is supplied on the command line or through the
//! environment of the build machine. Only the controller URL is positional;
//! the rest falls back to `KILN_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use kiln_common::CacheConfig;

use crate::error::{AgentError, AgentResult};
use crate::git::RemoteRef;

/// Whether the triggering ref comes from the canonical repository or a fork
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustLevel {
    Safe,
    Unsafe,
}

impl TrustLevel {
    /// Directory name of this trust level's cache partition
    pub fn dir_name(&self) -> &'static str {
        match self {
            TrustLevel::Safe => "safe",
            TrustLevel::Unsafe => "unsafe",
        }
    }
}

/// Where build steps execute
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Sandbox {
    /// Inside a container started from the job's image
    Container,
    /// Directly on the build machine (local debugging only)
    Host,
}

/// Agent configuration
#[derive(Debug, Clone, Parser)]
#[command(
    name = "kiln-agent",
    version,
    about = "Runs a kiln build job and streams its progress to the controller"
)]
pub struct AgentConfig {
    /// Controller URL (http(s) URLs are rewritten to ws(s))
    pub url: String,

    /// Name of the job to run from the repository's configuration file
    #[arg(long, env = "KILN_JOB_NAME", default_value = "build")]
    pub job: String,

    /// Git ref that triggered the build (e.g. refs/heads/main, refs/pull/12/head)
    #[arg(long, env = "KILN_REMOTE_REF")]
    pub remote_ref: String,

    /// Exact commit to build
    #[arg(long, env = "KILN_COMMIT")]
    pub commit: String,

    /// Repository URL to fetch from
    #[arg(long, env = "KILN_CLONE_URL")]
    pub clone_url: String,

    /// The triggering ref belongs to the canonical repository
    #[arg(long, env = "KILN_TRUSTED")]
    pub trusted: bool,

    /// Container image the build runs in
    #[arg(long = "image", env = "KILN_IMAGE_NAME")]
    pub image_name: String,

    /// Where to download the image archive from when it is not cached
    #[arg(long, env = "KILN_IMAGE_URL")]
    pub image_url: String,

    /// JSON cache options: {"write_to": "...", "load_from": ["..."]}
    #[arg(long, env = "KILN_CACHE_OPTIONS", default_value = "{}")]
    pub cache_options: String,

    /// Job configuration file, relative to the checkout
    #[arg(long, env = "KILN_CONFIG_FILE", default_value = ".kiln.yml")]
    pub config_file: PathBuf,

    /// Working directory for checkouts and logs
    #[arg(long, env = "KILN_WORK_DIR")]
    pub work_dir: Option<PathBuf>,

    /// Base directory for build caches and image archives
    #[arg(long, env = "KILN_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Container runtime executable
    #[arg(long, env = "KILN_RUNTIME", default_value = "docker")]
    pub runtime: String,

    /// Where build steps execute
    #[arg(long, env = "KILN_SANDBOX", value_enum, default_value_t = Sandbox::Container)]
    pub sandbox: Sandbox,

    /// Wall-clock limit for the build run
    #[arg(long, env = "KILN_BUILD_TIMEOUT", default_value = "3h", value_parser = humantime::parse_duration)]
    pub build_timeout: Duration,

    /// How often queued messages are flushed to the controller
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
    pub flush_interval: Duration,

    /// Keep-alive ping interval
    #[arg(long, default_value = "55s", value_parser = humantime::parse_duration)]
    pub ping_interval: Duration,

    /// Upper bound on waiting for the controller to confirm the close
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    pub shutdown_timeout: Duration,

    /// Attempts per frame before a send failure is given up on
    #[arg(long, default_value_t = 3)]
    pub send_retries: u32,

    /// Log file used when running detached
    #[arg(long, env = "KILN_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Stay attached to the invoking process instead of detaching
    #[arg(long)]
    pub foreground: bool,
}

impl AgentConfig {
    /// Check everything that must be right before a connection is attempted
    pub fn validate(&self) -> AgentResult<()> {
        self.controller_url()?;
        self.cache_config()?;
        Ok(())
    }

    /// Controller URL with http(s) rewritten to ws(s)
    pub fn controller_url(&self) -> AgentResult<String> {
        websocket_url(&self.url)
    }

    pub fn trust_level(&self) -> TrustLevel {
        if self.trusted {
            TrustLevel::Safe
        } else {
            TrustLevel::Unsafe
        }
    }

    /// Cache templates from the host-provided options blob
    pub fn cache_config(&self) -> AgentResult<CacheConfig> {
        Ok(CacheConfig::from_json(&self.cache_options)?)
    }

    pub fn remote_ref(&self) -> RemoteRef {
        RemoteRef::parse(&self.remote_ref)
    }

    pub fn work_dir(&self) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("kiln")
        })
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("kiln")
        })
    }

    /// Where the repository is checked out
    pub fn checkout_dir(&self) -> PathBuf {
        self.work_dir().join("src")
    }

    /// Absolute path of the job configuration file
    pub fn config_path(&self) -> PathBuf {
        self.checkout_dir().join(&self.config_file)
    }

    /// Where the image archive is cached
    pub fn image_archive(&self) -> PathBuf {
        let file_name: String = self
            .image_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        self.cache_dir()
            .join("images")
            .join(format!("{}.tar", file_name))
    }

    pub fn log_file(&self) -> PathBuf {
        self.log_file
            .clone()
            .unwrap_or_else(|| self.work_dir().join("agent.log"))
    }
}

/// Rewrite an http(s) URL to ws(s); ws(s) URLs pass through
pub fn websocket_url(url: &str) -> AgentResult<String> {
    let url = url.trim();
    if let Some(rest) = url.strip_prefix("http://") {
        Ok(format!("ws://{}", rest))
    } else if let Some(rest) = url.strip_prefix("https://") {
        Ok(format!("wss://{}", rest))
    } else if url.starts_with("ws://") || url.starts_with("wss://") {
        Ok(url.to_string())
    } else {
        Err(AgentError::InvalidUrl(url.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> AgentConfig {
        let mut args = vec![
            "kiln-agent",
            "https://ci.example.com/agents/42",
            "--remote-ref",
            "refs/heads/main",
            "--commit",
            "0123456789abcdef0123456789abcdef01234567",
            "--clone-url",
            "https://example.com/repo.git",
            "--image",
            "rust:1.80",
            "--image-url",
            "https://images.example.com/rust-1.80.tar",
        ];
        args.extend_from_slice(extra);
        AgentConfig::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]);
        assert_eq!(config.job, "build");
        assert_eq!(config.runtime, "docker");
        assert_eq!(config.sandbox, Sandbox::Container);
        assert_eq!(config.flush_interval, Duration::from_secs(1));
        assert_eq!(config.ping_interval, Duration::from_secs(55));
        assert_eq!(config.build_timeout, Duration::from_secs(3 * 3600));
        assert_eq!(config.trust_level(), TrustLevel::Unsafe);
        assert!(!config.foreground);
    }

    #[test]
    fn test_url_rewriting() {
        assert_eq!(websocket_url("http://host/x").unwrap(), "ws://host/x");
        assert_eq!(websocket_url("https://host/x").unwrap(), "wss://host/x");
        assert_eq!(websocket_url("wss://host/x").unwrap(), "wss://host/x");
        assert!(matches!(
            websocket_url("ftp://host"),
            Err(AgentError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_trusted_flag() {
        let config = parse(&["--trusted"]);
        assert_eq!(config.trust_level(), TrustLevel::Safe);
        assert_eq!(config.trust_level().dir_name(), "safe");
    }

    #[test]
    fn test_cache_options_validation() {
        let config = parse(&["--cache-options", r#"{"write_to": "deps/{Branch}"}"#]);
        assert!(config.validate().is_ok());
        assert_eq!(
            config.cache_config().unwrap().write_to.as_deref(),
            Some("deps/{Branch}")
        );

        let config = parse(&["--cache-options", "{not json"]);
        assert!(matches!(
            config.validate(),
            Err(AgentError::CacheOptions(_))
        ));
    }

    #[test]
    fn test_paths_derive_from_dirs() {
        let config = parse(&["--work-dir", "/w", "--cache-dir", "/c"]);
        assert_eq!(config.checkout_dir(), PathBuf::from("/w/src"));
        assert_eq!(config.config_path(), PathBuf::from("/w/src/.kiln.yml"));
        assert_eq!(config.log_file(), PathBuf::from("/w/agent.log"));
        assert_eq!(
            config.image_archive(),
            PathBuf::from("/c/images/rust_1.80.tar")
        );
    }

    #[test]
    fn test_missing_url_is_rejected() {
        let err = AgentConfig::try_parse_from(["kiln-agent"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }
}
